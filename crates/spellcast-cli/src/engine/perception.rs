//! Perception adapters.
//!
//! The loop only needs "what is on screen right now". Whatever produces the
//! answer (an external detector, a recording) stays behind [`Perception`],
//! and its failures stop at this boundary as an empty frame.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use spellcast_core::detection::{Detection, Region};
use tracing::warn;

use crate::config::PerceptionConfig;
use crate::engine::channels::LogSink;

/// Capture region handed to detector programs as `x1,y1,x2,y2`.
pub const REGION_ENV: &str = "SPELLCAST_REGION";

/// Model reference handed to detector programs.
pub const MODEL_ENV: &str = "SPELLCAST_MODEL";

/// Source of per-tick detections.
pub trait Perception: Send + Sync {
    /// Detections for `region` (full screen when `None`). Never fails:
    /// problems are logged and produce an empty list.
    fn detect(&self, region: Option<Region>) -> impl Future<Output = Vec<Detection>> + Send;
}

/// Runs a detector program once per tick and parses its stdout.
///
/// With a worker log attached, the first failure of a streak and the
/// recovery after it are reported there; repeats only go to `tracing`.
#[derive(Debug)]
pub struct CommandPerception {
    command: Vec<String>,
    model: Option<String>,
    timeout: Duration,
    log: Option<LogSink>,
    failing: AtomicBool,
}

impl CommandPerception {
    pub fn new(command: Vec<String>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            command,
            model,
            timeout,
            log: None,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_log(&mut self, log: LogSink) {
        self.log = Some(log);
    }

    async fn run(&self, region: Option<Region>) -> Result<Vec<Detection>> {
        let (program, args) = self
            .command
            .split_first()
            .context("detector command is empty")?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(region) = region {
            cmd.env(REGION_ENV, region.to_string());
        } else {
            cmd.env_remove(REGION_ENV);
        }
        if let Some(model) = &self.model {
            cmd.env(MODEL_ENV, model);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("detector timed out after {:?}", self.timeout))?
            .with_context(|| format!("failed to run detector '{}'", program))?;

        if !output.status.success() {
            bail!(
                "detector exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&stdout).context("detector output is not a JSON array of detections")
    }
}

impl Perception for CommandPerception {
    async fn detect(&self, region: Option<Region>) -> Vec<Detection> {
        match self.run(region).await {
            Ok(detections) => {
                if self.failing.swap(false, Ordering::Relaxed) {
                    if let Some(log) = &self.log {
                        log.info("Perception recovered");
                    }
                }
                detections
            }
            Err(e) => {
                let message = format!("Perception failed: {:#}", e);
                let first = !self.failing.swap(true, Ordering::Relaxed);
                match &self.log {
                    Some(log) if first => log.warn(message),
                    _ => warn!("{}", message),
                }
                Vec::new()
            }
        }
    }
}

/// Cycles through recorded frames, one JSON array per line.
#[derive(Debug)]
pub struct ReplayPerception {
    frames: Vec<Vec<Detection>>,
    next: AtomicUsize,
}

impl ReplayPerception {
    pub fn from_frames(frames: Vec<Vec<Detection>>) -> Self {
        Self {
            frames,
            next: AtomicUsize::new(0),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        let frames = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("{}:{}: invalid detection frame", path.display(), idx + 1)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_frames(frames))
    }
}

impl Perception for ReplayPerception {
    async fn detect(&self, _region: Option<Region>) -> Vec<Detection> {
        if self.frames.is_empty() {
            return Vec::new();
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.frames.len();
        self.frames[idx].clone()
    }
}

/// Perception selected by the settings file.
#[derive(Debug)]
pub enum AnyPerception {
    Disabled,
    Command(CommandPerception),
    Replay {
        path: PathBuf,
        replay: ReplayPerception,
    },
}

impl AnyPerception {
    pub fn from_config(config: &PerceptionConfig) -> Result<Self> {
        Ok(match config {
            PerceptionConfig::Disabled => AnyPerception::Disabled,
            PerceptionConfig::Command {
                command,
                model,
                timeout_ms,
            } => AnyPerception::Command(CommandPerception::new(
                command.clone(),
                model.clone(),
                Duration::from_millis(*timeout_ms),
            )),
            PerceptionConfig::Replay { path } => AnyPerception::Replay {
                path: path.clone(),
                replay: ReplayPerception::load(path)?,
            },
        })
    }

    /// Route detector failures to the worker log.
    pub fn report_to(&mut self, log: &LogSink) {
        if let AnyPerception::Command(p) = self {
            p.set_log(log.clone());
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, AnyPerception::Disabled)
    }

    /// Short description for the startup log.
    pub fn describe(&self) -> String {
        match self {
            AnyPerception::Disabled => "disabled".to_string(),
            AnyPerception::Command(p) => format!("command `{}`", p.command.join(" ")),
            AnyPerception::Replay { path, replay } => {
                format!("replay of {} ({} frames)", path.display(), replay.frames.len())
            }
        }
    }
}

impl Perception for AnyPerception {
    async fn detect(&self, region: Option<Region>) -> Vec<Detection> {
        match self {
            AnyPerception::Disabled => Vec::new(),
            AnyPerception::Command(p) => p.detect(region).await,
            AnyPerception::Replay { replay, .. } => replay.detect(region).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandPerception {
        CommandPerception::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            None,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_command_output_is_parsed() {
        let p = sh(r#"echo '[{"name":"frostbolt_ready","confidence":0.9,"box":[1,2,3,4]}]'"#);
        let detections = p.detect(None).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "frostbolt_ready");
        assert_eq!(detections[0].bbox, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_region_and_model_are_passed_in_env() {
        let p = CommandPerception::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"printf '[{"label":"%s"},{"label":"%s"}]' "$SPELLCAST_REGION" "$SPELLCAST_MODEL""#
                    .to_string(),
            ],
            Some("best.pt".to_string()),
            Duration::from_secs(5),
        );
        let detections = p.detect(Some(Region::new(10, 20, 30, 40))).await;
        assert_eq!(detections[0].label, "10,20,30,40");
        assert_eq!(detections[1].label, "best.pt");
    }

    #[tokio::test]
    async fn test_failures_become_empty_frames() {
        assert!(sh("exit 3").detect(None).await.is_empty());
        assert!(sh("echo not-json").detect(None).await.is_empty());
        assert!(sh("true").detect(None).await.is_empty());

        let missing = CommandPerception::new(
            vec!["/nonexistent/spellcast-detector".to_string()],
            None,
            Duration::from_secs(1),
        );
        assert!(missing.detect(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_streak_reported_once_to_worker_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("healthy");
        let log = LogSink::new();
        let mut lines = log.subscribe();
        let mut p = sh(&format!(
            "test -f '{}' && echo '[]' || exit 3",
            marker.display()
        ));
        p.set_log(log.clone());

        assert!(p.detect(None).await.is_empty());
        assert!(p.detect(None).await.is_empty());
        let line = lines.try_recv().expect("failure reported");
        assert!(line.starts_with("Perception failed: detector exited with"));
        assert!(lines.try_recv().is_err());

        std::fs::write(&marker, "").unwrap();
        assert!(p.detect(None).await.is_empty());
        assert_eq!(lines.try_recv().unwrap(), "Perception recovered");
        p.detect(None).await;
        assert!(lines.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_detector_times_out() {
        let p = CommandPerception::new(
            vec!["sleep".to_string(), "5".to_string()],
            None,
            Duration::from_millis(100),
        );
        let started = std::time::Instant::now();
        assert!(p.detect(None).await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_replay_cycles_frames() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("frames.jsonl");
        std::fs::write(
            &path,
            "[{\"label\":\"a_ready\"}]\n\n[]\n[{\"label\":\"b_ready\"},{\"label\":\"c_cooldown\"}]\n",
        )
        .unwrap();

        let replay = ReplayPerception::load(&path).expect("load");
        assert_eq!(replay.detect(None).await[0].label, "a_ready");
        assert!(replay.detect(None).await.is_empty());
        assert_eq!(replay.detect(None).await.len(), 2);
        assert_eq!(replay.detect(None).await[0].label, "a_ready");
    }

    #[test]
    fn test_replay_reports_bad_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("frames.jsonl");
        std::fs::write(&path, "[]\n{oops\n").unwrap();
        let err = ReplayPerception::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(":2:"));
    }

    #[tokio::test]
    async fn test_disabled_sees_nothing() {
        let p = AnyPerception::from_config(&PerceptionConfig::Disabled).unwrap();
        assert!(p.is_disabled());
        assert!(p.detect(Some(Region::new(0, 0, 10, 10))).await.is_empty());
    }
}
