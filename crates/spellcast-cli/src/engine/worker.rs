//! Worker lifecycle.
//!
//! A [`Worker`] is configured, then started into a [`WorkerHandle`] that owns
//! the listener, the automation loop and the optional hotkey source reader.
//! Everything between the handle and those tasks goes through channels plus
//! one cancellation token.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use spellcast_core::events::{DebugStep, StepDecision, Telemetry, WorkerEvent};
use spellcast_core::mode::Mode;
use spellcast_core::protocol::WorkerStatus;
use spellcast_core::strategy::{Strategy, StrategyError};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Settings;
use crate::engine::automation::AutomationLoop;
use crate::engine::channels::{LogSink, TelemetrySink};
use crate::engine::effector::{AnyEffector, Effector};
use crate::engine::mode::{read_hotkey_source, run_listener, ModeMachine, KEY_CHANNEL_CAPACITY};
use crate::engine::perception::{AnyPerception, Perception};
use crate::engine::strategy_store::StrategyStore;

/// Buffered debug decisions.
const STEP_CHANNEL_CAPACITY: usize = 8;

/// Why a debug decision was not delivered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepRejected {
    #[error("the engine is not running in debug mode")]
    NotDebug,
    #[error("no debug step is waiting for a decision")]
    NothingPending,
    #[error("the automation loop has stopped")]
    Stopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("the mode listener has stopped")]
pub struct ListenerStopped;

/// A configured, not yet running worker.
pub struct Worker<P, E> {
    settings: Settings,
    perception: P,
    effector: E,
    debug: bool,
    log: LogSink,
    telemetry: TelemetrySink,
}

impl<P, E> Worker<P, E>
where
    P: Perception + 'static,
    E: Effector + 'static,
{
    pub fn new(settings: Settings, perception: P, effector: E, debug: bool) -> Self {
        Self {
            settings,
            perception,
            effector,
            debug,
            log: LogSink::new(),
            telemetry: TelemetrySink::new(),
        }
    }

    /// Log channel, usable before start to announce setup.
    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Subscribe before start to see the startup lines too.
    pub fn subscribe(&self) -> WorkerEvents {
        WorkerEvents::new(&self.log, &self.telemetry)
    }

    /// Load the strategy, then launch the listener and the loop.
    pub fn start(self) -> WorkerHandle {
        let Worker {
            settings,
            perception,
            effector,
            debug,
            log,
            telemetry,
        } = self;
        let cancel = CancellationToken::new();

        let store = StrategyStore::new(log.clone());
        match &settings.current_strategy {
            Some(path) => {
                // Failure is logged and leaves the empty strategy active
                let _ = store.load(path);
            }
            None => log.warn(
                "No strategy configured; set current_strategy in the settings file or run 'spellcast reload <path>'",
            ),
        }

        let machine = ModeMachine::new(&settings.mode_switch_keys, log.clone());
        machine.announce(&settings.mode_switch_keys);
        let mode = machine.subscribe();

        let (keys, key_rx) = mpsc::channel(KEY_CHANNEL_CAPACITY);
        let mut tasks = vec![tokio::spawn(run_listener(machine, key_rx, cancel.clone()))];

        if let Some(path) = settings.hotkey_source.clone() {
            tasks.push(tokio::spawn(read_hotkey_source(
                path,
                keys.clone(),
                log.clone(),
                cancel.clone(),
            )));
        }

        let (pending_tx, pending) = watch::channel(None);
        let mut automation = AutomationLoop::new(
            perception,
            effector,
            mode.clone(),
            store.subscribe(),
            log.clone(),
            telemetry.clone(),
            cancel.clone(),
        )
        .with_region(settings.screen_capture_region);

        let steps = if debug {
            let (tx, rx) = mpsc::channel(STEP_CHANNEL_CAPACITY);
            automation = automation.with_debug(rx, pending_tx);
            log.info("Debug mode: every cast waits for 'execute' or 'skip'");
            Some(tx)
        } else {
            None
        };
        tasks.push(tokio::spawn(automation.run()));
        log.info("Automation engine started");

        WorkerHandle {
            cancel,
            tasks,
            store,
            mode,
            pending,
            keys,
            steps,
            log,
            telemetry,
            started_at: Utc::now(),
        }
    }
}

/// The worker the binary runs, with adapters picked by the settings file.
pub type ConfiguredWorker = Worker<AnyPerception, AnyEffector>;

impl ConfiguredWorker {
    /// Build the adapters named in `settings`.
    ///
    /// Fails only when an adapter cannot be set up, e.g. an unreadable
    /// replay file.
    pub fn from_settings(settings: Settings, debug: bool) -> anyhow::Result<Self> {
        let perception = AnyPerception::from_config(&settings.perception)?;
        let effector = AnyEffector::from_config(&settings.effector);
        let mut worker = Worker::new(settings, perception, effector, debug);
        worker.perception.report_to(&worker.log);
        Ok(worker)
    }

    /// Log which adapters are in use.
    pub fn announce_adapters(&self) {
        self.log
            .info(format!("Perception: {}", self.perception.describe()));
        if self.perception.is_disabled() {
            self.log.warn(
                "Perception is disabled, nothing will be cast; configure [perception] in the settings file",
            );
        }
        self.log.info(format!("Keystrokes: {}", self.effector.describe()));
    }
}

/// A running worker. Dropping it cancels every task.
pub struct WorkerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    store: StrategyStore,
    mode: watch::Receiver<Mode>,
    pending: watch::Receiver<Option<DebugStep>>,
    keys: mpsc::Sender<String>,
    steps: Option<mpsc::Sender<StepDecision>>,
    log: LogSink,
    telemetry: TelemetrySink,
    started_at: DateTime<Utc>,
}

impl WorkerHandle {
    /// Cancel and wait for every task. A keystroke in flight completes first.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                error!("Worker task failed: {}", e);
            }
        }
        self.log.info("Automation engine stopped");
    }

    pub fn is_debug(&self) -> bool {
        self.steps.is_some()
    }

    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    pub fn strategy(&self) -> Arc<Strategy> {
        self.store.current()
    }

    pub fn status(&self) -> WorkerStatus {
        let strategy = self.store.current();
        WorkerStatus {
            running: true,
            debug: self.is_debug(),
            mode: self.mode(),
            strategy: (!strategy.name.is_empty()).then(|| strategy.name.clone()),
            global_cooldown_secs: strategy.cooldown_secs(),
            pending_step: self.pending.borrow().clone(),
            started_at: Some(self.started_at.to_rfc3339()),
        }
    }

    /// Replace the strategy from `path`, or re-read the last one.
    pub fn reload(&self, path: Option<&Path>) -> Result<Arc<Strategy>, StrategyError> {
        self.store.reload(path)
    }

    /// Feed a key event to the mode listener.
    pub async fn press_key(&self, key: impl Into<String>) -> Result<(), ListenerStopped> {
        self.keys.send(key.into()).await.map_err(|_| ListenerStopped)
    }

    /// Answer the pending debug step.
    pub async fn decide(&self, decision: StepDecision) -> Result<DebugStep, StepRejected> {
        let steps = self.steps.as_ref().ok_or(StepRejected::NotDebug)?;
        let step = self
            .pending
            .borrow()
            .clone()
            .ok_or(StepRejected::NothingPending)?;
        steps
            .send(decision)
            .await
            .map_err(|_| StepRejected::Stopped)?;
        debug!("Delivered {} for {}", decision, step.spell);
        Ok(step)
    }

    pub fn subscribe(&self) -> WorkerEvents {
        WorkerEvents::new(&self.log, &self.telemetry)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Merged view of the log and telemetry channels.
pub struct WorkerEvents {
    log: broadcast::Receiver<String>,
    telemetry: broadcast::Receiver<Telemetry>,
    log_closed: bool,
    telemetry_closed: bool,
}

impl WorkerEvents {
    fn new(log: &LogSink, telemetry: &TelemetrySink) -> Self {
        Self {
            log: log.subscribe(),
            telemetry: telemetry.subscribe(),
            log_closed: false,
            telemetry_closed: false,
        }
    }

    /// Next event, or `None` once the worker is gone and both channels
    /// are drained.
    pub async fn next(&mut self) -> Option<WorkerEvent> {
        loop {
            tokio::select! {
                received = self.log.recv(), if !self.log_closed => match received {
                    Ok(line) => return Some(WorkerEvent::Log { line }),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Log subscriber lagged, {} line(s) dropped", skipped);
                    }
                    Err(RecvError::Closed) => self.log_closed = true,
                },
                received = self.telemetry.recv(), if !self.telemetry_closed => match received {
                    Ok(telemetry) => return Some(WorkerEvent::Telemetry { telemetry }),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Telemetry subscriber lagged, {} item(s) dropped", skipped);
                    }
                    Err(RecvError::Closed) => self.telemetry_closed = true,
                },
                else => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::effector::DryRunEffector;
    use crate::engine::perception::ReplayPerception;
    use spellcast_core::detection::Detection;
    use spellcast_core::mode::ModeSwitchKeys;
    use std::path::PathBuf;
    use std::time::Duration;

    const FROST: &str = r#"
name: Frost
global_cooldown: 1.5
aoe_priority:
  - {name: frostbolt, key: "1"}
single_target_priority:
  - {name: frostbolt, key: "1"}
"#;

    fn settings(strategy: Option<PathBuf>) -> Settings {
        Settings {
            current_strategy: strategy,
            mode_switch_keys: ModeSwitchKeys {
                aoe_mode: Some("f1".to_string()),
                single_target_mode: Some("f2".to_string()),
                stop_casting: Some("f3".to_string()),
            },
            ..Default::default()
        }
    }

    fn ready_frames() -> ReplayPerception {
        ReplayPerception::from_frames(vec![vec![Detection::new(
            "frostbolt_ready",
            0.9,
            [0, 0, 8, 8],
        )]])
    }

    fn write_strategy(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("frost.yaml");
        std::fs::write(&path, FROST).expect("write strategy");
        path
    }

    async fn wait_for_line(events: &mut WorkerEvents, wanted: &str) {
        loop {
            match events.next().await {
                Some(WorkerEvent::Log { line }) if line == wanted => return,
                Some(_) => {}
                None => panic!("worker ended before {:?}", wanted),
            }
        }
    }

    async fn wait_for_step(events: &mut WorkerEvents) -> DebugStep {
        loop {
            match events.next().await {
                Some(WorkerEvent::Telemetry {
                    telemetry: Telemetry::DebugStep(step),
                }) => return step,
                Some(_) => {}
                None => panic!("worker ended before a debug step"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotkey_starts_casting_and_stop_joins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new(
            settings(Some(write_strategy(&temp))),
            ready_frames(),
            DryRunEffector::new(Duration::from_millis(50)),
            false,
        );
        let mut events = worker.subscribe();
        let handle = worker.start();

        wait_for_line(&mut events, "Loaded strategy: Frost").await;
        assert_eq!(handle.mode(), Mode::Stopped);

        handle.press_key("F1").await.unwrap();
        wait_for_line(&mut events, "Switched to AOE mode").await;
        wait_for_line(&mut events, "Mode: AOE | Casting: frostbolt").await;

        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("stop should join all tasks");

        // Every sender lived in a task or the handle, so the stream ends
        wait_for_line(&mut events, "Automation engine stopped").await;
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_strategy_and_mode() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new(
            settings(Some(write_strategy(&temp))),
            ready_frames(),
            DryRunEffector::new(Duration::ZERO),
            false,
        );
        let mut events = worker.subscribe();
        let handle = worker.start();

        handle.press_key("f2").await.unwrap();
        wait_for_line(&mut events, "Switched to single target mode").await;

        let status = handle.status();
        assert!(status.running);
        assert!(!status.debug);
        assert_eq!(status.mode, Mode::SingleTarget);
        assert_eq!(status.strategy.as_deref(), Some("Frost"));
        assert_eq!(status.global_cooldown_secs, 1.5);
        assert!(status.started_at.is_some());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_strategy_idles_and_warns() {
        let worker = Worker::new(
            settings(None),
            ready_frames(),
            DryRunEffector::new(Duration::ZERO),
            false,
        );
        let mut events = worker.subscribe();
        let handle = worker.start();

        match events.next().await {
            Some(WorkerEvent::Log { line }) => assert!(line.starts_with("No strategy configured")),
            other => panic!("unexpected first event: {:?}", other),
        }
        handle.press_key("f1").await.unwrap();
        wait_for_line(&mut events, "Switched to AOE mode").await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(handle.status().strategy, None);
        assert!(matches!(
            handle.reload(None),
            Err(StrategyError::NotConfigured)
        ));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_swaps_strategy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new(
            settings(None),
            ready_frames(),
            DryRunEffector::new(Duration::ZERO),
            false,
        );
        let handle = worker.start();

        let loaded = handle.reload(Some(&write_strategy(&temp))).expect("reload");
        assert_eq!(loaded.name, "Frost");
        assert_eq!(handle.strategy().name, "Frost");
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_decisions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Worker::new(
            settings(Some(write_strategy(&temp))),
            ready_frames(),
            DryRunEffector::new(Duration::ZERO),
            true,
        );
        let mut events = worker.subscribe();
        let handle = worker.start();
        assert!(handle.is_debug());

        // Nothing to confirm yet
        assert_eq!(
            handle.decide(StepDecision::Execute).await,
            Err(StepRejected::NothingPending)
        );

        handle.press_key("f1").await.unwrap();
        let step = wait_for_step(&mut events).await;
        assert_eq!(handle.status().pending_step, Some(step.clone()));

        let answered = handle.decide(StepDecision::Execute).await.unwrap();
        assert_eq!(answered, step);
        wait_for_line(&mut events, "[debug] Command: execute").await;

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_decide_without_debug_is_rejected() {
        let worker = Worker::new(
            settings(None),
            ready_frames(),
            DryRunEffector::new(Duration::ZERO),
            false,
        );
        let handle = worker.start();
        assert_eq!(
            handle.decide(StepDecision::Skip).await,
            Err(StepRejected::NotDebug)
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_configured_worker_reports_adapters() {
        let worker = ConfiguredWorker::from_settings(settings(None), false).expect("build");
        let mut lines = worker.log().subscribe();
        worker.announce_adapters();

        assert_eq!(lines.try_recv().unwrap(), "Perception: disabled");
        assert!(lines.try_recv().unwrap().starts_with("Perception is disabled"));
        assert!(lines.try_recv().unwrap().starts_with("Keystrokes: dry run"));
    }

    #[tokio::test]
    async fn test_configured_detector_failures_reach_worker_log() {
        let settings = Settings {
            perception: crate::config::PerceptionConfig::Command {
                command: vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()],
                model: None,
                timeout_ms: 5_000,
            },
            ..Default::default()
        };
        let worker = ConfiguredWorker::from_settings(settings, false).expect("build");
        let mut lines = worker.log().subscribe();

        assert!(worker.perception.detect(None).await.is_empty());
        assert!(lines.try_recv().unwrap().starts_with("Perception failed:"));
    }

    #[test]
    fn test_configured_worker_rejects_missing_replay() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            perception: crate::config::PerceptionConfig::Replay {
                path: temp.path().join("missing.jsonl"),
            },
            ..Default::default()
        };
        assert!(ConfiguredWorker::from_settings(settings, false).is_err());
    }
}
