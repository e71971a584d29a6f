//! Keystroke adapters.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{EffectorConfig, EffectorKind};

/// Upper bound for one press or release command.
const KEY_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum EffectorError {
    #[error("keybind is empty")]
    EmptyKey,

    #[error("key command template is empty")]
    EmptyTemplate,

    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("'{program}' did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Sends one atomic keystroke: press, hold, release.
pub trait Effector: Send + Sync {
    fn send(&self, key: &str) -> impl Future<Output = Result<(), EffectorError>> + Send;
}

/// Logs keystrokes instead of sending them.
#[derive(Debug, Clone)]
pub struct DryRunEffector {
    delay: Duration,
}

impl DryRunEffector {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Effector for DryRunEffector {
    async fn send(&self, key: &str) -> Result<(), EffectorError> {
        if key.trim().is_empty() {
            return Err(EffectorError::EmptyKey);
        }
        info!(target: "spellcast::effector", "dry run: press {}", key);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Runs external press and release commands, e.g. `xdotool keydown {key}`.
#[derive(Debug, Clone)]
pub struct CommandEffector {
    press: Vec<String>,
    release: Vec<String>,
    delay: Duration,
}

impl CommandEffector {
    pub fn new(press: Vec<String>, release: Vec<String>, delay: Duration) -> Self {
        Self {
            press,
            release,
            delay,
        }
    }
}

impl Effector for CommandEffector {
    async fn send(&self, key: &str) -> Result<(), EffectorError> {
        if key.trim().is_empty() {
            return Err(EffectorError::EmptyKey);
        }

        let pressed = run_template(&self.press, key).await;
        tokio::time::sleep(self.delay).await;

        // A key must not stay held down, even if the press reported failure
        let released = if self.release.is_empty() {
            Ok(())
        } else {
            run_template(&self.release, key).await
        };

        pressed.and(released)
    }
}

/// Substitute `{key}` into each argument and run the result.
async fn run_template(template: &[String], key: &str) -> Result<(), EffectorError> {
    let args: Vec<String> = template.iter().map(|arg| arg.replace("{key}", key)).collect();
    let (program, rest) = args.split_first().ok_or(EffectorError::EmptyTemplate)?;
    debug!("Running key command: {}", args.join(" "));

    let output = tokio::process::Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(KEY_COMMAND_TIMEOUT, output)
        .await
        .map_err(|_| EffectorError::Timeout {
            program: program.clone(),
            timeout: KEY_COMMAND_TIMEOUT,
        })?
        .map_err(|source| EffectorError::Spawn {
            program: program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(EffectorError::Failed {
            program: program.clone(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Effector selected by the settings file.
#[derive(Debug, Clone)]
pub enum AnyEffector {
    DryRun(DryRunEffector),
    Command(CommandEffector),
}

impl AnyEffector {
    pub fn from_config(config: &EffectorConfig) -> Self {
        let delay = config.keypress_delay();
        match config.kind {
            EffectorKind::DryRun => AnyEffector::DryRun(DryRunEffector::new(delay)),
            EffectorKind::Command => AnyEffector::Command(CommandEffector::new(
                config.press.clone(),
                config.release.clone(),
                delay,
            )),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AnyEffector::DryRun(_) => "dry run (keys are logged, not sent)".to_string(),
            AnyEffector::Command(e) => format!("command `{}`", e.press.join(" ")),
        }
    }
}

impl Effector for AnyEffector {
    async fn send(&self, key: &str) -> Result<(), EffectorError> {
        match self {
            AnyEffector::DryRun(e) => e.send(key).await,
            AnyEffector::Command(e) => e.send(key).await,
        }
    }
}
