//! Protocol types for CLI-daemon communication.
//!
//! One JSON object per line in each direction. A `watch` request is answered
//! by a stream of `event` responses sharing the request id, ending when the
//! engine stops or the client hangs up.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::events::{DebugStep, WorkerEvent};
use crate::mode::Mode;

/// A request from CLI to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands the daemon can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Start the casting engine, optionally gated by debug confirmation.
    Start {
        #[serde(default)]
        debug: bool,
    },
    /// Stop the casting engine.
    Stop,
    /// Report engine state.
    Status,
    /// Reload the strategy, from `path` or from the last loaded file.
    Reload { path: Option<String> },
    /// Inject a hotkey event.
    Press { key: String },
    /// Answer a pending debug step (`execute` or `skip`).
    Step { decision: String },
    /// Stream log lines and telemetry.
    Watch,
    /// Shutdown the daemon gracefully.
    Shutdown,
}

/// A response from daemon to CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Engine state snapshot.
    Status(WorkerStatus),
    /// One streamed item of a `watch`.
    Event { event: WorkerEvent },
    /// Generic success message.
    Ok { message: String },
}

/// Engine state as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub debug: bool,
    pub mode: Mode,
    pub strategy: Option<String>,
    pub global_cooldown_secs: f64,
    pub pending_step: Option<DebugStep>,
    /// RFC 3339 start time.
    pub started_at: Option<String>,
}

impl WorkerStatus {
    /// Status reported while no engine exists.
    pub fn stopped() -> Self {
        Self {
            running: false,
            debug: false,
            mode: Mode::Stopped,
            strategy: None,
            global_cooldown_secs: 0.0,
            pending_step: None,
            started_at: None,
        }
    }
}
