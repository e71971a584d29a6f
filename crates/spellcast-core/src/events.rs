//! Messages that cross the worker boundary.
//!
//! Outward: free-text log lines and structured [`Telemetry`]. Inward:
//! [`StepDecision`]s answering a pending debug step.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolver::Cast;

/// A resolved cast waiting for operator confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugStep {
    pub spell: String,
    pub keybind: String,
}

impl From<&Cast> for DebugStep {
    fn from(cast: &Cast) -> Self {
        Self {
            spell: cast.spell.clone(),
            keybind: cast.keybind.clone(),
        }
    }
}

/// Structured per-tick observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Telemetry {
    /// Every raw label seen this tick, in detection order.
    Detections { labels: Vec<String> },
    DebugStep(DebugStep),
}

/// Operator answer to a pending debug step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDecision {
    Execute,
    Skip,
}

impl StepDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            StepDecision::Execute => "execute",
            StepDecision::Skip => "skip",
        }
    }
}

impl fmt::Display for StepDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown step decision '{0}', expected 'execute' or 'skip'")]
pub struct UnknownDecision(pub String);

impl FromStr for StepDecision {
    type Err = UnknownDecision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "execute" => Ok(StepDecision::Execute),
            "skip" => Ok(StepDecision::Skip),
            _ => Err(UnknownDecision(s.to_string())),
        }
    }
}

/// One item of a `watch` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum WorkerEvent {
    Log { line: String },
    Telemetry { telemetry: Telemetry },
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEvent::Log { line } => f.write_str(line),
            WorkerEvent::Telemetry {
                telemetry: Telemetry::Detections { labels },
            } => write!(f, "[detections] {}", labels.join(", ")),
            WorkerEvent::Telemetry {
                telemetry: Telemetry::DebugStep(step),
            } => write!(f, "[debug step] {} -> {}", step.spell, step.keybind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_wire_format() {
        let t = Telemetry::Detections {
            labels: vec!["frostbolt_ready".to_string()],
        };
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"type":"detections","labels":["frostbolt_ready"]}"#);

        let step = Telemetry::DebugStep(DebugStep {
            spell: "frostbolt".to_string(),
            keybind: "1".to_string(),
        });
        let json = serde_json::to_string(&step).unwrap();
        assert_eq!(json, r#"{"type":"debug_step","spell":"frostbolt","keybind":"1"}"#);
    }

    #[test]
    fn test_step_decision_parse_is_case_insensitive() {
        assert_eq!("EXECUTE".parse::<StepDecision>(), Ok(StepDecision::Execute));
        assert_eq!(" skip\n".parse::<StepDecision>(), Ok(StepDecision::Skip));
        assert!("go".parse::<StepDecision>().is_err());
    }

    #[test]
    fn test_worker_event_roundtrip() {
        let event = WorkerEvent::Log {
            line: "Switched to AOE mode".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""channel":"log""#));
        let parsed: WorkerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_worker_event_display() {
        let event = WorkerEvent::Telemetry {
            telemetry: Telemetry::DebugStep(DebugStep {
                spell: "icelance".to_string(),
                keybind: "2".to_string(),
            }),
        };
        assert_eq!(event.to_string(), "[debug step] icelance -> 2");
    }
}
