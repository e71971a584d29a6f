//! Spell-priority strategy documents.
//!
//! A strategy names two ordered priority lists (one per casting mode), a
//! global cooldown, and optional key aliases. Documents are written by hand
//! in YAML, JSON or TOML:
//!
//! ```yaml
//! name: Frostfire Mage
//! global_cooldown: 1.5
//! bindings:
//!   nuke: "1"
//! aoe_priority:
//!   - { name: blizzard, key: "3" }
//!   - { name: frostbolt, key: nuke }
//! single_target_priority:
//!   - { name: frostbolt, key: nuke }
//! ```
//!
//! Order in a list is priority, highest first.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::mode::Mode;

/// Cooldown used when a document does not set one.
pub const DEFAULT_GLOBAL_COOLDOWN_SECS: f64 = 1.5;

/// One entry of a priority list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellRule {
    /// Skill identifier, matched against ready detections.
    pub name: String,
    /// Alias from `bindings`, or a literal key.
    #[serde(deserialize_with = "key_text")]
    pub key: String,
}

impl SpellRule {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

/// An immutable spell-priority policy.
///
/// The default value is the empty strategy, which means "take no action".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_cooldown: Option<f64>,
    #[serde(deserialize_with = "key_map")]
    pub bindings: BTreeMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub aoe_priority: Vec<SpellRule>,
    #[serde(deserialize_with = "null_as_default")]
    pub single_target_priority: Vec<SpellRule>,
}

impl Strategy {
    /// Parse a document in the given format and validate it.
    pub fn parse(contents: &str, format: StrategyFormat) -> Result<Self, StrategyError> {
        let parse_err = |message: String| StrategyError::Parse { format, message };

        let strategy: Strategy = match format {
            StrategyFormat::Yaml => {
                serde_yaml::from_str(contents).map_err(|e| parse_err(e.to_string()))?
            }
            StrategyFormat::Json => {
                serde_json::from_str(contents).map_err(|e| parse_err(e.to_string()))?
            }
            StrategyFormat::Toml => toml::from_str(contents).map_err(|e| parse_err(e.to_string()))?,
        };

        if let Some(cooldown) = strategy.global_cooldown {
            if !cooldown.is_finite() || cooldown < 0.0 {
                return Err(StrategyError::InvalidCooldown(cooldown));
            }
        }

        Ok(strategy)
    }

    /// True when neither priority list has a rule.
    pub fn is_empty(&self) -> bool {
        self.aoe_priority.is_empty() && self.single_target_priority.is_empty()
    }

    /// Configured cooldown in seconds, or the default.
    pub fn cooldown_secs(&self) -> f64 {
        self.global_cooldown.unwrap_or(DEFAULT_GLOBAL_COOLDOWN_SECS)
    }

    /// Minimum spacing between two consecutive keystrokes.
    ///
    /// Saturates at [`Duration::MAX`] for values too large to represent.
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_secs()).unwrap_or(Duration::MAX)
    }

    /// Priority list governing `mode`. `Stopped` has none.
    pub fn priority(&self, mode: Mode) -> &[SpellRule] {
        match mode {
            Mode::Aoe => &self.aoe_priority,
            Mode::SingleTarget => &self.single_target_priority,
            Mode::Stopped => &[],
        }
    }

    /// Physical key for a rule: its alias target, or the literal key.
    pub fn keybind(&self, rule: &SpellRule) -> String {
        self.bindings
            .get(&rule.key)
            .cloned()
            .unwrap_or_else(|| rule.key.clone())
    }
}

/// Load and parse a strategy document from disk.
///
/// The format is picked from the file extension. A document without a
/// `name` takes the file stem.
pub fn load_strategy(path: &Path) -> Result<Strategy, StrategyError> {
    let contents = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            StrategyError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            StrategyError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let mut strategy = Strategy::parse(&contents, StrategyFormat::from_path(path))?;
    if strategy.name.trim().is_empty() {
        strategy.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(strategy)
}

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyFormat {
    Yaml,
    Json,
    Toml,
}

impl StrategyFormat {
    /// Pick a format from the file extension. Unknown extensions are YAML.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => StrategyFormat::Json,
            "toml" => StrategyFormat::Toml,
            _ => StrategyFormat::Yaml,
        }
    }
}

impl fmt::Display for StrategyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyFormat::Yaml => write!(f, "YAML"),
            StrategyFormat::Json => write!(f, "JSON"),
            StrategyFormat::Toml => write!(f, "TOML"),
        }
    }
}

/// Reasons a strategy could not be loaded.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {format} strategy document: {message}")]
    Parse {
        format: StrategyFormat,
        message: String,
    },

    #[error("global_cooldown must be a finite number >= 0, got {0}")]
    InvalidCooldown(f64),

    #[error("no strategy path configured")]
    NotConfigured,
}

/// Keys may be written as numbers in hand-edited documents (`key: 1`).
#[derive(Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
enum KeyRepr {
    Text(String),
    Number(i64),
}

impl From<KeyRepr> for String {
    fn from(repr: KeyRepr) -> Self {
        match repr {
            KeyRepr::Text(s) => s,
            KeyRepr::Number(n) => n.to_string(),
        }
    }
}

fn key_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    KeyRepr::deserialize(deserializer).map(String::from)
}

fn key_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    let raw: Option<HashMap<KeyRepr, KeyRepr>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(alias, key)| (alias.into(), key.into()))
        .collect())
}

/// An explicit `null` (e.g. `aoe_priority:` with nothing under it) is empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
