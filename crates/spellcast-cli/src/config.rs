//! Settings file (TOML).
//!
//! Lookup order: `--config <path>`, `./spellcast.toml`, then
//! `<config_dir>/spellcast/config.toml`. A missing or broken file is not
//! fatal: the engine runs with defaults, which cast nothing.
//!
//! ```toml
//! current_strategy = "strategies/frost.yaml"
//! screen_capture_region = [0, 0, 1920, 1080]
//!
//! [mode_switch_keys]
//! aoe_mode = "f1"
//! single_target_mode = "f2"
//! stop_casting = "f3"
//!
//! [perception]
//! kind = "command"
//! command = ["python3", "detect.py"]
//! model = "models/best.pt"
//!
//! [effector]
//! kind = "command"
//! press = ["xdotool", "keydown", "{key}"]
//! release = ["xdotool", "keyup", "{key}"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spellcast_core::detection::Region;
use spellcast_core::mode::ModeSwitchKeys;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::channels::LogSink;

/// Settings file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "spellcast.toml";

const DEFAULT_DETECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_KEYPRESS_DELAY_MS: u64 = 50;

/// Everything the worker needs to run. Built once per start and passed in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Strategy document loaded at start.
    pub current_strategy: Option<PathBuf>,
    pub mode_switch_keys: ModeSwitchKeys,
    /// Capture rectangle; absent means full screen.
    pub screen_capture_region: Option<Region>,
    /// FIFO or file of newline-separated key names.
    pub hotkey_source: Option<PathBuf>,
    pub perception: PerceptionConfig,
    #[serde(alias = "keystroke_sender")]
    pub effector: EffectorConfig,
}

/// Which detector feeds the loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerceptionConfig {
    /// No detector; every tick sees nothing.
    #[default]
    Disabled,
    /// External detector program printing a JSON array of detections.
    Command {
        command: Vec<String>,
        /// Opaque model reference handed to the program.
        #[serde(default)]
        model: Option<String>,
        #[serde(default = "default_detect_timeout_ms")]
        timeout_ms: u64,
    },
    /// Recorded frames, one JSON array per line, replayed in a cycle.
    Replay { path: PathBuf },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectorKind {
    /// Log keystrokes without sending them.
    #[default]
    DryRun,
    /// Run `press` and `release` argument templates.
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectorConfig {
    pub kind: EffectorKind,
    /// Press template; `{key}` is replaced by the key name.
    pub press: Vec<String>,
    pub release: Vec<String>,
    /// Hold time between press and release.
    pub keypress_delay_ms: u64,
}

impl Default for EffectorConfig {
    fn default() -> Self {
        Self {
            kind: EffectorKind::DryRun,
            press: Vec::new(),
            release: Vec::new(),
            keypress_delay_ms: DEFAULT_KEYPRESS_DELAY_MS,
        }
    }
}

impl EffectorConfig {
    pub fn keypress_delay(&self) -> Duration {
        Duration::from_millis(self.keypress_delay_ms)
    }
}

fn default_detect_timeout_ms() -> u64 {
    DEFAULT_DETECT_TIMEOUT_MS
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("{0}")]
    Invalid(String),
}

impl Settings {
    /// Reject settings that cannot work at all.
    ///
    /// A degenerate capture region is not an error here; see
    /// [`Settings::normalized`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let PerceptionConfig::Command {
            command,
            timeout_ms,
            ..
        } = &self.perception
        {
            if command
                .first()
                .map_or(true, |program| program.trim().is_empty())
            {
                return Err(ConfigError::Invalid(
                    "perception.command must be a non-empty array".to_string(),
                ));
            }
            if *timeout_ms == 0 {
                return Err(ConfigError::Invalid(
                    "perception.timeout_ms must be > 0".to_string(),
                ));
            }
        }
        if self.effector.kind == EffectorKind::Command
            && self
                .effector
                .press
                .first()
                .map_or(true, |program| program.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "effector.press must be a non-empty array when kind = \"command\"".to_string(),
            ));
        }
        Ok(())
    }

    /// Anchor relative file paths at `base`.
    pub fn resolve_relative(mut self, base: &Path) -> Self {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        if let Some(path) = self.current_strategy.as_mut() {
            anchor(path);
        }
        if let Some(path) = self.hotkey_source.as_mut() {
            anchor(path);
        }
        if let PerceptionConfig::Replay { path } = &mut self.perception {
            anchor(path);
        }
        self
    }

    /// Drop a capture region with no area, falling back to full screen.
    pub fn normalized(mut self) -> Self {
        if let Some(region) = self.screen_capture_region {
            if !region.is_valid() {
                warn!(
                    "Ignoring screen_capture_region {} (needs x2 > x1 and y2 > y1), capturing full screen",
                    region
                );
                self.screen_capture_region = None;
            }
        }
        self
    }
}

/// Default settings path when `--config` is not given.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("spellcast").join("config.toml"))
        .unwrap_or(local)
}

/// Read and validate a settings file.
pub fn try_load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let settings: Settings = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    settings.validate()?;
    Ok(settings.normalized())
}

/// Settings plus where they came from and what went wrong, if anything.
#[derive(Debug)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub path: PathBuf,
    /// Set when defaults were used instead of the file.
    pub problem: Option<ConfigError>,
}

impl LoadedSettings {
    /// Tell the operator which settings are in effect.
    pub fn report(&self, log: &LogSink) {
        match &self.problem {
            None => log.info(format!("Loaded settings from {}", self.path.display())),
            Some(ConfigError::NotFound(_)) => log.info(format!(
                "No settings file at {}, using defaults",
                self.path.display()
            )),
            Some(problem) => log.warn(format!("{}; using default settings", problem)),
        }
    }
}

/// Load settings, falling back to defaults on any problem.
///
/// Relative paths inside the file resolve against the file's directory.
pub fn load_settings(path: Option<&Path>) -> LoadedSettings {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    match try_load_settings(&path) {
        Ok(settings) => {
            let base = path.parent().unwrap_or(Path::new("."));
            debug!("Loaded settings from {}", path.display());
            LoadedSettings {
                settings: settings.resolve_relative(base),
                path,
                problem: None,
            }
        }
        Err(problem) => {
            if !matches!(problem, ConfigError::NotFound(_)) {
                warn!("{}; using default settings", problem);
            }
            LoadedSettings {
                settings: Settings::default(),
                path,
                problem: Some(problem),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("spellcast.toml");
        std::fs::write(&path, contents).expect("write settings");
        path
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.perception, PerceptionConfig::Disabled);
        assert_eq!(settings.effector.kind, EffectorKind::DryRun);
        assert_eq!(settings.effector.keypress_delay(), Duration::from_millis(50));
        assert!(settings.mode_switch_keys.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_full_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            &temp,
            r#"
current_strategy = "frost.yaml"
screen_capture_region = [0, 0, 1920, 1080]
hotkey_source = "/tmp/spellcast.keys"

[mode_switch_keys]
aoe_mode = "f1"
single_target_mode = "f2"
stop_casting = "f3"

[perception]
kind = "command"
command = ["python3", "detect.py"]
model = "best.pt"

[keystroke_sender]
kind = "command"
press = ["xdotool", "keydown", "{key}"]
release = ["xdotool", "keyup", "{key}"]
keypress_delay_ms = 30
"#,
        );

        let settings = try_load_settings(&path).expect("load");
        assert_eq!(settings.current_strategy, Some(PathBuf::from("frost.yaml")));
        assert_eq!(settings.screen_capture_region, Some(Region::new(0, 0, 1920, 1080)));
        assert_eq!(settings.mode_switch_keys.stop_casting.as_deref(), Some("f3"));
        assert_eq!(
            settings.perception,
            PerceptionConfig::Command {
                command: vec!["python3".to_string(), "detect.py".to_string()],
                model: Some("best.pt".to_string()),
                timeout_ms: 5000,
            }
        );
        assert_eq!(settings.effector.kind, EffectorKind::Command);
        assert_eq!(settings.effector.keypress_delay_ms, 30);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = try_load_settings(&temp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));

        let loaded = load_settings(Some(&temp.path().join("missing.toml")));
        assert_eq!(loaded.settings, Settings::default());
        assert!(matches!(loaded.problem, Some(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "current_strategy = [");
        assert!(matches!(
            try_load_settings(&path),
            Err(ConfigError::Parse { .. })
        ));
        let loaded = load_settings(Some(&path));
        assert_eq!(loaded.settings, Settings::default());

        let log = LogSink::new();
        let mut lines = log.subscribe();
        loaded.report(&log);
        assert!(lines.try_recv().unwrap().ends_with("using default settings"));
    }

    #[test]
    fn test_relative_paths_follow_the_settings_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            &temp,
            r#"
current_strategy = "strategies/frost.yaml"
hotkey_source = "/run/keys.fifo"

[perception]
kind = "replay"
path = "frames.jsonl"
"#,
        );

        let loaded = load_settings(Some(&path));
        assert!(loaded.problem.is_none());
        let settings = loaded.settings;
        assert_eq!(
            settings.current_strategy,
            Some(temp.path().join("strategies/frost.yaml"))
        );
        assert_eq!(settings.hotkey_source, Some(PathBuf::from("/run/keys.fifo")));
        assert_eq!(
            settings.perception,
            PerceptionConfig::Replay {
                path: temp.path().join("frames.jsonl")
            }
        );
    }

    #[test]
    fn test_degenerate_region_means_full_screen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "screen_capture_region = [100, 100, 50, 400]\n");
        let settings = try_load_settings(&path).expect("load");
        assert_eq!(settings.screen_capture_region, None);
    }

    #[test]
    fn test_extreme_region_coordinates_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            &temp,
            "screen_capture_region = [-2147483648, 0, 2147483647, 1]\n",
        );
        let settings = try_load_settings(&path).expect("load");
        assert_eq!(
            settings.screen_capture_region,
            Some(Region::new(i32::MIN, 0, i32::MAX, 1))
        );
    }

    #[test]
    fn test_command_perception_requires_program() {
        let settings = Settings {
            perception: PerceptionConfig::Command {
                command: vec![],
                model: None,
                timeout_ms: 100,
            },
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_command_effector_requires_press() {
        let settings = Settings {
            effector: EffectorConfig {
                kind: EffectorKind::Command,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
