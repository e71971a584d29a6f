//! Casting modes and the hotkey map that switches between them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::input::normalize_key_name;

/// The active casting policy.
///
/// `Stopped` is both the initial state and the safe no-op state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Aoe,
    SingleTarget,
    #[default]
    Stopped,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Aoe => "AOE",
            Mode::SingleTarget => "SINGLE_TARGET",
            Mode::Stopped => "STOPPED",
        }
    }

    /// True for the modes that select a priority list.
    pub fn is_casting(self) -> bool {
        !matches!(self, Mode::Stopped)
    }

    /// State after applying `action`. Every action is valid from every state.
    pub fn after(self, action: ModeAction) -> Mode {
        action.target()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a mapped hotkey does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeAction {
    EnterAoe,
    EnterSingle,
    Stop,
}

impl ModeAction {
    /// Mode reached by this action.
    pub fn target(self) -> Mode {
        match self {
            ModeAction::EnterAoe => Mode::Aoe,
            ModeAction::EnterSingle => Mode::SingleTarget,
            ModeAction::Stop => Mode::Stopped,
        }
    }

    /// Log line emitted when the action fires.
    pub fn announcement(self) -> &'static str {
        match self {
            ModeAction::EnterAoe => "Switched to AOE mode",
            ModeAction::EnterSingle => "Switched to single target mode",
            ModeAction::Stop => "Stopped automatic casting",
        }
    }

    /// Name of the settings field that binds this action.
    pub fn config_name(self) -> &'static str {
        match self {
            ModeAction::EnterAoe => "aoe_mode",
            ModeAction::EnterSingle => "single_target_mode",
            ModeAction::Stop => "stop_casting",
        }
    }
}

/// Hotkey bindings as written in the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeSwitchKeys {
    pub aoe_mode: Option<String>,
    pub single_target_mode: Option<String>,
    pub stop_casting: Option<String>,
}

impl ModeSwitchKeys {
    /// Configured `(action, key)` pairs in declaration order.
    pub fn bindings(&self) -> Vec<(ModeAction, &str)> {
        [
            (ModeAction::EnterAoe, self.aoe_mode.as_deref()),
            (ModeAction::EnterSingle, self.single_target_mode.as_deref()),
            (ModeAction::Stop, self.stop_casting.as_deref()),
        ]
        .into_iter()
        .filter_map(|(action, key)| key.map(|k| (action, k)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings().is_empty()
    }
}

/// Normalized key name -> action lookup.
///
/// When two actions share a key, the later binding in declaration order
/// (`aoe_mode`, `single_target_mode`, `stop_casting`) wins, so a shared key
/// always errs toward stopping.
#[derive(Debug, Clone, Default)]
pub struct ModeKeymap {
    keys: HashMap<String, ModeAction>,
}

impl ModeKeymap {
    pub fn new(keys: &ModeSwitchKeys) -> Self {
        let keys = keys
            .bindings()
            .into_iter()
            .filter_map(|(action, key)| normalize_key_name(key).map(|k| (k, action)))
            .collect();
        Self { keys }
    }

    /// Action bound to a raw key event, if any.
    ///
    /// Malformed key names never match.
    pub fn action_for(&self, raw_key: &str) -> Option<ModeAction> {
        let key = normalize_key_name(raw_key)?;
        self.keys.get(&key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
