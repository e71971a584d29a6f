//! Spell selection.
//!
//! Pure function of (ready skills, mode, strategy). Priority is the order of
//! the mode's list; confidence and remaining cooldowns play no part.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::mode::Mode;
use crate::strategy::Strategy;

/// A resolved action: which spell, and which physical key casts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cast {
    pub spell: String,
    pub keybind: String,
}

/// Pick the highest-priority ready spell for `mode`.
///
/// Returns `None` when stopped, when the list is empty, or when nothing in
/// the list is ready.
pub fn resolve(ready_skills: &HashSet<String>, mode: Mode, strategy: &Strategy) -> Option<Cast> {
    if !mode.is_casting() {
        return None;
    }

    strategy
        .priority(mode)
        .iter()
        .find(|rule| ready_skills.contains(&rule.name))
        .map(|rule| Cast {
            spell: rule.name.clone(),
            keybind: strategy.keybind(rule),
        })
}
