//! Key name normalization.
//!
//! Hotkey events arrive as free-form key names from whatever hook feeds the
//! listener (`F1`, `Key.f1`, `'q'`, `Esc`, ...). Configured mode switch keys
//! are written by hand. Both sides go through [`normalize_key_name`] so they
//! compare equal regardless of spelling.

/// Normalize a key name for comparison.
///
/// - Case-insensitive: `F1` and `f1` are the same key
/// - `Key.` prefixes are stripped (`Key.f1` -> `f1`)
/// - Quoted characters are unquoted (`'q'` -> `q`)
/// - Common aliases collapse to one spelling (`esc` -> `escape`)
///
/// Returns `None` for malformed names: empty, whitespace only, or containing
/// control characters.
pub fn normalize_key_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        return None;
    }

    let without_prefix = trimmed
        .strip_prefix("Key.")
        .or_else(|| trimmed.strip_prefix("key."))
        .unwrap_or(trimmed);

    let unquoted = without_prefix
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .filter(|s| !s.is_empty())
        .unwrap_or(without_prefix);

    let lower = unquoted.to_lowercase();
    if lower.trim().is_empty() {
        // A quoted space is still the space key
        return if unquoted == " " {
            Some("space".to_string())
        } else {
            None
        };
    }

    Some(canonical_alias(&lower).unwrap_or(&lower).to_string())
}

/// Map an alternative spelling to its canonical key name.
fn canonical_alias(key: &str) -> Option<&'static str> {
    let canonical = match key {
        "esc" => "escape",
        "return" => "enter",
        "del" => "delete",
        "ins" => "insert",
        "bksp" | "back" => "backspace",
        "spacebar" => "space",
        "pgup" | "page_up" | "prior" => "pageup",
        "pgdn" | "page_down" | "next" => "pagedown",
        "arrowup" => "up",
        "arrowdown" => "down",
        "arrowleft" => "left",
        "arrowright" => "right",
        "ctrl_l" | "ctrl_r" | "control" => "ctrl",
        "alt_l" | "alt_r" | "alt_gr" | "option" => "alt",
        "shift_l" | "shift_r" => "shift",
        "cmd" | "cmd_l" | "cmd_r" | "super" | "meta" | "win" => "super",
        _ => return None,
    };
    Some(canonical)
}

/// Display form for operator-facing messages (`f1` -> `F1`).
pub fn display_key_name(key: &str) -> String {
    key.to_uppercase()
}
