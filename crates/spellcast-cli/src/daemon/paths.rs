//! Socket and PID file locations.
//!
//! Directory, first match wins:
//! 1. `SPELLCAST_SOCKET_DIR`
//! 2. `XDG_RUNTIME_DIR/spellcast`
//! 3. `~/.spellcast`
//! 4. `<temp>/spellcast`
//!
//! Several daemons can coexist under different instance names
//! (`SPELLCAST_INSTANCE`, default `default`): `{dir}/{instance}.sock`.

use std::env;
use std::path::{Path, PathBuf};

pub const SOCKET_DIR_ENV: &str = "SPELLCAST_SOCKET_DIR";
pub const INSTANCE_ENV: &str = "SPELLCAST_INSTANCE";

const DEFAULT_INSTANCE: &str = "default";

/// Instance name from the environment, sanitized.
pub fn instance_name() -> String {
    let raw = env::var(INSTANCE_ENV).unwrap_or_default();
    if raw.is_empty() {
        return DEFAULT_INSTANCE.to_string();
    }
    sanitize_instance_name(&raw)
}

pub fn socket_dir() -> PathBuf {
    if let Some(dir) = non_empty_var(SOCKET_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(runtime_dir) = non_empty_var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("spellcast");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".spellcast");
    }
    env::temp_dir().join("spellcast")
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

/// Keep instance names usable as a file stem.
///
/// Only ASCII alphanumerics, `-` and `_` are allowed, and the name may not
/// start with `-`. Anything else maps to `default`.
pub(crate) fn sanitize_instance_name(name: &str) -> String {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        name.to_string()
    } else {
        tracing::warn!(
            "Invalid instance name {:?}, using '{}'. Use letters, digits, '-' or '_'.",
            name,
            DEFAULT_INSTANCE
        );
        DEFAULT_INSTANCE.to_string()
    }
}

pub fn socket_path() -> PathBuf {
    socket_dir().join(format!("{}.sock", instance_name()))
}

pub fn pid_path() -> PathBuf {
    socket_dir().join(format!("{}.pid", instance_name()))
}

/// Create `dir` if needed and restrict it to the current user.
pub fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests touching the environment must not interleave
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Restores the named variables on drop while holding the lock.
    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn new(names: &[&'static str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = names.iter().map(|name| (*name, env::var(name).ok())).collect();
            Self { saved, _lock: lock }
        }

        fn set(&self, name: &str, value: Option<&str>) {
            // SAFETY: ENV_MUTEX is held for the guard's lifetime
            unsafe {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                self.set(name, value.as_deref());
            }
        }
    }

    #[test]
    fn test_instance_defaults() {
        let env = EnvGuard::new(&[INSTANCE_ENV]);
        env.set(INSTANCE_ENV, None);
        assert_eq!(instance_name(), "default");
        env.set(INSTANCE_ENV, Some(""));
        assert_eq!(instance_name(), "default");
        env.set(INSTANCE_ENV, Some("raid-night"));
        assert_eq!(instance_name(), "raid-night");
    }

    #[test]
    fn test_socket_dir_priority() {
        let env = EnvGuard::new(&[SOCKET_DIR_ENV, "XDG_RUNTIME_DIR"]);

        env.set(SOCKET_DIR_ENV, Some("/custom/sockets"));
        env.set("XDG_RUNTIME_DIR", Some("/run/user/1000"));
        assert_eq!(socket_dir(), PathBuf::from("/custom/sockets"));

        env.set(SOCKET_DIR_ENV, Some(""));
        assert_eq!(socket_dir(), PathBuf::from("/run/user/1000/spellcast"));

        env.set("XDG_RUNTIME_DIR", None);
        env.set(SOCKET_DIR_ENV, None);
        let fallback = socket_dir();
        assert!(
            fallback.ends_with(".spellcast") || fallback.ends_with("spellcast"),
            "unexpected fallback {:?}",
            fallback
        );
    }

    #[test]
    fn test_paths_use_instance_name() {
        let env = EnvGuard::new(&[SOCKET_DIR_ENV, INSTANCE_ENV]);
        env.set(SOCKET_DIR_ENV, Some("/tmp/spellcast-test"));
        env.set(INSTANCE_ENV, Some("alt"));
        assert_eq!(socket_path(), PathBuf::from("/tmp/spellcast-test/alt.sock"));
        assert_eq!(pid_path(), PathBuf::from("/tmp/spellcast-test/alt.pid"));

        env.set(INSTANCE_ENV, Some("../../etc/passwd"));
        assert_eq!(socket_path(), PathBuf::from("/tmp/spellcast-test/default.sock"));
    }

    #[test]
    fn test_sanitize_accepts_safe_names() {
        for name in ["default", "main2", "raid_night", "alt-1", "_hidden"] {
            assert_eq!(sanitize_instance_name(name), name);
        }
    }

    #[test]
    fn test_sanitize_rejects_unsafe_names() {
        for name in [
            "",
            " ",
            "-x",
            "--instance",
            "..",
            "a/b",
            "/etc/passwd",
            "a\\b",
            "name\0",
            "$(whoami)",
            "a;b",
            "héllo",
        ] {
            assert_eq!(sanitize_instance_name(name), "default", "{:?}", name);
        }
    }
}
