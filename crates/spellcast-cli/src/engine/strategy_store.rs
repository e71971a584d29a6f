//! Holds the active strategy and swaps it atomically on reload.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use spellcast_core::strategy::{load_strategy, Strategy, StrategyError};
use tokio::sync::watch;

use crate::engine::channels::LogSink;

/// Single writer for the active [`Strategy`].
///
/// Readers hold a `watch::Receiver` and clone the `Arc` once per tick, so a
/// reload is always observed as a whole document.
#[derive(Debug)]
pub struct StrategyStore {
    tx: watch::Sender<Arc<Strategy>>,
    last_path: Mutex<Option<PathBuf>>,
    log: LogSink,
}

impl StrategyStore {
    /// A store holding the empty strategy.
    pub fn new(log: LogSink) -> Self {
        let (tx, _) = watch::channel(Arc::new(Strategy::default()));
        Self {
            tx,
            last_path: Mutex::new(None),
            log,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Strategy>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<Strategy> {
        self.tx.borrow().clone()
    }

    /// Load `path` and make it active.
    ///
    /// On failure the empty strategy becomes active, so the loop stops
    /// acting until a good document is loaded.
    pub fn load(&self, path: &Path) -> Result<Arc<Strategy>, StrategyError> {
        if let Ok(mut last) = self.last_path.lock() {
            *last = Some(path.to_path_buf());
        }

        match load_strategy(path) {
            Ok(strategy) => {
                let strategy = Arc::new(strategy);
                self.tx.send_replace(strategy.clone());
                self.log.info(format!("Loaded strategy: {}", strategy.name));
                self.log.info(format!(
                    "Global cooldown set to {}s",
                    strategy.cooldown_secs()
                ));
                if strategy.is_empty() {
                    self.log
                        .warn("Strategy has no spells in either priority list; nothing will be cast");
                }
                Ok(strategy)
            }
            Err(e) => {
                self.tx.send_replace(Arc::new(Strategy::default()));
                self.log.warn(format!("Failed to load strategy: {}", e));
                Err(e)
            }
        }
    }

    /// Load `path`, or re-read the last loaded path.
    pub fn reload(&self, path: Option<&Path>) -> Result<Arc<Strategy>, StrategyError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self
                .last_path()
                .ok_or(StrategyError::NotConfigured)?,
        };
        self.load(&path)
    }

    pub fn last_path(&self) -> Option<PathBuf> {
        self.last_path.lock().ok().and_then(|last| last.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spellcast_core::mode::Mode;
    use spellcast_core::resolver::resolve;
    use std::collections::HashSet;
    use std::time::Duration;

    const FROST: &str = r#"
name: Frost
global_cooldown: 2
aoe_priority:
  - {name: frostbolt, key: "1"}
  - {name: icelance, key: "2"}
"#;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).expect("write strategy");
        path
    }

    #[test]
    fn test_starts_empty() {
        let store = StrategyStore::new(LogSink::new());
        assert!(store.current().is_empty());
        assert_eq!(store.current().cooldown(), Duration::from_secs_f64(1.5));
    }

    #[test]
    fn test_load_publishes_to_subscribers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StrategyStore::new(LogSink::new());
        let rx = store.subscribe();

        store.load(&write(&temp, "frost.yaml", FROST)).expect("load");
        assert_eq!(rx.borrow().name, "Frost");
        assert_eq!(rx.borrow().cooldown(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_file_leaves_empty_strategy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StrategyStore::new(LogSink::new());
        let log = store.log.clone();
        let mut lines = log.subscribe();

        let err = store.load(&temp.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, StrategyError::NotFound { .. }));
        assert!(store.current().is_empty());
        assert!(lines.try_recv().unwrap().starts_with("Failed to load strategy"));
    }

    #[test]
    fn test_malformed_reload_replaces_with_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StrategyStore::new(LogSink::new());
        store.load(&write(&temp, "frost.yaml", FROST)).expect("load");

        let broken = write(&temp, "broken.yaml", "aoe_priority: [");
        assert!(matches!(
            store.reload(Some(&broken)),
            Err(StrategyError::Parse { .. })
        ));
        assert!(store.current().is_empty());
    }

    #[test]
    fn test_reload_without_path_rereads_last() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StrategyStore::new(LogSink::new());
        let path = write(&temp, "frost.yaml", FROST);
        store.load(&path).expect("load");

        std::fs::write(&path, FROST.replace("name: Frost", "name: Frost v2")).unwrap();
        let reloaded = store.reload(None).expect("reload");
        assert_eq!(reloaded.name, "Frost v2");
    }

    #[test]
    fn test_reload_without_any_path_is_not_configured() {
        let store = StrategyStore::new(LogSink::new());
        assert!(matches!(store.reload(None), Err(StrategyError::NotConfigured)));
    }

    #[test]
    fn test_reloading_unchanged_document_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StrategyStore::new(LogSink::new());
        let path = write(&temp, "frost.yaml", FROST);

        let first = store.reload(Some(&path)).expect("first");
        let second = store.reload(None).expect("second");
        assert_eq!(*first, *second);

        let ready: HashSet<String> = ["icelance".to_string()].into_iter().collect();
        assert_eq!(
            resolve(&ready, Mode::Aoe, &first),
            resolve(&ready, Mode::Aoe, &second)
        );
    }
}
