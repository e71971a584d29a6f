//! Mode state machine and the hotkey listener task.
//!
//! Key events come from one bounded channel fed by the controller's `press`
//! command, by stdin in foreground mode, and by an optional hotkey source
//! file. The listener is the only writer of the current [`Mode`].

use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::time::Duration;

use spellcast_core::input::{display_key_name, normalize_key_name};
use spellcast_core::mode::{Mode, ModeAction, ModeKeymap, ModeSwitchKeys};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::channels::LogSink;

/// Pending key events before senders wait.
pub const KEY_CHANNEL_CAPACITY: usize = 64;

/// Pause before reopening a hotkey FIFO whose writer went away.
const FIFO_REOPEN_DELAY: Duration = Duration::from_millis(250);

/// Current mode plus the key map that drives it.
#[derive(Debug)]
pub struct ModeMachine {
    tx: watch::Sender<Mode>,
    keymap: ModeKeymap,
    log: LogSink,
}

impl ModeMachine {
    /// A machine in `Stopped`.
    pub fn new(keys: &ModeSwitchKeys, log: LogSink) -> Self {
        let (tx, _) = watch::channel(Mode::Stopped);
        Self {
            tx,
            keymap: ModeKeymap::new(keys),
            log,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Mode {
        *self.tx.borrow()
    }

    /// Apply a raw key event. Unmapped or malformed keys are ignored
    /// without a log line.
    pub fn handle_key(&self, raw_key: &str) -> Option<Mode> {
        let Some(action) = self.keymap.action_for(raw_key) else {
            debug!("Ignoring key event {:?}", raw_key);
            return None;
        };
        let mode = self.current().after(action);
        self.tx.send_replace(mode);
        self.log.info(action.announcement());
        Some(mode)
    }

    /// Tell the operator which keys do what.
    pub fn announce(&self, keys: &ModeSwitchKeys) {
        if keys.is_empty() {
            self.log
                .warn("Warning: no mode switch keys configured; set [mode_switch_keys] in the settings file");
            return;
        }
        self.log.info("Keyboard listener started");
        for (action, key) in keys.bindings() {
            match normalize_key_name(key) {
                Some(name) => self.log.info(format!(
                    "Press {} to {}",
                    display_key_name(&name),
                    action_hint(action)
                )),
                None => self.log.warn(format!(
                    "Ignoring malformed key {:?} for {}",
                    key,
                    action.config_name()
                )),
            }
        }
    }
}

fn action_hint(action: ModeAction) -> &'static str {
    match action {
        ModeAction::EnterAoe => "switch to aoe mode",
        ModeAction::EnterSingle => "switch to single target mode",
        ModeAction::Stop => "stop casting",
    }
}

/// Apply key events until cancelled or every sender is gone.
pub async fn run_listener(
    machine: ModeMachine,
    mut keys: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            key = keys.recv() => match key {
                Some(key) => {
                    machine.handle_key(&key);
                }
                None => break,
            },
        }
    }
    debug!("Mode listener stopped");
}

enum SourceEnd {
    Eof,
    Stopped,
}

/// Forward newline-separated key names from a FIFO or regular file.
///
/// A regular file is read once. A FIFO is reopened whenever its writer
/// closes, so an external hotkey daemon may come and go.
pub async fn read_hotkey_source(
    path: PathBuf,
    keys: mpsc::Sender<String>,
    log: LogSink,
    cancel: CancellationToken,
) {
    let is_fifo = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.file_type().is_fifo(),
        Err(e) => {
            log.warn(format!(
                "Cannot open hotkey source {}: {}",
                path.display(),
                e
            ));
            return;
        }
    };

    if !is_fifo {
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                if let Err(e) = forward_lines(file, &keys, &cancel).await {
                    log.warn(format!("Hotkey source {} failed: {}", path.display(), e));
                }
            }
            Err(e) => log.warn(format!(
                "Cannot open hotkey source {}: {}",
                path.display(),
                e
            )),
        }
        return;
    }

    log.info(format!("Reading hotkeys from {}", path.display()));
    loop {
        let receiver = match pipe::OpenOptions::new().open_receiver(&path) {
            Ok(receiver) => receiver,
            Err(e) => {
                log.warn(format!(
                    "Cannot open hotkey source {}: {}",
                    path.display(),
                    e
                ));
                return;
            }
        };

        match forward_lines(receiver, &keys, &cancel).await {
            Ok(SourceEnd::Stopped) => return,
            Ok(SourceEnd::Eof) => {}
            Err(e) => debug!("Hotkey FIFO read error: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(FIFO_REOPEN_DELAY) => {}
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    keys: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> std::io::Result<SourceEnd> {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(SourceEnd::Stopped),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(SourceEnd::Eof);
        };
        let key = line.trim();
        if key.is_empty() {
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SourceEnd::Stopped),
            sent = keys.send(key.to_string()) => {
                if sent.is_err() {
                    return Ok(SourceEnd::Stopped);
                }
            }
        }
    }
}
