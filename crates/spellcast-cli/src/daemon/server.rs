//! Unix socket server for the daemon process.
//!
//! The daemon owns at most one running engine. Clients start, stop and steer
//! it with one JSON request per line; `watch` turns the connection into a
//! stream of engine events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use spellcast_core::error::ApiError;
use spellcast_core::events::{DebugStep, StepDecision};
use spellcast_core::protocol::{Command, Request, Response, ResponseData, WorkerStatus};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::load_settings;
use crate::daemon::paths;
use crate::engine::worker::{ConfiguredWorker, ListenerStopped, StepRejected};
use crate::engine::{WorkerEvents, WorkerHandle};

/// Maximum number of concurrent client connections.
const MAX_CONNECTIONS: usize = 100;

/// How long the daemon waits with no engine and no clients before exiting.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How long in-flight connections get to finish during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum request size in bytes.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Lifecycle of the single engine a daemon hosts.
pub struct Controller {
    config_path: Option<PathBuf>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Controller {
    /// Settings are re-read from `config_path` on every start.
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self {
            config_path,
            worker: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    pub async fn start(&self, debug_mode: bool) -> Result<WorkerStatus, ApiError> {
        let mut slot = self.worker.lock().await;
        if slot.is_some() {
            return Err(ApiError::engine_already_running());
        }

        let loaded = load_settings(self.config_path.as_deref());
        let worker = ConfiguredWorker::from_settings(loaded.settings.clone(), debug_mode)
            .map_err(|e| ApiError::configuration(format!("{:#}", e)))?;
        loaded.report(worker.log());
        worker.announce_adapters();

        let handle = worker.start();
        let status = handle.status();
        info!("Engine started (debug: {})", debug_mode);
        *slot = Some(handle);
        Ok(status)
    }

    pub async fn stop(&self) -> Result<(), ApiError> {
        let mut slot = self.worker.lock().await;
        let handle = slot.take().ok_or_else(ApiError::engine_not_running)?;
        handle.stop().await;
        info!("Engine stopped");
        Ok(())
    }

    pub async fn status(&self) -> WorkerStatus {
        match self.worker.lock().await.as_ref() {
            Some(handle) => handle.status(),
            None => WorkerStatus::stopped(),
        }
    }

    /// Returns the name of the strategy now active.
    pub async fn reload(&self, path: Option<&Path>) -> Result<String, ApiError> {
        let slot = self.worker.lock().await;
        let handle = slot.as_ref().ok_or_else(ApiError::engine_not_running)?;
        let strategy = handle.reload(path)?;
        Ok(strategy.name.clone())
    }

    pub async fn press(&self, key: &str) -> Result<(), ApiError> {
        if key.trim().is_empty() {
            return Err(ApiError::invalid_input_with_suggestion(
                "No key specified",
                "Name a key, e.g. 'spellcast press f1'",
            ));
        }
        let slot = self.worker.lock().await;
        let handle = slot.as_ref().ok_or_else(ApiError::engine_not_running)?;
        handle
            .press_key(key)
            .await
            .map_err(|ListenerStopped| ApiError::command_failed("The mode listener has stopped"))
    }

    /// Answer the pending debug step with `execute` or `skip`.
    pub async fn step(&self, decision: &str) -> Result<(StepDecision, DebugStep), ApiError> {
        let decision: StepDecision = decision.parse().map_err(|e| {
            ApiError::invalid_input_with_suggestion(
                format!("{}", e),
                "Use 'spellcast step execute' or 'spellcast step skip'",
            )
        })?;

        let slot = self.worker.lock().await;
        let handle = slot.as_ref().ok_or_else(ApiError::engine_not_running)?;
        match handle.decide(decision).await {
            Ok(step) => Ok((decision, step)),
            Err(StepRejected::NotDebug) => Err(ApiError::not_in_debug_mode()),
            Err(StepRejected::NothingPending) => Err(ApiError::invalid_input_with_suggestion(
                "No debug step is waiting for a decision",
                "Wait for a '[debug] Paused' line in 'spellcast watch'",
            )),
            Err(e @ StepRejected::Stopped) => Err(ApiError::command_failed(e.to_string())),
        }
    }

    pub async fn subscribe(&self) -> Result<WorkerEvents, ApiError> {
        let slot = self.worker.lock().await;
        let handle = slot.as_ref().ok_or_else(ApiError::engine_not_running)?;
        Ok(handle.subscribe())
    }

    /// Stop the engine if one is running.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            handle.stop().await;
        }
    }
}

/// The daemon server that listens for client connections.
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    controller: Arc<Controller>,
    connection_semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl DaemonServer {
    /// Bind to the socket for the current instance.
    pub async fn bind(config_path: Option<PathBuf>) -> Result<Self> {
        Self::bind_to(paths::socket_path(), paths::pid_path(), config_path).await
    }

    /// Bind to a specific socket path.
    ///
    /// Binds first, and only on `AddrInUse` looks at the PID file: a live
    /// daemon is an error, a dead one leaves a stale socket that is removed.
    pub async fn bind_to(
        socket_path: PathBuf,
        pid_path: PathBuf,
        config_path: Option<PathBuf>,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            paths::ensure_private_dir(parent).with_context(|| {
                format!("Failed to create socket directory for {:?}", socket_path)
            })?;
        }

        // The PID file goes in right after bind, so a client that sees the
        // socket also sees a live PID
        let write_pid = |pid_path: &PathBuf| -> Result<()> {
            std::fs::write(pid_path, std::process::id().to_string())
                .with_context(|| format!("Failed to write PID file: {:?}", pid_path))
        };

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => {
                write_pid(&pid_path)?;
                l
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_daemon_alive(&pid_path) {
                    anyhow::bail!(
                        "Daemon already running (socket {:?} in use, PID file valid)",
                        socket_path
                    );
                }
                remove_stale_socket(&socket_path)?;

                let l = UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?;
                write_pid(&pid_path)?;
                l
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        info!("Daemon listening on {:?}", socket_path);

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            controller: Arc::new(Controller::new(config_path)),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop the hosted engine, if any. Used on signal-driven exit.
    pub async fn stop_engine(&self) {
        self.controller.shutdown().await;
    }

    /// Accept connections until a shutdown request or the idle timeout.
    ///
    /// In-flight connections get [`GRACEFUL_SHUTDOWN_TIMEOUT`] to finish,
    /// then are aborted. Socket and PID files are removed on drop.
    pub async fn run(&self) -> Result<()> {
        self.spawn_idle_shutdown_task();

        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("Accepted new connection");
                            let controller = self.controller.clone();
                            let shutdown = self.shutdown.clone();
                            connection_tasks.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, controller, shutdown).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, waiting for in-flight connections");
                    break;
                }
            }
        }

        // Watch streams end once the engine is gone
        self.controller.shutdown().await;

        if !connection_tasks.is_empty() {
            info!(
                "Waiting for {} in-flight connection(s) to complete",
                connection_tasks.len()
            );

            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Graceful shutdown timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        Ok(())
    }

    /// Exit after [`IDLE_TIMEOUT`] with no engine and no client connected.
    fn spawn_idle_shutdown_task(&self) {
        let controller = self.controller.clone();
        let shutdown = self.shutdown.clone();
        let semaphore = self.connection_semaphore.clone();

        tokio::spawn(async move {
            let mut idle_since: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {}
                }

                let engine_running = controller.is_running().await;
                let has_connections = semaphore.available_permits() < MAX_CONNECTIONS;

                if engine_running || has_connections {
                    if idle_since.is_some() {
                        debug!("Activity detected, resetting idle timer");
                    }
                    idle_since = None;
                    continue;
                }

                let idle_start = *idle_since.get_or_insert_with(Instant::now);
                if idle_start.elapsed() >= IDLE_TIMEOUT {
                    info!(
                        "No activity for {} seconds, shutting down",
                        IDLE_TIMEOUT.as_secs()
                    );
                    shutdown.cancel();
                    break;
                }

                debug!(
                    "Idle for {} seconds (shutdown in {} seconds)",
                    idle_start.elapsed().as_secs(),
                    IDLE_TIMEOUT.saturating_sub(idle_start.elapsed()).as_secs()
                );
            }
        });
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("Failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("Failed to remove PID file on shutdown");
        }
    }
}

/// Remove a socket left behind by a dead daemon. Refuses symlinks and
/// anything that is not a socket.
fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(socket_path)
        .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;

    if metadata.file_type().is_symlink() {
        anyhow::bail!(
            "Socket path {:?} is a symlink, refusing to delete it",
            socket_path
        );
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            anyhow::bail!(
                "Path {:?} exists but is not a socket file (type: {:?})",
                socket_path,
                metadata.file_type()
            );
        }
    }

    info!("Removing stale socket from dead daemon");
    std::fs::remove_file(socket_path)
        .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))
}

/// True when the PID file names a process that still exists.
fn is_daemon_alive(pid_path: &Path) -> bool {
    let pid: i32 = match std::fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
    {
        Some(pid) => pid,
        None => return false,
    };

    // SAFETY: signal 0 delivers nothing; it only checks that the process
    // exists and may be signalled.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Read one line of at most `max_size` bytes.
///
/// Returns the number of bytes read; 0 means EOF.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from client")?;

        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            anyhow::bail!("Request too large: exceeded {} byte limit", max_size);
        }

        // Multi-byte characters may straddle reads; validate once at the end
        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;
        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
    buf.push_str(line);
    Ok(total)
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    let mut json = serde_json::to_string(response).context("Failed to serialize response")?;
    debug!("Sending: {}", json);
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write response")?;
    writer.flush().await.context("Failed to flush")
}

/// What a request turns into on the wire.
enum Reply {
    Single(Response),
    Stream { id: String, events: WorkerEvents },
}

async fn handle_connection(
    stream: UnixStream,
    controller: Arc<Controller>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE).await?;
        if bytes_read == 0 {
            debug!("Client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        debug!("Received: {} bytes", trimmed.len());

        let reply = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => handle_request(request, &controller, &shutdown).await,
            Err(e) => Reply::Single(Response::error(
                "unknown",
                ApiError::invalid_input_with_suggestion(
                    format!("Invalid JSON request: {}", e),
                    "Send one JSON object per line with 'id' and 'command' fields. Example: {\"id\":\"1\",\"command\":{\"action\":\"status\"}}",
                ),
            )),
        };

        match reply {
            Reply::Single(response) => write_response(&mut writer, &response).await?,
            Reply::Stream { id, events } => {
                if !stream_events(&id, events, &mut reader, &mut writer).await? {
                    debug!("Watcher disconnected");
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Forward engine events until the engine stops or the client hangs up.
///
/// Returns false when the client hung up. Input sent mid-stream is
/// discarded.
async fn stream_events<R, W>(
    request_id: &str,
    mut events: WorkerEvents,
    reader: &mut R,
    writer: &mut W,
) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_response(
        writer,
        &Response::success(
            request_id,
            ResponseData::Ok {
                message: "Watching engine events".to_string(),
            },
        ),
    )
    .await?;

    loop {
        let discard = tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    write_response(writer, &Response::success(request_id, ResponseData::Event { event }))
                        .await?;
                    0
                }
                None => {
                    write_response(
                        writer,
                        &Response::success(
                            request_id,
                            ResponseData::Ok {
                                message: "Engine stopped".to_string(),
                            },
                        ),
                    )
                    .await?;
                    return Ok(true);
                }
            },
            available = reader.fill_buf() => match available.context("Failed to read from client")? {
                [] => return Ok(false),
                buf => buf.len(),
            },
        };
        reader.consume(discard);
    }
}

async fn handle_request(
    request: Request,
    controller: &Controller,
    shutdown: &CancellationToken,
) -> Reply {
    debug!("Handling command: {:?}", request.command);
    let id = request.id;

    let result = match request.command {
        Command::Start { debug } => controller.start(debug).await.map(ResponseData::Status),
        Command::Stop => controller.stop().await.map(|()| ok("Engine stopped")),
        Command::Status => Ok(ResponseData::Status(controller.status().await)),
        Command::Reload { path } => controller
            .reload(path.as_deref().map(Path::new))
            .await
            .map(|name| ok(format!("Loaded strategy: {}", name))),
        Command::Press { key } => controller
            .press(&key)
            .await
            .map(|()| ok(format!("Pressed {}", key))),
        Command::Step { decision } => {
            controller
                .step(&decision)
                .await
                .map(|(decision, step)| {
                    ok(format!("{}: {} (key: {})", decision, step.spell, step.keybind))
                })
        }
        Command::Watch => match controller.subscribe().await {
            Ok(events) => return Reply::Stream { id, events },
            Err(e) => Err(e),
        },
        Command::Shutdown => Ok(handle_shutdown(shutdown)),
    };

    Reply::Single(match result {
        Ok(data) => Response::success(id, data),
        Err(e) => Response::error(id, e),
    })
}

fn ok(message: impl Into<String>) -> ResponseData {
    ResponseData::Ok {
        message: message.into(),
    }
}

/// The engine itself is stopped by [`DaemonServer::run`] on its way out.
fn handle_shutdown(shutdown: &CancellationToken) -> ResponseData {
    info!("Received shutdown command, stopping daemon");
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        // Let the response flush first
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
    });

    ok("Daemon shutting down")
}
