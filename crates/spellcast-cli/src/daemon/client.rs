//! Client for connecting to the daemon process.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use spellcast_core::protocol::{Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::daemon::paths;

/// Maximum time to wait for daemon to start up.
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between socket connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for communicating with the daemon.
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DaemonClient {
    /// Connect to the daemon, starting it if necessary.
    ///
    /// `config` is only used when a new daemon has to be started.
    pub async fn connect(config: Option<&Path>) -> Result<Self> {
        if let Some(client) = Self::try_connect().await {
            return Ok(client);
        }

        info!("Daemon not running, starting...");
        let child = Self::start_daemon(config)?;
        let stream = Self::wait_for_daemon(&paths::socket_path(), child).await?;
        Ok(Self::from_stream(stream))
    }

    /// Connect to an already running daemon only.
    pub async fn try_connect() -> Option<Self> {
        let stream = UnixStream::connect(paths::socket_path()).await.ok()?;
        debug!("Connected to existing daemon");
        Some(Self::from_stream(stream))
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Start the daemon as a detached background process.
    ///
    /// Returns the child so an early crash is noticed before the timeout.
    fn start_daemon(config: Option<&Path>) -> Result<std::process::Child> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe().context("Failed to get current executable path")?;

        let mut command = std::process::Command::new(exe);
        if let Some(config) = config {
            command.arg("--config").arg(config);
        }
        // New process group: closing the terminal must not SIGHUP the daemon
        let child = command
            .arg("daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .context("Failed to spawn daemon process")?;

        Ok(child)
    }

    async fn wait_for_daemon(
        socket_path: &Path,
        mut child: std::process::Child,
    ) -> Result<UnixStream> {
        let start = std::time::Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    bail!(
                        "Daemon exited immediately with status: {} (run 'spellcast daemon' directly to diagnose)",
                        status
                    );
                }
                Ok(None) => {}
                Err(e) => debug!("Error checking daemon status: {}", e),
            }

            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    info!("Connected to daemon after {:?}", start.elapsed());
                    return Ok(stream);
                }
                Err(_) => {
                    if start.elapsed() > DAEMON_STARTUP_TIMEOUT {
                        bail!("Daemon failed to start within {:?}", DAEMON_STARTUP_TIMEOUT);
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Send a request and wait for a response.
    pub async fn request(&mut self, request: Request) -> Result<Response> {
        self.request_with_timeout(request, REQUEST_TIMEOUT).await
    }

    /// Send a request and wait for a response with a custom timeout.
    pub async fn request_with_timeout(
        &mut self,
        request: Request,
        timeout_duration: Duration,
    ) -> Result<Response> {
        self.send(&request).await?;
        match timeout(timeout_duration, self.next_response())
            .await
            .context("Request timed out")??
        {
            Some(response) => Ok(response),
            None => bail!("Daemon closed connection unexpectedly"),
        }
    }

    /// Write one request line without waiting for the answer.
    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let mut json = serde_json::to_string(request).context("Failed to serialize request")?;
        debug!("Sending: {}", json);
        json.push('\n');
        self.writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write request")?;
        self.writer.flush().await.context("Failed to flush")
    }

    /// Next response line, or `None` once the daemon hangs up.
    ///
    /// Used directly to follow a `watch` stream.
    pub async fn next_response(&mut self) -> Result<Option<Response>> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .context("Failed to read response")?;
        if bytes_read == 0 {
            return Ok(None);
        }
        debug!("Received: {}", line.trim());
        let response = serde_json::from_str(&line).context("Failed to parse response")?;
        Ok(Some(response))
    }
}
