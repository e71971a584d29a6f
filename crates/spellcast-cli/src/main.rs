//! spellcast CLI, foreground runner and daemon entry point.

mod args;
mod config;
mod daemon;
mod engine;

use std::path::{Path, PathBuf};

use clap::Parser;
use spellcast_core::events::{StepDecision, Telemetry, WorkerEvent};
use spellcast_core::protocol::{Command, Request, ResponseData};
use spellcast_core::strategy::StrategyError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::args::{Cli, Commands};
use crate::config::load_settings;
use crate::daemon::{DaemonClient, DaemonServer};
use crate::engine::worker::ConfiguredWorker;
use crate::engine::WorkerHandle;

fn main() {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Commands::Run(_)));

    let config = cli.config.as_deref().map(absolute);
    let result = match cli.command {
        Commands::Daemon => {
            run_daemon(config);
            return;
        }
        Commands::Examples => {
            println!("{}", crate::args::EXAMPLES_TEXT);
            return;
        }
        Commands::Run(args) => run_foreground(config, args.debug),
        command => run_client_command(command, config),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; INFO otherwise. The foreground runner prints worker
/// lines itself, so their tracing copy is muted there.
fn init_tracing(foreground: bool) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if foreground {
        if let Ok(directive) = "spellcast::worker=off".parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Daemons outlive the client's working directory.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Turns worker events into printable lines.
///
/// Detection telemetry arrives every tick; only changes are shown.
#[derive(Debug, Default)]
struct EventPrinter {
    last_labels: Option<Vec<String>>,
}

impl EventPrinter {
    fn line(&mut self, event: &WorkerEvent) -> Option<String> {
        if let WorkerEvent::Telemetry {
            telemetry: Telemetry::Detections { labels },
        } = event
        {
            if self.last_labels.as_ref() == Some(labels) {
                return None;
            }
            self.last_labels = Some(labels.clone());
        }
        Some(event.to_string())
    }
}

/// A line typed into the foreground runner.
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand<'a> {
    Empty,
    Step(StepDecision),
    Reload(Option<&'a str>),
    Key(&'a str),
}

impl<'a> ConsoleCommand<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ConsoleCommand::Empty;
        }
        if let Ok(decision) = line.parse() {
            return ConsoleCommand::Step(decision);
        }
        if line.eq_ignore_ascii_case("reload") {
            return ConsoleCommand::Reload(None);
        }
        if let Some(path) = line.strip_prefix("reload ") {
            return ConsoleCommand::Reload(Some(path.trim()));
        }
        ConsoleCommand::Key(line)
    }
}

async fn handle_console_line(handle: &WorkerHandle, line: &str) {
    match ConsoleCommand::parse(line) {
        ConsoleCommand::Empty => {}
        ConsoleCommand::Step(decision) => {
            if let Err(e) = handle.decide(decision).await {
                warn!("Cannot {}: {}", decision, e);
            }
        }
        // Load failures are already on the worker log
        ConsoleCommand::Reload(path) => match handle.reload(path.map(Path::new)) {
            Err(e @ StrategyError::NotConfigured) => warn!("{}", e),
            Err(e) => debug!("Reload failed: {}", e),
            Ok(_) => {}
        },
        ConsoleCommand::Key(key) => {
            if let Err(e) = handle.press_key(key).await {
                warn!("Key {} dropped: {}", key, e);
            }
        }
    }
}

/// Run the engine in this process until Ctrl+C or SIGTERM.
fn run_foreground(config: Option<PathBuf>, debug: bool) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;

    let result = runtime.block_on(async move {
        let loaded = load_settings(config.as_deref());
        let worker = ConfiguredWorker::from_settings(loaded.settings.clone(), debug)?;
        let mut events = worker.subscribe();
        loaded.report(worker.log());
        worker.announce_adapters();
        let handle = worker.start();

        let printer = tokio::spawn(async move {
            let mut printer = EventPrinter::default();
            while let Some(event) = events.next().await {
                if let Some(line) = printer.line(&event) {
                    println!("{}", line);
                }
            }
        });

        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        loop {
            tokio::select! {
                line = stdin.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => handle_console_line(&handle, &line).await,
                    Ok(None) => {
                        debug!("stdin closed, running until interrupted");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, stopping");
                    break;
                }
                _ = sigterm() => {
                    info!("Received SIGTERM, stopping");
                    break;
                }
            }
        }

        handle.stop().await;
        let _ = printer.await;
        Ok::<(), anyhow::Error>(())
    });

    // A pending stdin read would otherwise hold the runtime open
    runtime.shutdown_background();
    result
}

/// Map a client subcommand to its protocol command.
fn cli_to_command(command: Commands) -> Option<Command> {
    Some(match command {
        Commands::Start(args) => Command::Start { debug: args.debug },
        Commands::Stop => Command::Stop,
        Commands::Status => Command::Status,
        Commands::Reload(args) => Command::Reload {
            path: args
                .path
                .map(|path| absolute(&path).to_string_lossy().into_owned()),
        },
        Commands::Press(args) => Command::Press { key: args.key },
        Commands::Step(args) => Command::Step {
            decision: args.decision,
        },
        Commands::Watch => Command::Watch,
        Commands::Shutdown => Command::Shutdown,
        Commands::Run(_) | Commands::Daemon | Commands::Examples => return None,
    })
}

/// Run a client command against the daemon, starting it if needed.
fn run_client_command(command: Commands, config: Option<PathBuf>) -> anyhow::Result<()> {
    let Some(command) = cli_to_command(command) else {
        return Ok(());
    };
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut client = if command == Command::Shutdown {
            match DaemonClient::try_connect().await {
                Some(client) => client,
                None => {
                    println!("Daemon is not running");
                    return Ok(());
                }
            }
        } else {
            DaemonClient::connect(config.as_deref()).await?
        };

        let watching = command == Command::Watch;
        let request = Request {
            id: Uuid::new_v4().to_string(),
            command,
        };
        let response = client.request(request).await?;

        if !response.success {
            if let Some(err) = response.error {
                eprintln!("Error: {}", err);
            }
            std::process::exit(1);
        }

        if watching {
            return follow_watch(&mut client).await;
        }
        if let Some(data) = response.data {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Ok(())
    })
}

/// Print streamed events until the engine stops or the daemon goes away.
async fn follow_watch(client: &mut DaemonClient) -> anyhow::Result<()> {
    let mut printer = EventPrinter::default();
    while let Some(response) = client.next_response().await? {
        match response.data {
            Some(ResponseData::Event { event }) => {
                if let Some(line) = printer.line(&event) {
                    println!("{}", line);
                }
            }
            Some(ResponseData::Ok { message }) => {
                println!("{}", message);
                break;
            }
            other => debug!("Ignoring unexpected watch response: {:?}", other),
        }
    }
    Ok(())
}

/// Run the daemon server with graceful signal handling.
///
/// The engine is stopped before exit so a keystroke in flight completes;
/// dropping the server removes the socket and PID files.
fn run_daemon(config: Option<PathBuf>) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let server = match DaemonServer::bind(config).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to start daemon: {:#}", e);
                std::process::exit(1);
            }
        };

        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!("Daemon error: {}", e);
                    std::process::exit(1);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully");
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
        }
        server.stop_engine().await;
    });
}

/// Wait for SIGTERM. If the handler cannot be installed, never completes.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(
                "Failed to register SIGTERM handler: {}, only SIGINT will stop the process",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{PressArgs, ReloadArgs, RunArgs};
    use spellcast_core::events::DebugStep;

    #[test]
    fn test_console_commands() {
        assert_eq!(ConsoleCommand::parse("  "), ConsoleCommand::Empty);
        assert_eq!(
            ConsoleCommand::parse("Execute"),
            ConsoleCommand::Step(StepDecision::Execute)
        );
        assert_eq!(
            ConsoleCommand::parse("skip\n"),
            ConsoleCommand::Step(StepDecision::Skip)
        );
        assert_eq!(ConsoleCommand::parse("reload"), ConsoleCommand::Reload(None));
        assert_eq!(
            ConsoleCommand::parse("reload  fire.yaml "),
            ConsoleCommand::Reload(Some("fire.yaml"))
        );
        assert_eq!(ConsoleCommand::parse(" F1 "), ConsoleCommand::Key("F1"));
    }

    #[test]
    fn test_printer_dedupes_detections() {
        let mut printer = EventPrinter::default();
        let frame = |labels: &[&str]| WorkerEvent::Telemetry {
            telemetry: Telemetry::Detections {
                labels: labels.iter().map(|l| l.to_string()).collect(),
            },
        };

        assert!(printer.line(&frame(&["frostbolt_ready"])).is_some());
        assert!(printer.line(&frame(&["frostbolt_ready"])).is_none());
        assert!(printer.line(&frame(&[])).is_some());
        assert!(printer.line(&frame(&[])).is_none());

        // Other events always print
        let log = WorkerEvent::Log {
            line: "Switched to AOE mode".to_string(),
        };
        assert_eq!(printer.line(&log).as_deref(), Some("Switched to AOE mode"));
        assert_eq!(printer.line(&log).as_deref(), Some("Switched to AOE mode"));
        let step = WorkerEvent::Telemetry {
            telemetry: Telemetry::DebugStep(DebugStep {
                spell: "frostbolt".to_string(),
                keybind: "1".to_string(),
            }),
        };
        assert!(printer.line(&step).is_some());
    }

    #[test]
    fn test_cli_to_command() {
        assert_eq!(
            cli_to_command(Commands::Start(RunArgs { debug: true })),
            Some(Command::Start { debug: true })
        );
        assert_eq!(
            cli_to_command(Commands::Press(PressArgs {
                key: "f1".to_string()
            })),
            Some(Command::Press {
                key: "f1".to_string()
            })
        );
        assert_eq!(cli_to_command(Commands::Run(RunArgs { debug: false })), None);
        assert_eq!(cli_to_command(Commands::Daemon), None);
    }

    #[test]
    fn test_reload_paths_are_made_absolute() {
        let command = cli_to_command(Commands::Reload(ReloadArgs {
            path: Some(PathBuf::from("fire.yaml")),
        }));
        match command {
            Some(Command::Reload { path: Some(path) }) => {
                assert!(Path::new(&path).is_absolute());
                assert!(path.ends_with("fire.yaml"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            cli_to_command(Commands::Reload(ReloadArgs { path: None })),
            Some(Command::Reload { path: None })
        );
    }
}
