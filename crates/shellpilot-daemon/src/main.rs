//! shellpilot-daemon: serves the shell tools over JSON lines on stdio.

mod protocol;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use shellpilot_core::config::ConfigError;
use shellpilot_core::{EventBus, SessionRegistry, ShellSettings, ShellType, ToolExecutor};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use protocol::{EventLine, Response};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Directory for per-invocation output files (env: SHELLPILOT_OUTPUT_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Directory for per-session transcripts (env: SHELLPILOT_TRANSCRIPT_DIR)
    #[arg(long)]
    transcript_dir: Option<PathBuf>,

    /// Shell backing new sessions: auto, bash or sh (env: SHELLPILOT_SHELL_TYPE)
    #[arg(long)]
    shell: Option<ShellType>,

    /// Path to bash (env: SHELLPILOT_BASH_PATH)
    #[arg(long)]
    bash_path: Option<String>,

    /// Milliseconds between SIGTERM and SIGKILL on stop (env: SHELLPILOT_STOP_GRACE_MS)
    #[arg(long)]
    stop_grace_ms: Option<u64>,

    /// Also write session output and exit events to stdout
    #[arg(long)]
    events: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Read requests from stdin until EOF (default)
    Serve,
    /// Print the tool specs as JSON and exit
    Tools,
}

impl Cli {
    /// Environment settings with command-line flags on top.
    fn settings(&self) -> Result<ShellSettings, ConfigError> {
        let mut settings = ShellSettings::from_env()?;
        if let Some(dir) = &self.output_dir {
            settings = settings.output_dir(dir.clone());
        }
        if let Some(dir) = &self.transcript_dir {
            settings = settings.transcript_dir(dir.clone());
        }
        if let Some(shell) = self.shell {
            settings = settings.shell_type(shell);
        }
        if let Some(path) = &self.bash_path {
            settings = settings.bash_path(path.clone());
        }
        if let Some(ms) = self.stop_grace_ms {
            settings = settings.stop_grace(Duration::from_millis(ms));
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(2);
        }
    };

    let events = Arc::new(EventBus::new());
    let registry = Arc::new(SessionRegistry::new(settings, Arc::clone(&events)));
    let executor = Arc::new(ToolExecutor::new(Arc::clone(&registry)));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Tools => match serde_json::to_string_pretty(&executor.tool_specs()) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                log::error!("Failed to serialize tool specs: {}", e);
                std::process::exit(1);
            }
        },
        Command::Serve => {
            serve(executor, events, cli.events).await;
            let registry = Arc::clone(&registry);
            if let Err(e) = tokio::task::spawn_blocking(move || registry.stop_all()).await {
                log::warn!("Failed to stop sessions: {}", e);
            }
            log::info!("shellpilot-daemon stopped");
        }
    }
}

async fn serve(executor: Arc<ToolExecutor>, events: Arc<EventBus>, forward_events: bool) {
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    serve_io(
        executor,
        events,
        forward_events,
        tokio::io::stdin(),
        tokio::io::stdout(),
        interrupted,
    )
    .await;
}

/// Serve requests from `input` until EOF or `shutdown` completes.
async fn serve_io<R, W>(
    executor: Arc<ToolExecutor>,
    events: Arc<EventBus>,
    forward_events: bool,
    input: R,
    mut output: W,
    shutdown: impl Future<Output = ()>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    log::info!(
        "shellpilot-daemon serving (outputs in {})",
        executor.registry().settings().output_dir.display()
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let result = async {
                output.write_all(line.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await
            }
            .await;
            if let Err(e) = result {
                log::warn!("Failed to write response: {}", e);
                break;
            }
        }
    });

    let forwarder = forward_events.then(|| {
        let mut event_rx = events.subscribe();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(event) => {
                        let line = EventLine {
                            event: &event.event_type,
                            payload: &event.payload,
                        };
                        if let Ok(json) = serde_json::to_string(&line) {
                            if tx.send(json).is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Event forwarding lagged, {} events dropped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    let mut lines = BufReader::new(input).lines();
    let mut in_flight = Vec::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match protocol::parse_line(&line) {
                    Ok(request) => {
                        let executor = Arc::clone(&executor);
                        let tx = tx.clone();
                        in_flight.push(tokio::task::spawn_blocking(move || {
                            let response = protocol::handle(&executor, request);
                            send_response(&tx, &response);
                        }));
                    }
                    Err(response) => send_response(&tx, &response),
                }
                in_flight.retain(|task| !task.is_finished());
            }
            _ = &mut shutdown => {
                log::info!("Interrupted, stopping sessions");
                // in-flight requests end once their shells are gone
                let registry = Arc::clone(executor.registry());
                if let Err(e) = tokio::task::spawn_blocking(move || registry.stop_all()).await {
                    log::warn!("Failed to stop sessions: {}", e);
                }
                break;
            }
        }
    }

    for task in in_flight {
        if let Err(e) = task.await {
            log::warn!("Request task failed: {}", e);
        }
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    drop(tx);
    let _ = writer.await;
}

fn send_response(tx: &mpsc::UnboundedSender<String>, response: &Response) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => log::warn!("Failed to serialize response: {}", e),
    }
}
