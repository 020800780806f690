//! `bench_psu` console binary.
//!
//! Loads the layered configuration, starts one session and feeds it console
//! lines from stdin or from the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bench_psu::config::{Settings, TransportKind};
use bench_psu::console::{Console, ConsoleCommand, HELP};
use bench_psu::session::{Session, SessionEvent, SessionHandle};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bench_psu")]
#[command(about = "Console for multi-channel SCPI bench power supplies")]
struct Cli {
    /// Configuration file (defaults to config/default.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the built-in simulator.
    #[arg(long, conflicts_with_all = ["serial", "visa"])]
    simulated: bool,

    /// Serial port of the instrument.
    #[arg(long, value_name = "PORT", conflicts_with = "visa")]
    serial: Option<String>,

    /// VISA resource of the instrument.
    #[arg(long, value_name = "RESOURCE")]
    visa: Option<String>,

    /// Print reports as JSON.
    #[arg(long)]
    json: bool,

    /// Console lines to run instead of reading stdin.
    script: Vec<String>,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut Settings) {
        if self.simulated {
            settings.transport.kind = TransportKind::Simulated;
        } else if let Some(port) = &self.serial {
            settings.transport.kind = TransportKind::Serial;
            settings.transport.resource = port.clone();
        } else if let Some(resource) = &self.visa {
            settings.transport.kind = TransportKind::Visa;
            settings.transport.resource = resource.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("load configuration from {}", path.display()))?,
        None => Settings::load().context("load configuration")?,
    };
    cli.apply_overrides(&mut settings);
    settings.validate().context("validate configuration")?;
    init_tracing(&settings.application.log_level);

    info!(name = %settings.application.name, transport = ?settings.transport.kind, "starting");
    let session = Session::spawn(&settings.session);
    let printer = tokio::spawn(print_events(session.subscribe()));
    let mut console = Console::new(settings.transport.spec(), 1);

    if cli.script.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("read stdin")? {
            if !handle_line(&session, &mut console, &line, cli.json).await? {
                break;
            }
        }
    } else {
        for line in &cli.script {
            if !handle_line(&session, &mut console, line, cli.json).await? {
                break;
            }
        }
    }

    session.shutdown().await.context("shut down session")?;
    printer.abort();
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Notices go to stdout; progress goes to the log. Reports are printed by the console loop.
async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Notice { message }) => println!("[INFO] {message}"),
            Ok(SessionEvent::Started { id, operation, steps }) => {
                debug!(id, %operation, steps, "started");
            }
            Ok(SessionEvent::StepCompleted {
                id,
                index,
                total,
                step,
                ..
            }) => debug!(id, "step {}/{}: {step}", index + 1, total),
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!(missed, "event printer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Runs one console line. Returns false on `quit`.
async fn handle_line(
    session: &SessionHandle,
    console: &mut Console,
    line: &str,
    json: bool,
) -> Result<bool> {
    let command = match console.parse(line) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("[ERROR] {}: {e}", e.kind());
            return Ok(true);
        }
    };

    match command {
        ConsoleCommand::Empty => {}
        ConsoleCommand::Quit => return Ok(false),
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Devices => {
            let devices = session.status().devices;
            if json {
                println!("{}", serde_json::to_string(&devices)?);
            } else if devices.is_empty() {
                println!("no devices connected yet");
            } else {
                for device in devices {
                    println!("{}  {}", device.resource_key, device.identity);
                }
            }
        }
        ConsoleCommand::Status => {
            let status = session.status();
            if json {
                println!("{}", serde_json::to_string(&status)?);
            } else {
                println!(
                    "connected={} identity={} state={:?} saved={}",
                    status.connected,
                    status.identity.as_deref().unwrap_or("-"),
                    status.state,
                    status.saved_commands
                );
            }
        }
        ConsoleCommand::Run(request) => match session.run(request).await {
            Ok(report) => {
                console.observe(&report);
                if json {
                    println!("{}", serde_json::to_string(&report)?);
                } else {
                    println!("{report}");
                }
            }
            Err(e) => eprintln!("[ERROR] {}: {e}", e.kind()),
        },
    }
    Ok(true)
}
