//! Binary entrypoint for the comlogger CLI.
//!
//! Commands:
//! - `run [--port <name>] [--output-dir <dir>]` - log every configured link until Ctrl-C
//! - `init` - write a starter `comlogger.toml`
//! - `ports` - list serial ports in the order auto-rebind considers them
//! - `decode <FRAME> [--json]` - decode one frame and print its output line
//!
//! See the library crate docs for module-level details: `comlogger::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::mpsc;

use comlogger::config::Config;
use comlogger::engine::ComLogger;
use comlogger::events::EngineEvent;
use comlogger::frame::try_decode;
use comlogger::hotplug::DeviceWatcher;
use comlogger::serial::SerialBackend;

#[derive(Parser)]
#[command(name = "comlogger")]
#[command(about = "Keeps the latest measurement frame from a serial device on disk")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "comlogger.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Log frames from all configured links until interrupted
    Run {
        /// Serial port for the first link (e.g., /dev/ttyUSB0 or COM3)
        #[arg(short, long)]
        port: Option<String>,
        /// Output folder for the first link
        #[arg(short, long)]
        output_dir: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// List available serial ports
    Ports,
    /// Decode a single frame and print the output line
    Decode {
        frame: String,
        /// Print all fields as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Run { port, output_dir } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await.map_err(|e| {
                    anyhow!("{} (run `comlogger init` to create a default config)", e)
                })?,
            };
            if let Some(first) = config.links.first_mut() {
                if let Some(port) = port {
                    first.port = port;
                }
                if let Some(dir) = output_dir {
                    first.output_dir = dir;
                }
            }
            config.validate()?;
            run(config).await?;
        }
        Commands::Init => {
            if std::path::Path::new(&cli.config).exists() {
                bail!("{} already exists; not overwriting", cli.config);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Ports => {
            let backend = system_backend()?;
            let ports = tokio::task::spawn_blocking(move || backend.available_ports()).await??;
            if ports.is_empty() {
                println!("No serial ports found.");
            }
            for port in ports {
                println!("{}", port);
            }
        }
        Commands::Decode { frame, json } => {
            let frame = frame.trim_end_matches(['\r', '\n']);
            let fields = try_decode(frame).map_err(|e| anyhow!("Invalid frame: {}", e))?;
            if json {
                let payload = serde_json::json!({
                    "line": comlogger::frame::format_line(&fields),
                    "temperatures": fields.temperatures_f64(),
                    "distances": fields.distances_f64(),
                });
                println!("{}", payload);
            } else {
                println!("{}", comlogger::frame::format_line(&fields));
            }
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!("Starting comlogger v{}", env!("CARGO_PKG_VERSION"));
    let backend = system_backend()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let event_log = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::StatusChanged {
                    last_error: Some(err),
                    id,
                    ..
                } => {
                    log::debug!("[{}] last error at {}: {}", id, err.at.to_rfc3339(), err.message);
                }
                EngineEvent::StatusChanged { .. } => {}
                EngineEvent::LiveRow(row) => info!("[{}] {} <- {}", row.id, row.line, row.port),
            }
        }
    });

    let engines: Vec<Arc<ComLogger>> = config
        .engine_settings()
        .into_iter()
        .map(|settings| {
            Arc::new(ComLogger::new(
                settings,
                Arc::clone(&backend),
                Some(tx.clone()),
            ))
        })
        .collect();
    drop(tx);

    for engine in &engines {
        engine.start();
    }
    let watcher = DeviceWatcher::new(
        Arc::clone(&backend),
        engines.clone(),
        Duration::from_millis(config.timing.poll_interval_ms),
    )
    .spawn();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");

    watcher.stop().await;
    for engine in &engines {
        engine.stop().await;
        if engine.is_running() {
            warn!("[{}] port still open after stop", engine.id());
        }
    }
    drop(engines);
    let _ = tokio::time::timeout(Duration::from_secs(1), event_log).await;
    Ok(())
}

#[cfg(feature = "serial")]
fn system_backend() -> Result<Arc<dyn SerialBackend>> {
    Ok(Arc::new(comlogger::serial::SystemSerial))
}

#[cfg(not(feature = "serial"))]
fn system_backend() -> Result<Arc<dyn SerialBackend>> {
    bail!("comlogger was built without the 'serial' feature")
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only in foreground (TTY) runs
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
