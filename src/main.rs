use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use mqtt_bus_gateway::bus::envelope::BusEnvelope;
use mqtt_bus_gateway::bus::BusEvent;
use mqtt_bus_gateway::{Bridge, GatewayConfig};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const APP_DIR: &str = "mqtt-bus-gateway";
const CONFIG_FILE: &str = "config.toml";
const INPUT_BUFFER: usize = 64;

/// Relays MQTT messages to a notification bus on stdin/stdout
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let args = Args::parse();

    let path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = GatewayConfig::load(&path).await?;
    let (endpoint, settings) = config.validate()?;

    let (bus_tx, bus_rx) = mpsc::channel(settings.channel_capacity);
    let bridge = Arc::new(Bridge::new(endpoint, settings, bus_tx));
    bridge.start()?;

    let writer = tokio::spawn(write_bus_events(bus_rx));
    let lines = spawn_line_reader(std::io::stdin());

    tokio::select! {
        _ = read_bus_calls(bridge.clone(), lines) => {
            info!("Bus input closed, shutting down");
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Ctrl-C received, shutting down");
        }
    }

    bridge.stop().await;
    drop(bridge);
    if let Err(e) = writer.await {
        warn!("Bus writer ended abnormally: {}", e);
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging();
    Ok(())
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the bus, logs go to stderr
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn default_config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir().ok_or_else(|| eyre!("No config directory available"))?;
    path.push(APP_DIR);
    path.push(CONFIG_FILE);
    Ok(path)
}

/// Reads lines on a plain thread
///
/// A blocked read never holds up runtime shutdown; the thread ends with the
/// process.
fn spawn_line_reader<R: Read + Send + 'static>(input: R) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(INPUT_BUFFER);
    std::thread::spawn(move || {
        for line in BufReader::new(input).lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Bus input failed: {}", e);
                    break;
                }
            }
        }
        debug!("Bus input reader finished");
    });
    rx
}

async fn read_bus_calls(bridge: Arc<Bridge>, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let call = BusEnvelope::parse_line(line).and_then(BusEnvelope::into_call);
        match call {
            Ok(Some(call)) => bridge.on_bus_message(call),
            Ok(None) => {}
            Err(e) => warn!("Skipping malformed bus line: {}", e),
        }
    }
}

async fn write_bus_events(mut rx: mpsc::Receiver<BusEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        let line = match BusEnvelope::from(event).to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode bus event: {}", e);
                continue;
            }
        };
        debug!("Bus out: {}", line);
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        }
        .await;
        if let Err(e) = written {
            error!("Failed to write bus event: {}", e);
            break;
        }
    }
}
