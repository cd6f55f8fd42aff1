//! Binary entrypoint for the Meshlink CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `firmware-check <version>` - show how a firmware string is parsed and gated
//! - `replay <capture>` - run a full connect + handshake against a stream capture
//!   of `FromRadio` frames and print the resulting events
//!
//! See the library crate docs for module-level details: `meshlink::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshlink::config::Config;
use meshlink::events::LinkEvent;
use meshlink::metrics;
use meshlink::mqtt::RecordingMqttClient;
use meshlink::notify::LogNotifier;
use meshlink::protobuf::proto::from_radio::PayloadVariant as FRPayload;
use meshlink::radio::framer::StreamFramer;
use meshlink::radio::{codec, firmware};
use meshlink::radio::{
    AdapterState, ConnectionState, RadioLink, RecordingTransport, SessionCounters, TransportEvent,
};
use meshlink::store::MeshStore;

const REPLAY_PERIPHERAL: &str = "replay-0000";

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Bluetooth LE link engine for Meshtastic radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Parse a firmware version string and check it against the configured minimum
    FirmwareCheck {
        version: String,
        /// Override the configured minimum version
        #[arg(long)]
        minimum: Option<String>,
    },
    /// Replay a capture of framed FromRadio packets through a full session
    Replay {
        capture: String,
        /// Snapshot file to persist into (overrides the configured path)
        #[arg(long)]
        snapshot: Option<String>,
        /// Seconds without events before the replay stops
        #[arg(long, default_value_t = 2)]
        idle: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init has no config to read yet
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::FirmwareCheck { version, minimum } => {
            let config = pre_config.unwrap_or_default();
            let minimum = minimum.unwrap_or(config.radio.minimum_firmware_version);
            let parsed = firmware::parse_version(&version);
            let supported = firmware::is_supported(&parsed.version, &minimum);
            let payload = serde_json::json!({
                "raw": version,
                "version": parsed.version,
                "valid": parsed.valid,
                "minimum": minimum,
                "supported": supported,
                "encrypted_mqtt_topic": firmware::uses_encrypted_mqtt_topic(&parsed.version),
            });
            println!("{}", payload);
            if !supported {
                std::process::exit(1);
            }
        }
        Commands::Replay {
            capture,
            snapshot,
            idle,
        } => {
            let config = match pre_config {
                Some(c) => c,
                None => {
                    warn!("No readable config at {}; using defaults", cli.config);
                    Config::default()
                }
            };
            replay(config, &capture, snapshot, Duration::from_secs(idle.max(1))).await?;
        }
    }

    Ok(())
}

async fn replay(
    config: Config,
    capture: &str,
    snapshot: Option<String>,
    idle: Duration,
) -> Result<()> {
    let raw = tokio::fs::read(capture)
        .await
        .map_err(|e| anyhow!("Failed to read capture {}: {}", capture, e))?;
    let mut framer = StreamFramer::new();
    framer.push(&raw);
    let mut frames = Vec::new();
    while let Some(frame) = framer.next_frame() {
        frames.push(frame);
    }
    info!(
        "Loaded {} frames from {} ({} bytes skipped)",
        frames.len(),
        capture,
        framer.skipped()
    );

    // Pick the nonce the capture completes with so the handshake accepts it.
    let nonce = frames
        .iter()
        .filter_map(|f| codec::decode_from_radio(f).ok())
        .find_map(|p| match p {
            FRPayload::ConfigCompleteId(id) => Some(id),
            _ => None,
        })
        .unwrap_or(1);

    let store = match snapshot.or_else(|| config.persistence.snapshot_path.clone()) {
        Some(path) => {
            info!("Persisting replay into {}", path);
            MeshStore::open(&path)?
        }
        None => MeshStore::in_memory(),
    };
    let store = Arc::new(Mutex::new(store));

    let (transport_tx, transport_rx) = tokio::sync::mpsc::unbounded_channel();
    let transport = RecordingTransport::with_responder(transport_tx.clone());
    for frame in frames {
        transport.queue_from_radio(frame);
    }

    let mut prefs = config.runtime_preferences();
    prefs.auto_reconnect = false;
    let (link, handle, mut events) = RadioLink::new(
        transport,
        transport_rx,
        store,
        Arc::new(LogNotifier),
        RecordingMqttClient::new(),
        prefs,
    );
    let link = link.with_counters(SessionCounters::starting_at(nonce.wrapping_sub(1)));
    let task = tokio::spawn(link.run());

    let _ = transport_tx.send(TransportEvent::StateChanged(AdapterState::PoweredOn));
    let _ = transport_tx.send(TransportEvent::Discovered {
        peripheral: REPLAY_PERIPHERAL.to_string(),
        name: Some("Replay".to_string()),
        rssi: 0,
    });
    handle.connect(REPLAY_PERIPHERAL)?;

    let mut subscribed = false;
    loop {
        match tokio::time::timeout(idle, events.recv()).await {
            Ok(Some(event)) => {
                if event == LinkEvent::StateChanged(ConnectionState::Subscribed) {
                    subscribed = true;
                }
                println!("{:?}", event);
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    let status = handle.status().await?;
    handle.flush().await?;
    handle.shutdown().await;
    let _ = task.await;

    let payload = serde_json::json!({
        "status": if subscribed { "ok" } else { "incomplete" },
        "state": status.state.to_string(),
        "nonce": status.nonce,
        "invalid_firmware": status.is_invalid_firmware,
        "last_error": status.last_error,
        "metrics": metrics::snapshot(),
    });
    println!("{}", payload);
    if !subscribed {
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.clone())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match file {
        Some(f) => {
            let write_mutex = Arc::new(Mutex::new(f));
            // Mirror to the console only when someone is watching
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!(
                    "{} [{}] {}: {}",
                    ts,
                    record.level(),
                    record.target(),
                    record.args()
                );
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(
                    fmt,
                    "{} [{}] {}: {}",
                    ts,
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
