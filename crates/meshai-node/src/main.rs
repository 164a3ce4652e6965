//! MeshAI Node - headless Meshtastic bridge with an AI responder
//!
//! This binary runs a single bridge session:
//! - Connects to a radio over serial, TCP or Bluetooth LE
//! - Logs every mesh event
//! - Answers trigger messages with a local Ollama model
//! - Sends lines typed on stdin to the mesh

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshai_bridge::{
    node_id_string, BridgeConfig, BridgeEvent, BridgeHandle, InterfaceConfig, MeshBridge,
    OllamaClient, DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT,
};

/// Configuration file looked up in the home directory
const CONFIG_FILE_NAME: &str = ".meshtastic-ai-config.json";

#[derive(Parser)]
#[command(name = "meshai-node")]
#[command(about = "Headless Meshtastic bridge with a local AI responder")]
#[command(version)]
struct Args {
    /// Configuration file (default: ~/.meshtastic-ai-config.json when present)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Connect over USB serial; without a value the port is auto-detected
    #[arg(long, num_args = 0..=1, default_missing_value = "auto", conflicts_with_all = ["tcp", "ble"])]
    serial: Option<String>,

    /// Connect over TCP (host or host:port)
    #[arg(long, conflicts_with = "ble")]
    tcp: Option<String>,

    /// Connect over Bluetooth LE (address or device name)
    #[arg(long)]
    ble: Option<String>,

    /// Completion model
    #[arg(long)]
    model: Option<String>,

    /// Completion endpoint
    #[arg(long)]
    ollama_url: Option<String>,

    /// AI trigger prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Disable AI replies
    #[arg(long)]
    no_ai: bool,

    /// Channel used for lines typed on stdin
    #[arg(long, default_value_t = 0)]
    channel: u8,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    save_config: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the default level
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = match &config_path {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            BridgeConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        Some(path) if args.config.is_some() => {
            anyhow::bail!("configuration file {} not found", path.display());
        }
        _ => BridgeConfig::default(),
    };
    apply_overrides(&mut config, &args)?;
    config.validate().context("invalid configuration")?;

    if args.save_config {
        let path = config_path.context("no configuration path (HOME is not set)")?;
        config.save(&path)?;
        info!("Configuration written to {}", path.display());
    }

    info!("Starting MeshAI node v{}", meshai_bridge::VERSION);
    if config.ai.enabled {
        check_completion_service(&config).await;
    } else {
        info!("AI replies disabled");
    }

    let (bridge, handle) = MeshBridge::with_defaults();
    let controller = tokio::spawn(bridge.run());

    // Log events from the start so connection progress is visible
    let events = handle.subscribe_all();
    let logger = tokio::spawn(log_events(events));

    handle
        .connect(config.clone())
        .await
        .with_context(|| format!("failed to connect to {}", config.interface.target()))?;

    info!("═══════════════════════════════════════════════════════════");
    info!("  Connected via {} to {}", config.interface.kind(), config.interface.target());
    if config.ai.enabled {
        info!("  AI model {} answers messages starting with '{}'", config.ai.model, config.ai.prefix);
    }
    info!("  Type a line to send it on channel {}; /help for commands", args.channel);
    info!("═══════════════════════════════════════════════════════════");

    let stdin = tokio::spawn(read_stdin(handle.clone(), args.channel));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = stdin => info!("Input closed"),
    }

    info!("Shutting down");
    if let Err(e) = handle.disconnect().await {
        debug!("Disconnect: {}", e);
    }
    handle.shutdown().await.ok();
    controller.await.ok();
    logger.await.ok();

    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(CONFIG_FILE_NAME))
}

/// Apply command line flags on top of the file configuration
fn apply_overrides(config: &mut BridgeConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(port) = &args.serial {
        config.interface = InterfaceConfig::Serial {
            port: (port != "auto").then(|| PathBuf::from(port)),
            baud_rate: match &config.interface {
                InterfaceConfig::Serial { baud_rate, .. } => *baud_rate,
                _ => DEFAULT_BAUD_RATE,
            },
        };
    }
    if let Some(target) = &args.tcp {
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .with_context(|| format!("invalid TCP port in '{}'", target))?,
            ),
            None => (target.clone(), DEFAULT_TCP_PORT),
        };
        config.interface = InterfaceConfig::Tcp { host, port };
    }
    if let Some(address) = &args.ble {
        config.interface = InterfaceConfig::Ble {
            address: address.clone(),
        };
    }
    if let Some(model) = &args.model {
        config.ai.model = model.clone();
    }
    if let Some(url) = &args.ollama_url {
        config.ai.url = url.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.ai.prefix = prefix.clone();
    }
    if args.no_ai {
        config.ai.enabled = false;
    }
    Ok(())
}

/// Warn early when the completion service or model is missing
async fn check_completion_service(config: &BridgeConfig) {
    let client = match OllamaClient::new(&config.ai) {
        Ok(client) => client,
        Err(e) => {
            warn!("Cannot build completion client: {}", e);
            return;
        }
    };
    match client.health_check().await {
        Ok(models) => {
            let wanted = client.model();
            let installed = models
                .iter()
                .any(|m| m == wanted || m.split(':').next() == Some(wanted));
            if installed {
                info!("Completion service ready with model {}", wanted);
            } else {
                warn!(
                    "Model {} is not installed (available: {}); run `ollama pull {}`",
                    wanted,
                    models.join(", "),
                    wanted
                );
            }
        }
        Err(e) => warn!("Completion service unavailable, AI replies will fail: {}", e),
    }
}

/// Log every bridge event
async fn log_events(mut events: meshai_bridge::Subscription) {
    while let Some(event) = events.next().await {
        match event {
            BridgeEvent::NodeUpdated { node, created } => {
                if created {
                    info!("New node {} ({})", node_id_string(node.id), node.display_name());
                } else {
                    debug!("Node {} updated", node_id_string(node.id));
                }
            }
            BridgeEvent::MessageReceived { message } => {
                info!(
                    "[ch{}] {} -> {}: {}",
                    message.channel,
                    node_id_string(message.from),
                    node_id_string(message.to),
                    message.text
                );
            }
            BridgeEvent::MessageSent { message } => {
                info!("[ch{}] sent: {}", message.channel, message.text);
            }
            BridgeEvent::MessageAcked { message } => {
                debug!("Message {} acknowledged", message.id);
            }
            BridgeEvent::MessageFailed { message, reason } => {
                warn!("Message {} failed: {}", message.id, reason);
            }
            BridgeEvent::ConnectionStateChanged {
                state,
                transport,
                target,
                reason,
            } => match reason {
                Some(reason) => warn!("Link {} {} is {}: {}", transport, target, state, reason),
                None => info!("Link {} {} is {}", transport, target, state),
            },
            BridgeEvent::AiReplyGenerated {
                request_id, reply, ..
            } => {
                info!("AI reply #{}: {}", request_id, reply);
            }
            BridgeEvent::AiRequestFailed {
                request_id,
                state,
                reason,
                ..
            } => {
                warn!("AI request #{} {:?}: {}", request_id, state, reason);
            }
            BridgeEvent::TelemetryReceived { node, telemetry } => {
                debug!(
                    "Telemetry from {}: battery {}%, {} mV",
                    node_id_string(node),
                    telemetry.battery_level,
                    telemetry.voltage_mv
                );
            }
        }
    }
}

/// Forward stdin lines to the mesh until input closes
async fn read_stdin(handle: BridgeHandle, channel: u8) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!("Reading stdin: {}", e);
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" => return,
            "/help" => {
                info!("Commands: /nodes, /stats, /auto on|off, /quit; anything else is sent");
            }
            "/nodes" => match handle.snapshot().await {
                Ok(Some(snapshot)) => match serde_json::to_string_pretty(&snapshot.nodes) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("Cannot render nodes: {}", e),
                },
                Ok(None) => warn!("Not connected"),
                Err(e) => warn!("Snapshot failed: {}", e),
            },
            "/stats" => match handle.stats().await {
                Ok(stats) => println!("{:#?}", stats),
                Err(e) => warn!("Stats failed: {}", e),
            },
            "/auto on" | "/auto off" => {
                let enabled = line.ends_with("on");
                match handle.set_auto_respond(channel, enabled).await {
                    Ok(()) => info!("Auto-respond on channel {}: {}", channel, enabled),
                    Err(e) => warn!("Cannot change auto-respond: {}", e),
                }
            }
            text => {
                if let Err(e) = handle.send_message(channel, text).await {
                    warn!("Send failed: {}", e);
                }
            }
        }
    }
}
