//! hermes - keeps configured MQTT clients connected and logs what arrives

use clap::{Parser, Subcommand};
use hermes::config::{ClientConfig, HermesConfig};
use hermes::observability::init_default_logging;
use hermes::store::{MemoryMessageStore, MessageStore, SledMessageStore};
use hermes::transport::mqtt::RumqttcEngineFactory;
use hermes::types::AckMode;
use hermes::{ConnectionRegistry, Event, HermesError};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// How long `run` waits for in-flight work on shutdown
const SHUTDOWN_QUIESCE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "hermes")]
#[command(about = "Resilient MQTT connection manager with durable inbound storage")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "HERMES_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every configured client and log events until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Print how many unacknowledged messages each client has stored
    Backlog,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    info!("Starting hermes v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Backlog => show_backlog(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<HermesConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(HermesConfig::load_from_file(path)?);
    }

    for path_str in ["hermes.toml", "config/hermes.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(HermesConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create hermes.toml".into())
}

fn open_store(config: &HermesConfig) -> Result<Arc<dyn MessageStore>, HermesError> {
    match &config.store.path {
        Some(path) => {
            info!("Opening message store at {}", path.display());
            Ok(Arc::new(SledMessageStore::open(path)?))
        }
        None => {
            warn!("No [store] path configured, messages are kept in memory only");
            Ok(Arc::new(MemoryMessageStore::new()))
        }
    }
}

async fn run(config: HermesConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&config)?;
    let factory = Arc::new(RumqttcEngineFactory::new(config.reconnect.clone()));
    let registry = ConnectionRegistry::new(factory, store)?;

    // Listeners run on the dispatcher task; manual acks are sent from here
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let manual: Vec<_> = config
        .clients
        .iter()
        .filter(|c| c.ack == AckMode::Manual)
        .map(|c| c.identity(&config.app.id))
        .collect();
    registry.add_listener(Arc::new(move |event: &Event| {
        log_event(event);
        if let Event::MessageArrived { client, message } = event {
            if manual.contains(client) {
                let _ = ack_tx.send((client.clone(), message.message_id.clone()));
            }
        }
    }));

    let ack_registry = registry.clone();
    let ack_task = tokio::spawn(async move {
        while let Some((client, message_id)) = ack_rx.recv().await {
            if let Err(e) = ack_registry.acknowledge(&client, &message_id).await {
                warn!(client = %client, message_id, "Acknowledge failed: {}", e);
            }
        }
    });

    for client in &config.clients {
        if let Err(e) = start_client(&registry, &config.app.id, client).await {
            error!(client_id = %client.client_id, "Client failed to start: {}", e);
        }
    }

    info!(clients = config.clients.len(), "hermes is running");
    wait_for_shutdown_signal().await?;

    info!("Shutting down");
    registry.disconnect_all(SHUTDOWN_QUIESCE).await;
    registry.flush_events().await;
    registry.close_all().await;
    ack_task.abort();
    Ok(())
}

async fn start_client(
    registry: &ConnectionRegistry,
    app_id: &str,
    client: &ClientConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let info = registry
        .client_info(client.identity(app_id))
        .with_options(client.connect_options()?)
        .with_ack_mode(client.ack);
    let identity = registry.register(info).await?;

    if !client.subscriptions.is_empty() {
        // Recorded now, sent as soon as the session is up
        match registry
            .subscribe(&identity, &client.subscriptions, client.subscription_qos)
            .await
        {
            Ok(()) | Err(HermesError::NotConnected { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    registry.connect(&identity).await?;
    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::MessageArrived { client, message } => info!(
            client = %client,
            topic = %message.topic,
            message_id = %message.message_id,
            bytes = message.payload.len(),
            duplicate = message.duplicate,
            "Message arrived"
        ),
        Event::ConnectFailed { client, error }
        | Event::PersistenceFailed { client, error, .. }
        | Event::SubscribeFailed { client, error, .. }
        | Event::PublishFailed { client, error, .. } => {
            warn!(client = %client, event = event.name(), error = %error, "Client error");
        }
        other => info!(client = %other.client(), event = other.name(), "Client event"),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    signal::ctrl_c().await
}

fn handle_config_command(config: &HermesConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", config.to_toml_string()?);
    }
    info!(clients = config.clients.len(), "Configuration is valid");
    Ok(())
}

async fn show_backlog(config: &HermesConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config)?;
    for identity in config.identities() {
        let count = store.count(&identity).await.map_err(HermesError::from)?;
        println!("{identity}\t{count}");
    }
    Ok(())
}
