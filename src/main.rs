//! Cogwyrm command line entry point
//!
//! Publishes single messages, watches topics through the shared subscription
//! registry, and checks topic filters without touching a broker.

use cogwyrm::config::{BrokerEndpoint, CogwyrmConfig, ConfigError};
use cogwyrm::network::{spawn_tcp_probe, NetworkMonitor};
use cogwyrm::observability::init_default_logging;
use cogwyrm::protocol::{
    check_topic_filter, topic_matches_pattern, wildcard_help, EventOutput, Message, QoS,
};
use cogwyrm::session::{ConnectionSession, MessageCallback};
use cogwyrm::transport::mqtt::RumqttcConnector;
use cogwyrm::{EventCondition, MessageHistory, SubscriptionRegistry};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["cogwyrm.toml", "config/cogwyrm.toml"];
const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT publish and watch tool
#[derive(Parser)]
#[command(name = "cogwyrm")]
#[command(about = "Publish to and watch MQTT topics with a reconnecting session")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL overriding the configured endpoint (mqtt://, mqtts://, tcp://, ssl://)
    #[arg(short, long, env = "COGWYRM_BROKER", value_name = "URL")]
    broker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, publish one message and disconnect
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        /// Quality of service: 0, 1 or 2
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// Subscribe and print matching messages as JSON lines until Ctrl-C
    Watch {
        /// Subscription filter sent to the broker
        #[arg(short, long)]
        topic: String,
        /// Local event filter; defaults to the subscription filter
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
    },
    /// Topic filter utilities
    Topic {
        #[command(subcommand)]
        action: TopicCommand,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Subcommand)]
enum TopicCommand {
    /// Check a topic filter against the wildcard rules
    Validate { topic: String },
    /// Check whether a topic matches a filter
    Match { pattern: String, topic: String },
    /// Explain the wildcard syntax
    Help,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => match resolve_endpoint(&config, cli.broker.as_deref()) {
            Ok(endpoint) => publish(&config, endpoint, &topic, message, qos, retain).await,
            Err(e) => Err(e.into()),
        },
        Commands::Watch { topic, filter, qos } => {
            match resolve_endpoint(&config, cli.broker.as_deref()) {
                Ok(endpoint) => watch(&config, endpoint, &topic, filter, qos).await,
                Err(e) => Err(e.into()),
            }
        }
        Commands::Topic { action } => handle_topic_command(action),
        Commands::Config { show } => handle_config_command(&config, cli.broker.as_deref(), show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> Result<CogwyrmConfig, ConfigError> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return CogwyrmConfig::load_from_file(path);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return CogwyrmConfig::load_from_file(path);
        }
    }

    info!("No configuration file found, using defaults");
    let config = CogwyrmConfig::default();
    config.validate()?;
    Ok(config)
}

fn resolve_endpoint(
    config: &CogwyrmConfig,
    broker_url: Option<&str>,
) -> Result<BrokerEndpoint, ConfigError> {
    match broker_url {
        Some(url) => {
            let endpoint = BrokerEndpoint::from_url(url)?;
            Ok(match &config.broker.client_id {
                Some(client_id) => endpoint.with_client_id(client_id),
                None => endpoint,
            })
        }
        None => config.to_endpoint(),
    }
}

async fn publish(
    config: &CogwyrmConfig,
    endpoint: BrokerEndpoint,
    topic: &str,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let session = ConnectionSession::builder(endpoint, Arc::new(RumqttcConnector::new()))
        .options(config.session_options().without_auto_reconnect())
        .on_delivery_complete(|message: &Message| {
            info!(topic = %message.topic, qos = %message.qos, "Delivery complete");
        })
        .build();

    session.connect().await?;
    let published = session.publish(topic, message, qos, retain).await;
    session.disconnect().await;
    published?;

    println!("Published to {topic}");
    Ok(())
}

async fn watch(
    config: &CogwyrmConfig,
    endpoint: BrokerEndpoint,
    topic: &str,
    filter: Option<String>,
    qos: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let condition = EventCondition::new(filter.unwrap_or_else(|| topic.to_string()))?;
    let history = Arc::new(MessageHistory::new());

    let monitor = NetworkMonitor::default();
    let probe = spawn_tcp_probe(
        monitor.clone(),
        format!("{}:{}", endpoint.host(), endpoint.port()),
        PROBE_INTERVAL,
        PROBE_TIMEOUT,
    );
    let registry = SubscriptionRegistry::new(
        Arc::new(RumqttcConnector::new()),
        config.session_options(),
    )
    .with_network_monitor(monitor);

    let (outputs, mut received) = mpsc::unbounded_channel::<EventOutput>();
    let recorder = history.clone();
    let callback: MessageCallback = Arc::new(move |message: &Message| {
        recorder.record(message.clone());
        if let Some(output) = condition.evaluate(message) {
            let _ = outputs.send(output);
        }
    });

    registry.acquire(&endpoint, topic, qos, callback).await?;
    info!(endpoint = %endpoint, topic, "Watching, press Ctrl-C to stop");

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            output = received.recv() => match output {
                Some(output) => println!("{}", serde_json::to_string(&output)?),
                None => break,
            },
        }
    }

    if let Err(e) = registry.release(&endpoint.key(), topic).await {
        warn!(error = %e, "Release on shutdown failed");
    }
    registry.shutdown().await;
    probe.abort();

    info!(messages = history.len(), "Watch finished");
    Ok(())
}

fn handle_topic_command(action: TopicCommand) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        TopicCommand::Validate { topic } => {
            check_topic_filter(&topic)?;
            println!("valid");
        }
        TopicCommand::Match { pattern, topic } => {
            println!("{}", topic_matches_pattern(&pattern, &topic));
        }
        TopicCommand::Help => println!("{}", wildcard_help()),
    }
    Ok(())
}

fn handle_config_command(
    config: &CogwyrmConfig,
    broker_url: Option<&str>,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = resolve_endpoint(config, broker_url)?;

    if show {
        println!("# endpoint: {endpoint} (client id {})", endpoint.client_id());
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
