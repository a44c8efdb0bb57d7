mod aggregator;
mod checker;
mod client;
mod config;
mod error;
mod generator;
mod metrics;
mod output;
mod pool;
mod rate;
mod schedule;
mod shutdown;
mod transport;

use anyhow::Result;
use checker::CheckerSettings;
use clap::{Args, Parser, Subcommand};
use config::{qos_from_u8, ClientConfig, Schedule, TlsSettings, DEFAULT_CLIENT_PREFIX};
use error::ConfigError;
use generator::GeneratorSettings;
use pool::BarrierPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transport::MqttConnector;

#[derive(Parser)]
#[command(name = "mqtt-load")]
#[command(about = "MQTT load generator and throughput checker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish messages from a pool of concurrent clients
    #[command(disable_help_flag = true)]
    Publish(PublishArgs),

    /// Subscribe to a topic and report the receive rate
    #[command(disable_help_flag = true)]
    Check(CheckArgs),
}

/// Broker connection flags shared by both modes
#[derive(Args)]
struct BrokerArgs {
    /// Target MQTT topic
    #[arg(short = 't', long, default_value = "/load")]
    topic: String,

    /// MQTT username
    #[arg(short = 'u', long, env = "MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password
    #[arg(short = 'P', long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// MQTT broker host
    #[arg(short = 'h', long, default_value = "localhost")]
    host: String,

    /// MQTT broker port
    #[arg(short = 'p', long, default_value = "1883")]
    port: u16,

    /// QoS level used by all clients (0, 1, or 2)
    #[arg(short = 'q', long, default_value = "1")]
    qos: u8,

    /// Prefix of the generated MQTT client IDs
    #[arg(long, default_value = DEFAULT_CLIENT_PREFIX)]
    client_prefix: String,

    /// Give up on a client that is not connected after this long
    #[arg(long, default_value = "30s")]
    connect_timeout: humantime::Duration,

    /// Path to TLS certificate file
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS CA file
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Path to TLS key file
    #[arg(long)]
    key: Option<PathBuf>,

    /// Allow self-signed certificates
    #[arg(long)]
    insecure: bool,

    /// Use MQTTS
    #[arg(long)]
    mqtts: bool,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[derive(Args)]
struct PublishArgs {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Number of messages to send per client
    #[arg(short = 'c', long, default_value = "1000")]
    count: u64,

    /// Size in bytes of the message payload
    #[arg(short = 's', long, default_value = "100")]
    size: usize,

    /// Milliseconds to wait between messages
    #[arg(short = 'i', long, default_value = "1")]
    interval: u64,

    /// Distribution of time between messages
    #[arg(short = 'z', long, value_enum, default_value = "normal")]
    schedule: Schedule,

    /// Number of concurrent MQTT clients
    #[arg(short = 'n', long, default_value = "1")]
    clients: usize,

    /// Publish to <topic>/<client> with client numbers 1..=N
    #[arg(long)]
    suffix: bool,

    /// Keep going with the clients that connected instead of aborting
    #[arg(long)]
    allow_partial: bool,

    /// Wait this long for a publish acknowledgment
    #[arg(long, default_value = "10s")]
    ack_timeout: humantime::Duration,

    /// Retries for an unacknowledged publish before it counts as dropped
    #[arg(long, default_value = "2")]
    publish_retries: u32,

    /// Print the run summary as JSON instead of progress bars and a banner
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CheckArgs {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Log statistics periodically instead of showing interactive output
    #[arg(long)]
    disable_bar: bool,

    /// Reset the counter after <n> seconds without a message
    #[arg(long, default_value = "30", value_parser = parse_seconds)]
    reset_after: Duration,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|e| format!("{}", e))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| format!("expected a non-negative number of seconds, got {}: {}", value, e))
}

impl BrokerArgs {
    fn into_config(self) -> Result<ClientConfig, ConfigError> {
        let qos = qos_from_u8(self.qos)?;
        let tls = TlsSettings::from_flags(self.mqtts, self.ca, self.cert, self.key)?;

        Ok(ClientConfig {
            topic: self.topic,
            username: self.username.filter(|u| !u.is_empty()),
            password: self.password,
            host: self.host,
            port: self.port,
            qos,
            tls,
            insecure: self.insecure,
            client_prefix: self.client_prefix,
            connect_timeout: self.connect_timeout.into(),
            ..ClientConfig::default()
        })
    }
}

impl PublishArgs {
    fn settings(&self) -> GeneratorSettings {
        GeneratorSettings {
            clients: self.clients,
            policy: if self.allow_partial {
                BarrierPolicy::AllowPartial
            } else {
                BarrierPolicy::RequireAll
            },
            interactive: !self.json,
        }
    }

    fn into_config(self) -> Result<ClientConfig, ConfigError> {
        if self.clients == 0 {
            return Err(ConfigError::InvalidClientCount);
        }
        Ok(ClientConfig {
            message_count: self.count,
            payload_size: self.size,
            interval: Duration::from_millis(self.interval),
            schedule: self.schedule,
            id_as_subtopic: self.suffix,
            ack_timeout: self.ack_timeout.into(),
            publish_retries: self.publish_retries,
            ..self.broker.into_config()?
        })
    }
}

impl CheckArgs {
    fn settings(&self) -> CheckerSettings {
        CheckerSettings {
            interactive: !self.disable_bar,
            reset_after: self.reset_after,
        }
    }

    fn into_config(self) -> Result<ClientConfig, ConfigError> {
        self.broker.into_config()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match cli.verbose {
        0 => "mqtt_load=info",
        1 => "mqtt_load=debug",
        _ => "mqtt_load=trace,rumqttc=debug",
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            trigger.trigger();
        }
    });

    match cli.command {
        Commands::Publish(args) => {
            let settings = args.settings();
            let json = args.json;
            let config = Arc::new(args.into_config()?);
            let connector = MqttConnector::new(config.clone(), false)?;

            let report =
                generator::run(config, &settings, |id| connector.connection(id), shutdown).await?;

            if json {
                output::print_json(&report)?;
            } else {
                output::print_report(&report);
            }
        }

        Commands::Check(args) => {
            let settings = args.settings();
            let config = Arc::new(args.into_config()?);
            let connector = MqttConnector::new(config.clone(), true)?;

            if settings.interactive {
                println!("press ctrl+c to exit");
            }

            let report =
                checker::run(config, &settings, |id| connector.connection(id), shutdown).await?;
            info!(client_id = %report.client_id, received = report.received, "Checker finished");
        }
    }

    Ok(())
}
