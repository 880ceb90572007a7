//! cdc-bridge - relays CDC records from Kafka topics into RabbitMQ queues
//!
//! # Usage
//!
//! ```bash
//! # Defaults plus environment overrides
//! cdc-bridge
//!
//! # TOML file, then environment overrides
//! cdc-bridge -c relay.toml
//!
//! # Validate configuration and exit
//! cdc-bridge -c relay.toml --validate
//! ```

use cdc_relay::adapters::amqp::AmqpBroker;
use cdc_relay::adapters::kafka::KafkaLogSource;
use cdc_relay::{init_tracing, shutdown_on_ctrl_c, BridgeRuntime, RelayConfig, RelayResult};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cdc-bridge")]
#[command(version, about = "Relays change-data-capture records from Kafka into RabbitMQ")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "CDC_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "cdc-bridge failed");
            eprintln!("cdc-bridge: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> RelayResult<()> {
    let mut config = RelayConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.processing.log_level = level;
    }
    init_tracing(&config);

    if cli.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let source = KafkaLogSource::new(&config.kafka)?;
    let publisher = AmqpBroker::connect(&config.rabbitmq, &config.relay_name).await?;

    let token = CancellationToken::new();
    shutdown_on_ctrl_c(token.clone());

    let mut runtime = BridgeRuntime::new(source, publisher, config)?;
    runtime.run(token).await
}
