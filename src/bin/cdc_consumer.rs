//! cdc-consumer - decodes and logs CDC events from a RabbitMQ queue
//!
//! # Usage
//!
//! ```bash
//! # Consume the configured queue (default cdc.customers)
//! cdc-consumer -c relay.toml
//!
//! # Another queue
//! RABBITMQ_QUEUE=cdc.orders cdc-consumer
//! ```

use cdc_relay::adapters::amqp::AmqpBroker;
use cdc_relay::{
    init_tracing, shutdown_on_ctrl_c, ConsumerRuntime, LogEventHandler, RelayConfig, RelayResult,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cdc-consumer")]
#[command(version, about = "Consumes change-data-capture events from a RabbitMQ queue")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "CDC_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// Queue to consume, overriding the configuration
    #[arg(short, long)]
    queue: Option<String>,

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
            error!(error = %e, "cdc-consumer failed");
            eprintln!("cdc-consumer: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> RelayResult<()> {
    let mut config = RelayConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.processing.log_level = level;
    }
    if let Some(queue) = cli.queue {
        config.rabbitmq.queue_name = queue;
        config.validate()?;
    }
    init_tracing(&config);

    if cli.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let consumer_tag = format!("{}-consumer", config.relay_name);
    let broker = AmqpBroker::connect(&config.rabbitmq, &consumer_tag).await?;

    let token = CancellationToken::new();
    shutdown_on_ctrl_c(token.clone());

    let mut runtime = ConsumerRuntime::new(broker, LogEventHandler, config)?;
    runtime.run(token).await
}
