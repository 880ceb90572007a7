//! Runtimes driving the two relay loops.
//!
//! This module provides:
//! - `BridgeRuntime`: change log → queue (poll, route, publish, commit)
//! - `ConsumerRuntime`: queue → decode, classify, acknowledge
//!
//! The runtimes handle:
//! - The per-unit state machine and its structured logging
//! - Publish retries with back-off
//! - Poison message redelivery caps and dead-lettering
//! - Health tracking and metrics
//! - Cooperative cancellation and release of both adapters on every exit path

mod bridge_runtime;
mod consumer_runtime;
mod redelivery;

pub use bridge_runtime::{BridgeRuntime, BridgeState};
pub use consumer_runtime::{ConsumerRuntime, ConsumerState, Disposition};
pub use redelivery::RedeliveryTracker;

use crate::RelayConfig;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over `processing.log_level`. Safe to call more than once.
pub fn init_tracing(config: &RelayConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.processing.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok(); // Ignore if already initialized
}

/// Cancel `token` on Ctrl-C / SIGINT
pub fn shutdown_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal; stopping"),
            },
            _ = token.cancelled() => return,
        }
        token.cancel();
    })
}

/// Sleep for `duration` unless cancelled first; returns `false` on cancellation
pub(crate) async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
