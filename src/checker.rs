//! Checker mode: subscribe to the target topic and report throughput

use crate::aggregator::{self, UpdateSink};
use crate::config::ClientConfig;
use crate::output;
use crate::pool::{BarrierPolicy, Pool};
use crate::rate::{RateReporter, RATE_WINDOW};
use crate::shutdown::Shutdown;
use crate::transport::Connection;
use anyhow::{Context, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Upper bound (exclusive) of the random checker identity
pub const CHECKER_ID_RANGE: u32 = 100_000;

pub struct CheckerSettings {
    /// Spinner display; otherwise periodic log lines with idle reset
    pub interactive: bool,
    pub reset_after: Duration,
}

/// Outcome of a checker run, once it was shut down
#[derive(Debug)]
pub struct CheckerReport {
    pub client_id: String,
    pub received: u64,
}

pub fn random_identity() -> u32 {
    rand::thread_rng().gen_range(0..CHECKER_ID_RANGE)
}

/// Run until shutdown. `make_connection` receives the checker's identity.
pub async fn run<C, F>(
    config: Arc<ClientConfig>,
    settings: &CheckerSettings,
    mut make_connection: F,
    shutdown: Shutdown,
) -> Result<CheckerReport>
where
    C: Connection,
    F: FnMut(u32) -> C,
{
    let identity = random_identity();
    let (updates, aggregator) = aggregator::channel();

    let pool = Pool::connect(
        config.clone(),
        1,
        |_| make_connection(identity),
        updates,
        BarrierPolicy::RequireAll,
        shutdown.clone(),
        |_| {},
    )
    .await
    .context("checker failed to connect")?;

    let client_id = pool
        .clients()
        .next()
        .map(|client| client.client_id().to_string())
        .unwrap_or_default();
    info!(client_id = %client_id, broker = %config.broker_addr(), "Checker connected");

    let sink: Box<dyn UpdateSink + Send> = if settings.interactive {
        Box::new(output::receive_spinner(true))
    } else {
        Box::new(RateReporter::new(settings.reset_after))
    };
    let aggregating = tokio::spawn(aggregator.with_refresh(RATE_WINDOW).run(sink));

    let summary = pool.start_receiving(shutdown).join().await;
    let (received, _sink) = aggregating.await.context("aggregator task failed")?;

    info!(received, processed = summary.processed(), "Checker stopped");
    Ok(CheckerReport {
        client_id,
        received,
    })
}
