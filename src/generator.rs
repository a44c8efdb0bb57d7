//! Generator mode: connect a pool, publish from every client, report

use crate::aggregator;
use crate::config::ClientConfig;
use crate::error::ConfigError;
use crate::output::{self, RunReport};
use crate::pool::{BarrierPolicy, Pool};
use crate::shutdown::Shutdown;
use crate::transport::Connection;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

pub struct GeneratorSettings {
    pub clients: usize,
    pub policy: BarrierPolicy,
    /// Draw progress bars instead of staying silent
    pub interactive: bool,
}

pub async fn run<C, F>(
    config: Arc<ClientConfig>,
    settings: &GeneratorSettings,
    make_connection: F,
    shutdown: Shutdown,
) -> Result<RunReport>
where
    C: Connection,
    F: FnMut(u32) -> C,
{
    if settings.clients == 0 {
        return Err(ConfigError::InvalidClientCount.into());
    }

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    info!(
        run_id = %run_id,
        broker = %config.broker_addr(),
        topic = %config.topic,
        clients = settings.clients,
        "Setting up {} MQTT clients",
        settings.clients
    );

    let (updates, aggregator) = aggregator::channel();
    let connect_pb = output::connect_bar(settings.clients as u64, settings.interactive);

    let pool = Pool::connect(
        config.clone(),
        settings.clients,
        make_connection,
        updates,
        settings.policy,
        shutdown.clone(),
        |progress| {
            connect_pb.set_position(progress.completed() as u64);
            connect_pb.set_message(format!(
                "connecting... ({} ok, {} failed)",
                progress.connected, progress.failed
            ));
        },
    )
    .await;

    let pool = match pool {
        Ok(pool) => {
            if pool.failures().is_empty() {
                connect_pb.finish_with_message(format!("all {} clients connected", pool.len()));
            } else {
                connect_pb.finish_with_message(format!(
                    "connected: {} ok, {} failed",
                    pool.len(),
                    pool.failures().len()
                ));
            }
            pool
        }
        Err(e) => {
            connect_pb.abandon_with_message("connect failed");
            return Err(e).context("client pool setup failed");
        }
    };

    info!(clients = pool.len(), "All clients connected, starting publishing messages");

    let requested = pool.requested();
    let expected = pool.len() as u64 * config.message_count;
    let bar = output::publish_bar(expected, settings.interactive);
    let aggregating = tokio::spawn(aggregator.run(bar));

    let publish_started = Instant::now();
    let summary = pool.start(shutdown).join().await;
    let elapsed = publish_started.elapsed();

    let (events, _bar) = aggregating.await.context("aggregator task failed")?;

    Ok(RunReport::new(
        run_id,
        started_at,
        &config,
        requested,
        &summary,
        events,
        elapsed,
    ))
}
