use crate::client::Completion;
use crate::config::{qos_to_u8, ClientConfig, Schedule};
use crate::metrics::LatencyPercentiles;
use crate::pool::PoolSummary;
use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Progress of the connect barrier
pub fn connect_bar(total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(bar_style(
        "{spinner:.blue} [{elapsed_precise}] {bar:40.blue/black} {pos}/{len} {msg}",
    ));
    pb.set_message("connecting...");
    pb
}

/// Progress of all publish loops, one step per acknowledged message
pub fn publish_bar(total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(bar_style(
        "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({per_sec}, eta {eta})",
    ));
    pb
}

/// Open-ended counter for received messages
pub fn receive_spinner(visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {pos} messages received ({per_sec})")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb
}

/// Outcome of one generator run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub broker: String,
    pub topic: String,
    pub id_as_subtopic: bool,
    pub qos: u8,
    pub schedule: Schedule,
    pub interval_ms: u64,
    pub payload_size: usize,
    pub messages_per_client: u64,
    pub clients_requested: usize,
    pub clients_connected: usize,
    pub clients_failed: usize,
    pub clients_lost: usize,
    pub cancelled: bool,
    pub published: u64,
    pub dropped: u64,
    /// Sum of all events seen by the aggregator
    pub events: u64,
    pub elapsed_secs: f64,
    pub publish_rate: f64,
    pub ack_latency: Option<LatencyPercentiles>,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        config: &ClientConfig,
        clients_requested: usize,
        summary: &PoolSummary,
        events: u64,
        elapsed: Duration,
    ) -> Self {
        let published = summary.processed();
        let elapsed_secs = elapsed.as_secs_f64();
        let publish_rate = if elapsed_secs > 0.0 {
            published as f64 / elapsed_secs
        } else {
            0.0
        };

        Self {
            run_id,
            started_at,
            broker: config.broker_addr(),
            topic: config.topic.clone(),
            id_as_subtopic: config.id_as_subtopic,
            qos: qos_to_u8(config.qos),
            schedule: config.schedule,
            interval_ms: u64::try_from(config.interval.as_millis()).unwrap_or(u64::MAX),
            payload_size: config.payload_size,
            messages_per_client: config.message_count,
            clients_requested,
            clients_connected: summary.clients.len(),
            clients_failed: summary.failed_to_connect,
            clients_lost: summary.count(Completion::ConnectionLost),
            cancelled: summary.count(Completion::Cancelled) > 0,
            published,
            dropped: summary.dropped(),
            events,
            elapsed_secs,
            publish_rate,
            ack_latency: summary.latency().percentiles(),
        }
    }

    /// Messages the run was asked to publish with the clients that connected
    pub fn expected(&self) -> u64 {
        self.clients_connected as u64 * self.messages_per_client
    }
}

pub fn print_json(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

pub fn print_report(report: &RunReport) {
    println!();
    println!("═══════════════════════════════════════════════════════════════");
    println!("                        RUN SUMMARY                             ");
    println!("═══════════════════════════════════════════════════════════════");
    println!();
    println!("  Run ID:          {}", report.run_id);
    println!("  Started:         {}", report.started_at);
    println!("  Broker:          {}", report.broker);
    if report.id_as_subtopic {
        println!("  Topic:           {}/<client>", report.topic);
    } else {
        println!("  Topic:           {}", report.topic);
    }
    println!("  QoS:             {}", report.qos);
    println!(
        "  Schedule:        {} (mean {} ms)",
        report.schedule, report.interval_ms
    );
    println!("  Payload:         {} bytes", report.payload_size);
    println!();
    println!(
        "  Clients:         {} connected / {} requested",
        report.clients_connected, report.clients_requested
    );
    if report.clients_failed > 0 {
        println!("  Failed:          {}", report.clients_failed);
    }
    if report.clients_lost > 0 {
        println!("  Lost mid-run:    {}", report.clients_lost);
    }
    println!(
        "  Messages:        {} published / {} expected",
        report.published,
        report.expected()
    );
    if report.dropped > 0 {
        println!("  Dropped:         {}", report.dropped);
    }
    println!(
        "  Duration:        {:.2}s ({:.1} msg/s)",
        report.elapsed_secs, report.publish_rate
    );

    if let Some(latency) = &report.ack_latency {
        println!();
        println!("  ACK LATENCY");
        println!("  ─────────────────────────────────────────────────────────────");
        println!(
            "    min {:.3} ms   mean {:.3} ms   max {:.3} ms",
            latency.min_ms, latency.mean_ms, latency.max_ms
        );
        println!(
            "    p50 {:.3} ms   p95 {:.3} ms   p99 {:.3} ms",
            latency.p50_ms, latency.p95_ms, latency.p99_ms
        );
    }

    if report.cancelled {
        println!();
        println!("  Run was interrupted before all messages were sent.");
    }
    println!();
}
