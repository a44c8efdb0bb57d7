//! Sliding-window rate counter and idle-reset monitor for the checker

use crate::aggregator::UpdateSink;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Count of increments observed within the trailing window
#[derive(Debug)]
pub struct RateCounter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    in_window: u64,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            in_window: 0,
        }
    }

    pub fn incr(&mut self, count: u64, now: Instant) {
        self.expire(now);
        self.samples.push_back((now, count));
        self.in_window += count;
    }

    pub fn rate(&mut self, now: Instant) -> u64 {
        self.expire(now);
        self.in_window
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, count)) = self.samples.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.samples.pop_front();
            self.in_window -= count;
        }
    }
}

/// Result of one reporting tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing received since start or since the last reset
    Quiet,
    Report { total: u64, rate: u64 },
    /// Reported, then zeroed because the last message is older than the idle threshold
    ReportAndReset { total: u64, rate: u64 },
}

/// Cumulative count plus one-second rate, zeroed after a period of silence.
///
/// Owned by the aggregator task alone; nothing else touches it.
#[derive(Debug)]
pub struct ThroughputMonitor {
    total: u64,
    rate: RateCounter,
    last_message: Option<Instant>,
    idle_after: Duration,
}

impl ThroughputMonitor {
    pub fn new(idle_after: Duration) -> Self {
        Self {
            total: 0,
            rate: RateCounter::new(RATE_WINDOW),
            last_message: None,
            idle_after,
        }
    }

    pub fn idle_after(&self) -> Duration {
        self.idle_after
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Zero counts carry no message and do not refresh the idle clock
    pub fn record(&mut self, count: u64, now: Instant) {
        if count == 0 {
            return;
        }
        self.total += count;
        self.rate.incr(count, now);
        self.last_message = Some(now);
    }

    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.total == 0 {
            return TickOutcome::Quiet;
        }

        let total = self.total;
        let rate = self.rate.rate(now);
        let idle = self
            .last_message
            .is_some_and(|at| now.saturating_duration_since(at) > self.idle_after);

        if idle {
            self.total = 0;
            TickOutcome::ReportAndReset { total, rate }
        } else {
            TickOutcome::Report { total, rate }
        }
    }
}

/// Aggregator sink that logs the monitor's state on every refresh tick
pub struct RateReporter {
    monitor: ThroughputMonitor,
}

impl RateReporter {
    pub fn new(idle_after: Duration) -> Self {
        Self {
            monitor: ThroughputMonitor::new(idle_after),
        }
    }

    #[cfg(test)]
    pub fn monitor(&self) -> &ThroughputMonitor {
        &self.monitor
    }
}

impl UpdateSink for RateReporter {
    fn add(&mut self, count: u64) {
        self.monitor.record(count, Instant::now());
    }

    fn tick(&mut self) {
        match self.monitor.tick(Instant::now()) {
            TickOutcome::Quiet => {}
            TickOutcome::Report { total, rate } => {
                info!(total, rate, "Received {} messages so far while handling {} msg/sec", total, rate);
            }
            TickOutcome::ReportAndReset { total, rate } => {
                info!(total, rate, "Received {} messages so far while handling {} msg/sec", total, rate);
                info!(
                    idle_secs = self.monitor.idle_after().as_secs_f64(),
                    "Did not receive a message for at least {} seconds. Resetting counter.",
                    self.monitor.idle_after().as_secs()
                );
                info!("Log will continue when new messages arrive.");
            }
        }
    }

    fn flush(&mut self) {
        debug!(total = self.monitor.total(), "Rate reporter stopped");
    }
}
