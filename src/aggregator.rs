//! Single consumer of the shared update channel

use indicatif::ProgressBar;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Buffer of the update channel between clients and the aggregator
pub const UPDATE_BUFFER: usize = 1000;

/// Display or counter state fed by the aggregator.
///
/// The aggregator is its only writer, so implementations need no locking.
pub trait UpdateSink {
    fn add(&mut self, count: u64);

    /// Periodic refresh, only called when the aggregator has a refresh period
    fn tick(&mut self) {}

    /// Called once after the channel closed
    fn flush(&mut self) {}
}

impl<S: UpdateSink + ?Sized> UpdateSink for Box<S> {
    fn add(&mut self, count: u64) {
        (**self).add(count)
    }

    fn tick(&mut self) {
        (**self).tick()
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}

impl UpdateSink for ProgressBar {
    fn add(&mut self, count: u64) {
        self.inc(count);
    }

    fn tick(&mut self) {
        ProgressBar::tick(self);
    }

    fn flush(&mut self) {
        // Leave the bar where it stopped instead of jumping to its length
        self.abandon();
    }
}

pub fn channel() -> (mpsc::Sender<u64>, Aggregator) {
    let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
    (tx, Aggregator::new(rx))
}

/// Drains update events until every producer is gone
pub struct Aggregator {
    updates: mpsc::Receiver<u64>,
    refresh: Option<Duration>,
}

impl Aggregator {
    pub fn new(updates: mpsc::Receiver<u64>) -> Self {
        Self {
            updates,
            refresh: None,
        }
    }

    pub fn with_refresh(mut self, every: Duration) -> Self {
        self.refresh = Some(every);
        self
    }

    /// Sum every received count into `sink`; returns the total and the sink
    /// once the channel closed and the sink was flushed.
    pub async fn run<S: UpdateSink>(mut self, mut sink: S) -> (u64, S) {
        let mut total = 0u64;
        let mut ticker = self.refresh.map(|every| {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                update = self.updates.recv() => match update {
                    Some(count) => {
                        total += count;
                        sink.add(count);
                    }
                    None => break,
                },
                _ = next_tick(&mut ticker) => sink.tick(),
            }
        }

        sink.flush();
        (total, sink)
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
