//! Fixed-size client pool with a two-phase start: connect barrier, then work

use crate::client::{Client, ClientSummary, Completion};
use crate::config::ClientConfig;
use crate::error::{ClientError, PoolError};
use crate::metrics::LatencyHistogram;
use crate::shutdown::Shutdown;
use crate::transport::Connection;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What to do when some clients fail to pass the connect barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPolicy {
    /// Abort the run if any client failed
    RequireAll,
    /// Carry on with the clients that connected, abort only if none did
    AllowPartial,
}

/// Progress of the connect barrier, reported after every client outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierProgress {
    pub total: usize,
    pub connected: usize,
    pub failed: usize,
}

impl BarrierProgress {
    pub fn completed(&self) -> usize {
        self.connected + self.failed
    }
}

/// Clients that passed the connect barrier, in insertion order
pub struct Pool<C: Connection> {
    clients: Vec<Client<C>>,
    requested: usize,
    failures: Vec<ClientError>,
}

impl<C: Connection> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("requested", &self.requested)
            .field("connected", &self.clients.len())
            .field("failed", &self.failures.len())
            .finish()
    }
}

impl<C: Connection> Pool<C> {
    /// Build `size` clients with identities `1..=size`, connect them all
    /// concurrently and return once every one of them reported an outcome.
    ///
    /// `on_progress` runs after each outcome. Shutdown aborts the barrier.
    pub async fn connect<F, P>(
        config: Arc<ClientConfig>,
        size: usize,
        mut make_connection: F,
        updates: mpsc::Sender<u64>,
        policy: BarrierPolicy,
        mut shutdown: Shutdown,
        mut on_progress: P,
    ) -> Result<Self, PoolError>
    where
        F: FnMut(u32) -> C,
        P: FnMut(BarrierProgress),
    {
        let mut pending = JoinSet::new();
        for index in 0..size {
            let id = index as u32 + 1;
            let mut client = Client::new(id, config.clone(), make_connection(id), updates.clone());
            pending.spawn(async move {
                let result = client.connect().await;
                (index, client, result)
            });
        }
        // Clients hold the remaining senders; the aggregator ends once they are gone
        drop(updates);

        let mut slots: Vec<Option<Client<C>>> = (0..size).map(|_| None).collect();
        let mut failures = Vec::new();
        let mut progress = BarrierProgress {
            total: size,
            connected: 0,
            failed: 0,
        };

        loop {
            tokio::select! {
                joined = pending.join_next() => match joined {
                    Some(Ok((index, client, Ok(())))) => {
                        debug!(client_id = %client.client_id(), state = ?client.state(), "Client passed the barrier");
                        slots[index] = Some(client);
                        progress.connected += 1;
                        on_progress(progress);
                    }
                    Some(Ok((_, client, Err(e)))) => {
                        warn!(client_id = %client.client_id(), error = %e, "Client failed to connect");
                        failures.push(e);
                        progress.failed += 1;
                        on_progress(progress);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Connect task failed");
                        failures.push(ClientError::Connect {
                            client_id: "unknown".to_string(),
                            reason: e.to_string(),
                        });
                        progress.failed += 1;
                        on_progress(progress);
                    }
                    None => break,
                },
                _ = shutdown.wait() => {
                    pending.abort_all();
                    close_all(slots.into_iter().flatten()).await;
                    return Err(PoolError::Cancelled);
                }
            }
        }

        let clients: Vec<Client<C>> = slots.into_iter().flatten().collect();
        debug!(connected = clients.len(), failed = failures.len(), "Connect barrier released");

        if !failures.is_empty() {
            if clients.is_empty() {
                return Err(PoolError::NoClientsConnected);
            }
            if policy == BarrierPolicy::RequireAll {
                let failed = failures.len();
                close_all(clients).await;
                let first = failures.swap_remove(0);
                return Err(PoolError::ConnectFailed {
                    failed,
                    total: size,
                    first,
                });
            }
            warn!(
                connected = clients.len(),
                failed = failures.len(),
                "Proceeding with {} of {} clients",
                clients.len(),
                size
            );
        }

        Ok(Self {
            clients,
            requested: size,
            failures,
        })
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn failures(&self) -> &[ClientError] {
        &self.failures
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client<C>> {
        self.clients.iter()
    }

    /// Phase two for the generator: run every client's publish loop concurrently
    pub fn start(self, shutdown: Shutdown) -> PoolRun {
        info!(clients = self.clients.len(), "Starting publish loops");
        let failed = self.failures.len();
        let mut tasks = JoinSet::new();
        for client in self.clients {
            tasks.spawn(client.publish(shutdown.clone()));
        }
        PoolRun { tasks, failed }
    }

    /// Phase two for the checker: subscribe every client, then receive
    pub fn start_receiving(self, shutdown: Shutdown) -> PoolRun {
        let failed = self.failures.len();
        let mut tasks = JoinSet::new();
        for mut client in self.clients {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = client.subscribe().await {
                    warn!(client_id = %client.client_id(), error = %e, "Failed to subscribe");
                    client.close().await;
                    return ClientSummary {
                        id: client.id(),
                        client_id: client.client_id().to_string(),
                        processed: 0,
                        dropped: 0,
                        completion: Completion::ConnectionLost,
                        latency: LatencyHistogram::new(),
                    };
                }
                client.receive(shutdown).await
            });
        }
        PoolRun { tasks, failed }
    }
}

async fn close_all<C: Connection>(clients: impl IntoIterator<Item = Client<C>>) {
    for mut client in clients {
        client.close().await;
    }
}

/// Running pool; [`PoolRun::join`] completes once every client finished
pub struct PoolRun {
    tasks: JoinSet<ClientSummary>,
    failed: usize,
}

impl PoolRun {
    pub async fn join(mut self) -> PoolSummary {
        let mut clients = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(summary) => clients.push(summary),
                Err(e) => warn!(error = %e, "Client task failed"),
            }
        }
        clients.sort_by_key(|summary| summary.id);
        PoolSummary {
            clients,
            failed_to_connect: self.failed,
        }
    }
}

/// Outcome of a whole pool
#[derive(Debug)]
pub struct PoolSummary {
    pub clients: Vec<ClientSummary>,
    pub failed_to_connect: usize,
}

impl PoolSummary {
    pub fn processed(&self) -> u64 {
        self.clients.iter().map(|c| c.processed).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.clients.iter().map(|c| c.dropped).sum()
    }

    pub fn count(&self, completion: Completion) -> usize {
        self.clients.iter().filter(|c| c.completion == completion).count()
    }

    pub fn latency(&self) -> LatencyHistogram {
        let mut merged = LatencyHistogram::new();
        for client in &self.clients {
            merged.merge(&client.latency);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator;
    use crate::config::Schedule;
    use crate::shutdown;
    use crate::transport::mock::{MockBroker, MockConnection};
    use std::time::Duration;

    fn config(count: u64, suffix: bool) -> Arc<ClientConfig> {
        Arc::new(ClientConfig {
            message_count: count,
            payload_size: 8,
            interval: Duration::ZERO,
            schedule: Schedule::Flat,
            id_as_subtopic: suffix,
            ..ClientConfig::default()
        })
    }

    async fn connect_pool(
        broker: &MockBroker,
        config: Arc<ClientConfig>,
        size: usize,
        policy: BarrierPolicy,
        shutdown: Shutdown,
    ) -> (Result<Pool<MockConnection>, PoolError>, aggregator::Aggregator) {
        let (tx, aggregator) = aggregator::channel();
        let make = {
            let broker = broker.clone();
            let config = config.clone();
            move |id| broker.connection(config.client_id(id))
        };
        let pool = Pool::connect(config, size, make, tx, policy, shutdown, |_| {}).await;
        (pool, aggregator)
    }

    #[tokio::test]
    async fn every_client_connects_before_setup_completes() {
        let broker = MockBroker::new();
        // Reverse the natural order so the barrier has to wait for the first client
        for id in 1..=4u32 {
            broker.delay_connect(
                &format!("mqtt-load-generator-{}", id),
                Duration::from_millis(10 * (5 - id as u64)),
            );
        }
        let (_trigger, shutdown) = shutdown::channel();
        let (pool, _aggregator) =
            connect_pool(&broker, config(1, false), 4, BarrierPolicy::RequireAll, shutdown).await;
        broker.record("setup complete");

        let pool = pool.unwrap();
        assert_eq!(pool.len(), 4);
        let ids: Vec<u32> = pool.clients().map(|c| c.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        let log = broker.log();
        let setup = log.iter().position(|e| e == "setup complete").unwrap();
        assert_eq!(setup, 4);
        for id in 1..=4 {
            assert!(log[..setup].contains(&format!("connect mqtt-load-generator-{}", id)));
        }
    }

    #[tokio::test]
    async fn progress_reports_each_outcome() {
        let broker = MockBroker::new();
        broker.fail_connect("mqtt-load-generator-2");
        let (tx, _aggregator) = aggregator::channel();
        let (_trigger, shutdown) = shutdown::channel();
        let mut seen = Vec::new();

        let make = {
            let broker = broker.clone();
            move |id| broker.connection(format!("mqtt-load-generator-{}", id))
        };
        let pool = Pool::connect(
            config(1, false),
            3,
            make,
            tx,
            BarrierPolicy::AllowPartial,
            shutdown,
            |p| seen.push(p),
        )
        .await
        .unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.failures().len(), 1);
        assert_eq!(seen.len(), 3);
        let last = seen.last().unwrap();
        assert_eq!((last.connected, last.failed, last.completed()), (2, 1, 3));
    }

    #[tokio::test]
    async fn require_all_aborts_on_any_failure() {
        let broker = MockBroker::new();
        broker.fail_connect("mqtt-load-generator-3");
        let (_trigger, shutdown) = shutdown::channel();
        let (pool, _aggregator) =
            connect_pool(&broker, config(1, false), 3, BarrierPolicy::RequireAll, shutdown).await;

        match pool {
            Err(PoolError::ConnectFailed { failed, total, .. }) => {
                assert_eq!((failed, total), (1, 3));
            }
            other => panic!("unexpected barrier outcome: {:?}", other),
        }
        // Connected clients are released again
        let log = broker.log();
        assert!(log.contains(&"disconnect mqtt-load-generator-1".to_string()));
        assert!(log.contains(&"disconnect mqtt-load-generator-2".to_string()));
    }

    #[tokio::test]
    async fn partial_pool_needs_at_least_one_client() {
        let broker = MockBroker::new();
        broker.fail_connect("mqtt-load-generator-1");
        broker.fail_connect("mqtt-load-generator-2");
        let (_trigger, shutdown) = shutdown::channel();
        let (pool, _aggregator) =
            connect_pool(&broker, config(1, false), 2, BarrierPolicy::AllowPartial, shutdown).await;
        assert!(matches!(pool, Err(PoolError::NoClientsConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_client_is_bounded_by_connect_timeout() {
        let broker = MockBroker::new();
        broker.hang_connect("mqtt-load-generator-2");
        let config = Arc::new(ClientConfig {
            connect_timeout: Duration::from_secs(5),
            ..(*config(1, false)).clone()
        });
        let (_trigger, shutdown) = shutdown::channel();
        let (pool, _aggregator) =
            connect_pool(&broker, config, 3, BarrierPolicy::AllowPartial, shutdown).await;

        let pool = pool.unwrap();
        assert_eq!(pool.len(), 2);
        assert!(matches!(pool.failures()[0], ClientError::ConnectTimeout { .. }));
    }

    #[tokio::test]
    async fn shutdown_unblocks_the_barrier() {
        let broker = MockBroker::new();
        broker.hang_connect("mqtt-load-generator-1");
        let config = Arc::new(ClientConfig {
            connect_timeout: Duration::from_secs(3600),
            ..(*config(1, false)).clone()
        });
        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();

        let (pool, _aggregator) =
            connect_pool(&broker, config, 2, BarrierPolicy::RequireAll, shutdown).await;
        assert!(matches!(pool, Err(PoolError::Cancelled)));
    }

    #[tokio::test]
    async fn aggregator_sees_every_message() {
        let broker = MockBroker::new();
        let (_trigger, shutdown) = shutdown::channel();
        let (pool, aggregator) =
            connect_pool(&broker, config(25, true), 4, BarrierPolicy::RequireAll, shutdown.clone()).await;
        let counting = tokio::spawn(aggregator.run(ProgressCounter::default()));

        let summary = pool.unwrap().start(shutdown).join().await;
        let (total, _) = counting.await.unwrap();

        assert_eq!(total, 100);
        assert_eq!(summary.processed(), 100);
        assert_eq!(summary.count(Completion::Finished), 4);
        assert_eq!(summary.latency().len(), 100);

        // Suffixing fans the pool out over one sub-topic per client
        let mut topics: Vec<String> = broker.published().into_iter().map(|(t, _)| t).collect();
        topics.sort();
        topics.dedup();
        assert_eq!(topics, vec!["/load/1", "/load/2", "/load/3", "/load/4"]);
    }

    #[tokio::test]
    async fn receiving_pool_subscribes_after_barrier() {
        let broker = MockBroker::new();
        let (trigger, shutdown) = shutdown::channel();
        let (pool, aggregator) =
            connect_pool(&broker, config(0, false), 1, BarrierPolicy::RequireAll, shutdown.clone()).await;
        let run = pool.unwrap().start_receiving(shutdown);
        let counting = tokio::spawn(aggregator.run(ProgressCounter::default()));

        while broker.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        broker.inject("/load", 4);
        broker.inject("/load", 4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();

        let summary = run.join().await;
        let (total, _) = counting.await.unwrap();
        assert_eq!(summary.processed(), 2);
        assert_eq!(total, 2);
    }

    #[derive(Default)]
    struct ProgressCounter(u64);

    impl aggregator::UpdateSink for ProgressCounter {
        fn add(&mut self, count: u64) {
            self.0 += count;
        }
    }
}
