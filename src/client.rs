use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::metrics::LatencyHistogram;
use crate::schedule::DelaySchedule;
use crate::shutdown::Shutdown;
use crate::transport::{Connection, Notification};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Grace period handed to the transport when a client disconnects
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle of a client. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Connecting,
    Connected,
    /// Generator role, `sent` messages already handled
    Publishing { sent: u64 },
    /// Checker role
    Subscribed,
    Disconnected,
}

/// How a client's work ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Finished,
    ConnectionLost,
    Cancelled,
}

/// Per-client outcome handed back to the pool on join
#[derive(Debug)]
pub struct ClientSummary {
    pub id: u32,
    pub client_id: String,
    /// Messages acknowledged (generator) or received (checker)
    pub processed: u64,
    /// Messages given up on after exhausting retries
    pub dropped: u64,
    pub completion: Completion,
    pub latency: LatencyHistogram,
}

/// Topic a client publishes to: `{topic}/{id}` when identities are used as
/// sub-topics, the configured topic otherwise.
pub fn resolve_topic(config: &ClientConfig, id: u32) -> String {
    if config.id_as_subtopic {
        format!("{}/{}", config.topic, id)
    } else {
        config.topic.clone()
    }
}

/// One simulated endpoint.
///
/// Owns its connection exclusively and only ever produces on the shared
/// update channel.
pub struct Client<C: Connection> {
    id: u32,
    config: Arc<ClientConfig>,
    connection: C,
    updates: mpsc::Sender<u64>,
    state: ClientState,
}

impl<C: Connection> Client<C> {
    pub fn new(id: u32, config: Arc<ClientConfig>, connection: C, updates: mpsc::Sender<u64>) -> Self {
        Self {
            id,
            config,
            connection,
            updates,
            state: ClientState::Created,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        self.connection.client_id()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Establish the session, bounded by the configured connect timeout
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.state = ClientState::Connecting;
        let connect_timeout = self.config.connect_timeout;

        match timeout(connect_timeout, self.connection.connect()).await {
            Ok(Ok(())) => {
                self.state = ClientState::Connected;
                debug!(client_id = %self.client_id(), "Client connected");
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = ClientState::Disconnected;
                Err(e)
            }
            Err(_) => {
                self.state = ClientState::Disconnected;
                Err(ClientError::ConnectTimeout {
                    client_id: self.client_id().to_string(),
                    timeout: connect_timeout,
                })
            }
        }
    }

    /// Generator role: publish the configured number of messages, pacing
    /// them with the configured schedule, then disconnect.
    ///
    /// Each iteration publishes, waits for the acknowledgment, waits the
    /// sampled delay and only then reports one event. A message that is
    /// still unacknowledged after the retries is counted as dropped and
    /// reports nothing. A lost session ends the loop early.
    pub async fn publish(mut self, mut shutdown: Shutdown) -> ClientSummary {
        let topic = resolve_topic(&self.config, self.id);
        let mut rng = StdRng::from_entropy();

        // One random payload, reused for every message
        let mut buffer = vec![0u8; self.config.payload_size];
        rng.fill(&mut buffer[..]);
        let payload = Bytes::from(buffer);

        let delays = DelaySchedule::new(self.config.interval, self.config.schedule);
        let mut latency = LatencyHistogram::new();
        let mut processed = 0u64;
        let mut dropped = 0u64;
        let mut completion = Completion::Finished;

        debug!(
            client_id = %self.client_id(),
            topic = %topic,
            count = self.config.message_count,
            schedule = %delays.schedule(),
            mean = ?delays.mean(),
            "Starting publish loop"
        );

        for sent in 0..self.config.message_count {
            if shutdown.is_triggered() {
                completion = Completion::Cancelled;
                break;
            }
            self.state = ClientState::Publishing { sent };

            let acked = match self.publish_one(&topic, &payload, &mut latency).await {
                Ok(()) => {
                    processed += 1;
                    true
                }
                Err(e) if e.is_fatal() => {
                    warn!(client_id = %self.client_id(), error = %e, sent, "Stopping publish loop");
                    completion = Completion::ConnectionLost;
                    break;
                }
                Err(e) => {
                    dropped += 1;
                    debug!(client_id = %self.client_id(), error = %e, "Dropping message");
                    false
                }
            };

            let mut cancelled = false;
            if !delays.is_zero() {
                let wait = delays.sample(&mut rng);
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = shutdown.wait() => cancelled = true,
                }
            }

            if acked && self.updates.send(1).await.is_err() {
                debug!(client_id = %self.client_id(), "Update channel closed");
            }
            if cancelled {
                completion = Completion::Cancelled;
                break;
            }
        }

        self.close().await;
        ClientSummary {
            id: self.id,
            client_id: self.client_id().to_string(),
            processed,
            dropped,
            completion,
            latency,
        }
    }

    async fn publish_one(
        &mut self,
        topic: &str,
        payload: &Bytes,
        latency: &mut LatencyHistogram,
    ) -> Result<(), ClientError> {
        let ack_timeout = self.config.ack_timeout;
        let mut attempt = 0u32;

        loop {
            let started = Instant::now();
            let result = match timeout(
                ack_timeout,
                self.connection
                    .publish(topic, self.config.qos, false, payload.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ClientError::AckTimeout {
                    client_id: self.client_id().to_string(),
                    timeout: ack_timeout,
                }),
            };

            match result {
                Ok(()) => {
                    latency.record(started.elapsed());
                    trace!(client_id = %self.client_id(), topic = %topic, "Published message");
                    return Ok(());
                }
                Err(e) if e.is_fatal() || attempt >= self.config.publish_retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    debug!(client_id = %self.client_id(), attempt, error = %e, "Publish not acknowledged, retrying");
                }
            }
        }
    }

    /// Checker role, step one: subscribe to the configured topic
    pub async fn subscribe(&mut self) -> Result<(), ClientError> {
        let topic = self.config.topic.clone();
        self.connection.subscribe(&topic, self.config.qos).await?;
        self.state = ClientState::Subscribed;
        info!(client_id = %self.client_id(), topic = %topic, "Subscribed to topic '{}'", topic);
        Ok(())
    }

    /// Checker role, step two: turn every delivered message into one event
    /// until shutdown or until the connection is gone for good.
    pub async fn receive(mut self, mut shutdown: Shutdown) -> ClientSummary {
        let mut processed = 0u64;

        let completion = loop {
            tokio::select! {
                _ = shutdown.wait() => break Completion::Cancelled,
                notification = self.connection.next_notification() => match notification {
                    Some(Notification::Message { topic, payload_len }) => {
                        trace!(topic = %topic, bytes = payload_len, "Message delivered");
                        processed += 1;
                        if self.updates.send(1).await.is_err() {
                            break Completion::Finished;
                        }
                    }
                    Some(Notification::ConnectionLost(reason)) => {
                        debug!(client_id = %self.client_id(), error = %reason, "Waiting for reconnect");
                    }
                    None => break Completion::ConnectionLost,
                },
            }
        };

        self.close().await;
        ClientSummary {
            id: self.id,
            client_id: self.client_id().to_string(),
            processed,
            dropped: 0,
            completion,
            latency: LatencyHistogram::new(),
        }
    }

    /// Disconnect and enter the terminal state
    pub async fn close(&mut self) {
        if let Err(e) = self.connection.disconnect(DISCONNECT_GRACE).await {
            debug!(client_id = %self.client_id(), error = %e, "Disconnect failed");
        }
        self.state = ClientState::Disconnected;
    }
}
