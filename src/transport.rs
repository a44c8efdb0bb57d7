//! Broker connection capability and its rumqttc implementation

use crate::config::{ClientConfig, TlsSettings};
use crate::error::{ClientError, ConfigError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Reconnect backoff for connections that survive a loss
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the rumqttc request queue
const REQUEST_CAPACITY: usize = 1000;

/// Asynchronous notification from a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A message arrived on a subscribed topic
    Message { topic: String, payload_len: usize },
    /// The session dropped; the reason is the transport's error text
    ConnectionLost(String),
}

/// What a client needs from the broker connection it exclusively owns.
///
/// Every operation is asynchronous. `publish` and `subscribe` resolve only
/// once the broker acknowledged them; unsolicited events come out of
/// `next_notification`.
#[async_trait]
pub trait Connection: Send + 'static {
    fn client_id(&self) -> &str;

    async fn connect(&mut self) -> Result<(), ClientError>;

    async fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), ClientError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError>;

    /// Next message or loss notification, `None` once the connection is gone for good
    async fn next_notification(&mut self) -> Option<Notification>;

    async fn disconnect(&mut self, grace: Duration) -> Result<(), ClientError>;
}

/// Builds one [`MqttConnection`] per client identity from a shared config.
///
/// TLS material is read once here, so a missing file is reported before
/// any client exists.
#[derive(Clone)]
pub struct MqttConnector {
    config: Arc<ClientConfig>,
    transport: Transport,
    reconnect: bool,
}

impl MqttConnector {
    pub fn new(config: Arc<ClientConfig>, reconnect: bool) -> Result<Self, ConfigError> {
        let transport = match &config.tls {
            TlsSettings::Disabled => {
                if config.insecure {
                    warn!("--insecure has no effect without TLS");
                }
                Transport::Tcp
            }
            tls if config.insecure => {
                warn!("Server certificate verification is disabled");
                Transport::tls_with_config(insecure_tls(tls)?)
            }
            TlsSettings::Platform => Transport::tls_with_default_config(),
            TlsSettings::ClientAuth { ca, cert, key } => {
                let ca = read_tls_file(ca)?;
                let cert = read_tls_file(cert)?;
                let key = read_tls_file(key)?;
                Transport::tls(ca, Some((cert, key)), None)
            }
        };

        if config.tls.is_enabled() {
            debug!(
                client_auth = config.tls.is_configured(),
                verify = !config.insecure,
                "TLS enabled"
            );
        }

        Ok(Self {
            config,
            transport,
            reconnect,
        })
    }

    pub fn connection(&self, id: u32) -> MqttConnection {
        let client_id = self.config.client_id(id);
        let mut options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let max_packet = (self.config.payload_size + self.config.topic.len() + 1024).max(256 * 1024);
        options.set_max_packet_size(max_packet, max_packet);

        if let Some(username) = &self.config.username {
            options.set_credentials(username, self.config.password.clone().unwrap_or_default());
        }
        options.set_transport(self.transport.clone());

        MqttConnection {
            client_id,
            options: Some(options),
            reconnect: self.reconnect,
            client: None,
            events: None,
            driver: None,
            pending: VecDeque::new(),
            unsent: 0,
            stopping: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

fn read_tls_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::TlsFile {
        path: path.to_path_buf(),
        source,
    })
}

/// TLS that accepts any server certificate, for brokers with self-signed
/// certificates. A client certificate is still presented when one is given.
fn insecure_tls(tls: &TlsSettings) -> Result<TlsConfiguration, ConfigError> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerifier));

    let client_config = match tls {
        TlsSettings::ClientAuth { cert, key, .. } => {
            let certs = rustls_pemfile::certs(&mut read_tls_file(cert)?.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| ConfigError::TlsFile {
                    path: cert.clone(),
                    source,
                })?;
            let private_key = rustls_pemfile::private_key(&mut read_tls_file(key)?.as_slice())
                .map_err(|source| ConfigError::TlsFile {
                    path: key.clone(),
                    source,
                })?
                .ok_or_else(|| {
                    ConfigError::InvalidTls(format!("no private key in {}", key.display()))
                })?;
            builder
                .with_client_auth_cert(certs, private_key)
                .map_err(|e| ConfigError::InvalidTls(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConfiguration::Rustls(Arc::new(client_config)))
}

// Accepts any server certificate; only reachable through --insecure
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Events forwarded from the driver task to the owning connection
#[derive(Debug)]
enum DriverEvent {
    /// A PUBLISH was written to the socket with this packet id (0 for QoS 0)
    Sent(u16),
    /// PUBACK for a packet id
    Acked(u16),
    /// PUBCOMP for a packet id
    Completed(u16),
    Subscribed,
    Notify(Notification),
}

/// rumqttc-backed connection.
///
/// After the CONNACK the event loop is polled by a spawned driver task that
/// forwards acknowledgments and notifications over an unbounded channel, so
/// it never blocks on a slow consumer.
///
/// A publish is matched to its acknowledgment by packet id: the socket write
/// for QoS 0, PUBACK for QoS 1 and PUBCOMP for QoS 2. Acknowledgments for
/// earlier publishes that already timed out are discarded.
pub struct MqttConnection {
    client_id: String,
    options: Option<MqttOptions>,
    reconnect: bool,
    client: Option<AsyncClient>,
    events: Option<mpsc::UnboundedReceiver<DriverEvent>>,
    driver: Option<JoinHandle<()>>,
    pending: VecDeque<Notification>,
    /// Publish requests queued whose outgoing PUBLISH has not been seen yet
    unsent: usize,
    stopping: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
}

impl MqttConnection {
    /// Poll until the broker answers the CONNECT
    async fn try_connect(eventloop: &mut EventLoop) -> Result<(), String> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == rumqttc::ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(format!("rejected by broker: {:?}", ack.code))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    fn lost(&self, reason: impl Into<String>) -> ClientError {
        ClientError::ConnectionLost {
            client_id: self.client_id.clone(),
            reason: reason.into(),
        }
    }

    async fn next_event(&mut self) -> Option<DriverEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Account for an event that is not the one currently awaited
    fn set_aside(&mut self, event: Option<DriverEvent>) -> Result<(), ClientError> {
        match event {
            Some(DriverEvent::Notify(Notification::ConnectionLost(reason))) => Err(self.lost(reason)),
            Some(DriverEvent::Notify(other)) => {
                self.pending.push_back(other);
                Ok(())
            }
            Some(DriverEvent::Sent(_)) => {
                self.unsent = self.unsent.saturating_sub(1);
                Ok(())
            }
            Some(DriverEvent::Acked(pkid)) | Some(DriverEvent::Completed(pkid)) => {
                trace!(client_id = %self.client_id, pkid, "Discarding stale acknowledgment");
                Ok(())
            }
            Some(DriverEvent::Subscribed) => Ok(()),
            None => Err(self.lost("event loop stopped")),
        }
    }
}

struct Driver {
    client_id: String,
    client: AsyncClient,
    reconnect: bool,
    stopping: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl Driver {
    async fn run(self, mut eventloop: EventLoop) {
        let mut retry_delay = INITIAL_RETRY_DELAY;
        let mut lost = false;

        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if lost {
                        lost = false;
                        retry_delay = INITIAL_RETRY_DELAY;
                        self.resubscribe();
                    }
                    None
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => Some(DriverEvent::Sent(pkid)),
                Ok(Event::Incoming(Packet::PubAck(ack))) => Some(DriverEvent::Acked(ack.pkid)),
                Ok(Event::Incoming(Packet::PubComp(comp))) => Some(DriverEvent::Completed(comp.pkid)),
                Ok(Event::Incoming(Packet::SubAck(_))) => Some(DriverEvent::Subscribed),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    trace!(client_id = %self.client_id, topic = %publish.topic, "Received message");
                    Some(DriverEvent::Notify(Notification::Message {
                        topic: publish.topic.clone(),
                        payload_len: publish.payload.len(),
                    }))
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => None,
                Err(e) => {
                    if self.stopping.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!(client_id = %self.client_id, error = %e, "Connection lost");
                    let _ = self
                        .tx
                        .send(DriverEvent::Notify(Notification::ConnectionLost(e.to_string())));
                    if !self.reconnect {
                        break;
                    }
                    lost = true;
                    debug!(client_id = %self.client_id, retry_in = ?retry_delay, "Reconnecting");
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                    None
                }
            };

            if let Some(event) = event {
                if self.tx.send(event).is_err() {
                    break;
                }
            }
        }
    }

    /// Clean sessions drop subscriptions, so replay them after a reconnect
    fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().clone();
        for (topic, qos) in subscriptions {
            if let Err(e) = self.client.try_subscribe(&topic, qos) {
                warn!(client_id = %self.client_id, topic = %topic, error = %e, "Failed to resubscribe");
            } else {
                debug!(client_id = %self.client_id, topic = %topic, "Resubscribed");
            }
        }
    }
}

#[async_trait]
impl Connection for MqttConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        let options = self.options.take().ok_or_else(|| ClientError::Connect {
            client_id: self.client_id.clone(),
            reason: "connection already used".to_string(),
        })?;

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        if let Err(reason) = Self::try_connect(&mut eventloop).await {
            if reason.contains("Too many open files") {
                warn!(client_id = %self.client_id, "Connection failed: Too many open files. Try: ulimit -n 65535");
            }
            return Err(ClientError::Connect {
                client_id: self.client_id.clone(),
                reason,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            client_id: self.client_id.clone(),
            client: client.clone(),
            reconnect: self.reconnect,
            stopping: self.stopping.clone(),
            subscriptions: self.subscriptions.clone(),
            tx,
        };
        self.driver = Some(tokio::spawn(driver.run(eventloop)));
        self.events = Some(rx);
        self.client = Some(client);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ClientError::NotConnected(self.client_id.clone()))?;

        client
            .publish_bytes(topic, qos, retain, payload)
            .await
            .map_err(|e| ClientError::Publish {
                client_id: self.client_id.clone(),
                reason: e.to_string(),
            })?;
        self.unsent += 1;

        // Requests leave the event loop in order, so once every earlier
        // request was written the next outgoing PUBLISH is this one
        let pkid = loop {
            match self.next_event().await {
                Some(DriverEvent::Sent(pkid)) => {
                    self.unsent = self.unsent.saturating_sub(1);
                    if self.unsent == 0 {
                        break pkid;
                    }
                }
                other => self.set_aside(other)?,
            }
        };

        if qos == QoS::AtMostOnce {
            return Ok(());
        }
        loop {
            match self.next_event().await {
                Some(DriverEvent::Acked(acked)) if qos == QoS::AtLeastOnce && acked == pkid => {
                    return Ok(())
                }
                Some(DriverEvent::Completed(done)) if qos == QoS::ExactlyOnce && done == pkid => {
                    return Ok(())
                }
                other => self.set_aside(other)?,
            }
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ClientError::NotConnected(self.client_id.clone()))?;

        client
            .subscribe(topic, qos)
            .await
            .map_err(|e| ClientError::Subscribe {
                client_id: self.client_id.clone(),
                reason: e.to_string(),
            })?;
        self.subscriptions.lock().push((topic.to_string(), qos));

        loop {
            match self.next_event().await {
                Some(DriverEvent::Subscribed) => return Ok(()),
                other => self.set_aside(other)?,
            }
        }
    }

    async fn next_notification(&mut self) -> Option<Notification> {
        if let Some(notification) = self.pending.pop_front() {
            return Some(notification);
        }
        loop {
            match self.next_event().await? {
                DriverEvent::Notify(notification) => return Some(notification),
                DriverEvent::Sent(_) => self.unsent = self.unsent.saturating_sub(1),
                DriverEvent::Acked(_) | DriverEvent::Completed(_) | DriverEvent::Subscribed => {
                    continue
                }
            }
        }
    }

    async fn disconnect(&mut self, grace: Duration) -> Result<(), ClientError> {
        self.stopping.store(true, Ordering::Relaxed);

        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(client_id = %self.client_id, error = %e, "Disconnect request failed");
            }
        }

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(grace, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        self.events = None;
        Ok(())
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// In-memory broker for exercising clients and pools without a network
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct BrokerState {
        log: Vec<String>,
        published: Vec<(String, usize)>,
        attempts: Vec<Bytes>,
        fail_connect: HashSet<String>,
        hang_connect: HashSet<String>,
        connect_delay: HashMap<String, Duration>,
        lose_after: HashMap<String, u64>,
        reject_acks: HashMap<String, u32>,
        subscribers: Vec<(String, mpsc::UnboundedSender<Notification>)>,
        constructed: usize,
    }

    /// Shared handle on the fake broker; every [`MockConnection`] reports into it
    #[derive(Clone, Default)]
    pub struct MockBroker {
        state: Arc<Mutex<BrokerState>>,
    }

    impl MockBroker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn connection(&self, client_id: impl Into<String>) -> MockConnection {
            self.state.lock().constructed += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            MockConnection {
                client_id: client_id.into(),
                broker: self.clone(),
                connected: false,
                published: 0,
                inbox_tx: tx,
                inbox_rx: rx,
            }
        }

        pub fn fail_connect(&self, client_id: &str) {
            self.state.lock().fail_connect.insert(client_id.to_string());
        }

        pub fn hang_connect(&self, client_id: &str) {
            self.state.lock().hang_connect.insert(client_id.to_string());
        }

        pub fn delay_connect(&self, client_id: &str, delay: Duration) {
            self.state.lock().connect_delay.insert(client_id.to_string(), delay);
        }

        /// Drop the session once the client has published `count` messages
        pub fn lose_connection_after(&self, client_id: &str, count: u64) {
            self.state.lock().lose_after.insert(client_id.to_string(), count);
        }

        /// Fail the next `count` publishes of a client without dropping the session
        pub fn reject_acks(&self, client_id: &str, count: u32) {
            self.state.lock().reject_acks.insert(client_id.to_string(), count);
        }

        /// Deliver a message to every subscriber of `topic`
        pub fn inject(&self, topic: &str, payload_len: usize) {
            let state = self.state.lock();
            for (filter, tx) in &state.subscribers {
                if filter == topic {
                    let _ = tx.send(Notification::Message {
                        topic: topic.to_string(),
                        payload_len,
                    });
                }
            }
        }

        /// Drop every subscriber's session
        pub fn drop_subscribers(&self, reason: &str) {
            let state = self.state.lock();
            for (_, tx) in &state.subscribers {
                let _ = tx.send(Notification::ConnectionLost(reason.to_string()));
            }
        }

        pub fn record(&self, entry: impl Into<String>) {
            self.state.lock().log.push(entry.into());
        }

        pub fn log(&self) -> Vec<String> {
            self.state.lock().log.clone()
        }

        pub fn published(&self) -> Vec<(String, usize)> {
            self.state.lock().published.clone()
        }

        /// Payload of every publish attempt, including rejected ones
        pub fn attempts(&self) -> Vec<Bytes> {
            self.state.lock().attempts.clone()
        }

        pub fn subscriber_count(&self) -> usize {
            self.state.lock().subscribers.len()
        }

        pub fn constructed(&self) -> usize {
            self.state.lock().constructed
        }
    }

    pub struct MockConnection {
        client_id: String,
        broker: MockBroker,
        connected: bool,
        published: u64,
        inbox_tx: mpsc::UnboundedSender<Notification>,
        inbox_rx: mpsc::UnboundedReceiver<Notification>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn client_id(&self) -> &str {
            &self.client_id
        }

        async fn connect(&mut self) -> Result<(), ClientError> {
            let (delay, hang, fail) = {
                let state = self.broker.state.lock();
                (
                    state.connect_delay.get(&self.client_id).copied(),
                    state.hang_connect.contains(&self.client_id),
                    state.fail_connect.contains(&self.client_id),
                )
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if hang {
                std::future::pending::<()>().await;
            }
            if fail {
                self.broker.record(format!("refused {}", self.client_id));
                return Err(ClientError::Connect {
                    client_id: self.client_id.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            self.connected = true;
            self.broker.record(format!("connect {}", self.client_id));
            Ok(())
        }

        async fn publish(
            &mut self,
            topic: &str,
            _qos: QoS,
            _retain: bool,
            payload: Bytes,
        ) -> Result<(), ClientError> {
            if !self.connected {
                return Err(ClientError::NotConnected(self.client_id.clone()));
            }

            let mut state = self.broker.state.lock();
            state.attempts.push(payload.clone());
            if let Some(&limit) = state.lose_after.get(&self.client_id) {
                if self.published >= limit {
                    self.connected = false;
                    state.log.push(format!("lost {}", self.client_id));
                    return Err(ClientError::ConnectionLost {
                        client_id: self.client_id.clone(),
                        reason: "broker closed the connection".to_string(),
                    });
                }
            }
            if let Some(remaining) = state.reject_acks.get_mut(&self.client_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ClientError::Publish {
                        client_id: self.client_id.clone(),
                        reason: "not acknowledged".to_string(),
                    });
                }
            }

            self.published += 1;
            state.published.push((topic.to_string(), payload.len()));
            for (filter, tx) in &state.subscribers {
                if filter == topic {
                    let _ = tx.send(Notification::Message {
                        topic: topic.to_string(),
                        payload_len: payload.len(),
                    });
                }
            }
            Ok(())
        }

        async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), ClientError> {
            if !self.connected {
                return Err(ClientError::NotConnected(self.client_id.clone()));
            }
            let mut state = self.broker.state.lock();
            state.subscribers.push((topic.to_string(), self.inbox_tx.clone()));
            state.log.push(format!("subscribe {} {}", self.client_id, topic));
            Ok(())
        }

        async fn next_notification(&mut self) -> Option<Notification> {
            self.inbox_rx.recv().await
        }

        async fn disconnect(&mut self, _grace: Duration) -> Result<(), ClientError> {
            self.connected = false;
            self.broker.record(format!("disconnect {}", self.client_id));
            Ok(())
        }
    }
}
