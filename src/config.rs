use crate::error::ConfigError;
use clap::ValueEnum;
use rumqttc::QoS;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CLIENT_PREFIX: &str = "mqtt-load-generator";

/// Convert a raw QoS level to rumqttc QoS, rejecting anything outside 0..=2
pub fn qos_from_u8(qos: u8) -> Result<QoS, ConfigError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::InvalidQos(other)),
    }
}

pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Distribution of the wait between two messages of one client
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    /// Always wait exactly the interval
    Flat,
    /// Gaussian wait, mean = interval, stdev = interval / 2
    Normal,
    /// Uniform wait in [0, 2 * interval]
    Random,
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Flat => write!(f, "flat"),
            Schedule::Normal => write!(f, "normal"),
            Schedule::Random => write!(f, "random"),
        }
    }
}

/// TLS material. The core only looks at whether TLS is on; the paths are
/// read by the transport when it builds its options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsSettings {
    #[default]
    Disabled,
    /// TLS with the platform trust roots, no client certificate
    Platform,
    /// Client-authenticated TLS, all three files given
    ClientAuth {
        ca: PathBuf,
        cert: PathBuf,
        key: PathBuf,
    },
}

impl TlsSettings {
    pub fn from_flags(
        mqtts: bool,
        ca: Option<PathBuf>,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        match (ca, cert, key) {
            (Some(ca), Some(cert), Some(key)) => Ok(TlsSettings::ClientAuth { ca, cert, key }),
            (None, None, None) if mqtts => Ok(TlsSettings::Platform),
            (None, None, None) => Ok(TlsSettings::Disabled),
            _ => Err(ConfigError::IncompleteTls),
        }
    }

    /// True when CA, certificate and key were all provided
    pub fn is_configured(&self) -> bool {
        matches!(self, TlsSettings::ClientAuth { .. })
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsSettings::Disabled)
    }
}

/// Configuration shared by every client of a pool.
///
/// Immutable once built; clients hold it behind an `Arc`. The QoS field is
/// already validated, so a `ClientConfig` can never carry an invalid level.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub qos: QoS,
    pub message_count: u64,
    pub payload_size: usize,
    pub interval: Duration,
    pub schedule: Schedule,
    pub id_as_subtopic: bool,
    pub tls: TlsSettings,
    pub insecure: bool,
    pub client_prefix: String,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub publish_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            topic: "/load".to_string(),
            username: None,
            password: None,
            host: "localhost".to_string(),
            port: 1883,
            qos: QoS::AtLeastOnce,
            message_count: 1000,
            payload_size: 100,
            interval: Duration::from_millis(1),
            schedule: Schedule::Normal,
            id_as_subtopic: false,
            tls: TlsSettings::Disabled,
            insecure: false,
            client_prefix: DEFAULT_CLIENT_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            publish_retries: 2,
        }
    }
}

impl ClientConfig {
    /// Transport client ID for a given client identity
    pub fn client_id(&self, id: u32) -> String {
        format!("{}-{}", self.client_prefix, id)
    }

    pub fn broker_addr(&self) -> String {
        let scheme = if self.tls.is_enabled() { "ssl" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from_u8(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_from_u8(3), Err(ConfigError::InvalidQos(3))));
        assert!(matches!(qos_from_u8(255), Err(ConfigError::InvalidQos(255))));
    }

    #[test]
    fn qos_round_trips_to_level() {
        for level in 0..=2u8 {
            assert_eq!(qos_to_u8(qos_from_u8(level).unwrap()), level);
        }
    }

    #[test]
    fn tls_needs_all_three_files() {
        let ca = Some(PathBuf::from("ca.pem"));
        let cert = Some(PathBuf::from("cert.pem"));
        let key = Some(PathBuf::from("key.pem"));

        let full = TlsSettings::from_flags(false, ca.clone(), cert.clone(), key).unwrap();
        assert!(full.is_configured());
        assert!(full.is_enabled());

        assert!(matches!(
            TlsSettings::from_flags(true, ca, cert, None),
            Err(ConfigError::IncompleteTls)
        ));
    }

    #[test]
    fn mqtts_without_files_uses_platform_roots() {
        let tls = TlsSettings::from_flags(true, None, None, None).unwrap();
        assert_eq!(tls, TlsSettings::Platform);
        assert!(tls.is_enabled());
        assert!(!tls.is_configured());

        let plain = TlsSettings::from_flags(false, None, None, None).unwrap();
        assert!(!plain.is_enabled());
    }

    #[test]
    fn client_id_uses_prefix() {
        let config = ClientConfig::default();
        assert_eq!(config.client_id(7), "mqtt-load-generator-7");
        assert_eq!(config.broker_addr(), "tcp://localhost:1883");
    }

    #[test]
    fn schedule_display_matches_cli_names() {
        assert_eq!(Schedule::Flat.to_string(), "flat");
        assert_eq!(Schedule::Normal.to_string(), "normal");
        assert_eq!(Schedule::Random.to_string(), "random");
    }
}
