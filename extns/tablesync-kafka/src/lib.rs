//! Thin Kafka consumer used by tablesync. It subscribes a single consumer group to one topic,
//! hands out messages on request and commits offsets only when explicitly asked to. Auto commit is
//! always disabled, the caller decides when a message counts as processed.

use rdkafka::config::ClientConfig;
use tracing::warn;

pub mod source;

pub use source::{KafkaMessage, KafkaOffset, KafkaSource, KafkaSourceConfig};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    /// The group moved on to a new generation, the partition may now belong to another member.
    #[error("Commit rejected by a rebalance - {0}")]
    Rebalanced(String),

    /// Commit failed while the coordinator was unavailable, moving or slow to answer.
    #[error("Retriable commit failure - {0}")]
    CommitRetriable(String),

    #[error("{0}")]
    Other(String),
}

/// SASL credentials for the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSaslAuth {
    /// PLAIN, SCRAM-SHA-256, SCRAM-SHA-512 etc.
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// Where a consumer group without a committed offset starts reading. A committed offset for the
/// group always wins over the start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Start from the oldest message still retained by the broker.
    #[default]
    Earliest,
    /// Resume from the group's committed offset, new groups only see new messages.
    Committed,
}

impl StartPosition {
    pub(crate) fn auto_offset_reset(&self) -> &'static str {
        match self {
            StartPosition::Earliest => "earliest",
            StartPosition::Committed => "latest",
        }
    }
}

/// Applies the optional TLS and SASL settings to the librdkafka client config.
pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    tls_config: Option<TlsConfig>,
    auth_config: Option<KafkaSaslAuth>,
) {
    let tls_enabled = tls_config.is_some();
    if let Some(tls_config) = tls_config {
        client_config.set("security.protocol", "SSL");
        if tls_config.insecure_skip_verify {
            warn!(
                "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config.set("enable.ssl.certificate.verification", "false");
            client_config.set("ssl.endpoint.identification.algorithm", "none");
        }
        if let Some(ca_cert) = tls_config.ca_cert {
            client_config.set("ssl.ca.pem", ca_cert);
        }
        if let Some(client_auth) = tls_config.client_auth {
            client_config
                .set("ssl.certificate.pem", client_auth.client_cert)
                .set("ssl.key.pem", client_auth.client_cert_private_key);
        }
    }

    if let Some(auth) = auth_config {
        let protocol = if tls_enabled { "SASL_SSL" } else { "SASL_PLAINTEXT" };
        client_config
            .set("security.protocol", protocol)
            .set("sasl.mechanisms", auth.mechanism)
            .set("sasl.username", auth.username)
            .set("sasl.password", auth.password);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sasl_without_tls_uses_plaintext() {
        let mut cfg = ClientConfig::new();
        update_auth_config(
            &mut cfg,
            None,
            Some(KafkaSaslAuth {
                mechanism: "PLAIN".to_string(),
                username: "sync".to_string(),
                password: "secret".to_string(),
            }),
        );
        assert_eq!(cfg.get("security.protocol"), Some("SASL_PLAINTEXT"));
        assert_eq!(cfg.get("sasl.mechanisms"), Some("PLAIN"));
        assert_eq!(cfg.get("sasl.username"), Some("sync"));
    }

    #[test]
    fn test_sasl_with_tls() {
        let mut cfg = ClientConfig::new();
        update_auth_config(
            &mut cfg,
            Some(TlsConfig {
                insecure_skip_verify: true,
                ca_cert: Some("ca-pem".to_string()),
                client_auth: None,
            }),
            Some(KafkaSaslAuth {
                mechanism: "SCRAM-SHA-512".to_string(),
                username: "sync".to_string(),
                password: "secret".to_string(),
            }),
        );
        assert_eq!(cfg.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(cfg.get("ssl.ca.pem"), Some("ca-pem"));
        assert_eq!(
            cfg.get("ssl.endpoint.identification.algorithm"),
            Some("none")
        );
    }

    #[test]
    fn test_no_auth_leaves_config_untouched() {
        let mut cfg = ClientConfig::new();
        update_auth_config(&mut cfg, None, None);
        assert_eq!(cfg.get("security.protocol"), None);
    }

    #[test]
    fn test_start_position_reset_policy() {
        assert_eq!(StartPosition::Earliest.auto_offset_reset(), "earliest");
        assert_eq!(StartPosition::Committed.auto_offset_reset(), "latest");
        assert_eq!(StartPosition::default(), StartPosition::Earliest);
    }
}
