use std::collections::HashMap;
use std::time::Duration;

use tablesync_kafka::{
    KafkaSaslAuth, KafkaSourceConfig, StartPosition, TlsClientAuthCerts, TlsConfig,
};

use crate::config::Env;
use crate::{Error, Result};

const DEFAULT_BROKERS: &str = "kafka:9092";
const DEFAULT_TOPIC: &str = "carga_topic";
const DEFAULT_CONSUMER_GROUP: &str = "sync-group";
const DEFAULT_CLIENT_ID: &str = "sync-service";
const DEFAULT_READ_BATCH_SIZE: usize = 1;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SourceConfig {
    pub(crate) kafka: KafkaSourceConfig,
    /// Messages requested per read.
    pub(crate) read_batch_size: usize,
    /// How long a read waits for `read_batch_size` messages before returning what it has.
    pub(crate) read_timeout: Duration,
}

impl SourceConfig {
    pub(crate) fn from_env(env: &Env<'_>) -> Result<Self> {
        let brokers: Vec<String> = env
            .string("TABLESYNC_KAFKA_BROKERS", DEFAULT_BROKERS)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(Error::Config(
                "TABLESYNC_KAFKA_BROKERS lists no brokers".to_string(),
            ));
        }

        let start_position = match env
            .get("TABLESYNC_KAFKA_START_POSITION")
            .map(str::to_lowercase)
            .as_deref()
        {
            None | Some("earliest") => StartPosition::Earliest,
            Some("committed") => StartPosition::Committed,
            Some(other) => {
                return Err(Error::Config(format!(
                    "Invalid TABLESYNC_KAFKA_START_POSITION {other:?}, expected earliest or committed"
                )));
            }
        };

        let read_batch_size = env.parse("TABLESYNC_KAFKA_READ_BATCH_SIZE", DEFAULT_READ_BATCH_SIZE)?;
        if read_batch_size == 0 {
            return Err(Error::Config(
                "TABLESYNC_KAFKA_READ_BATCH_SIZE must be at least 1".to_string(),
            ));
        }

        let kafka = KafkaSourceConfig {
            brokers,
            topic: env.string("TABLESYNC_KAFKA_TOPIC", DEFAULT_TOPIC),
            consumer_group: env.string("TABLESYNC_KAFKA_CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP),
            client_id: env.string("TABLESYNC_KAFKA_CLIENT_ID", DEFAULT_CLIENT_ID),
            start_position,
            auth: sasl_auth(env)?,
            tls: tls_config(env)?,
            kafka_raw_config: parse_raw_config(env.get("TABLESYNC_KAFKA_CONFIG").unwrap_or("")),
        };

        Ok(Self {
            kafka,
            read_batch_size,
            read_timeout: env.millis("TABLESYNC_KAFKA_READ_TIMEOUT_MS", DEFAULT_READ_TIMEOUT_MS)?,
        })
    }
}

fn sasl_auth(env: &Env<'_>) -> Result<Option<KafkaSaslAuth>> {
    let Some(mechanism) = env.get("TABLESYNC_KAFKA_SASL_MECHANISM") else {
        return Ok(None);
    };
    let required = |key: &str| {
        env.get(key).map(str::to_string).ok_or_else(|| {
            Error::Config(format!(
                "{key} is required when TABLESYNC_KAFKA_SASL_MECHANISM is set"
            ))
        })
    };
    Ok(Some(KafkaSaslAuth {
        mechanism: mechanism.to_uppercase(),
        username: required("TABLESYNC_KAFKA_SASL_USERNAME")?,
        password: required("TABLESYNC_KAFKA_SASL_PASSWORD")?,
    }))
}

fn tls_config(env: &Env<'_>) -> Result<Option<TlsConfig>> {
    let insecure_skip_verify = env.flag("TABLESYNC_KAFKA_TLS_INSECURE_SKIP_VERIFY")?;
    let ca_cert = env.get("TABLESYNC_KAFKA_TLS_CA_CERT").map(str::to_string);
    let client_auth = match (
        env.get("TABLESYNC_KAFKA_TLS_CLIENT_CERT"),
        env.get("TABLESYNC_KAFKA_TLS_CLIENT_KEY"),
    ) {
        (Some(cert), Some(key)) => Some(TlsClientAuthCerts {
            client_cert: cert.to_string(),
            client_cert_private_key: key.to_string(),
        }),
        (None, None) => None,
        _ => {
            return Err(Error::Config(
                "TABLESYNC_KAFKA_TLS_CLIENT_CERT and TABLESYNC_KAFKA_TLS_CLIENT_KEY must be set together"
                    .to_string(),
            ));
        }
    };

    if !insecure_skip_verify && ca_cert.is_none() && client_auth.is_none() {
        return Ok(None);
    }
    Ok(Some(TlsConfig {
        insecure_skip_verify,
        ca_cert,
        client_auth,
    }))
}

/// One `key: value` pair per line. Lines without a separator are ignored, values may contain
/// further colons.
fn parse_raw_config(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::vars;

    fn source_config(pairs: &[(&str, &str)]) -> Result<SourceConfig> {
        let map = vars(pairs);
        SourceConfig::from_env(&Env(&map))
    }

    #[test]
    fn test_brokers_and_start_position() {
        let config = source_config(&[
            ("TABLESYNC_KAFKA_BROKERS", "k1:9092, k2:9092,"),
            ("TABLESYNC_KAFKA_START_POSITION", "Committed"),
            ("TABLESYNC_KAFKA_READ_BATCH_SIZE", "50"),
            ("TABLESYNC_KAFKA_READ_TIMEOUT_MS", "20"),
        ])
        .unwrap();
        assert_eq!(
            config.kafka.brokers,
            vec!["k1:9092".to_string(), "k2:9092".to_string()]
        );
        assert_eq!(config.kafka.start_position, StartPosition::Committed);
        assert_eq!(config.read_batch_size, 50);
        assert_eq!(config.read_timeout, Duration::from_millis(20));
    }

    #[test]
    fn test_invalid_source_settings() {
        assert!(source_config(&[("TABLESYNC_KAFKA_BROKERS", " , ")]).is_err());
        assert!(source_config(&[("TABLESYNC_KAFKA_START_POSITION", "latest")]).is_err());
        assert!(source_config(&[("TABLESYNC_KAFKA_READ_BATCH_SIZE", "0")]).is_err());
    }

    #[test]
    fn test_sasl_requires_credentials() {
        let err = source_config(&[
            ("TABLESYNC_KAFKA_SASL_MECHANISM", "plain"),
            ("TABLESYNC_KAFKA_SASL_USERNAME", "sync"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("TABLESYNC_KAFKA_SASL_PASSWORD"));

        let config = source_config(&[
            ("TABLESYNC_KAFKA_SASL_MECHANISM", "plain"),
            ("TABLESYNC_KAFKA_SASL_USERNAME", "sync"),
            ("TABLESYNC_KAFKA_SASL_PASSWORD", "secret"),
        ])
        .unwrap();
        assert_eq!(
            config.kafka.auth,
            Some(KafkaSaslAuth {
                mechanism: "PLAIN".to_string(),
                username: "sync".to_string(),
                password: "secret".to_string(),
            })
        );
    }

    #[test]
    fn test_tls_settings() {
        let config = source_config(&[("TABLESYNC_KAFKA_TLS_CA_CERT", "ca-pem")]).unwrap();
        assert_eq!(
            config.kafka.tls,
            Some(TlsConfig {
                insecure_skip_verify: false,
                ca_cert: Some("ca-pem".to_string()),
                client_auth: None,
            })
        );

        let err = source_config(&[("TABLESYNC_KAFKA_TLS_CLIENT_CERT", "cert")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_raw_config() {
        let parsed = parse_raw_config(
            "max.poll.interval.ms: 100\n  socket.timeout.ms:10000\nbroken line\nssl.endpoint: a:b\n",
        );
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed.get("max.poll.interval.ms"), Some(&"100".to_string()));
        assert_eq!(parsed.get("socket.timeout.ms"), Some(&"10000".to_string()));
        assert_eq!(parsed.get("ssl.endpoint"), Some(&"a:b".to_string()));
    }
}
