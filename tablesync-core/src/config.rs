//! Settings are read once at startup from `TABLESYNC_*` environment variables. Everything has a
//! default, so an empty environment yields a service that talks to `kafka:9092` and
//! `postgres-db:5432` and copies `carga_topic` into `tabela`.

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::config::components::metrics::MetricsConfig;
use crate::config::components::sink::SinkConfig;
use crate::config::components::source::SourceConfig;
use crate::{Error, Result};

pub(crate) mod components;

const ENV_PREFIX: &str = "TABLESYNC_";
const ENV_WORKERS: &str = "TABLESYNC_WORKERS";
const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) source: SourceConfig,
    pub(crate) sink: SinkConfig,
    /// Partition workers. Each owns one pooled connection.
    pub(crate) workers: usize,
    pub(crate) metrics: MetricsConfig,
}

impl Settings {
    pub(crate) fn load() -> Result<Self> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        Settings::try_from(vars)
    }
}

impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(vars: HashMap<String, String>) -> Result<Self> {
        let env = Env(&vars);
        let workers = env.parse(ENV_WORKERS, DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(Error::Config(format!("{ENV_WORKERS} must be at least 1")));
        }

        let mut sink = SinkConfig::from_env(&env)?;
        // one connection per worker, no more
        sink.pg.max_connections = u32::try_from(workers)
            .map_err(|_| Error::Config(format!("{ENV_WORKERS} is too large: {workers}")))?;

        Ok(Settings {
            source: SourceConfig::from_env(&env)?,
            sink,
            workers,
            metrics: MetricsConfig::from_env(&env)?,
        })
    }
}

/// Typed lookups over the collected variables.
pub(crate) struct Env<'a>(&'a HashMap<String, String>);

impl Env<'_> {
    /// The trimmed value, None when unset or blank.
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub(crate) fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("Invalid value {raw:?} for {key} - {e}"))),
        }
    }

    pub(crate) fn millis(&self, key: &str, default_ms: u64) -> Result<Duration> {
        self.parse(key, default_ms).map(Duration::from_millis)
    }

    /// Accepts true/false, yes/no and 1/0.
    pub(crate) fn flag(&self, key: &str) -> Result<bool> {
        match self.get(key).map(str::to_lowercase).as_deref() {
            None | Some("false" | "no" | "0") => Ok(false),
            Some("true" | "yes" | "1") => Ok(true),
            Some(other) => Err(Error::Config(format!(
                "Invalid value {other:?} for {key}, expected true or false"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tablesync_kafka::StartPosition;
    use tablesync_postgres::WriteMode;

    use super::*;
    use crate::decode::{IdType, ValueType};

    pub(crate) fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::try_from(HashMap::new()).unwrap();

        let kafka = &settings.source.kafka;
        assert_eq!(kafka.brokers, vec!["kafka:9092".to_string()]);
        assert_eq!(kafka.topic, "carga_topic");
        assert_eq!(kafka.consumer_group, "sync-group");
        assert_eq!(kafka.client_id, "sync-service");
        assert_eq!(kafka.start_position, StartPosition::Earliest);
        assert!(kafka.auth.is_none());
        assert!(kafka.tls.is_none());
        assert_eq!(settings.source.read_batch_size, 1);
        assert_eq!(settings.source.read_timeout, Duration::from_secs(1));

        let sink = &settings.sink;
        assert_eq!(sink.pg.host, "postgres-db");
        assert_eq!(sink.pg.port, 5432);
        assert_eq!(sink.pg.database, "mydb");
        assert_eq!(sink.pg.max_connections, 1);
        assert_eq!(sink.table.table, "tabela");
        assert_eq!(sink.table.key_column, "id");
        assert_eq!(sink.table.value_columns, vec!["valor".to_string()]);
        assert_eq!(sink.table.mode, WriteMode::Upsert);
        assert_eq!(sink.mapping.id_type, IdType::Text);
        assert_eq!(sink.mapping.value_type, ValueType::Integer);
        assert_eq!(sink.retry.max_retries, 10);
        assert_eq!(sink.write_timeout, Duration::from_secs(5));

        assert_eq!(settings.workers, 1);
        assert_eq!(settings.metrics.port, 2469);
    }

    #[test]
    fn test_workers_size_the_pool() {
        let settings = Settings::try_from(vars(&[("TABLESYNC_WORKERS", "4")])).unwrap();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.sink.pg.max_connections, 4);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Settings::try_from(vars(&[("TABLESYNC_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unparsable_number_names_the_variable() {
        let err = Settings::try_from(vars(&[("TABLESYNC_PG_PORT", "five")])).unwrap_err();
        assert!(err.to_string().contains("TABLESYNC_PG_PORT"), "{err}");
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let settings = Settings::try_from(vars(&[("TABLESYNC_KAFKA_TOPIC", "   ")])).unwrap();
        assert_eq!(settings.source.kafka.topic, "carga_topic");
    }

    #[test]
    fn test_flags() {
        let map = vars(&[("A", "Yes"), ("B", "0"), ("C", "maybe")]);
        let env = Env(&map);
        assert!(env.flag("A").unwrap());
        assert!(!env.flag("B").unwrap());
        assert!(!env.flag("missing").unwrap());
        assert!(env.flag("C").is_err());
    }
}
