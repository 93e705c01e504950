use std::time::Duration;

use tablesync_postgres::{PgSinkConfig, TableSpec, WriteMode};

use crate::config::Env;
use crate::decode::{Decoder, IdType, ValueType};
use crate::retry::RetryConfig;
use crate::{Error, Result};

const DEFAULT_PG_HOST: &str = "postgres-db";
const DEFAULT_PG_PORT: u16 = 5432;
const DEFAULT_PG_USER: &str = "user";
const DEFAULT_PG_PASSWORD: &str = "password";
const DEFAULT_PG_DATABASE: &str = "mydb";
const DEFAULT_PG_SSL_MODE: &str = "prefer";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_TABLE: &str = "tabela";
const DEFAULT_ID_COLUMN: &str = "id";
const DEFAULT_VALUE_COLUMN: &str = "valor";
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;

/// Payload fields and the column types they must match.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FieldMapping {
    pub(crate) id_field: String,
    pub(crate) value_field: String,
    pub(crate) id_type: IdType,
    pub(crate) value_type: ValueType,
}

impl FieldMapping {
    pub(crate) fn decoder(&self) -> Decoder {
        Decoder::new(
            &self.id_field,
            &self.value_field,
            self.id_type,
            self.value_type,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SinkConfig {
    pub(crate) pg: PgSinkConfig,
    pub(crate) table: TableSpec,
    pub(crate) mapping: FieldMapping,
    /// Upper bound on a single write, a write that takes longer counts as a transient failure.
    pub(crate) write_timeout: Duration,
    pub(crate) retry: RetryConfig,
}

impl SinkConfig {
    pub(crate) fn from_env(env: &Env<'_>) -> Result<Self> {
        let pg = PgSinkConfig {
            host: env.string("TABLESYNC_PG_HOST", DEFAULT_PG_HOST),
            port: env.parse("TABLESYNC_PG_PORT", DEFAULT_PG_PORT)?,
            user: env.string("TABLESYNC_PG_USER", DEFAULT_PG_USER),
            password: env.string("TABLESYNC_PG_PASSWORD", DEFAULT_PG_PASSWORD),
            database: env.string("TABLESYNC_PG_DATABASE", DEFAULT_PG_DATABASE),
            ssl_mode: env.string("TABLESYNC_PG_SSL_MODE", DEFAULT_PG_SSL_MODE),
            max_connections: 1,
            connect_timeout: env.millis(
                "TABLESYNC_PG_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )?,
        };
        tablesync_postgres::sink::parse_ssl_mode(&pg.ssl_mode)
            .map_err(|e| Error::Config(e.to_string()))?;

        let mode = match env.get("TABLESYNC_WRITE_MODE").map(str::to_lowercase).as_deref() {
            None | Some("upsert") => WriteMode::Upsert,
            Some("insert") => WriteMode::Insert,
            Some(other) => {
                return Err(Error::Config(format!(
                    "Invalid TABLESYNC_WRITE_MODE {other:?}, expected upsert or insert"
                )));
            }
        };
        let table = TableSpec {
            table: env.string("TABLESYNC_TABLE", DEFAULT_TABLE),
            key_column: env.string("TABLESYNC_ID_COLUMN", DEFAULT_ID_COLUMN),
            value_columns: vec![env.string("TABLESYNC_VALUE_COLUMN", DEFAULT_VALUE_COLUMN)],
            mode,
        };
        // rejects bad identifiers and key columns listed as values
        table
            .statement()
            .map_err(|e| Error::Config(format!("Invalid target table - {e}")))?;

        let mapping = FieldMapping {
            id_field: env.string("TABLESYNC_ID_FIELD", DEFAULT_ID_COLUMN),
            value_field: env.string("TABLESYNC_VALUE_FIELD", DEFAULT_VALUE_COLUMN),
            id_type: env.parse("TABLESYNC_ID_TYPE", IdType::default())?,
            value_type: env.parse("TABLESYNC_VALUE_TYPE", ValueType::default())?,
        };
        if mapping.id_field == mapping.value_field {
            return Err(Error::Config(format!(
                "Identifier and value are both read from payload field {:?}",
                mapping.id_field
            )));
        }

        Ok(Self {
            pg,
            table,
            mapping,
            write_timeout: env.millis("TABLESYNC_WRITE_TIMEOUT_MS", DEFAULT_WRITE_TIMEOUT_MS)?,
            retry: retry_config(env)?,
        })
    }
}

fn retry_config(env: &Env<'_>) -> Result<RetryConfig> {
    let defaults = RetryConfig::default();
    let retry = RetryConfig {
        max_retries: env.parse("TABLESYNC_RETRY_MAX_RETRIES", defaults.max_retries)?,
        initial_interval: env.millis(
            "TABLESYNC_RETRY_INITIAL_INTERVAL_MS",
            defaults.initial_interval.as_millis() as u64,
        )?,
        max_interval: env.millis(
            "TABLESYNC_RETRY_MAX_INTERVAL_MS",
            defaults.max_interval.as_millis() as u64,
        )?,
        factor: env.parse("TABLESYNC_RETRY_FACTOR", defaults.factor)?,
        jitter: env.parse("TABLESYNC_RETRY_JITTER", defaults.jitter)?,
    };

    if retry.factor.is_nan() || retry.factor < 1.0 {
        return Err(Error::Config(format!(
            "TABLESYNC_RETRY_FACTOR must be at least 1.0, got {}",
            retry.factor
        )));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return Err(Error::Config(format!(
            "TABLESYNC_RETRY_JITTER must be between 0.0 and 1.0, got {}",
            retry.jitter
        )));
    }
    if retry.max_interval < retry.initial_interval {
        return Err(Error::Config(
            "TABLESYNC_RETRY_MAX_INTERVAL_MS is shorter than the initial interval".to_string(),
        ));
    }
    Ok(retry)
}
