use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use tracing::info;

use crate::statement::TableSpec;
use crate::{Error, PgValue, Result};

/// Connection parameters for the target database.
#[derive(Clone, PartialEq)]
pub struct PgSinkConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// disable, allow, prefer, require, verify-ca or verify-full
    pub ssl_mode: String,
    /// Upper bound of the connection pool, one per concurrent writer.
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

// keeps the password out of logs
impl std::fmt::Debug for PgSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSinkConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

pub fn parse_ssl_mode(mode: &str) -> Result<PgSslMode> {
    match mode.to_lowercase().as_str() {
        "disable" => Ok(PgSslMode::Disable),
        "allow" => Ok(PgSslMode::Allow),
        "prefer" => Ok(PgSslMode::Prefer),
        "require" => Ok(PgSslMode::Require),
        "verify-ca" => Ok(PgSslMode::VerifyCa),
        "verify-full" => Ok(PgSslMode::VerifyFull),
        _ => Err(Error::Config(format!("Invalid SSL mode: {mode}"))),
    }
}

/// Writes rows into one table through a bounded pool. Clones share the pool, each write holds a
/// connection exclusively for the duration of the statement.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
    statement: Arc<str>,
    value_columns: usize,
}

impl PgSink {
    /// Opens the pool and checks that the database answers.
    pub async fn connect(config: PgSinkConfig, table: TableSpec) -> Result<Self> {
        let statement = table.statement()?;
        info!(
            host = config.host,
            port = config.port,
            database = config.database,
            user = config.user,
            max_connections = config.max_connections,
            "Connecting to PostgreSQL"
        );

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .ssl_mode(parse_ssl_mode(&config.ssl_mode)?);

        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::Connection(format!(
                    "Failed to connect to {}:{}/{} - {e}",
                    config.host, config.port, config.database
                ))
            })?;

        let sink = Self {
            pool,
            statement: Arc::from(statement),
            value_columns: table.value_columns.len(),
        };
        sink.ping().await.map_err(|e| {
            Error::Connection(format!("PostgreSQL did not answer the health check - {e}"))
        })?;
        info!(statement = %sink.statement, "PostgreSQL sink ready");
        Ok(sink)
    }

    /// Executes the table statement for one row. Returns the number of affected rows.
    pub async fn write(&self, key: &PgValue, values: &[PgValue]) -> Result<u64> {
        if values.len() != self.value_columns {
            return Err(Error::Config(format!(
                "expected {} values, got {}",
                self.value_columns,
                values.len()
            )));
        }

        let mut query = bind(sqlx::query(&self.statement), key);
        for value in values {
            query = bind(query, value);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Waits for checked out connections to be returned and closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind<'q>(query: PgQuery<'q>, value: &'q PgValue) -> PgQuery<'q> {
    match value {
        PgValue::Text(v) => query.bind(v.as_str()),
        PgValue::BigInt(v) => query.bind(*v),
        PgValue::Double(v) => query.bind(*v),
        PgValue::Json(v) => query.bind(sqlx::types::Json(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssl_mode() {
        assert!(matches!(parse_ssl_mode("prefer"), Ok(PgSslMode::Prefer)));
        assert!(matches!(
            parse_ssl_mode("VERIFY-FULL"),
            Ok(PgSslMode::VerifyFull)
        ));
        assert!(matches!(parse_ssl_mode("sometimes"), Err(Error::Config(_))));
    }

    #[test]
    fn test_debug_hides_password() {
        let config = PgSinkConfig {
            host: "postgres-db".to_string(),
            port: 5432,
            user: "user".to_string(),
            password: "hunter2".to_string(),
            database: "mydb".to_string(),
            ssl_mode: "prefer".to_string(),
            max_connections: 1,
            connect_timeout: Duration::from_secs(1),
        };
        let printed = format!("{config:?}");
        assert!(printed.contains("postgres-db"));
        assert!(!printed.contains("hunter2"));
    }

    #[cfg(feature = "pg-tests")]
    mod live {
        use super::super::*;
        use crate::WriteMode;

        fn local_config() -> PgSinkConfig {
            PgSinkConfig {
                host: "localhost".to_string(),
                port: 5432,
                user: "postgres".to_string(),
                password: "postgres".to_string(),
                database: "postgres".to_string(),
                ssl_mode: "disable".to_string(),
                max_connections: 2,
                connect_timeout: Duration::from_secs(5),
            }
        }

        async fn create_table(mode: WriteMode) -> (PgSink, String) {
            let table = format!("tabela_{}", uuid::Uuid::new_v4().simple());
            let admin = PgSink::connect(
                local_config(),
                TableSpec {
                    table: "pg_class".to_string(),
                    key_column: "oid".to_string(),
                    value_columns: vec![],
                    mode: WriteMode::Insert,
                },
            )
            .await
            .unwrap();
            sqlx::query(&format!(
                "CREATE TABLE \"{table}\" (id TEXT PRIMARY KEY, valor BIGINT NOT NULL)"
            ))
            .execute(&admin.pool)
            .await
            .unwrap();

            let sink = PgSink::connect(
                local_config(),
                TableSpec {
                    table: table.clone(),
                    key_column: "id".to_string(),
                    value_columns: vec!["valor".to_string()],
                    mode,
                },
            )
            .await
            .unwrap();
            (sink, table)
        }

        #[tokio::test]
        async fn test_upsert_is_idempotent() {
            let (sink, table) = create_table(WriteMode::Upsert).await;
            let key = PgValue::Text("42".to_string());

            sink.write(&key, &[PgValue::BigInt(7)]).await.unwrap();
            sink.write(&key, &[PgValue::BigInt(7)]).await.unwrap();

            let rows: Vec<(String, i64)> =
                sqlx::query_as(&format!("SELECT id, valor FROM \"{table}\""))
                    .fetch_all(&sink.pool)
                    .await
                    .unwrap();
            assert_eq!(rows, vec![("42".to_string(), 7)]);
        }

        #[tokio::test]
        async fn test_insert_duplicate_is_constraint_violation() {
            let (sink, _table) = create_table(WriteMode::Insert).await;
            let key = PgValue::Text("42".to_string());

            sink.write(&key, &[PgValue::BigInt(7)]).await.unwrap();
            let err = sink.write(&key, &[PgValue::BigInt(7)]).await.unwrap_err();
            assert!(matches!(err, Error::ConstraintViolation(_)));
        }

        #[tokio::test]
        async fn test_missing_table_is_connection_error() {
            let sink = PgSink::connect(
                local_config(),
                TableSpec {
                    table: "does_not_exist_anywhere".to_string(),
                    key_column: "id".to_string(),
                    value_columns: vec!["valor".to_string()],
                    mode: WriteMode::Upsert,
                },
            )
            .await
            .unwrap();
            let err = sink
                .write(&PgValue::Text("1".into()), &[PgValue::BigInt(1)])
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Connection(_)));
        }
    }
}
