use tablesync_postgres::{PgSink, PgValue};

use crate::config::components::sink::SinkConfig;
use crate::error::Error;
use crate::message::{FieldValue, RecordKey, WriteCommand};
use crate::sink::{Ack, Sink, SinkError};

impl From<&RecordKey> for PgValue {
    fn from(key: &RecordKey) -> Self {
        match key {
            RecordKey::Text(s) => PgValue::Text(s.clone()),
            RecordKey::Integer(i) => PgValue::BigInt(*i),
        }
    }
}

impl From<&FieldValue> for PgValue {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Integer(i) => PgValue::BigInt(*i),
            FieldValue::Float(v) => PgValue::Double(*v),
            FieldValue::Text(s) => PgValue::Text(s.clone()),
            FieldValue::Json(v) => PgValue::Json(v.clone()),
        }
    }
}

impl From<tablesync_postgres::Error> for SinkError {
    fn from(value: tablesync_postgres::Error) -> Self {
        match value {
            tablesync_postgres::Error::ConstraintViolation(e) => SinkError::ConstraintViolation(e),
            tablesync_postgres::Error::Transient(e) => SinkError::Transient(e),
            tablesync_postgres::Error::Connection(e) => SinkError::Connection(e),
            // a command that does not fit the statement is a bug in the mapping, not in the row
            tablesync_postgres::Error::Config(e) => SinkError::Connection(e),
        }
    }
}

impl From<tablesync_postgres::Error> for Error {
    fn from(value: tablesync_postgres::Error) -> Self {
        match value {
            tablesync_postgres::Error::Config(e) => Error::Config(e),
            tablesync_postgres::Error::Connection(e) => Error::Connection(e),
            other => Error::Sink(other.to_string()),
        }
    }
}

/// Opens the pool for the configured table. Fails if the database cannot be reached.
pub(crate) async fn new_pg_sink(config: SinkConfig) -> crate::Result<PgSink> {
    Ok(PgSink::connect(config.pg, config.table).await?)
}

impl Sink for PgSink {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn write(&mut self, command: &WriteCommand) -> Result<Ack, SinkError> {
        let key = PgValue::from(&command.key);
        let values: Vec<PgValue> = command.values.iter().map(PgValue::from).collect();
        let rows_affected = PgSink::write(self, &key, &values).await?;
        Ok(Ack { rows_affected })
    }
}
