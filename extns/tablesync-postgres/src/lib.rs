//! Thin PostgreSQL writer used by tablesync. A [`PgSink`] is bound to one table at connect time
//! and executes one parameterized statement per row. Database failures are reported through
//! [`Error`], already sorted into the classes the caller needs to decide between skipping,
//! retrying and giving up.

pub mod sink;
pub mod statement;

pub use sink::{PgSink, PgSinkConfig};
pub use statement::{TableSpec, WriteMode};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The row was rejected by the database. Writing it again cannot succeed.
    #[error("Constraint violation - {0}")]
    ConstraintViolation(String),

    /// The write may succeed if attempted again (connection reset, timeout, deadlock...).
    #[error("Transient - {0}")]
    Transient(String),

    /// The sink cannot be used until it is reconnected or reconfigured.
    #[error("Connection - {0}")]
    Connection(String),

    #[error("Config - {0}")]
    Config(String),
}

/// A single bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Text(String),
    BigInt(i64),
    Double(f64),
    Json(serde_json::Value),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        classify(err)
    }
}

/// Sorts a sqlx error into constraint / transient / connection.
pub fn classify(err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code() {
                Some(code) => from_sqlstate(&code, message),
                None => Error::Transient(message),
            }
        }
        sqlx::Error::Io(e) => Error::Transient(format!("I/O - {e}")),
        sqlx::Error::PoolTimedOut => {
            Error::Transient("timed out acquiring a pooled connection".to_string())
        }
        sqlx::Error::Protocol(e) => Error::Transient(format!("protocol - {e}")),
        sqlx::Error::WorkerCrashed => Error::Transient("connection worker crashed".to_string()),
        sqlx::Error::Encode(e) => Error::ConstraintViolation(format!("encoding parameter - {e}")),
        sqlx::Error::PoolClosed => Error::Connection("connection pool is closed".to_string()),
        sqlx::Error::Configuration(e) => Error::Connection(format!("configuration - {e}")),
        sqlx::Error::Tls(e) => Error::Connection(format!("TLS - {e}")),
        sqlx::Error::TypeNotFound { type_name } => {
            Error::Connection(format!("type not found: {type_name}"))
        }
        other => Error::Transient(other.to_string()),
    }
}

/// Classification by SQLSTATE, see https://www.postgresql.org/docs/current/errcodes-appendix.html
pub fn from_sqlstate(code: &str, message: String) -> Error {
    let message = format!("{message} (SQLSTATE {code})");
    match code {
        // serialization failure, deadlock, lock not available, statement timeout, shutdown
        "40001" | "40P01" | "55P03" | "57014" | "57P01" | "57P02" | "57P03" => {
            Error::Transient(message)
        }
        // invalid catalog name (database does not exist)
        "3D000" => Error::Connection(message),
        _ => match code.get(..2) {
            // integrity constraint violation, data exception
            Some("23") | Some("22") => Error::ConstraintViolation(message),
            // connection exception, insufficient resources
            Some("08") | Some("53") => Error::Transient(message),
            // syntax error or access rule violation (missing table/column, permissions),
            // invalid authorization
            Some("42") | Some("28") => Error::Connection(message),
            _ => Error::Transient(message),
        },
    }
}
