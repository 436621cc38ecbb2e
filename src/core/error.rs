use crate::driver::SqlError;
use crate::transaction::jta::JtaError;
use std::fmt;
use thiserror::Error;

/// Category a driver failure is translated into, decided by the dialect's
/// exception converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JdbcErrorKind {
    ConstraintViolation,
    SqlGrammar,
    Connection,
    LockAcquisition,
    DataException,
    Generic,
}

impl fmt::Display for JdbcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConstraintViolation => "constraint violation",
            Self::SqlGrammar => "SQL grammar",
            Self::Connection => "JDBC connection",
            Self::LockAcquisition => "lock acquisition",
            Self::DataException => "data",
            Self::Generic => "JDBC",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} error: {message}{}", sql_suffix(.sql))]
    Jdbc {
        kind: JdbcErrorKind,
        message: String,
        sql: Option<String>,
        #[source]
        source: SqlError,
    },

    /// Fewer rows were affected than the operation expected.
    #[error("Stale state: {0}")]
    StaleState(String),

    #[error("{message}")]
    TooManyRowsAffected {
        message: String,
        expected: u64,
        actual: u64,
        batch_position: Option<usize>,
    },

    #[error("Batch update failed: {0}")]
    BatchFailed(usize),

    #[error("Assertion failure: {0}")]
    Assertion(String),

    #[error("transaction timeout expired")]
    TransactionTimeout,

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<JtaError>,
    },

    #[error("Session error: {0}")]
    Session(String),

    #[error("connection proxy not usable after transaction completion")]
    ConnectionRevoked,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    General(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

fn sql_suffix(sql: &Option<String>) -> String {
    match sql {
        Some(sql) => format!(" [{}]", sql),
        None => String::new(),
    }
}

impl Error {
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Position within the batch for row-count failures raised during batch
    /// verification.
    pub fn batch_position(&self) -> Option<usize> {
        match self {
            Self::TooManyRowsAffected { batch_position, .. } => *batch_position,
            Self::BatchFailed(position) => Some(*position),
            _ => None,
        }
    }

    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Jdbc { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    pub fn is_row_count_mismatch(&self) -> bool {
        matches!(self, Self::StaleState(_) | Self::TooManyRowsAffected { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
