//! Error types for the Tenantry bookkeeping and platform stores.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// SQLSTATE `undefined_object`, returned e.g. when dropping a missing slot.
const UNDEFINED_OBJECT: &str = "42704";

/// SQLSTATE `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StateError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                match db_err.code().as_deref() {
                    Some(UNDEFINED_OBJECT) => StateError::NotFound(message),
                    Some(UNIQUE_VIOLATION) => StateError::Conflict(message),
                    _ if message.contains("does not exist") => StateError::NotFound(message),
                    _ => StateError::Database(message),
                }
            }
            other => StateError::Database(other.to_string()),
        }
    }
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}
