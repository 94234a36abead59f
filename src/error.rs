use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by intent translation and execution.
///
/// Each kind is reported to the caller verbatim; the adapters never retry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    /// The intent cannot be expressed in the target backend's query language.
    #[error("translation error: {0}")]
    Translation(String),
    /// No adapter is registered for the requested database type.
    #[error("unsupported database type: {0}")]
    UnsupportedDatabaseType(String),
    /// The connection handle is dead, closed, or of the wrong kind.
    #[error("connection error: {0}")]
    Connection(String),
    /// The backend rejected a well-formed query.
    #[error("execution error: {0}")]
    Execution(String),
    /// The context deadline elapsed before the backend answered.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

impl AdapterError {
    pub fn translation(msg: impl Into<String>) -> Self {
        AdapterError::Translation(msg.into())
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Translation(_) => "translation",
            AdapterError::UnsupportedDatabaseType(_) => "unsupported_database_type",
            AdapterError::Connection(_) => "connection",
            AdapterError::Execution(_) => "execution",
            AdapterError::Timeout(_) => "timeout",
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
