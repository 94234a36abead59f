use std::time::Duration;

use super::connection::{DatabaseType, DbConnection};
use crate::error::{AdapterError, Result};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Request-scoped view of a connection.
///
/// Adapters read it and never mutate it. A detached context has no
/// connection and can only be used for translation.
#[derive(Debug, Clone)]
pub struct DbContext<'a> {
    connection: Option<&'a DbConnection>,
    database_type: DatabaseType,
    /// Table or collection used when the intent leaves `target` empty.
    pub target_hint: Option<String>,
    /// Declared columns of the target, used instead of `*` for plain reads.
    pub columns: Option<Vec<String>>,
    pub timeout: Duration,
}

impl<'a> DbContext<'a> {
    pub fn new(connection: &'a DbConnection) -> Self {
        Self {
            connection: Some(connection),
            database_type: connection.database_type(),
            target_hint: None,
            columns: None,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn detached(database_type: DatabaseType) -> Self {
        Self {
            connection: None,
            database_type,
            target_hint: None,
            columns: None,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_target_hint(mut self, target: impl Into<String>) -> Self {
        self.target_hint = Some(target.into());
        self
    }

    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    /// The live connection, or a connection error for detached contexts.
    pub fn connection(&self) -> Result<&'a DbConnection> {
        self.connection.ok_or_else(|| {
            AdapterError::Connection(format!(
                "no {} connection attached to this context",
                self.database_type
            ))
        })
    }
}
