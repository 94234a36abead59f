//! Query adapters.
//!
//! An adapter turns an [`AnalysisIntent`] into a backend-native query and runs
//! it against the connection carried by a [`DbContext`].
//!
//! ```text
//!   AnalysisIntent ──translate──▶ QueryArtifact ──execute──▶ ResultSet
//!                        │                            │
//!                   pure, no I/O             one backend round trip
//! ```
//!
//! Translation always happens before any I/O, so a malformed intent is
//! reported without touching the database.
use async_trait::async_trait;
use mongodb::bson::Document;
use serde::Serialize;

use crate::db::{DatabaseType, DbContext, ResultSet};
use crate::error::Result;
use crate::intent::{AnalysisIntent, Value};

pub mod factory;
pub mod mongo;
pub mod sql;

pub use factory::AdapterFactory;
pub use mongo::MongoDbAdapter;
pub use sql::SqlAdapter;

/// Parameterized SQL text plus its bound values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlQuery {
    pub text: String,
    /// Values for `$1..$n`, in placeholder order.
    pub bound_parameters: Vec<Value>,
    /// `text` with the limit raised by one, used to detect truncation.
    #[serde(skip)]
    pub fetch_text: String,
    #[serde(skip)]
    pub limit: Option<u64>,
}

/// A MongoDB aggregation pipeline bound to a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineQuery {
    pub collection: String,
    pub stages: Vec<Document>,
    #[serde(skip)]
    pub limit: Option<u64>,
    /// Whether the pipeline groups, so `_id` holds the group keys.
    #[serde(skip)]
    pub grouped: bool,
    /// Output columns known up front, in SQL select order.
    #[serde(skip)]
    pub columns: Vec<String>,
    /// Row to return when a global aggregate matches no documents.
    #[serde(skip)]
    pub empty_aggregate: Option<Document>,
}

/// Backend-specific query produced by [`QueryAdapter::translate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueryArtifact {
    Sql(SqlQuery),
    Pipeline(PipelineQuery),
}

impl QueryArtifact {
    pub fn database_type(&self) -> DatabaseType {
        match self {
            QueryArtifact::Sql(_) => DatabaseType::Sql,
            QueryArtifact::Pipeline(_) => DatabaseType::MongoDb,
        }
    }
}

/// Uniform contract implemented by every backend adapter.
#[async_trait]
pub trait QueryAdapter: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &'static str;

    fn database_type(&self) -> DatabaseType;

    /// Build the backend query for `intent`. Never touches the connection.
    fn translate(&self, intent: &AnalysisIntent, context: &DbContext<'_>) -> Result<QueryArtifact>;

    /// Run a previously translated query and normalize its rows.
    async fn execute(&self, artifact: &QueryArtifact, context: &DbContext<'_>) -> Result<ResultSet>;

    /// Translate then execute. Errors from either step propagate unchanged.
    async fn run(&self, intent: &AnalysisIntent, context: &DbContext<'_>) -> Result<ResultSet> {
        let artifact = self.translate(intent, context)?;
        self.execute(&artifact, context).await
    }
}

/// The closed set of adapters this crate ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    Sql(SqlAdapter),
    MongoDb(MongoDbAdapter),
}

impl Adapter {
    pub fn for_type(database_type: DatabaseType) -> Self {
        match database_type {
            DatabaseType::Sql => Adapter::Sql(SqlAdapter),
            DatabaseType::MongoDb => Adapter::MongoDb(MongoDbAdapter),
        }
    }
}

#[async_trait]
impl QueryAdapter for Adapter {
    fn name(&self) -> &'static str {
        match self {
            Adapter::Sql(a) => a.name(),
            Adapter::MongoDb(a) => a.name(),
        }
    }

    fn database_type(&self) -> DatabaseType {
        match self {
            Adapter::Sql(a) => a.database_type(),
            Adapter::MongoDb(a) => a.database_type(),
        }
    }

    fn translate(&self, intent: &AnalysisIntent, context: &DbContext<'_>) -> Result<QueryArtifact> {
        match self {
            Adapter::Sql(a) => a.translate(intent, context),
            Adapter::MongoDb(a) => a.translate(intent, context),
        }
    }

    async fn execute(&self, artifact: &QueryArtifact, context: &DbContext<'_>) -> Result<ResultSet> {
        match self {
            Adapter::Sql(a) => a.execute(artifact, context).await,
            Adapter::MongoDb(a) => a.execute(artifact, context).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use crate::intent::Filter;

    #[test]
    fn test_adapter_for_type() {
        assert_eq!(Adapter::for_type(DatabaseType::Sql).name(), "PostgreSQL");
        assert_eq!(
            Adapter::for_type(DatabaseType::MongoDb).database_type(),
            DatabaseType::MongoDb
        );
    }

    #[test]
    fn test_enum_dispatch_translates() {
        let intent = AnalysisIntent::new("orders").filter(Filter::eq("status", "shipped"));
        let ctx = DbContext::detached(DatabaseType::Sql);
        let artifact = Adapter::for_type(DatabaseType::Sql)
            .translate(&intent, &ctx)
            .unwrap();
        assert_eq!(artifact.database_type(), DatabaseType::Sql);

        let ctx = DbContext::detached(DatabaseType::MongoDb);
        let artifact = Adapter::for_type(DatabaseType::MongoDb)
            .translate(&intent, &ctx)
            .unwrap();
        assert_eq!(artifact.database_type(), DatabaseType::MongoDb);
    }

    #[test]
    fn test_artifact_serializes_with_kind_tag() {
        let artifact = QueryArtifact::Sql(SqlQuery {
            text: "SELECT 1".into(),
            bound_parameters: vec![Value::Int(1)],
            fetch_text: "SELECT 1".into(),
            limit: None,
        });
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "sql", "text": "SELECT 1", "bound_parameters": [1]})
        );
    }

    #[tokio::test]
    async fn test_run_on_detached_context_is_connection_error() {
        let intent = AnalysisIntent::new("orders");
        let ctx = DbContext::detached(DatabaseType::Sql);
        let err = Adapter::for_type(DatabaseType::Sql)
            .run(&intent, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Connection(_)));
    }

    #[tokio::test]
    async fn test_run_reports_translation_error_first() {
        let intent = AnalysisIntent::new("orders").limit(-1);
        let ctx = DbContext::detached(DatabaseType::MongoDb);
        let err = Adapter::for_type(DatabaseType::MongoDb)
            .run(&intent, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Translation(_)));
    }
}
