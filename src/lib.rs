pub mod adapter;
pub mod ast;
pub mod db;
pub mod error;
pub mod export;
pub mod intent;

pub use adapter::{Adapter, AdapterFactory, QueryAdapter, QueryArtifact};
pub use db::{DatabaseType, DbConnection, DbContext, ResultSet};
pub use error::{AdapterError, Result};
pub use intent::AnalysisIntent;
