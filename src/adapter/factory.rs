use std::collections::HashMap;
use std::sync::OnceLock;

use super::{Adapter, MongoDbAdapter, QueryAdapter, SqlAdapter};
use crate::db::DatabaseType;
use crate::error::{AdapterError, Result};

/// Registration table mapping database types to adapters.
///
/// Built once and then only read, so a shared instance needs no locking.
#[derive(Debug, Clone)]
pub struct AdapterFactory {
    adapters: HashMap<DatabaseType, Adapter>,
}

impl Default for AdapterFactory {
    fn default() -> Self {
        let mut factory = Self::empty();
        factory.register(Adapter::Sql(SqlAdapter));
        factory.register(Adapter::MongoDb(MongoDbAdapter));
        factory
    }
}

impl AdapterFactory {
    /// A factory with every built-in adapter registered.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Process-wide factory with the built-in adapters.
    pub fn global() -> &'static AdapterFactory {
        static FACTORY: OnceLock<AdapterFactory> = OnceLock::new();
        FACTORY.get_or_init(AdapterFactory::new)
    }

    /// Bind `adapter` to its database type, replacing any previous binding.
    pub fn register(&mut self, adapter: Adapter) {
        self.adapters.insert(adapter.database_type(), adapter);
    }

    pub fn get_adapter(&self, database_type: DatabaseType) -> Result<Adapter> {
        self.adapters
            .get(&database_type)
            .copied()
            .ok_or_else(|| AdapterError::UnsupportedDatabaseType(database_type.to_string()))
    }

    /// Look up an adapter by a database type name such as `"postgres"`.
    pub fn get_adapter_by_name(&self, name: &str) -> Result<Adapter> {
        self.get_adapter(name.parse()?)
    }

    pub fn supported_types(&self) -> Vec<DatabaseType> {
        let mut types: Vec<DatabaseType> = self.adapters.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}
