/// Analysis intents: the translation input shared by every adapter.
///
/// ```text
/// JSON from the model layer
///       ↓
/// AnalysisIntent          (types.rs)
///       ↓
/// validate()              (validate.rs)
///       ↓
/// adapter::{SqlAdapter, MongoDbAdapter}
/// ```
pub mod types;
pub mod validate;

pub use types::*;

use crate::error::{AdapterError, Result};

impl AnalysisIntent {
    /// Parse an intent from JSON, reporting malformed input as a translation error.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| AdapterError::translation(format!("malformed intent: {}", e)))
    }
}
