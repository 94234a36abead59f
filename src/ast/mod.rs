/// SQL AST used by the SQL adapter.
///
/// ```text
/// AnalysisIntent
///       ↓
/// SqlAdapter::translate   (adapter/sql.rs)
///       ↓
/// SelectQuery AST         (types.rs)
///       ↓
/// SQL Compiler            (compiler.rs)
///       ↓
/// SqlQuery { text, bound_parameters }
/// ```
pub mod compiler;
pub mod types;

pub use compiler::{compile, quote_ident};
pub use types::*;
