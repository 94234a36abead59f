mod connection;
mod context;
mod document;
mod params;
mod query;

pub use connection::*;
pub use context::*;
pub use document::*;
pub use query::*;
