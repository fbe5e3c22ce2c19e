//! Persistent knowledge store.

mod error;
mod schema;
mod sqlite;

pub use error::StoreError;
pub use schema::{SCHEMA, SCHEMA_VERSION};
pub use sqlite::{default_store_path, KnowledgeStore};
