//! Storage Layer - SQLite-backed persistence
//!
//! Each store configuration is one SQLite artifact with tables:
//! - ctx_metadata(key, value)
//! - ctx_objects(entity, key, fields)
//! - ctx_sequences(entity, next_key)

pub mod coordinator;
pub mod schema;
pub mod sqlite;

pub use coordinator::{AttachedStore, StoreCoordinator, StoreStats};
pub use sqlite::{RowWrite, SqliteStore, StoreOptions};
