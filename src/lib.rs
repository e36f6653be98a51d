//! # ctxstore - Layered persistence contexts
//!
//! A persistence layer built around two ideas:
//! - A hierarchy of mutation-scoped contexts. The root context lives on a
//!   dedicated worker thread and owns the write path to storage; the main
//!   context is its child and belongs to the thread that created it.
//!   Saving a context pushes its changes one level up until the root
//!   commits them to disk.
//! - A registry of named store configurations, each attached as its own
//!   SQLite artifact. Stores are built lazily and can repair themselves by
//!   deleting a corrupt artifact and starting over.

pub mod uri;
pub mod schema;
pub mod reflect;
pub mod codec;
pub mod registry;
pub mod storage;
pub mod builder;
pub mod context;
pub mod object;
pub mod save;
pub mod stack;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use uri::ObjectId;
pub use schema::{AttributeDescriptor, AttributeType, EntityDescriptor, RelationshipDescriptor, Schema, SortKey};
pub use reflect::EntityReflector;
pub use registry::{StoreConfiguration, StoreConfigurationRegistry};
pub use storage::{SqliteStore, StoreCoordinator};
pub use builder::PersistentStoreBuilder;
pub use context::{Confinement, Context};
pub use object::{Deletable, ManagedObject, Reflectable, Saveable};
pub use save::SaveCoordinator;
pub use stack::DataStack;

/// Result type alias for ctxstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ctxstore operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to attach store '{configuration}' at {location}: {reason}")]
    StoreAttach {
        configuration: String,
        location: String,
        reason: String,
    },

    #[error("Save failed in context '{context}' (level {level}): {source}")]
    Save {
        context: String,
        level: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Reflection error: {0}")]
    Reflection(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Context '{context}' is confined to another thread")]
    Confinement { context: String },

    #[error("{object} belongs to a different context than '{context}'")]
    CrossContext { object: String, context: String },

    #[error("Worker for context '{0}' is no longer running")]
    WorkerUnavailable(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// The save level that failed, if this is a save error
    pub fn failed_level(&self) -> Option<(&str, usize)> {
        match self {
            Error::Save { context, level, .. } => Some((context.as_str(), *level)),
            _ => None,
        }
    }
}
