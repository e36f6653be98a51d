//! Persistent store builder
//!
//! Attaches one store per registered configuration. When automatic reset is
//! enabled a store that fails to attach has its artifacts deleted and is
//! attached once more; a second failure is final.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde_json::json;
use crate::config::default_store_path;
use crate::registry::{MEMORY_STORE_TYPE, SQLITE_STORE_TYPE, StoreConfiguration, StoreConfigurationRegistry};
use crate::schema::Schema;
use crate::storage::sqlite::{artifact_paths, location_path};
use crate::storage::{AttachedStore, SqliteStore, StoreCoordinator, StoreOptions};
use crate::{Error, Result};

/// Builds the `StoreCoordinator` for a schema and a set of configurations
#[derive(Debug, Clone)]
pub struct PersistentStoreBuilder {
    schema: Arc<Schema>,
    automatic_reset: bool,
}

impl PersistentStoreBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            automatic_reset: false,
        }
    }

    pub fn with_automatic_reset(mut self, automatic_reset: bool) -> Self {
        self.automatic_reset = automatic_reset;
        self
    }

    /// Configuration used when nothing is registered
    pub fn default_configuration() -> StoreConfiguration {
        let mut options = BTreeMap::new();
        options.insert("journal_mode".to_string(), json!("wal"));
        options.insert("migrate_automatically".to_string(), json!(true));

        StoreConfiguration {
            name: None,
            store_type: SQLITE_STORE_TYPE.to_string(),
            location: Some(default_store_path().to_string_lossy().into_owned()),
            options,
        }
    }

    /// Attach every registered configuration
    pub fn build(&self, registry: &StoreConfigurationRegistry) -> Result<Arc<StoreCoordinator>> {
        self.schema.validate()?;

        let configurations: Vec<StoreConfiguration> = if registry.is_empty() {
            vec![Self::default_configuration()]
        } else {
            registry.iter().cloned().collect()
        };

        let mut stores = Vec::with_capacity(configurations.len());
        for configuration in configurations {
            if let Some(name) = &configuration.name {
                if !self.schema.configurations.contains_key(name) {
                    tracing::warn!("Schema has no configuration named {}; its store will hold no entities", name);
                }
            }
            stores.push(self.attach_with_repair(configuration)?);
        }

        tracing::info!("Attached {} store(s)", stores.len());
        Ok(Arc::new(StoreCoordinator::new(Arc::clone(&self.schema), stores)))
    }

    fn attach_with_repair(&self, configuration: StoreConfiguration) -> Result<AttachedStore> {
        let error = match self.attach(&configuration) {
            Ok(store) => return Ok(store),
            // Bad configuration is never repaired
            Err(e @ (Error::Configuration(_) | Error::StoreAttach { .. })) => return Err(e),
            Err(e) => e,
        };

        let location = configuration.location.clone().unwrap_or_default();
        if !self.automatic_reset || configuration.store_type == MEMORY_STORE_TYPE {
            return Err(attach_error(&configuration, &location, &error));
        }

        tracing::warn!(
            "Store {} failed to attach ({}); deleting {} and retrying",
            configuration.display_name(),
            error,
            location
        );
        destroy_artifacts(&location_path(&location))?;

        match self.attach(&configuration) {
            Ok(store) => {
                tracing::info!("Store {} rebuilt at {}", configuration.display_name(), location);
                Ok(store)
            }
            Err(e) => Err(attach_error(&configuration, &location, &e)),
        }
    }

    /// One attempt at attaching `configuration`
    fn attach(&self, configuration: &StoreConfiguration) -> Result<AttachedStore> {
        let options = StoreOptions::from_map(&configuration.options)?;

        let (store, location) = match configuration.store_type.as_str() {
            SQLITE_STORE_TYPE => {
                let location = configuration.location.as_deref().ok_or_else(|| {
                    Error::Configuration(format!(
                        "Store {} of type {} needs a location",
                        configuration.display_name(),
                        SQLITE_STORE_TYPE
                    ))
                })?;
                let path = location_path(location);
                if !options.read_only {
                    ensure_parent_dir(&path)?;
                }
                (SqliteStore::open(&path, &options)?, Some(path))
            }
            MEMORY_STORE_TYPE => (SqliteStore::open_in_memory(&options)?, None),
            other => {
                return Err(Error::StoreAttach {
                    configuration: configuration.display_name().to_string(),
                    location: configuration.location.clone().unwrap_or_default(),
                    reason: format!("Unsupported store type: {}", other),
                });
            }
        };

        self.check_fingerprint(&store, &options)?;

        tracing::debug!(
            "Attached store {} ({}) at {:?}",
            configuration.display_name(),
            configuration.store_type,
            location
        );
        Ok(AttachedStore::new(configuration.clone(), location, store))
    }

    fn check_fingerprint(&self, store: &SqliteStore, options: &StoreOptions) -> Result<()> {
        let expected = self.schema.fingerprint();

        match store.fingerprint()? {
            Some(found) if found == expected => Ok(()),
            Some(found) if options.migrate_automatically && !options.read_only => {
                tracing::info!("Schema changed ({} -> {}); migrating store", short(&found), short(&expected));
                store.set_fingerprint(&expected)
            }
            Some(found) => Err(Error::Validation(format!(
                "Store was created for schema {} but the current schema is {}",
                short(&found),
                short(&expected)
            ))),
            None if options.read_only => Ok(()),
            None => store.set_fingerprint(&expected),
        }
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

fn attach_error(configuration: &StoreConfiguration, location: &str, error: &Error) -> Error {
    Error::StoreAttach {
        configuration: configuration.display_name().to_string(),
        location: location.to_string(),
        reason: error.to_string(),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Delete a store file and its journal siblings. Missing files are fine.
pub fn destroy_artifacts(path: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for artifact in artifact_paths(path) {
        match std::fs::remove_file(&artifact) {
            Ok(()) => removed.push(artifact),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    if !removed.is_empty() {
        tracing::info!("Deleted {} store artifact(s) at {}", removed.len(), path.display());
    }
    Ok(removed)
}
