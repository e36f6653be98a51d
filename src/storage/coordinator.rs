//! Store coordinator - every attached store behind one handle
//!
//! Routes each entity to the store whose configuration holds it and turns
//! change sets into row writes. Only the root context calls into it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use crate::codec;
use crate::context::{ChangeSet, ObjectSnapshot};
use crate::registry::StoreConfiguration;
use crate::schema::{EntityDescriptor, Schema};
use crate::uri::ObjectId;
use crate::{Error, Result};
use super::sqlite::{RowWrite, SqliteStore};

/// One configuration attached to its store
#[derive(Debug)]
pub struct AttachedStore {
    pub configuration: StoreConfiguration,
    /// File backing the store, `None` for in-memory stores
    pub location: Option<PathBuf>,
    store: Mutex<SqliteStore>,
}

impl AttachedStore {
    pub fn new(configuration: StoreConfiguration, location: Option<PathBuf>, store: SqliteStore) -> Self {
        Self {
            configuration,
            location,
            store: Mutex::new(store),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SqliteStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        self.configuration.display_name()
    }

    pub fn is_read_only(&self) -> bool {
        self.lock().is_read_only()
    }
}

/// Row counts of one attached store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub configuration: String,
    pub location: Option<PathBuf>,
    pub entities: Vec<(String, usize)>,
}

impl StoreStats {
    pub fn total(&self) -> usize {
        self.entities.iter().map(|(_, count)| count).sum()
    }
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let location = self
            .location
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string());
        writeln!(f, "Store {} ({}):", self.configuration, location)?;
        for (entity, count) in &self.entities {
            writeln!(f, "  {}: {}", entity, count)?;
        }
        write!(f, "  Total: {}", self.total())
    }
}

/// The built handle to every attached store
#[derive(Debug)]
pub struct StoreCoordinator {
    schema: Arc<Schema>,
    stores: Vec<AttachedStore>,
}

impl StoreCoordinator {
    pub fn new(schema: Arc<Schema>, stores: Vec<AttachedStore>) -> Self {
        Self { schema, stores }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn stores(&self) -> &[AttachedStore] {
        &self.stores
    }

    /// Names of the attached configurations, in attach order
    pub fn configurations(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.name().to_string()).collect()
    }

    /// The store persisting `entity`: the first whose configuration holds it
    pub fn store_for_entity(&self, entity: &str) -> Result<&AttachedStore> {
        self.stores
            .iter()
            .find(|s| self.schema.configuration_contains(s.configuration.name.as_deref(), entity))
            .ok_or_else(|| Error::Configuration(format!("No attached store holds entity {}", entity)))
    }

    /// Reserve `count` permanent keys for `entity`
    pub fn allocate_keys(&self, entity: &str, count: usize) -> Result<Vec<i64>> {
        self.store_for_entity(entity)?.lock().allocate_keys(entity, count)
    }

    /// Load one object from storage
    pub fn fetch(&self, id: &ObjectId) -> Result<Option<ObjectSnapshot>> {
        let Some(key) = id.key() else {
            return Ok(None);
        };
        let descriptor = self.descriptor(id.entity())?;
        let row = self.store_for_entity(id.entity())?.lock().fetch_row(id.entity(), key)?;

        row.map(|text| -> Result<ObjectSnapshot> {
            Ok(ObjectSnapshot {
                id: id.clone(),
                fields: codec::decode_fields(descriptor, &text)?,
            })
        })
        .transpose()
    }

    /// Load every stored object of `entity`, ordered by key
    pub fn fetch_all(&self, entity: &str) -> Result<Vec<ObjectSnapshot>> {
        let descriptor = self.descriptor(entity)?;
        let rows = self.store_for_entity(entity)?.lock().fetch_rows(entity)?;

        rows.into_iter()
            .map(|(key, text)| -> Result<ObjectSnapshot> {
                Ok(ObjectSnapshot {
                    id: ObjectId::permanent(entity, key),
                    fields: codec::decode_fields(descriptor, &text)?,
                })
            })
            .collect()
    }

    fn descriptor(&self, entity: &str) -> Result<&EntityDescriptor> {
        self.schema
            .entity(entity)
            .ok_or_else(|| Error::Reflection(format!("Unknown entity: {}", entity)))
    }

    /// Write a change set to storage, one transaction per store.
    ///
    /// Every id must be permanent. Stores are written in attach order; a
    /// failing store leaves earlier stores committed.
    pub fn commit(&self, changes: &ChangeSet) -> Result<()> {
        let mut batches: BTreeMap<usize, Vec<RowWrite>> = BTreeMap::new();

        for snapshot in changes.inserted.iter().chain(&changes.updated) {
            let (index, key) = self.route(&snapshot.id)?;
            let fields = codec::encode_fields(self.descriptor(snapshot.id.entity())?, &snapshot.fields)?;
            batches.entry(index).or_default().push(RowWrite::Upsert {
                entity: snapshot.id.entity().to_string(),
                key,
                fields,
            });
        }

        for id in &changes.deleted {
            let (index, key) = self.route(id)?;
            batches.entry(index).or_default().push(RowWrite::Delete {
                entity: id.entity().to_string(),
                key,
            });
        }

        for (index, writes) in batches {
            let attached = &self.stores[index];
            attached.lock().apply(&writes)?;
            tracing::debug!("Committed {} writes to store {}", writes.len(), attached.name());
        }
        Ok(())
    }

    fn route(&self, id: &ObjectId) -> Result<(usize, i64)> {
        let key = id
            .key()
            .ok_or_else(|| Error::Validation(format!("{} has no permanent identity", id)))?;
        let index = self
            .stores
            .iter()
            .position(|s| self.schema.configuration_contains(s.configuration.name.as_deref(), id.entity()))
            .ok_or_else(|| Error::Configuration(format!("No attached store holds entity {}", id.entity())))?;
        Ok((index, key))
    }

    /// Row counts of every attached store
    pub fn stats(&self) -> Result<Vec<StoreStats>> {
        self.stores
            .iter()
            .map(|attached| -> Result<StoreStats> {
                Ok(StoreStats {
                    configuration: attached.name().to_string(),
                    location: attached.location.clone(),
                    entities: attached.lock().count_by_entity()?,
                })
            })
            .collect()
    }
}
