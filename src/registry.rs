//! Store configuration registry
//!
//! Maps configuration names to the type, location and options of the store
//! that holds them. The unnamed (default) entry is a fallback that only
//! exists while no named entry does.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::{Error, Result};

/// Store type backed by a SQLite file at the configured location
pub const SQLITE_STORE_TYPE: &str = "sqlite";
/// Store type backed by an in-memory SQLite database
pub const MEMORY_STORE_TYPE: &str = "memory";

/// One registered store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfiguration {
    /// `None` for the default configuration
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub store_type: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl StoreConfiguration {
    /// Name used in logs and errors
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<default>")
    }
}

/// Named mapping of configurations to stores.
#[derive(Debug, Clone, Default)]
pub struct StoreConfigurationRegistry {
    default: Option<StoreConfiguration>,
    named: BTreeMap<String, StoreConfiguration>,
}

impl StoreConfigurationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or replace the store for `name` (`None` = default).
    ///
    /// A default entry can only be set while no named entry exists. Setting a
    /// named entry removes the default.
    pub fn set(
        &mut self,
        options: BTreeMap<String, Value>,
        store_type: &str,
        location: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        if store_type.trim().is_empty() {
            return Err(Error::Configuration("Store type is required".to_string()));
        }

        let configuration = StoreConfiguration {
            name: name.map(str::to_string),
            store_type: store_type.to_string(),
            location: location.map(str::to_string),
            options,
        };

        match name {
            None => {
                if !self.named.is_empty() {
                    return Err(Error::Configuration(format!(
                        "Cannot set a default store while named configurations exist ({})",
                        self.named.keys().cloned().collect::<Vec<_>>().join(", ")
                    )));
                }
                self.default = Some(configuration);
            }
            Some("") => {
                return Err(Error::Configuration("Configuration name cannot be empty".to_string()));
            }
            Some(name) => {
                if self.default.take().is_some() {
                    tracing::debug!("Named configuration {} replaces the default store", name);
                }
                self.named.insert(name.to_string(), configuration);
            }
        }

        Ok(())
    }

    /// Remove the entry for `name` (`None` = default). Attached stores are unaffected.
    pub fn remove(&mut self, name: Option<&str>) -> Option<StoreConfiguration> {
        match name {
            None => self.default.take(),
            Some(name) => self.named.remove(name),
        }
    }

    pub fn get(&self, name: Option<&str>) -> Option<&StoreConfiguration> {
        match name {
            None => self.default.as_ref(),
            Some(name) => self.named.get(name),
        }
    }

    /// All entries, default first, then named entries in name order
    pub fn iter(&self) -> impl Iterator<Item = &StoreConfiguration> {
        self.default.iter().chain(self.named.values())
    }

    pub fn len(&self) -> usize {
        self.default.iter().count() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.named.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_is_required() {
        let mut registry = StoreConfigurationRegistry::new();
        let err = registry.set(BTreeMap::new(), "", Some("a.db"), None).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_default_can_be_overwritten() {
        let mut registry = StoreConfigurationRegistry::new();
        registry.set(BTreeMap::new(), "sqlite", Some("a.db"), None).unwrap();
        registry.set(BTreeMap::new(), "sqlite", Some("b.db"), None).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(None).unwrap().location.as_deref(), Some("b.db"));
    }

    #[test]
    fn test_named_entry_removes_default() {
        let mut registry = StoreConfigurationRegistry::new();
        registry.set(BTreeMap::new(), "sqlite", Some("default.db"), None).unwrap();
        registry.set(BTreeMap::new(), "sqlite", Some("a.db"), Some("A")).unwrap();

        assert!(registry.get(None).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(Some("A")).unwrap().display_name(), "A");
    }

    #[test]
    fn test_default_rejected_while_named_exists() {
        let mut registry = StoreConfigurationRegistry::new();
        registry.set(BTreeMap::new(), "sqlite", Some("a.db"), Some("A")).unwrap();
        let err = registry.set(BTreeMap::new(), "sqlite", Some("d.db"), None).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        // Once the named entry is gone the default is allowed again
        registry.remove(Some("A"));
        registry.set(BTreeMap::new(), "sqlite", Some("d.db"), None).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_iter_order_and_options() {
        let mut registry = StoreConfigurationRegistry::new();
        let mut options = BTreeMap::new();
        options.insert("journal_mode".to_string(), json!("wal"));
        registry.set(options, "sqlite", Some("b.db"), Some("b")).unwrap();
        registry.set(BTreeMap::new(), "memory", None, Some("a")).unwrap();

        let names: Vec<_> = registry.iter().map(|c| c.display_name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.get(Some("b")).unwrap().options["journal_mode"], json!("wal"));
        assert!(registry.remove(Some("missing")).is_none());
    }
}
