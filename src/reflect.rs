//! Entity reflection - cached key sets and relationship key paths

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use crate::schema::{EntityDescriptor, RelationshipDescriptor, Schema, SortKey};
use crate::{Error, Result};

/// Key sets derived from one entity descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKeys {
    pub attributes: Vec<String>,
    pub persisted_attributes: Vec<String>,
    pub transient_attributes: Vec<String>,
    pub relationships: Vec<String>,
}

impl EntityKeys {
    fn derive(entity: &EntityDescriptor) -> Self {
        let attributes = entity.attributes.iter().map(|a| a.name.clone()).collect();
        let persisted_attributes = entity
            .attributes
            .iter()
            .filter(|a| !a.transient)
            .map(|a| a.name.clone())
            .collect();
        let transient_attributes = entity
            .attributes
            .iter()
            .filter(|a| a.transient)
            .map(|a| a.name.clone())
            .collect();
        let relationships = entity.relationships.iter().map(|r| r.name.clone()).collect();

        Self {
            attributes,
            persisted_attributes,
            transient_attributes,
            relationships,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntity {
    descriptor: Arc<EntityDescriptor>,
    keys: Arc<EntityKeys>,
}

/// Derives entity metadata from a schema and caches it per entity.
///
/// The first lookup of an entity builds its descriptor handle and key sets;
/// later lookups return the same `Arc`s for as long as the reflector lives.
#[derive(Debug)]
pub struct EntityReflector {
    schema: Arc<Schema>,
    cache: RwLock<HashMap<String, CachedEntity>>,
}

impl EntityReflector {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn cached(&self, entity: &str) -> Result<CachedEntity> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
        {
            return Ok(hit.clone());
        }

        let descriptor = self
            .schema
            .entity(entity)
            .ok_or_else(|| Error::Reflection(format!("Unknown entity: {}", entity)))?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.entry(entity.to_string()).or_insert_with(|| {
            tracing::debug!("Caching descriptor for entity {}", entity);
            CachedEntity {
                descriptor: Arc::new(descriptor.clone()),
                keys: Arc::new(EntityKeys::derive(descriptor)),
            }
        });
        Ok(entry.clone())
    }

    /// Descriptor for an entity
    pub fn entity(&self, entity: &str) -> Result<Arc<EntityDescriptor>> {
        Ok(self.cached(entity)?.descriptor)
    }

    /// All derived key sets for an entity
    pub fn keys(&self, entity: &str) -> Result<Arc<EntityKeys>> {
        Ok(self.cached(entity)?.keys)
    }

    pub fn attribute_keys(&self, entity: &str) -> Result<Vec<String>> {
        Ok(self.keys(entity)?.attributes.clone())
    }

    pub fn persisted_attribute_keys(&self, entity: &str) -> Result<Vec<String>> {
        Ok(self.keys(entity)?.persisted_attributes.clone())
    }

    pub fn transient_attribute_keys(&self, entity: &str) -> Result<Vec<String>> {
        Ok(self.keys(entity)?.transient_attributes.clone())
    }

    pub fn relationship_keys(&self, entity: &str) -> Result<Vec<String>> {
        Ok(self.keys(entity)?.relationships.clone())
    }

    pub fn default_ordering(&self, entity: &str) -> Result<Vec<SortKey>> {
        Ok(self.entity(entity)?.default_ordering.clone())
    }

    /// Resolve a dot-separated relationship path such as `folder.owner`.
    ///
    /// Every segment must name a relationship on the entity reached by the
    /// segments before it. Returns the descriptor of the last segment.
    pub fn relationship_for_key_path(&self, entity: &str, path: &str) -> Result<RelationshipDescriptor> {
        if path.is_empty() {
            return Err(Error::Reflection(format!("Empty key path on {}", entity)));
        }

        let mut current = self.entity(entity)?;
        let mut segments = path.split('.').peekable();

        while let Some(segment) = segments.next() {
            let relationship = match current.relationship(segment) {
                Some(rel) => rel.clone(),
                None if current.attribute(segment).is_some() => {
                    return Err(Error::Reflection(format!(
                        "'{}' in key path '{}' is an attribute of {}, not a relationship",
                        segment, path, current.name
                    )));
                }
                None => {
                    return Err(Error::Reflection(format!(
                        "Unknown key '{}' in key path '{}' on {}",
                        segment, path, current.name
                    )));
                }
            };

            if segments.peek().is_none() {
                return Ok(relationship);
            }
            current = self.entity(&relationship.destination)?;
        }

        // `split` always yields at least one segment
        Err(Error::Reflection(format!("Empty key path on {}", entity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeDescriptor, AttributeType, RelationshipDescriptor};

    fn reflector() -> EntityReflector {
        let schema = Schema::new(vec![
            EntityDescriptor::new("Person")
                .with_attribute(AttributeDescriptor::new("name", AttributeType::String))
                .with_relationship(RelationshipDescriptor::to_many("folders", "Folder")),
            EntityDescriptor::new("Folder")
                .with_attribute(AttributeDescriptor::new("name", AttributeType::String))
                .with_relationship(RelationshipDescriptor::to_one("owner", "Person"))
                .with_relationship(RelationshipDescriptor::to_many("notes", "Note")),
            EntityDescriptor::new("Note")
                .with_attribute(AttributeDescriptor::new("title", AttributeType::String))
                .with_attribute(AttributeDescriptor::new("draft", AttributeType::Json).transient())
                .with_relationship(RelationshipDescriptor::to_one("folder", "Folder")),
        ]);
        EntityReflector::new(Arc::new(schema))
    }

    #[test]
    fn test_key_sets() {
        let r = reflector();
        assert_eq!(r.attribute_keys("Note").unwrap(), vec!["title", "draft"]);
        assert_eq!(r.persisted_attribute_keys("Note").unwrap(), vec!["title"]);
        assert_eq!(r.transient_attribute_keys("Note").unwrap(), vec!["draft"]);
        assert_eq!(r.relationship_keys("Note").unwrap(), vec!["folder"]);
    }

    #[test]
    fn test_descriptor_is_cached() {
        let r = reflector();
        let a = r.entity("Note").unwrap();
        let b = r.entity("Note").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&r.keys("Note").unwrap(), &r.keys("Note").unwrap()));
    }

    #[test]
    fn test_unknown_entity() {
        assert!(matches!(reflector().attribute_keys("Tag"), Err(Error::Reflection(_))));
    }

    #[test]
    fn test_key_path_through_to_one() {
        let r = reflector();
        let rel = r.relationship_for_key_path("Note", "folder.owner").unwrap();
        assert_eq!(rel.name, "owner");
        assert_eq!(rel.destination, "Person");

        let rel = r.relationship_for_key_path("Note", "folder").unwrap();
        assert_eq!(rel.destination, "Folder");
    }

    #[test]
    fn test_key_path_through_to_many() {
        let rel = reflector().relationship_for_key_path("Person", "folders.notes").unwrap();
        assert!(rel.to_many);
        assert_eq!(rel.destination, "Note");
    }

    #[test]
    fn test_key_path_errors() {
        let r = reflector();
        assert!(matches!(r.relationship_for_key_path("Note", "folder.name"), Err(Error::Reflection(_))));
        assert!(matches!(r.relationship_for_key_path("Note", "title.owner"), Err(Error::Reflection(_))));
        assert!(matches!(r.relationship_for_key_path("Note", "folder.missing"), Err(Error::Reflection(_))));
        assert!(matches!(r.relationship_for_key_path("Note", ""), Err(Error::Reflection(_))));
        assert!(matches!(r.relationship_for_key_path("Note", "folder..owner"), Err(Error::Reflection(_))));
    }
}
