//! Field codec - descriptor-driven (de)serialization of object fields
//!
//! Only keys the entity descriptor declares as persisted attributes or
//! relationships cross the storage boundary. Relationship values are object
//! URIs: a string for to-one, an array of strings for to-many.

use std::collections::BTreeMap;
use serde_json::{Map, Value};
use crate::context::Context;
use crate::object::ManagedObject;
use crate::schema::EntityDescriptor;
use crate::uri::ObjectId;
use crate::{Error, Result};

/// Field storage of one object
pub type Fields = BTreeMap<String, Value>;

/// Keep only the keys a store persists for this entity
pub fn persisted_fields(entity: &EntityDescriptor, fields: &Fields) -> Fields {
    fields
        .iter()
        .filter(|(key, _)| {
            entity.attribute(key).is_some_and(|a| !a.transient) || entity.relationship(key).is_some()
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Encode an object's persisted fields as the JSON text stored in a row
pub fn encode_fields(entity: &EntityDescriptor, fields: &Fields) -> Result<String> {
    let map: Map<String, Value> = persisted_fields(entity, fields).into_iter().collect();
    Ok(serde_json::to_string(&Value::Object(map))?)
}

/// Decode a stored row, dropping keys the descriptor no longer declares
pub fn decode_fields(entity: &EntityDescriptor, text: &str) -> Result<Fields> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => {
            let fields: Fields = map.into_iter().collect();
            Ok(persisted_fields(entity, &fields))
        }
        other => Err(Error::Validation(format!(
            "Stored fields for {} are not an object: {}",
            entity.name, other
        ))),
    }
}

/// Object ids referenced by a relationship value
pub fn reference_targets(value: &Value) -> Result<Vec<ObjectId>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(uri) => Ok(vec![ObjectId::parse(uri)?]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(uri) => ObjectId::parse(uri),
                other => Err(Error::InvalidUri(format!("Expected object URI, found {}", other))),
            })
            .collect(),
        other => Err(Error::InvalidUri(format!("Expected object URI, found {}", other))),
    }
}

/// Replace references to `from` with `to` in every relationship of `fields`.
/// Returns whether anything changed.
pub fn rewrite_references(entity: &EntityDescriptor, fields: &mut Fields, from: &ObjectId, to: &ObjectId) -> bool {
    let from_uri = from.to_uri_string();
    let to_uri = to.to_uri_string();
    let mut changed = false;

    for rel in &entity.relationships {
        let Some(value) = fields.get_mut(&rel.name) else {
            continue;
        };
        match value {
            Value::String(uri) if *uri == from_uri => {
                *uri = to_uri.clone();
                changed = true;
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if item.as_str() == Some(from_uri.as_str()) {
                        *item = Value::String(to_uri.clone());
                        changed = true;
                    }
                }
            }
            _ => {}
        }
    }

    changed
}

/// Drop references to `target` from every relationship of `fields`
pub fn remove_references(entity: &EntityDescriptor, fields: &mut Fields, target: &ObjectId) -> bool {
    let target_uri = target.to_uri_string();
    let mut changed = false;

    for rel in &entity.relationships {
        let Some(value) = fields.get_mut(&rel.name) else {
            continue;
        };
        if value.as_str() == Some(target_uri.as_str()) {
            *value = Value::Null;
            changed = true;
        } else if let Value::Array(items) = value {
            let before = items.len();
            items.retain(|item| item.as_str() != Some(target_uri.as_str()));
            changed |= items.len() != before;
        }
    }

    changed
}

/// Archive a reference to an object as its permanent URI
pub fn encode_reference(object: &ManagedObject) -> Result<String> {
    Ok(object.materialize_identity()?.to_uri_string())
}

/// Resolve an archived reference in `context`
pub fn decode_reference(context: &Context, uri: &str) -> Result<ManagedObject> {
    let id = ObjectId::parse(uri)?;
    context.object(&id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeDescriptor, AttributeType, RelationshipDescriptor};
    use serde_json::json;

    fn note() -> EntityDescriptor {
        EntityDescriptor::new("Note")
            .with_attribute(AttributeDescriptor::new("title", AttributeType::String))
            .with_attribute(AttributeDescriptor::new("cursor", AttributeType::Integer).transient())
            .with_relationship(RelationshipDescriptor::to_one("folder", "Folder"))
            .with_relationship(RelationshipDescriptor::to_many("tags", "Tag"))
    }

    #[test]
    fn test_encode_skips_transient_and_unknown() {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!("hello"));
        fields.insert("cursor".into(), json!(4));
        fields.insert("stale".into(), json!(true));
        fields.insert("folder".into(), json!("ctxstore://Folder/p1"));

        let text = encode_fields(&note(), &fields).unwrap();
        let decoded: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, json!({"folder": "ctxstore://Folder/p1", "title": "hello"}));
    }

    #[test]
    fn test_decode_drops_removed_keys() {
        let fields = decode_fields(&note(), r#"{"title": "a", "color": "red"}"#).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["title"], json!("a"));
        assert!(decode_fields(&note(), "[1, 2]").is_err());
    }

    #[test]
    fn test_reference_targets() {
        assert!(reference_targets(&Value::Null).unwrap().is_empty());
        let ids = reference_targets(&json!(["ctxstore://Tag/p1", "ctxstore://Tag/p2"])).unwrap();
        assert_eq!(ids, vec![ObjectId::permanent("Tag", 1), ObjectId::permanent("Tag", 2)]);
        assert!(reference_targets(&json!(5)).is_err());
    }

    #[test]
    fn test_rewrite_and_remove_references() {
        let entity = note();
        let temp = ObjectId::Temporary { entity: "Tag".into(), serial: 9 };
        let perm = ObjectId::permanent("Tag", 3);

        let mut fields = Fields::new();
        fields.insert("tags".into(), json!([temp.to_uri_string(), "ctxstore://Tag/p1"]));
        assert!(rewrite_references(&entity, &mut fields, &temp, &perm));
        assert_eq!(fields["tags"], json!(["ctxstore://Tag/p3", "ctxstore://Tag/p1"]));
        assert!(!rewrite_references(&entity, &mut fields, &temp, &perm));

        assert!(remove_references(&entity, &mut fields, &perm));
        assert_eq!(fields["tags"], json!(["ctxstore://Tag/p1"]));
    }
}
