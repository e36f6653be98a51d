//! Managed objects - generic handles bound to one context
//!
//! A `ManagedObject` is an entity descriptor, the context that owns it and a
//! slot in that context's state. Fields live in the context; the handle is
//! cheap to clone. Capabilities are split into traits: `Reflectable` for
//! metadata, `Saveable` and `Deletable` for the lifecycle.

use std::fmt;
use std::sync::Arc;
use serde_json::Value;
use crate::codec::{self, Fields};
use crate::context::{Context, ContextState, Slot};
use crate::reflect::{EntityKeys, EntityReflector};
use crate::save::SaveCoordinator;
use crate::schema::{EntityDescriptor, RelationshipDescriptor};
use crate::uri::ObjectId;
use crate::{Error, Result};

/// Entity metadata of an object
pub trait Reflectable {
    fn entity_descriptor(&self) -> &EntityDescriptor;

    fn reflector(&self) -> &EntityReflector;

    fn entity_keys(&self) -> Result<Arc<EntityKeys>> {
        self.reflector().keys(&self.entity_descriptor().name)
    }

    fn attribute_keys(&self) -> Result<Vec<String>> {
        Ok(self.entity_keys()?.attributes.clone())
    }

    fn persisted_attribute_keys(&self) -> Result<Vec<String>> {
        Ok(self.entity_keys()?.persisted_attributes.clone())
    }

    fn transient_attribute_keys(&self) -> Result<Vec<String>> {
        Ok(self.entity_keys()?.transient_attributes.clone())
    }

    fn relationship_keys(&self) -> Result<Vec<String>> {
        Ok(self.entity_keys()?.relationships.clone())
    }

    fn relationship_for_key_path(&self, path: &str) -> Result<RelationshipDescriptor> {
        self.reflector()
            .relationship_for_key_path(&self.entity_descriptor().name, path)
    }
}

/// Things whose pending changes can be pushed up to storage
pub trait Saveable {
    fn save(&self) -> Result<()>;

    fn has_changes(&self) -> Result<bool>;
}

/// Things that can be removed from their context
pub trait Deletable {
    fn delete(&self) -> Result<()>;

    fn is_deleted(&self) -> Result<bool>;
}

/// Handle to one object in one context
#[derive(Clone)]
pub struct ManagedObject {
    context: Context,
    slot: Slot,
    entity: Arc<EntityDescriptor>,
}

impl ManagedObject {
    /// Insert a new object of `entity` into `context`. It carries a
    /// temporary id until saved or materialized.
    pub fn create(context: &Context, entity: &str) -> Result<Self> {
        let descriptor = context.reflector().entity(entity)?;
        let name = descriptor.name.clone();
        let slot = context.perform_and_wait(move |state| state.insert_new(&name))?;
        Ok(Self::from_parts(context.clone(), slot, descriptor))
    }

    pub(crate) fn from_parts(context: Context, slot: Slot, entity: Arc<EntityDescriptor>) -> Self {
        Self { context, slot, entity }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn entity_name(&self) -> &str {
        &self.entity.name
    }

    /// Current id; temporary until the object is materialized or saved
    pub fn id(&self) -> Result<ObjectId> {
        let slot = self.slot;
        self.context.perform(move |state| state.id(slot))
    }

    /// Assign a permanent id now, valid in every context and across restarts
    pub fn materialize_identity(&self) -> Result<ObjectId> {
        SaveCoordinator::obtain_permanent_ids(&self.context, Some(vec![self.slot]))?;
        self.id()
    }

    pub fn is_inserted(&self) -> Result<bool> {
        let slot = self.slot;
        self.context.perform_and_wait(move |state| state.is_inserted(slot))
    }

    /// Snapshot of all fields
    pub fn fields(&self) -> Result<Fields> {
        let slot = self.slot;
        self.context.perform(move |state| state.fields(slot))
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if self.entity.has_key(key) {
            Ok(())
        } else {
            Err(Error::Reflection(format!("{} has no key '{}'", self.entity.name, key)))
        }
    }

    fn relationship(&self, key: &str) -> Result<&RelationshipDescriptor> {
        self.check_key(key)?;
        self.entity.relationship(key).ok_or_else(|| {
            Error::Reflection(format!("'{}' on {} is an attribute, not a relationship", key, self.entity.name))
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_key(key)?;
        let slot = self.slot;
        let key = key.to_string();
        self.context.perform(move |state| state.get(slot, &key))
    }

    /// Set an attribute. Values are checked against the schema on save.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.check_key(key)?;
        if self.entity.relationship(key).is_some() {
            return Err(Error::Reflection(format!(
                "'{}' on {} is a relationship; use set_related or add_related",
                key, self.entity.name
            )));
        }
        let slot = self.slot;
        let key = key.to_string();
        let value = value.into();
        self.context.perform(move |state| state.set(slot, &key, value))
    }

    fn check_target(&self, relationship: &RelationshipDescriptor, target: &ManagedObject) -> Result<()> {
        if !Context::ptr_eq(&self.context, &target.context) {
            return Err(Error::CrossContext {
                object: target.entity.name.clone(),
                context: self.context.name().to_string(),
            });
        }
        if target.entity.name != relationship.destination {
            return Err(Error::Reflection(format!(
                "{}.{} expects {}, got {}",
                self.entity.name, relationship.name, relationship.destination, target.entity.name
            )));
        }
        Ok(())
    }

    /// Inverse side of `relationship`, if the schema declares one
    fn inverse_of(&self, relationship: &RelationshipDescriptor) -> Result<Option<RelationshipDescriptor>> {
        let Some(inverse) = &relationship.inverse else {
            return Ok(None);
        };
        let destination = self.context.reflector().entity(&relationship.destination)?;
        destination
            .relationship(inverse)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                Error::Reflection(format!("{} has no inverse relationship '{}'", destination.name, inverse))
            })
    }

    /// Register the current targets of `key` here so their inverses can be updated
    fn load_targets(&self, key: &str) -> Result<()> {
        if let Some(value) = self.get(key)? {
            for id in codec::reference_targets(&value)? {
                match self.context.object(&id) {
                    Ok(_) | Err(Error::ObjectNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Point a to-one relationship at `target`, or clear it with `None`
    pub fn set_related(&self, key: &str, target: Option<&ManagedObject>) -> Result<()> {
        let relationship = self.relationship(key)?.clone();
        if relationship.to_many {
            return Err(Error::Reflection(format!(
                "{}.{} is to-many; use add_related",
                self.entity.name, key
            )));
        }
        if let Some(target) = target {
            self.check_target(&relationship, target)?;
        }

        let inverse = self.inverse_of(&relationship)?;
        if let Some(inverse) = &inverse {
            self.load_targets(key)?;
            if let Some(target) = target.filter(|_| !inverse.to_many) {
                target.load_targets(&inverse.name)?;
            }
        }

        let source = self.slot;
        let target = target.map(|t| t.slot);
        self.context.perform(move |state| {
            let source_uri = state.id(source)?.to_uri_string();
            let previous = state.get(source, &relationship.name)?;

            let value = match target {
                Some(target) => Value::String(state.id(target)?.to_uri_string()),
                None => Value::Null,
            };
            state.set(source, &relationship.name, value)?;

            if let Some(inverse) = inverse {
                if let Some(previous) = previous {
                    for id in codec::reference_targets(&previous)? {
                        if let Some(old) = state.slot_of(&id) {
                            unlink(state, old, &inverse, &source_uri)?;
                        }
                    }
                }
                if let Some(target) = target {
                    if !inverse.to_many {
                        // One-to-one: the target's previous partner lets go of it
                        let target_uri = state.id(target)?.to_uri_string();
                        release_previous(state, target, &inverse, source, &relationship, &target_uri)?;
                    }
                    link(state, target, &inverse, &source_uri)?;
                }
            }
            Ok(())
        })
    }

    /// Add `target` to a to-many relationship
    pub fn add_related(&self, key: &str, target: &ManagedObject) -> Result<()> {
        let relationship = self.to_many(key)?;
        self.check_target(&relationship, target)?;
        let inverse = self.inverse_of(&relationship)?;
        if let Some(inverse) = inverse.as_ref().filter(|inverse| !inverse.to_many) {
            target.load_targets(&inverse.name)?;
        }

        let (source, target) = (self.slot, target.slot);
        self.context.perform(move |state| {
            let source_uri = state.id(source)?.to_uri_string();
            let target_uri = state.id(target)?.to_uri_string();
            link(state, source, &relationship, &target_uri)?;
            if let Some(inverse) = inverse {
                if !inverse.to_many {
                    // The target leaves whatever collection held it before
                    release_previous(state, target, &inverse, source, &relationship, &target_uri)?;
                }
                link(state, target, &inverse, &source_uri)?;
            }
            Ok(())
        })
    }

    /// Remove `target` from a to-many relationship
    pub fn remove_related(&self, key: &str, target: &ManagedObject) -> Result<()> {
        let relationship = self.to_many(key)?;
        self.check_target(&relationship, target)?;
        let inverse = self.inverse_of(&relationship)?;

        let (source, target) = (self.slot, target.slot);
        self.context.perform(move |state| {
            let source_uri = state.id(source)?.to_uri_string();
            let target_uri = state.id(target)?.to_uri_string();
            unlink(state, source, &relationship, &target_uri)?;
            if let Some(inverse) = inverse {
                unlink(state, target, &inverse, &source_uri)?;
            }
            Ok(())
        })
    }

    fn to_many(&self, key: &str) -> Result<RelationshipDescriptor> {
        let relationship = self.relationship(key)?;
        if !relationship.to_many {
            return Err(Error::Reflection(format!(
                "{}.{} is to-one; use set_related",
                self.entity.name, key
            )));
        }
        Ok(relationship.clone())
    }

    /// Objects a relationship points at, resolved in this object's context
    pub fn related(&self, key: &str) -> Result<Vec<ManagedObject>> {
        self.relationship(key)?;
        let Some(value) = self.get(key)? else {
            return Ok(Vec::new());
        };
        codec::reference_targets(&value)?
            .iter()
            .map(|id| self.context.object(id))
            .collect()
    }

    /// Archive-friendly reference to this object
    pub fn reference(&self) -> Result<String> {
        codec::encode_reference(self)
    }
}

/// Add `uri` to `key` on `slot`: append for to-many, replace for to-one
fn link(state: &mut ContextState, slot: Slot, relationship: &RelationshipDescriptor, uri: &str) -> Result<()> {
    if !relationship.to_many {
        return state.set(slot, &relationship.name, Value::String(uri.to_string()));
    }
    let mut items = match state.get(slot, &relationship.name)? {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    if !items.iter().any(|item| item.as_str() == Some(uri)) {
        items.push(Value::String(uri.to_string()));
        state.set(slot, &relationship.name, Value::Array(items))?;
    }
    Ok(())
}

/// Unlink `target_uri` from whatever `target.inverse` points at, other than `keep`
fn release_previous(
    state: &mut ContextState,
    target: Slot,
    inverse: &RelationshipDescriptor,
    keep: Slot,
    relationship: &RelationshipDescriptor,
    target_uri: &str,
) -> Result<()> {
    let Some(previous) = state.get(target, &inverse.name)? else {
        return Ok(());
    };
    for id in codec::reference_targets(&previous)? {
        if let Some(old) = state.slot_of(&id).filter(|old| *old != keep) {
            unlink(state, old, relationship, target_uri)?;
        }
    }
    Ok(())
}

/// Drop `uri` from `key` on `slot`
fn unlink(state: &mut ContextState, slot: Slot, relationship: &RelationshipDescriptor, uri: &str) -> Result<()> {
    match state.get(slot, &relationship.name)? {
        Some(Value::Array(mut items)) => {
            let before = items.len();
            items.retain(|item| item.as_str() != Some(uri));
            if items.len() != before {
                state.set(slot, &relationship.name, Value::Array(items))?;
            }
            Ok(())
        }
        Some(Value::String(current)) if current == uri => state.set(slot, &relationship.name, Value::Null),
        _ => Ok(()),
    }
}

impl Reflectable for ManagedObject {
    fn entity_descriptor(&self) -> &EntityDescriptor {
        &self.entity
    }

    fn reflector(&self) -> &EntityReflector {
        self.context.reflector()
    }
}

impl Saveable for ManagedObject {
    /// Saves the owning context, this object's siblings included
    fn save(&self) -> Result<()> {
        self.context.save()
    }

    fn has_changes(&self) -> Result<bool> {
        let slot = self.slot;
        self.context.perform_and_wait(move |state| state.is_changed(slot))
    }
}

impl Deletable for ManagedObject {
    fn delete(&self) -> Result<()> {
        let slot = self.slot;
        let reflector = Arc::clone(self.context.reflector());
        self.context.perform(move |state| state.delete(slot, &reflector))
    }

    fn is_deleted(&self) -> Result<bool> {
        let slot = self.slot;
        self.context.perform_and_wait(move |state| state.is_deleted(slot))
    }
}

impl Saveable for Context {
    fn save(&self) -> Result<()> {
        Context::save(self)
    }

    fn has_changes(&self) -> Result<bool> {
        Context::has_changes(self)
    }
}

impl PartialEq for ManagedObject {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.context == other.context
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObject")
            .field("entity", &self.entity.name)
            .field("slot", &self.slot)
            .field("context", &self.context.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MEMORY_STORE_TYPE;
    use crate::schema::Schema;
    use crate::stack::DataStack;
    use crate::stack::tests::{file_stack, memory_stack};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    /// People and desks, one desk per person
    fn desk_stack() -> DataStack {
        let stack = DataStack::new();
        stack
            .set_schema(Schema::new(vec![
                EntityDescriptor::new("Person")
                    .with_relationship(RelationshipDescriptor::to_one("desk", "Desk").with_inverse("owner")),
                EntityDescriptor::new("Desk")
                    .with_relationship(RelationshipDescriptor::to_one("owner", "Person").with_inverse("desk")),
            ]))
            .unwrap();
        stack
            .set_store_configuration(BTreeMap::new(), MEMORY_STORE_TYPE, None, None)
            .unwrap();
        stack
    }

    #[test]
    fn test_create_set_get() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();

        let note = ManagedObject::create(&main, "Note").unwrap();
        assert!(note.id().unwrap().is_temporary());
        assert!(note.is_inserted().unwrap());

        note.set("title", "hello").unwrap();
        assert_eq!(note.get("title").unwrap(), Some(json!("hello")));
        assert_eq!(note.get("body").unwrap(), None);
        assert!(note.has_changes().unwrap());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();

        assert!(matches!(note.set("colour", "red"), Err(Error::Reflection(_))));
        assert!(matches!(note.get("colour"), Err(Error::Reflection(_))));
        // Relationships go through the relationship API
        assert!(matches!(note.set("folder", "x"), Err(Error::Reflection(_))));
        assert!(matches!(ManagedObject::create(&main, "Missing"), Err(Error::Reflection(_))));
    }

    #[test]
    fn test_relationships_maintain_inverse() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();

        let folder = ManagedObject::create(&main, "Folder").unwrap();
        folder.set("name", "inbox").unwrap();
        let a = ManagedObject::create(&main, "Note").unwrap();
        let b = ManagedObject::create(&main, "Note").unwrap();

        a.set_related("folder", Some(&folder)).unwrap();
        folder.add_related("notes", &b).unwrap();

        assert_eq!(folder.related("notes").unwrap(), vec![a.clone(), b.clone()]);
        assert_eq!(b.related("folder").unwrap(), vec![folder.clone()]);

        a.set_related("folder", None).unwrap();
        assert_eq!(folder.related("notes").unwrap(), vec![b.clone()]);
        assert!(a.related("folder").unwrap().is_empty());

        folder.remove_related("notes", &b).unwrap();
        assert!(folder.related("notes").unwrap().is_empty());
        assert!(b.related("folder").unwrap().is_empty());
    }

    #[test]
    fn test_add_related_moves_note_out_of_stored_folder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("folders.db");

        let (inbox_id, note_id) = {
            let stack = file_stack(&path, BTreeMap::new());
            let main = stack.main_context().unwrap();
            let inbox = ManagedObject::create(&main, "Folder").unwrap();
            inbox.set("name", "inbox").unwrap();
            let note = ManagedObject::create(&main, "Note").unwrap();
            note.set("title", "moving").unwrap();
            inbox.add_related("notes", &note).unwrap();
            main.save().unwrap();
            (inbox.id().unwrap(), note.id().unwrap())
        };

        // The inbox is not loaded when the note changes folder
        let archive_id = {
            let stack = file_stack(&path, BTreeMap::new());
            let main = stack.main_context().unwrap();
            let archive = ManagedObject::create(&main, "Folder").unwrap();
            archive.set("name", "archive").unwrap();
            let note = main.object(&note_id).unwrap();
            archive.add_related("notes", &note).unwrap();
            main.save().unwrap();
            archive.id().unwrap()
        };

        let stack = file_stack(&path, BTreeMap::new());
        let main = stack.main_context().unwrap();
        let inbox = main.object(&inbox_id).unwrap();
        let archive = main.object(&archive_id).unwrap();
        let note = main.object(&note_id).unwrap();
        assert!(inbox.related("notes").unwrap().is_empty());
        assert_eq!(archive.related("notes").unwrap(), vec![note.clone()]);
        assert_eq!(note.related("folder").unwrap(), vec![archive]);
    }

    #[test]
    fn test_one_to_one_reassignment_releases_previous_partner() {
        let stack = desk_stack();
        let main = stack.main_context().unwrap();
        let ann = ManagedObject::create(&main, "Person").unwrap();
        let desk = ManagedObject::create(&main, "Desk").unwrap();
        ann.set_related("desk", Some(&desk)).unwrap();
        main.save().unwrap();
        let desk_id = desk.id().unwrap();

        // Ann is not registered in the child context
        let scratch = stack.new_child_context(&main, "scratch");
        let bob = ManagedObject::create(&scratch, "Person").unwrap();
        let desk_here = scratch.object(&desk_id).unwrap();
        bob.set_related("desk", Some(&desk_here)).unwrap();
        assert_eq!(desk_here.related("owner").unwrap(), vec![bob.clone()]);
        scratch.save().unwrap();

        assert_eq!(ann.get("desk").unwrap(), Some(Value::Null));
        let owners = desk.related("owner").unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].id().unwrap(), bob.id().unwrap());
    }

    #[test]
    fn test_relationship_shape_and_destination() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let folder = ManagedObject::create(&main, "Folder").unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();

        assert!(matches!(note.add_related("folder", &folder), Err(Error::Reflection(_))));
        assert!(matches!(folder.set_related("notes", Some(&note)), Err(Error::Reflection(_))));
        assert!(matches!(note.set_related("folder", Some(&note)), Err(Error::Reflection(_))));
    }

    #[test]
    fn test_cross_context_relation_fails() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let scratch = stack.new_child_context(&main, "scratch");

        let folder = ManagedObject::create(&scratch, "Folder").unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();
        assert!(matches!(
            note.set_related("folder", Some(&folder)),
            Err(Error::CrossContext { .. })
        ));
    }

    #[test]
    fn test_delete_nullifies_references() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let folder = ManagedObject::create(&main, "Folder").unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();
        note.set_related("folder", Some(&folder)).unwrap();

        folder.delete().unwrap();
        assert!(folder.is_deleted().unwrap());
        assert_eq!(note.get("folder").unwrap(), Some(Value::Null));
        assert!(matches!(folder.get("name"), Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_materialize_identity_and_reference() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();
        let temporary = note.id().unwrap();

        let permanent = note.materialize_identity().unwrap();
        assert!(!permanent.is_temporary());
        assert_eq!(note.id().unwrap(), permanent);
        // Materializing twice keeps the id
        assert_eq!(note.materialize_identity().unwrap(), permanent);
        assert!(matches!(main.object(&temporary), Err(Error::ObjectNotFound(_))));

        let uri = note.reference().unwrap();
        assert_eq!(uri, permanent.to_uri_string());
        assert_eq!(codec::decode_reference(&main, &uri).unwrap(), note);
    }

    #[test]
    fn test_reflectable_keys() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();

        assert_eq!(note.transient_attribute_keys().unwrap(), vec!["cursor".to_string()]);
        assert_eq!(note.relationship_keys().unwrap(), vec!["folder".to_string()]);
        assert_eq!(note.relationship_for_key_path("folder").unwrap().destination, "Folder");
        assert!(note.relationship_for_key_path("title").is_err());
    }
}
