//! Per-context object state and change tracking

use std::collections::{BTreeMap, HashMap};
use serde::Serialize;
use serde_json::Value;
use crate::codec::{self, Fields};
use crate::reflect::EntityReflector;
use crate::uri::ObjectId;
use crate::{Error, Result};

/// Context-local handle to a registered object. Stable across re-keying.
pub type Slot = u64;

/// Fields of one object at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub fields: Fields,
}

/// Changes handed from a context to its parent or to storage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub inserted: Vec<ObjectSnapshot>,
    pub updated: Vec<ObjectSnapshot>,
    pub deleted: Vec<ObjectId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Clean,
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
struct Record {
    id: ObjectId,
    fields: Fields,
    status: Status,
}

/// Objects registered in one context and their pending changes.
///
/// Only the context's own execution domain touches this state.
#[derive(Debug, Default)]
pub struct ContextState {
    records: HashMap<Slot, Record>,
    slots: HashMap<ObjectId, Slot>,
    next_slot: Slot,
}

impl ContextState {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_slot(&mut self) -> Slot {
        self.next_slot += 1;
        self.next_slot
    }

    /// Register a brand new object under a temporary id
    pub fn insert_new(&mut self, entity: &str) -> Slot {
        let id = ObjectId::temporary(entity);
        let slot = self.allocate_slot();
        self.slots.insert(id.clone(), slot);
        self.records.insert(slot, Record { id, fields: Fields::new(), status: Status::Inserted });
        slot
    }

    /// Register a clean object loaded from further up the chain.
    /// Returns the existing slot when the id is already registered.
    pub fn register(&mut self, snapshot: ObjectSnapshot) -> Slot {
        if let Some(slot) = self.slots.get(&snapshot.id) {
            return *slot;
        }
        let slot = self.allocate_slot();
        self.slots.insert(snapshot.id.clone(), slot);
        self.records.insert(
            slot,
            Record { id: snapshot.id, fields: snapshot.fields, status: Status::Clean },
        );
        slot
    }

    pub fn slot_of(&self, id: &ObjectId) -> Option<Slot> {
        self.slots.get(id).copied()
    }

    /// Lookup result for `id`: `Some(None)` when deleted here, `None` when unknown
    pub fn snapshot(&self, id: &ObjectId) -> Option<Option<ObjectSnapshot>> {
        let record = self.slots.get(id).and_then(|slot| self.records.get(slot))?;
        if record.status == Status::Deleted {
            return Some(None);
        }
        Some(Some(ObjectSnapshot { id: record.id.clone(), fields: record.fields.clone() }))
    }

    fn live(&self, slot: Slot) -> Result<&Record> {
        match self.records.get(&slot) {
            Some(record) if record.status != Status::Deleted => Ok(record),
            Some(record) => Err(Error::ObjectNotFound(format!("{} has been deleted", record.id))),
            None => Err(Error::ObjectNotFound(format!("slot {} is no longer registered", slot))),
        }
    }

    fn live_mut(&mut self, slot: Slot) -> Result<&mut Record> {
        match self.records.get_mut(&slot) {
            Some(record) if record.status != Status::Deleted => Ok(record),
            Some(record) => Err(Error::ObjectNotFound(format!("{} has been deleted", record.id))),
            None => Err(Error::ObjectNotFound(format!("slot {} is no longer registered", slot))),
        }
    }

    pub fn id(&self, slot: Slot) -> Result<ObjectId> {
        match self.records.get(&slot) {
            Some(record) => Ok(record.id.clone()),
            None => Err(Error::ObjectNotFound(format!("slot {} is no longer registered", slot))),
        }
    }

    pub fn get(&self, slot: Slot, key: &str) -> Result<Option<Value>> {
        Ok(self.live(slot)?.fields.get(key).cloned())
    }

    pub fn fields(&self, slot: Slot) -> Result<Fields> {
        Ok(self.live(slot)?.fields.clone())
    }

    pub fn set(&mut self, slot: Slot, key: &str, value: Value) -> Result<()> {
        let record = self.live_mut(slot)?;
        if record.fields.get(key) == Some(&value) {
            return Ok(());
        }
        record.fields.insert(key.to_string(), value);
        if record.status == Status::Clean {
            record.status = Status::Updated;
        }
        Ok(())
    }

    /// Mark an object deleted and drop references to it from every other
    /// object registered here. Objects never saved anywhere simply vanish.
    pub fn delete(&mut self, slot: Slot, reflector: &EntityReflector) -> Result<()> {
        let record = self.live(slot)?;
        let id = record.id.clone();

        if record.status == Status::Inserted {
            self.records.remove(&slot);
            self.slots.remove(&id);
        } else if let Some(record) = self.records.get_mut(&slot) {
            record.status = Status::Deleted;
        }

        for record in self.records.values_mut() {
            if record.status == Status::Deleted {
                continue;
            }
            let entity = reflector.entity(record.id.entity())?;
            if codec::remove_references(&entity, &mut record.fields, &id) && record.status == Status::Clean {
                record.status = Status::Updated;
            }
        }
        Ok(())
    }

    pub fn is_inserted(&self, slot: Slot) -> bool {
        self.records.get(&slot).is_some_and(|r| r.status == Status::Inserted)
    }

    /// Deleted here, or dropped entirely
    pub fn is_deleted(&self, slot: Slot) -> bool {
        self.records.get(&slot).is_none_or(|r| r.status == Status::Deleted)
    }

    pub fn is_changed(&self, slot: Slot) -> bool {
        self.records.get(&slot).is_some_and(|r| r.status != Status::Clean)
    }

    pub fn has_changes(&self) -> bool {
        self.records.values().any(|r| r.status != Status::Clean)
    }

    /// Inserted objects still carrying temporary ids, optionally limited to `only`
    pub fn temporary_slots(&self, only: Option<&[Slot]>) -> Vec<(Slot, String)> {
        let mut slots: Vec<_> = self
            .records
            .iter()
            .filter(|(slot, record)| {
                record.id.is_temporary()
                    && record.status != Status::Deleted
                    && only.is_none_or(|only| only.contains(*slot))
            })
            .map(|(slot, record)| (*slot, record.id.entity().to_string()))
            .collect();
        slots.sort_unstable();
        slots
    }

    /// Give a registered object a new id and rewrite references to it
    pub fn rekey(&mut self, slot: Slot, new_id: ObjectId, reflector: &EntityReflector) -> Result<()> {
        let old_id = self.id(slot)?;
        if old_id == new_id {
            return Ok(());
        }

        self.slots.remove(&old_id);
        self.slots.insert(new_id.clone(), slot);
        if let Some(record) = self.records.get_mut(&slot) {
            record.id = new_id.clone();
        }

        for record in self.records.values_mut() {
            let entity = reflector.entity(record.id.entity())?;
            codec::rewrite_references(&entity, &mut record.fields, &old_id, &new_id);
        }
        Ok(())
    }

    /// Snapshot of every pending change
    pub fn pending_changes(&self) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let mut records: Vec<_> = self.records.values().filter(|r| r.status != Status::Clean).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        for record in records {
            let snapshot = || ObjectSnapshot { id: record.id.clone(), fields: record.fields.clone() };
            match record.status {
                Status::Inserted => changes.inserted.push(snapshot()),
                Status::Updated => changes.updated.push(snapshot()),
                Status::Deleted => changes.deleted.push(record.id.clone()),
                Status::Clean => {}
            }
        }
        changes
    }

    /// Treat every pending change as committed
    pub fn mark_clean(&mut self) {
        let deleted: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| r.status == Status::Deleted)
            .map(|(slot, r)| (*slot, r.id.clone()))
            .collect();
        for (slot, id) in deleted {
            self.records.remove(&slot);
            self.slots.remove(&id);
        }
        for record in self.records.values_mut() {
            record.status = Status::Clean;
        }
    }

    /// Fold a child's changes into this context as pending changes
    pub fn merge(&mut self, changes: ChangeSet) {
        for snapshot in changes.inserted {
            match self.slots.get(&snapshot.id).and_then(|slot| self.records.get_mut(slot)) {
                Some(record) => {
                    record.fields = snapshot.fields;
                    record.status = Status::Inserted;
                }
                None => {
                    let slot = self.allocate_slot();
                    self.slots.insert(snapshot.id.clone(), slot);
                    self.records.insert(
                        slot,
                        Record { id: snapshot.id, fields: snapshot.fields, status: Status::Inserted },
                    );
                }
            }
        }

        for snapshot in changes.updated {
            match self.slots.get(&snapshot.id).and_then(|slot| self.records.get_mut(slot)) {
                Some(record) => {
                    record.fields = snapshot.fields;
                    if record.status != Status::Inserted {
                        record.status = Status::Updated;
                    }
                }
                None => {
                    let slot = self.allocate_slot();
                    self.slots.insert(snapshot.id.clone(), slot);
                    self.records.insert(
                        slot,
                        Record { id: snapshot.id, fields: snapshot.fields, status: Status::Updated },
                    );
                }
            }
        }

        for id in changes.deleted {
            match self.slots.get(&id).copied() {
                Some(slot) if self.records.get(&slot).is_some_and(|r| r.status == Status::Inserted) => {
                    self.records.remove(&slot);
                    self.slots.remove(&id);
                }
                Some(slot) => {
                    if let Some(record) = self.records.get_mut(&slot) {
                        record.status = Status::Deleted;
                    }
                }
                None => {
                    let slot = self.allocate_slot();
                    self.slots.insert(id.clone(), slot);
                    self.records.insert(slot, Record { id, fields: Fields::new(), status: Status::Deleted });
                }
            }
        }
    }

    /// Apply this context's view of `entity` on top of its parent's view
    pub fn overlay(&self, entity: &str, base: Vec<ObjectSnapshot>) -> Vec<ObjectSnapshot> {
        let mut view = Vec::with_capacity(base.len());
        for snapshot in base {
            match self.snapshot(&snapshot.id) {
                Some(Some(own)) => view.push(own),
                Some(None) => {}
                None => view.push(snapshot),
            }
        }

        let mut inserted: Vec<_> = self
            .records
            .values()
            .filter(|r| r.status == Status::Inserted && r.id.entity() == entity)
            .filter(|r| !view.iter().any(|s| s.id == r.id))
            .map(|r| ObjectSnapshot { id: r.id.clone(), fields: r.fields.clone() })
            .collect();
        inserted.sort_by(|a, b| a.id.cmp(&b.id));
        view.extend(inserted);
        view
    }

    /// Drop pending changes. Returns ids whose last committed state must be
    /// reloaded from further up the chain.
    pub fn discard_changes(&mut self) -> Vec<(Slot, ObjectId)> {
        let inserted: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| r.status == Status::Inserted)
            .map(|(slot, r)| (*slot, r.id.clone()))
            .collect();
        for (slot, id) in inserted {
            self.records.remove(&slot);
            self.slots.remove(&id);
        }

        let mut stale: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| matches!(r.status, Status::Updated | Status::Deleted))
            .map(|(slot, r)| (*slot, r.id.clone()))
            .collect();
        stale.sort_unstable();
        stale
    }

    /// Reset a registered object to a reloaded snapshot, or drop it when the
    /// object no longer exists further up the chain
    pub fn restore(&mut self, slot: Slot, snapshot: Option<ObjectSnapshot>) {
        match snapshot {
            Some(snapshot) => {
                if let Some(record) = self.records.get_mut(&slot) {
                    record.fields = snapshot.fields;
                    record.status = Status::Clean;
                }
            }
            None => {
                if let Some(record) = self.records.remove(&slot) {
                    self.slots.remove(&record.id);
                }
            }
        }
    }

    /// Check pending inserts and updates against the schema
    pub fn validate(&self, reflector: &EntityReflector) -> Result<()> {
        let mut pending: Vec<_> = self
            .records
            .values()
            .filter(|r| matches!(r.status, Status::Inserted | Status::Updated))
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));

        for record in pending {
            validate_fields(reflector, &record.id, &record.fields)?;
        }
        Ok(())
    }

    /// Number of registered objects, deleted ones included
    pub fn registered_count(&self) -> usize {
        self.records.len()
    }
}

/// Validate one object's fields against its entity descriptor
pub fn validate_fields(reflector: &EntityReflector, id: &ObjectId, fields: &Fields) -> Result<()> {
    let entity = reflector.entity(id.entity())?;

    for key in fields.keys() {
        if !entity.has_key(key) {
            return Err(Error::Validation(format!("{}: unknown key '{}'", id, key)));
        }
    }

    for attribute in &entity.attributes {
        match fields.get(&attribute.name) {
            None | Some(Value::Null) => {
                if !attribute.optional {
                    return Err(Error::Validation(format!(
                        "{}: required attribute '{}' is missing",
                        id, attribute.name
                    )));
                }
            }
            Some(value) => {
                if !attribute.attribute_type.accepts(value) {
                    return Err(Error::Validation(format!(
                        "{}: attribute '{}' expects {}, found {}",
                        id, attribute.name, attribute.attribute_type, value
                    )));
                }
            }
        }
    }

    for relationship in &entity.relationships {
        let value = fields.get(&relationship.name).unwrap_or(&Value::Null);
        let shape_ok = match value {
            Value::Null => true,
            Value::String(_) => !relationship.to_many,
            Value::Array(_) => relationship.to_many,
            _ => false,
        };
        if !shape_ok {
            return Err(Error::Validation(format!(
                "{}: relationship '{}' has malformed value {}",
                id, relationship.name, value
            )));
        }

        let targets = codec::reference_targets(value)
            .map_err(|e| Error::Validation(format!("{}: relationship '{}': {}", id, relationship.name, e)))?;
        if targets.is_empty() && !relationship.optional {
            return Err(Error::Validation(format!(
                "{}: required relationship '{}' is empty",
                id, relationship.name
            )));
        }
        for target in targets {
            if target.entity() != relationship.destination {
                return Err(Error::Validation(format!(
                    "{}: relationship '{}' points at {} instead of {}",
                    id, relationship.name, target, relationship.destination
                )));
            }
        }
    }

    Ok(())
}

/// Group entity names by how many temporary objects each has
pub fn count_by_entity(slots: &[(Slot, String)]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for (_, entity) in slots {
        *counts.entry(entity.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeDescriptor, AttributeType, EntityDescriptor, RelationshipDescriptor, Schema};
    use serde_json::json;
    use std::sync::Arc;

    fn reflector() -> EntityReflector {
        EntityReflector::new(Arc::new(Schema::new(vec![
            EntityDescriptor::new("Folder")
                .with_attribute(AttributeDescriptor::new("name", AttributeType::String).required())
                .with_relationship(RelationshipDescriptor::to_many("notes", "Note")),
            EntityDescriptor::new("Note")
                .with_attribute(AttributeDescriptor::new("title", AttributeType::String))
                .with_relationship(RelationshipDescriptor::to_one("folder", "Folder")),
        ])))
    }

    fn clean(state: &mut ContextState, entity: &str, key: i64, fields: Fields) -> Slot {
        state.register(ObjectSnapshot { id: ObjectId::permanent(entity, key), fields })
    }

    #[test]
    fn test_insert_set_and_pending() {
        let mut state = ContextState::new();
        let slot = state.insert_new("Note");
        state.set(slot, "title", json!("hello")).unwrap();

        let changes = state.pending_changes();
        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.inserted[0].fields["title"], json!("hello"));
        assert!(state.has_changes());

        state.mark_clean();
        assert!(!state.has_changes());
        assert_eq!(state.get(slot, "title").unwrap(), Some(json!("hello")));
    }

    #[test]
    fn test_set_same_value_keeps_clean() {
        let mut state = ContextState::new();
        let mut fields = Fields::new();
        fields.insert("title".into(), json!("a"));
        let slot = clean(&mut state, "Note", 1, fields);

        state.set(slot, "title", json!("a")).unwrap();
        assert!(!state.has_changes());
        state.set(slot, "title", json!("b")).unwrap();
        assert_eq!(state.pending_changes().updated.len(), 1);
    }

    #[test]
    fn test_delete_unsaved_object_vanishes() {
        let r = reflector();
        let mut state = ContextState::new();
        let slot = state.insert_new("Note");
        state.delete(slot, &r).unwrap();
        assert!(state.is_deleted(slot));
        assert!(state.pending_changes().is_empty());
        assert!(state.get(slot, "title").is_err());
    }

    #[test]
    fn test_delete_nullifies_references() {
        let r = reflector();
        let mut state = ContextState::new();
        let folder = clean(&mut state, "Folder", 1, Fields::new());
        let mut note_fields = Fields::new();
        note_fields.insert("folder".into(), json!("ctxstore://Folder/p1"));
        let note = clean(&mut state, "Note", 1, note_fields);

        state.delete(folder, &r).unwrap();
        assert_eq!(state.get(note, "folder").unwrap(), Some(Value::Null));
        let changes = state.pending_changes();
        assert_eq!(changes.deleted, vec![ObjectId::permanent("Folder", 1)]);
        assert_eq!(changes.updated.len(), 1);
    }

    #[test]
    fn test_rekey_rewrites_references() {
        let r = reflector();
        let mut state = ContextState::new();
        let folder = state.insert_new("Folder");
        let note = state.insert_new("Note");
        let temp = state.id(folder).unwrap();
        state.set(note, "folder", json!(temp.to_uri_string())).unwrap();

        let permanent = ObjectId::permanent("Folder", 7);
        state.rekey(folder, permanent.clone(), &r).unwrap();
        assert_eq!(state.id(folder).unwrap(), permanent);
        assert_eq!(state.get(note, "folder").unwrap(), Some(json!("ctxstore://Folder/p7")));
        assert_eq!(state.slot_of(&permanent), Some(folder));
        assert_eq!(state.slot_of(&temp), None);
        assert_eq!(state.temporary_slots(None).len(), 1);
    }

    #[test]
    fn test_merge_statuses() {
        let mut parent = ContextState::new();
        let existing = clean(&mut parent, "Note", 1, Fields::new());

        let mut fields = Fields::new();
        fields.insert("title".into(), json!("x"));
        parent.merge(ChangeSet {
            inserted: vec![ObjectSnapshot { id: ObjectId::permanent("Note", 2), fields: fields.clone() }],
            updated: vec![ObjectSnapshot { id: ObjectId::permanent("Note", 1), fields }],
            deleted: vec![ObjectId::permanent("Note", 3)],
        });

        let changes = parent.pending_changes();
        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.deleted, vec![ObjectId::permanent("Note", 3)]);
        assert_eq!(parent.get(existing, "title").unwrap(), Some(json!("x")));

        // Deleting something that was only ever inserted here cancels it out
        parent.merge(ChangeSet { deleted: vec![ObjectId::permanent("Note", 2)], ..Default::default() });
        assert!(parent.pending_changes().inserted.is_empty());
    }

    #[test]
    fn test_overlay() {
        let r = reflector();
        let mut state = ContextState::new();
        let mut f = Fields::new();
        f.insert("title".into(), json!("mine"));
        let mine = clean(&mut state, "Note", 1, Fields::new());
        state.set(mine, "title", json!("mine")).unwrap();
        let gone = clean(&mut state, "Note", 2, Fields::new());
        state.delete(gone, &r).unwrap();
        state.insert_new("Note");
        state.insert_new("Folder");

        let base = vec![
            ObjectSnapshot { id: ObjectId::permanent("Note", 1), fields: Fields::new() },
            ObjectSnapshot { id: ObjectId::permanent("Note", 2), fields: Fields::new() },
            ObjectSnapshot { id: ObjectId::permanent("Note", 3), fields: Fields::new() },
        ];
        let view = state.overlay("Note", base);
        assert_eq!(view.len(), 3);
        assert_eq!(view[0].fields, f);
        assert_eq!(view[1].id, ObjectId::permanent("Note", 3));
        assert!(view[2].id.is_temporary());
    }

    #[test]
    fn test_discard_and_restore() {
        let mut state = ContextState::new();
        let kept = clean(&mut state, "Note", 1, Fields::new());
        state.set(kept, "title", json!("edited")).unwrap();
        let fresh = state.insert_new("Note");

        let stale = state.discard_changes();
        assert_eq!(stale, vec![(kept, ObjectId::permanent("Note", 1))]);
        assert!(state.is_deleted(fresh));

        state.restore(kept, Some(ObjectSnapshot { id: ObjectId::permanent("Note", 1), fields: Fields::new() }));
        assert!(!state.has_changes());
        assert_eq!(state.get(kept, "title").unwrap(), None);
    }

    #[test]
    fn test_validate() {
        let r = reflector();
        let mut state = ContextState::new();
        let folder = state.insert_new("Folder");
        assert!(matches!(state.validate(&r), Err(Error::Validation(_))));

        state.set(folder, "name", json!("Inbox")).unwrap();
        state.validate(&r).unwrap();

        state.set(folder, "notes", json!("ctxstore://Note/p1")).unwrap();
        assert!(state.validate(&r).is_err());
        state.set(folder, "notes", json!(["ctxstore://Folder/p1"])).unwrap();
        assert!(state.validate(&r).is_err());
        state.set(folder, "notes", json!(["ctxstore://Note/p1"])).unwrap();
        state.validate(&r).unwrap();

        state.set(folder, "name", json!(12)).unwrap();
        assert!(state.validate(&r).is_err());
    }
}
