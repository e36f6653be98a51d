//! Save propagation
//!
//! Saving walks from a context up to the root. Each level gives its new
//! objects permanent ids, validates its pending changes, then either merges
//! them into its parent or, at the root, commits them to storage. The first
//! failing level stops the walk; levels below it keep what they merged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use crate::context::state::count_by_entity;
use crate::context::{ChangeSet, Context, ContextState, Slot};
use crate::reflect::EntityReflector;
use crate::storage::StoreCoordinator;
use crate::uri::ObjectId;
use crate::{Error, Result};

/// Drives a save from one context up to storage
pub struct SaveCoordinator;

impl SaveCoordinator {
    /// Save `context` and every ancestor up to the root.
    ///
    /// Errors are `Error::Save` naming the failing context and its level,
    /// counted from `context` (0) towards the root.
    ///
    /// Levels below the failing one are clean. The failing context keeps
    /// its own pending changes plus everything merged into it from below,
    /// so a later save of that context retries them.
    pub fn save(context: &Context) -> Result<()> {
        let mut current = context.clone();
        let mut level = 0;

        loop {
            let Some(parent) = current.parent().cloned() else {
                let written = Self::commit_root(&current).map_err(|e| save_error(&current, level, e))?;
                if written > 0 {
                    tracing::debug!("Context {} committed {} changes", current.name(), written);
                }
                return Ok(());
            };

            let changes = Self::prepare(&current).map_err(|e| save_error(&current, level, e))?;
            if !changes.is_empty() {
                let count = changes.len();
                parent
                    .perform_and_wait(move |state| state.merge(changes))
                    .map_err(|e| save_error(&parent, level + 1, e))?;
                current
                    .perform_and_wait(ContextState::mark_clean)
                    .map_err(|e| save_error(&current, level, e))?;
                tracing::debug!("Merged {} changes from {} into {}", count, current.name(), parent.name());
            }

            current = parent;
            level += 1;
        }
    }

    /// Permanent ids, validation, and the change set of a non-root level
    fn prepare(context: &Context) -> Result<ChangeSet> {
        Self::obtain_permanent_ids(context, None)?;
        let reflector = Arc::clone(context.reflector());
        context.perform(move |state| {
            state.validate(&reflector)?;
            Ok(state.pending_changes())
        })
    }

    /// Materialize, validate and commit the root's pending changes in one
    /// job on the root worker
    fn commit_root(root: &Context) -> Result<usize> {
        let store = root.required_store()?;
        let reflector = Arc::clone(root.reflector());

        root.perform(move |state| {
            let temporary = state.temporary_slots(None);
            let keys = allocate(&store, &temporary)?;
            assign_keys(state, temporary, keys, &reflector)?;

            state.validate(&reflector)?;
            let changes = state.pending_changes();
            if !changes.is_empty() {
                store.commit(&changes)?;
            }
            state.mark_clean();
            Ok(changes.len())
        })
    }

    /// Give inserted objects of `context` permanent ids, all of them or only
    /// the `only` slots. Keys come from the store owning each entity and are
    /// reserved on the root worker.
    pub fn obtain_permanent_ids(context: &Context, only: Option<Vec<Slot>>) -> Result<()> {
        let store = context.required_store()?;
        let reflector = Arc::clone(context.reflector());

        if context.is_root() {
            return context.perform(move |state| {
                let temporary = state.temporary_slots(only.as_deref());
                let keys = allocate(&store, &temporary)?;
                assign_keys(state, temporary, keys, &reflector)
            });
        }

        let temporary = context.perform_and_wait(move |state| state.temporary_slots(only.as_deref()))?;
        if temporary.is_empty() {
            return Ok(());
        }

        let request = temporary.clone();
        let keys = context.root().perform(move |_| allocate(&store, &request))?;
        context.perform(move |state| assign_keys(state, temporary, keys, &reflector))
    }
}

fn save_error(context: &Context, level: usize, source: Error) -> Error {
    tracing::debug!("Save failed at {} (level {}): {}", context.name(), level, source);
    Error::Save {
        context: context.name().to_string(),
        level,
        source: Box::new(source),
    }
}

/// Reserve one key per temporary object, grouped by entity
fn allocate(store: &StoreCoordinator, temporary: &[(Slot, String)]) -> Result<BTreeMap<String, Vec<i64>>> {
    count_by_entity(temporary)
        .into_iter()
        .map(|(entity, count)| -> Result<(String, Vec<i64>)> {
            let keys = store.allocate_keys(&entity, count)?;
            Ok((entity, keys))
        })
        .collect()
}

fn assign_keys(
    state: &mut ContextState,
    temporary: Vec<(Slot, String)>,
    keys: BTreeMap<String, Vec<i64>>,
    reflector: &EntityReflector,
) -> Result<()> {
    let mut keys: HashMap<String, std::vec::IntoIter<i64>> =
        keys.into_iter().map(|(entity, keys)| (entity, keys.into_iter())).collect();

    for (slot, entity) in temporary {
        let key = keys
            .get_mut(&entity)
            .and_then(Iterator::next)
            .ok_or_else(|| Error::Validation(format!("No permanent key reserved for {}", entity)))?;
        state.rekey(slot, ObjectId::permanent(entity, key), reflector)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Deletable, ManagedObject};
    use crate::stack::tests::memory_stack;
    use serde_json::json;

    #[test]
    fn test_save_walks_to_storage() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();
        note.set("title", "first").unwrap();

        main.save().unwrap();
        assert!(!main.has_changes().unwrap());
        assert!(!stack.root_context().unwrap().has_changes().unwrap());

        let id = note.id().unwrap();
        assert!(!id.is_temporary());
        let stored = stack.store().unwrap().fetch(&id).unwrap().unwrap();
        assert_eq!(stored.fields["title"], json!("first"));
    }

    #[test]
    fn test_references_are_rewritten_before_merge() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let folder = ManagedObject::create(&main, "Folder").unwrap();
        folder.set("name", "inbox").unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();
        note.set_related("folder", Some(&folder)).unwrap();

        main.save().unwrap();

        let folder_uri = folder.id().unwrap().to_uri_string();
        let stored = stack.store().unwrap().fetch(&note.id().unwrap()).unwrap().unwrap();
        assert_eq!(stored.fields["folder"], json!(folder_uri));
    }

    #[test]
    fn test_validation_failure_reports_level_zero() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        // Folder.name is required
        let _folder = ManagedObject::create(&main, "Folder").unwrap();

        let err = main.save().unwrap_err();
        assert_eq!(err.failed_level(), Some(("main", 0)));
        assert!(matches!(err, Error::Save { ref source, .. } if matches!(**source, Error::Validation(_))));
        assert!(main.has_changes().unwrap());
        assert!(!stack.root_context().unwrap().has_changes().unwrap());
    }

    #[test]
    fn test_child_save_reaches_storage_through_main() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let scratch = stack.new_child_context(&main, "scratch");

        let note = ManagedObject::create(&scratch, "Note").unwrap();
        note.set("title", "draft").unwrap();
        scratch.save().unwrap();

        let id = note.id().unwrap();
        assert_eq!(main.object(&id).unwrap().get("title").unwrap(), Some(json!("draft")));
        assert!(stack.store().unwrap().fetch(&id).unwrap().is_some());
    }

    #[test]
    fn test_delete_reaches_storage() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();
        let note = ManagedObject::create(&main, "Note").unwrap();
        note.set("title", "gone soon").unwrap();
        main.save().unwrap();
        let id = note.id().unwrap();

        note.delete().unwrap();
        assert_eq!(main.pending_changes().unwrap().deleted, vec![id.clone()]);
        main.save().unwrap();
        assert!(stack.store().unwrap().fetch(&id).unwrap().is_none());
        assert!(matches!(main.object(&id), Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_saving_root_directly() {
        let stack = memory_stack();
        let root = stack.root_context().unwrap();
        let note = ManagedObject::create(&root, "Note").unwrap();
        note.set("title", "from the worker").unwrap();

        SaveCoordinator::save(&root).unwrap();
        assert!(!note.id().unwrap().is_temporary());
        assert_eq!(stack.store().unwrap().fetch_all("Note").unwrap().len(), 1);
    }

    #[test]
    fn test_save_from_foreign_thread_is_refused() {
        let stack = memory_stack();
        let main = stack.main_context().unwrap();

        let handle = std::thread::spawn(move || main.save());
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.failed_level(), Some(("main", 0)));
    }
}
