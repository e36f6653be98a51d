//! Contexts - mutation scopes chained to a parent
//!
//! A root context has no parent, runs every operation on its own worker
//! thread and commits to the attached stores. Any other context is confined
//! to the thread that created it and saves into its parent.

pub mod state;
pub mod worker;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use crate::object::ManagedObject;
use crate::reflect::EntityReflector;
use crate::save::SaveCoordinator;
use crate::storage::StoreCoordinator;
use crate::uri::ObjectId;
use crate::{Error, Result};

pub use state::{ChangeSet, ContextState, ObjectSnapshot, Slot};
pub use worker::RootWorker;

/// Execution domain a context is bound to. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confinement {
    /// The dedicated worker thread of a root context
    RootWorker(ThreadId),
    /// The thread that created the context
    OwnerThread(ThreadId),
}

impl Confinement {
    pub fn thread_id(&self) -> ThreadId {
        match self {
            Confinement::RootWorker(id) | Confinement::OwnerThread(id) => *id,
        }
    }
}

enum Executor {
    Worker(RootWorker),
    Owner(ThreadId),
}

struct ContextInner {
    name: String,
    parent: Option<Context>,
    executor: Executor,
    state: Mutex<ContextState>,
    reflector: Arc<EntityReflector>,
    store: Option<Arc<StoreCoordinator>>,
}

impl ContextInner {
    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to a context. Clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a root context bound to `store`, with its own worker thread
    pub fn new_root(name: impl Into<String>, store: Arc<StoreCoordinator>, reflector: Arc<EntityReflector>) -> Result<Self> {
        let name = name.into();
        let worker = RootWorker::spawn(&name)?;
        tracing::debug!("Created root context {} on worker {:?}", name, worker.thread_id());

        Ok(Self {
            inner: Arc::new(ContextInner {
                name,
                parent: None,
                executor: Executor::Worker(worker),
                state: Mutex::new(ContextState::new()),
                reflector,
                store: Some(store),
            }),
        })
    }

    /// Create a child of `parent` confined to the calling thread
    pub fn new_child(parent: &Context, name: impl Into<String>) -> Self {
        let name = name.into();
        let owner = thread::current().id();
        tracing::debug!("Created context {} (parent {}) on {:?}", name, parent.name(), owner);

        Self {
            inner: Arc::new(ContextInner {
                name,
                parent: Some(parent.clone()),
                executor: Executor::Owner(owner),
                state: Mutex::new(ContextState::new()),
                reflector: Arc::clone(&parent.inner.reflector),
                store: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// The root at the top of this context's chain
    pub fn root(&self) -> Context {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current.clone()
    }

    /// Number of ancestors between this context and its root
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(parent) = current.parent() {
            depth += 1;
            current = parent;
        }
        depth
    }

    pub fn confinement(&self) -> Confinement {
        match &self.inner.executor {
            Executor::Worker(worker) => Confinement::RootWorker(worker.thread_id()),
            Executor::Owner(owner) => Confinement::OwnerThread(*owner),
        }
    }

    /// Whether the calling thread is this context's execution domain
    pub fn is_current_domain(&self) -> bool {
        thread::current().id() == self.confinement().thread_id()
    }

    pub fn reflector(&self) -> &Arc<EntityReflector> {
        &self.inner.reflector
    }

    /// Attached stores, for root contexts
    pub fn store(&self) -> Option<&Arc<StoreCoordinator>> {
        self.inner.store.as_ref()
    }

    /// Whether two handles refer to the same context
    pub fn ptr_eq(a: &Context, b: &Context) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Run `f` against this context's state on its own execution domain and
    /// wait for the result.
    ///
    /// Root contexts hand the work to their worker thread. Other contexts run
    /// it inline and refuse callers from any thread but their owner. `f` must
    /// not call back into this same context.
    pub fn perform_and_wait<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ContextState) -> R + Send + 'static,
        R: Send + 'static,
    {
        match &self.inner.executor {
            Executor::Worker(worker) => {
                let inner = Arc::clone(&self.inner);
                worker.run(&self.inner.name, move || {
                    let mut state = inner.lock_state();
                    f(&mut state)
                })
            }
            Executor::Owner(owner) => {
                if thread::current().id() != *owner {
                    return Err(Error::Confinement { context: self.inner.name.clone() });
                }
                let mut state = self.inner.lock_state();
                Ok(f(&mut state))
            }
        }
    }

    /// Like `perform_and_wait` for work that can itself fail
    pub fn perform<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ContextState) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.perform_and_wait(f)?
    }

    // ========== Objects ==========

    fn handle(&self, slot: Slot, entity: &str) -> Result<ManagedObject> {
        let descriptor = self.inner.reflector.entity(entity)?;
        Ok(ManagedObject::from_parts(self.clone(), slot, descriptor))
    }

    /// Resolve an object by id in this context.
    ///
    /// Objects already registered here win; otherwise the object is loaded
    /// from the parent chain (or storage) and registered clean. Temporary ids
    /// only resolve in the context that created them.
    pub fn object(&self, id: &ObjectId) -> Result<ManagedObject> {
        let lookup = id.clone();
        let known = self.perform_and_wait(move |state| {
            state.slot_of(&lookup).map(|slot| (slot, state.is_deleted(slot)))
        })?;

        match known {
            Some((_, true)) => return Err(Error::ObjectNotFound(format!("{} has been deleted", id))),
            Some((slot, false)) => return self.handle(slot, id.entity()),
            None if id.is_temporary() => {
                return Err(Error::ObjectNotFound(format!(
                    "{} is a temporary id not registered in context {}",
                    id,
                    self.name()
                )));
            }
            None => {}
        }

        let snapshot = match self.parent() {
            Some(parent) => parent.snapshot_in_chain(id)?,
            None => self.load_from_store(id)?,
        }
        .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;

        let slot = self.perform_and_wait(move |state| state.register(snapshot))?;
        self.handle(slot, id.entity())
    }

    /// Current state of `id` as seen from this context, without registering it
    pub fn snapshot_in_chain(&self, id: &ObjectId) -> Result<Option<ObjectSnapshot>> {
        let lookup = id.clone();
        match self.perform_and_wait(move |state| state.snapshot(&lookup))? {
            Some(found) => Ok(found),
            None => match self.parent() {
                Some(parent) => parent.snapshot_in_chain(id),
                None => self.load_from_store(id),
            },
        }
    }

    fn load_from_store(&self, id: &ObjectId) -> Result<Option<ObjectSnapshot>> {
        if id.is_temporary() {
            return Ok(None);
        }
        let store = self.required_store()?;
        let lookup = id.clone();
        self.perform(move |_| store.fetch(&lookup))
    }

    pub(crate) fn required_store(&self) -> Result<Arc<StoreCoordinator>> {
        self.root()
            .store()
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("Context {} has no attached store", self.name())))
    }

    /// Every live object of `entity` as seen from this context, without registering them
    pub fn view(&self, entity: &str) -> Result<Vec<ObjectSnapshot>> {
        let base = match self.parent() {
            Some(parent) => parent.view(entity)?,
            None => {
                let store = self.required_store()?;
                let name = entity.to_string();
                self.perform(move |_| store.fetch_all(&name))?
            }
        };
        let name = entity.to_string();
        self.perform_and_wait(move |state| state.overlay(&name, base))
    }

    /// Fetch every live object of `entity`, sorted by its default ordering
    pub fn fetch(&self, entity: &str) -> Result<Vec<ManagedObject>> {
        let descriptor = self.inner.reflector.entity(entity)?;
        let mut rows = self.view(entity)?;
        rows.sort_by(|a, b| descriptor.compare(&a.fields, &b.fields));

        let slots = self.perform_and_wait(move |state| {
            rows.into_iter().map(|row| state.register(row)).collect::<Vec<_>>()
        })?;

        Ok(slots
            .into_iter()
            .map(|slot| ManagedObject::from_parts(self.clone(), slot, Arc::clone(&descriptor)))
            .collect())
    }

    /// Number of live objects of `entity` visible from this context
    pub fn count(&self, entity: &str) -> Result<usize> {
        self.inner.reflector.entity(entity)?;
        Ok(self.view(entity)?.len())
    }

    // ========== Changes ==========

    pub fn has_changes(&self) -> Result<bool> {
        self.perform_and_wait(|state| state.has_changes())
    }

    /// Pending changes of this context, for inspection
    pub fn pending_changes(&self) -> Result<ChangeSet> {
        self.perform_and_wait(|state| state.pending_changes())
    }

    /// Push pending changes up the chain to storage
    pub fn save(&self) -> Result<()> {
        SaveCoordinator::save(self)
    }

    /// Drop pending changes and reload touched objects from the parent chain
    pub fn rollback(&self) -> Result<()> {
        let stale = self.perform_and_wait(|state| state.discard_changes())?;

        let mut restored = Vec::with_capacity(stale.len());
        for (slot, id) in stale {
            let snapshot = match self.parent() {
                Some(parent) => parent.snapshot_in_chain(&id)?,
                None => self.load_from_store(&id)?,
            };
            restored.push((slot, snapshot));
        }

        tracing::debug!("Rolled back context {} ({} objects reloaded)", self.name(), restored.len());
        self.perform_and_wait(move |state| {
            for (slot, snapshot) in restored {
                state.restore(slot, snapshot);
            }
        })
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Context::ptr_eq(self, other)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("parent", &self.parent().map(|p| p.name().to_string()))
            .field("confinement", &self.confinement())
            .finish()
    }
}
