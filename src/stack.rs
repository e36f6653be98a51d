//! Context hierarchy lifecycle
//!
//! `DataStack` owns the store configuration, the schema, and the lazily
//! built store, root context and main context. Everything is built on first
//! use under one lock and thrown away by `reset_store`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use serde_json::Value;
use crate::builder::PersistentStoreBuilder;
use crate::config::CtxstoreConfig;
use crate::context::Context;
use crate::reflect::EntityReflector;
use crate::registry::{StoreConfiguration, StoreConfigurationRegistry};
use crate::schema::Schema;
use crate::storage::StoreCoordinator;
use crate::storage::sqlite::location_path;
use crate::{Error, Result};

/// Name of the root context and its worker thread suffix
pub const ROOT_CONTEXT_NAME: &str = "root";
/// Name of the main context
pub const MAIN_CONTEXT_NAME: &str = "main";

#[derive(Debug, Default)]
struct Settings {
    registry: StoreConfigurationRegistry,
    schema: Arc<Schema>,
    automatic_reset: bool,
}

#[derive(Debug, Default)]
struct Lifecycle {
    reflector: Option<Arc<EntityReflector>>,
    store: Option<Arc<StoreCoordinator>>,
    root: Option<Context>,
    main: Option<Context>,
}

/// Root and main contexts plus the store they sit on.
///
/// Lock order is lifecycle before settings.
#[derive(Debug, Default)]
pub struct DataStack {
    settings: Mutex<Settings>,
    lifecycle: Mutex<Lifecycle>,
}

impl DataStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide stack
    pub fn shared() -> &'static DataStack {
        static SHARED: OnceLock<DataStack> = OnceLock::new();
        SHARED.get_or_init(DataStack::new)
    }

    /// Build a stack from a parsed `ctxstore.toml`. Relative schema and store
    /// paths resolve against `base_dir`.
    pub fn from_config(config: &CtxstoreConfig, base_dir: &Path) -> Result<Self> {
        let stack = Self::new();

        let schema_path = config
            .schema
            .as_deref()
            .ok_or_else(|| Error::Configuration("No schema file configured".to_string()))?;
        stack.set_schema(Schema::load(&base_dir.join(schema_path))?)?;
        stack.set_automatic_reset(config.automatic_reset);

        for store in &config.stores {
            let location = store.location.as_deref().map(|location| {
                let path = location_path(location);
                let path = if path.is_relative() { base_dir.join(path) } else { path };
                path.to_string_lossy().into_owned()
            });
            stack.set_store_configuration(
                store.options.clone(),
                &store.store_type,
                location.as_deref(),
                store.name.as_deref(),
            )?;
        }
        Ok(stack)
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========== Configuration ==========

    /// Register the store for configuration `name` (`None` = default).
    /// Takes effect on the next build.
    pub fn set_store_configuration(
        &self,
        options: BTreeMap<String, Value>,
        store_type: &str,
        location: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        self.settings().registry.set(options, store_type, location, name)
    }

    pub fn remove_store_configuration(&self, name: Option<&str>) -> Option<StoreConfiguration> {
        self.settings().registry.remove(name)
    }

    pub fn store_configurations(&self) -> Vec<StoreConfiguration> {
        self.settings().registry.iter().cloned().collect()
    }

    /// Replace the schema. Takes effect on the next build.
    pub fn set_schema(&self, schema: Schema) -> Result<()> {
        schema.validate()?;
        let mut lifecycle = self.lifecycle();
        self.settings().schema = Arc::new(schema);
        // A reflector handed out before any store exists follows the new schema
        if lifecycle.store.is_none() {
            lifecycle.reflector = None;
        }
        Ok(())
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.settings().schema)
    }

    pub fn set_automatic_reset(&self, automatic_reset: bool) {
        self.settings().automatic_reset = automatic_reset;
    }

    pub fn automatic_reset(&self) -> bool {
        self.settings().automatic_reset
    }

    // ========== Lifecycle ==========

    fn ensure_reflector(&self, lifecycle: &mut Lifecycle) -> Arc<EntityReflector> {
        let settings = self.settings();
        lifecycle
            .reflector
            .get_or_insert_with(|| Arc::new(EntityReflector::new(Arc::clone(&settings.schema))))
            .clone()
    }

    fn ensure_store(&self, lifecycle: &mut Lifecycle) -> Result<Arc<StoreCoordinator>> {
        if let Some(store) = &lifecycle.store {
            return Ok(Arc::clone(store));
        }

        let (schema, store) = {
            let settings = self.settings();
            let schema = Arc::clone(&settings.schema);
            let store = PersistentStoreBuilder::new(Arc::clone(&schema))
                .with_automatic_reset(settings.automatic_reset)
                .build(&settings.registry)?;
            (schema, store)
        };
        let current = lifecycle
            .reflector
            .as_ref()
            .is_some_and(|reflector| Arc::ptr_eq(reflector.schema(), &schema));
        if !current {
            lifecycle.reflector = Some(Arc::new(EntityReflector::new(schema)));
        }
        lifecycle.store = Some(Arc::clone(&store));
        Ok(store)
    }

    fn ensure_root(&self, lifecycle: &mut Lifecycle) -> Result<Context> {
        if let Some(root) = &lifecycle.root {
            return Ok(root.clone());
        }

        let store = self.ensure_store(lifecycle)?;
        let reflector = self.ensure_reflector(lifecycle);
        let root = Context::new_root(ROOT_CONTEXT_NAME, store, reflector)?;
        lifecycle.root = Some(root.clone());
        tracing::info!("Root context ready");
        Ok(root)
    }

    /// The root context, building the store on first use
    pub fn root_context(&self) -> Result<Context> {
        let mut lifecycle = self.lifecycle();
        self.ensure_root(&mut lifecycle)
    }

    /// The main context, creating the root first when needed. The main
    /// context belongs to the thread that first asks for it.
    pub fn main_context(&self) -> Result<Context> {
        let mut lifecycle = self.lifecycle();
        if let Some(main) = &lifecycle.main {
            return Ok(main.clone());
        }

        let root = self.ensure_root(&mut lifecycle)?;
        let main = Context::new_child(&root, MAIN_CONTEXT_NAME);
        lifecycle.main = Some(main.clone());
        Ok(main)
    }

    pub fn has_root_context(&self) -> bool {
        self.lifecycle().root.is_some()
    }

    pub fn has_main_context(&self) -> bool {
        self.lifecycle().main.is_some()
    }

    /// An extra context under `parent`, confined to the calling thread
    pub fn new_child_context(&self, parent: &Context, name: &str) -> Context {
        Context::new_child(parent, name)
    }

    /// The attached stores, building them on first use
    pub fn store(&self) -> Result<Arc<StoreCoordinator>> {
        let mut lifecycle = self.lifecycle();
        self.ensure_store(&mut lifecycle)
    }

    pub fn reflector(&self) -> Arc<EntityReflector> {
        let mut lifecycle = self.lifecycle();
        self.ensure_reflector(&mut lifecycle)
    }

    /// Forget the store and both contexts. The next access builds new ones.
    ///
    /// Handles obtained earlier stay usable but are detached from the stack.
    /// Callers must not reset while a save is running.
    pub fn reset_store(&self) {
        let mut lifecycle = self.lifecycle();
        let had_store = lifecycle.store.is_some();
        *lifecycle = Lifecycle::default();
        if had_store {
            tracing::info!("Store reset");
        }
    }
}
