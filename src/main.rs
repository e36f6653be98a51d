//! ctxstore CLI - inspect and repair context stores

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use ctxstore::builder::{PersistentStoreBuilder, destroy_artifacts};
use ctxstore::config::{self, CtxstoreConfig};
use ctxstore::registry::{SQLITE_STORE_TYPE, StoreConfiguration};
use ctxstore::storage::sqlite::location_path;
use ctxstore::{AttributeDescriptor, AttributeType, DataStack, EntityDescriptor, Schema, SortKey, ui};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ctxstore")]
#[command(version)]
#[command(about = "Layered persistence contexts over SQLite stores")]
#[command(long_about = r#"
ctxstore keeps objects in one or more SQLite stores described by a
ctxstore.toml file and a schema file.

Example usage:
  ctxstore init
  ctxstore check
  ctxstore dump --entity Note
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = "ctxstore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config and schema
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Attach every configured store and report the result
    Check,

    /// Show object counts per store and entity
    Stats,

    /// Print every object of an entity as JSON lines
    Dump {
        /// Entity name
        #[arg(short, long)]
        entity: String,
    },

    /// Delete the files of every configured store
    Reset {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => init(&cli.config, force),
        Commands::Check => check(&cli.config),
        Commands::Stats => stats(&cli.config),
        Commands::Dump { entity } => dump(&cli.config, &entity),
        Commands::Reset { yes } => reset(&cli.config, yes),
    }
}

fn base_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn load(config_path: &Path) -> anyhow::Result<CtxstoreConfig> {
    config::load_config(Some(config_path))?
        .with_context(|| format!("no config at {} (run `ctxstore init`)", config_path.display()))
}

fn load_stack(config_path: &Path) -> anyhow::Result<DataStack> {
    let config = load(config_path)?;
    let stack = DataStack::from_config(&config, &base_dir(config_path))?;
    Ok(stack)
}

fn starter_schema() -> Schema {
    Schema::new(vec![
        EntityDescriptor::new("Note")
            .with_attribute(AttributeDescriptor::new("title", AttributeType::String).required())
            .with_attribute(AttributeDescriptor::new("body", AttributeType::String))
            .ordered_by(SortKey::ascending("title")),
    ])
}

fn init(config_path: &Path, force: bool) -> anyhow::Result<()> {
    let base = base_dir(config_path);
    let store_path = config::default_store_path_in(Path::new(""));

    let mut options = BTreeMap::new();
    options.insert("journal_mode".to_string(), json!("wal"));
    let config = CtxstoreConfig {
        schema: Some("schema.json".to_string()),
        automatic_reset: false,
        stores: vec![StoreConfiguration {
            name: None,
            store_type: SQLITE_STORE_TYPE.to_string(),
            location: Some(store_path.to_string_lossy().into_owned()),
            options,
        }],
    };
    config::write_config(config_path, &config, force)?;
    ui::success(&format!("Wrote {}", config_path.display()));

    let schema_path = base.join("schema.json");
    if !schema_path.exists() {
        std::fs::write(&schema_path, serde_json::to_string_pretty(&starter_schema())?)?;
        ui::success(&format!("Wrote {}", schema_path.display()));
    }

    config::ensure_store_dir(&base.join(&store_path))?;
    Ok(())
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let stack = load_stack(config_path)?;
    let store = match stack.store() {
        Ok(store) => store,
        Err(e) => {
            ui::error(&e.to_string());
            return Err(e.into());
        }
    };

    ui::section("Stores");
    for attached in store.stores() {
        let location = attached
            .location
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string());
        let mode = if attached.is_read_only() { "read-only" } else { "read-write" };
        ui::info(attached.name(), &format!("{} ({}, {})", location, attached.configuration.store_type, mode));
    }
    ui::success(&format!("{} store(s) attached", store.stores().len()));
    Ok(())
}

fn stats(config_path: &Path) -> anyhow::Result<()> {
    let stack = load_stack(config_path)?;
    let stats = stack.store()?.stats()?;

    ui::section("Objects");
    let table = ui::stats_table(&stats);
    if table.is_empty() {
        ui::warn("No stores attached");
    } else {
        println!("{}", table);
    }
    Ok(())
}

fn dump(config_path: &Path, entity: &str) -> anyhow::Result<()> {
    let stack = load_stack(config_path)?;
    let main = stack.main_context()?;

    for object in main.fetch(entity)? {
        let line = json!({
            "id": object.id()?.to_uri_string(),
            "fields": object.fields()?,
        });
        println!("{}", line);
    }
    Ok(())
}

fn reset(config_path: &Path, yes: bool) -> anyhow::Result<()> {
    if !yes {
        anyhow::bail!("refusing to delete store files without --yes");
    }

    let base = base_dir(config_path);
    let configurations = match config::load_config(Some(config_path))? {
        Some(config) if !config.stores.is_empty() => config.stores,
        _ => vec![PersistentStoreBuilder::default_configuration()],
    };

    let mut removed = 0;
    for configuration in configurations {
        let Some(location) = configuration.location.as_deref() else {
            continue;
        };
        if configuration.store_type != SQLITE_STORE_TYPE {
            continue;
        }
        let path = location_path(location);
        let path = if path.is_relative() { base.join(path) } else { path };
        for artifact in destroy_artifacts(&path)? {
            ui::removed(&artifact.display().to_string());
            removed += 1;
        }
    }

    if removed == 0 {
        ui::warn("Nothing to delete");
    } else {
        ui::success(&format!("Deleted {} file(s)", removed));
    }
    Ok(())
}
