use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::registry::StoreConfiguration;

/// Environment variable overriding the directory of the default store
pub const DATA_DIR_ENV: &str = "CTXSTORE_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CtxstoreConfig {
    /// Schema file, JSON or TOML
    pub schema: Option<String>,
    #[serde(default)]
    pub automatic_reset: bool,
    #[serde(default, rename = "store", skip_serializing_if = "Vec::is_empty")]
    pub stores: Vec<StoreConfiguration>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("ctxstore.toml")
}

pub fn default_store_path() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("ctxstore.db"),
        _ => default_store_path_in(Path::new("")),
    }
}

pub fn default_store_path_in(base: &Path) -> PathBuf {
    base.join(".ctxstore").join("ctxstore.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<CtxstoreConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: CtxstoreConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &CtxstoreConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_store_dir(store_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = store_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_is_none() {
        let dir = tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml"))).unwrap().is_none());
    }

    #[test]
    fn test_parse_stores() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctxstore.toml");
        std::fs::write(
            &path,
            r#"
schema = "schema.json"
automatic_reset = true

[[store]]
name = "cache"
type = "sqlite"
location = "data/cache.db"
options = { journal_mode = "wal", busy_timeout_ms = 500 }

[[store]]
name = "scratch"
type = "memory"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(config.schema.as_deref(), Some("schema.json"));
        assert!(config.automatic_reset);
        assert_eq!(config.stores.len(), 2);
        assert_eq!(config.stores[0].name.as_deref(), Some("cache"));
        assert_eq!(config.stores[0].options["journal_mode"], json!("wal"));
        assert_eq!(config.stores[0].options["busy_timeout_ms"], json!(500));
        assert_eq!(config.stores[1].store_type, "memory");
        assert!(config.stores[1].location.is_none());
    }

    #[test]
    fn test_write_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctxstore.toml");
        let config = CtxstoreConfig { schema: Some("schema.json".into()), ..Default::default() };

        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());
        write_config(&path, &config, true).unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.schema.as_deref(), Some("schema.json"));
        assert!(!loaded.automatic_reset);
    }

    #[test]
    fn test_ensure_store_dir() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("a").join("b").join("ctxstore.db");
        ensure_store_dir(&store).unwrap();
        assert!(store.parent().unwrap().is_dir());
        assert_eq!(default_store_path_in(dir.path()), dir.path().join(".ctxstore/ctxstore.db"));
    }
}
