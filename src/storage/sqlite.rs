//! SQLite storage implementation

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde_json::Value;
use crate::{Error, Result};
use super::schema;

/// Options understood by SQLite-backed stores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOptions {
    /// `PRAGMA journal_mode`
    pub journal_mode: Option<String>,
    /// `PRAGMA synchronous`
    pub synchronous: Option<String>,
    pub busy_timeout_ms: Option<u64>,
    /// Open without write access; saves into this store fail
    pub read_only: bool,
    /// Accept a schema fingerprint mismatch and record the new fingerprint
    pub migrate_automatically: bool,
}

impl StoreOptions {
    /// Parse the option map of a store configuration.
    ///
    /// Unknown keys are ignored with a warning; known keys with the wrong
    /// value type are configuration errors.
    pub fn from_map(options: &BTreeMap<String, Value>) -> Result<Self> {
        let mut parsed = StoreOptions::default();

        for (key, value) in options {
            match key.as_str() {
                "journal_mode" => parsed.journal_mode = Some(pragma_word(key, value)?),
                "synchronous" => parsed.synchronous = Some(pragma_word(key, value)?),
                "busy_timeout_ms" => {
                    parsed.busy_timeout_ms = Some(value.as_u64().ok_or_else(|| {
                        Error::Configuration(format!("Option {} must be a non-negative integer", key))
                    })?);
                }
                "read_only" => parsed.read_only = option_bool(key, value)?,
                "migrate_automatically" => parsed.migrate_automatically = option_bool(key, value)?,
                _ => tracing::warn!("Ignoring unknown store option {}", key),
            }
        }

        Ok(parsed)
    }
}

fn option_bool(key: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::Configuration(format!("Option {} must be a boolean", key)))
}

/// Pragma values are spliced into SQL, so only plain words are accepted
fn pragma_word(key: &str, value: &Value) -> Result<String> {
    let word = value
        .as_str()
        .ok_or_else(|| Error::Configuration(format!("Option {} must be a string", key)))?;
    if word.is_empty() || !word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Configuration(format!("Invalid value for {}: {}", key, word)));
    }
    Ok(word.to_lowercase())
}

/// Turn a configured location (`file://` URI or plain path) into a path
pub fn location_path(location: &str) -> PathBuf {
    PathBuf::from(location.strip_prefix("file://").unwrap_or(location))
}

/// Every file SQLite may keep for a database at `path`
pub fn artifact_paths(path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        paths.push(PathBuf::from(name));
    }
    paths
}

/// A single write applied when the root context commits.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Upsert { entity: String, key: i64, fields: String },
    Delete { entity: String, key: i64 },
}

/// SQLite-backed storage for one store configuration
pub struct SqliteStore {
    conn: Connection,
    read_only: bool,
}

impl SqliteStore {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self> {
        let flags = if options.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let conn = Connection::open_with_flags(path, flags)?;
        Self::prepare(conn, options)
    }

    /// Open an in-memory database
    pub fn open_in_memory(options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(conn, options)
    }

    fn prepare(conn: Connection, options: &StoreOptions) -> Result<Self> {
        let store = Self {
            conn,
            read_only: options.read_only,
        };
        store.check_integrity()?;
        store.apply_options(options)?;
        if !store.read_only {
            store.initialize_schema()?;
        }
        Ok(store)
    }

    /// Fail on files that are not SQLite databases or fail a quick check
    fn check_integrity(&self) -> Result<()> {
        // Reading the schema version forces SQLite to parse the file header
        let _version: i64 = self.conn.query_row("PRAGMA schema_version", [], |row| row.get(0))?;
        let verdict: String = self.conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(Error::Validation(format!("Integrity check failed: {}", verdict)));
        }
        Ok(())
    }

    fn apply_options(&self, options: &StoreOptions) -> Result<()> {
        if let Some(mode) = &options.journal_mode {
            if !self.read_only {
                self.conn.execute_batch(&format!("PRAGMA journal_mode = {};", mode))?;
            }
        }
        if let Some(sync) = &options.synchronous {
            self.conn.execute_batch(&format!("PRAGMA synchronous = {};", sync))?;
        }
        if let Some(ms) = options.busy_timeout_ms {
            self.conn.busy_timeout(Duration::from_millis(ms))?;
        }
        Ok(())
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        for stmt in schema::all_schema_statements() {
            self.conn.execute(stmt, [])?;
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO ctx_metadata (key, value) VALUES (?1, ?2)",
            params![schema::LAYOUT_VERSION_KEY, schema::LAYOUT_VERSION],
        )?;
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    // ========== Metadata ==========

    /// Schema fingerprint recorded in this store, if any
    pub fn fingerprint(&self) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM ctx_metadata WHERE key = ?1",
                [schema::FINGERPRINT_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn set_fingerprint(&self, fingerprint: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO ctx_metadata (key, value) VALUES (?1, ?2)",
            params![schema::FINGERPRINT_KEY, fingerprint],
        )?;
        Ok(())
    }

    // ========== Keys ==========

    /// Reserve `count` consecutive keys for `entity`
    pub fn allocate_keys(&mut self, entity: &str, count: usize) -> Result<Vec<i64>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let tx = self.conn.transaction()?;
        let next: Option<i64> = tx
            .query_row(
                "SELECT next_key FROM ctx_sequences WHERE entity = ?1",
                [entity],
                |row| row.get(0),
            )
            .optional()?;

        let first = match next {
            Some(next) => next,
            // Keys continue after rows written before the sequence existed
            None => {
                let max: Option<i64> = tx.query_row(
                    "SELECT MAX(key) FROM ctx_objects WHERE entity = ?1",
                    [entity],
                    |row| row.get(0),
                )?;
                max.unwrap_or(0) + 1
            }
        };

        let after = first + count as i64;
        tx.execute(
            "INSERT OR REPLACE INTO ctx_sequences (entity, next_key) VALUES (?1, ?2)",
            params![entity, after],
        )?;
        tx.commit()?;

        Ok((first..after).collect())
    }

    // ========== Object Rows ==========

    /// Get the stored fields of one object
    pub fn fetch_row(&self, entity: &str, key: i64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT fields FROM ctx_objects WHERE entity = ?1 AND key = ?2",
                params![entity, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Get all rows of an entity, ordered by key
    pub fn fetch_rows(&self, entity: &str) -> Result<Vec<(i64, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, fields FROM ctx_objects WHERE entity = ?1 ORDER BY key")?;

        let rows = stmt
            .query_map([entity], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Count rows per entity
    pub fn count_by_entity(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity, COUNT(*) FROM ctx_objects GROUP BY entity ORDER BY entity")?;

        let counts = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                Ok((row.get(0)?, count as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(counts)
    }

    /// Apply a batch of writes in one transaction
    pub fn apply(&mut self, writes: &[RowWrite]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for write in writes {
            match write {
                RowWrite::Upsert { entity, key, fields } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO ctx_objects (entity, key, fields) VALUES (?1, ?2, ?3)",
                        params![entity, key, fields],
                    )?;
                }
                RowWrite::Delete { entity, key } => {
                    tx.execute(
                        "DELETE FROM ctx_objects WHERE entity = ?1 AND key = ?2",
                        params![entity, key],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.conn.path())
            .field("read_only", &self.read_only)
            .finish()
    }
}
