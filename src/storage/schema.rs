//! Database schema definitions

/// SQL to create the metadata table (schema fingerprint, layout version)
pub const CREATE_METADATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ctx_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// SQL to create the objects table
/// One row per persisted object; `fields` holds the codec JSON
pub const CREATE_OBJECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ctx_objects (
    entity TEXT NOT NULL,
    key INTEGER NOT NULL,
    fields TEXT NOT NULL,
    PRIMARY KEY (entity, key)
)
"#;

/// SQL to create the key sequences table
pub const CREATE_SEQUENCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ctx_sequences (
    entity TEXT PRIMARY KEY,
    next_key INTEGER NOT NULL
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_objects_entity ON ctx_objects(entity)",
];

/// Metadata key holding the schema fingerprint
pub const FINGERPRINT_KEY: &str = "schema_fingerprint";

/// Metadata key holding the table layout version
pub const LAYOUT_VERSION_KEY: &str = "layout_version";

/// Current table layout version
pub const LAYOUT_VERSION: &str = "1";

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![
        CREATE_METADATA_TABLE,
        CREATE_OBJECTS_TABLE,
        CREATE_SEQUENCES_TABLE,
    ];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
