//! Schema types - entity, attribute and relationship descriptors
//!
//! A schema is plain data loaded from JSON or TOML. It describes every entity
//! type the stores hold and optionally groups entities into named
//! configurations, one per physical store.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;

/// Value types an attribute may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Integer,
    Double,
    String,
    Boolean,
    /// Any JSON value
    Json,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Integer => "integer",
            AttributeType::Double => "double",
            AttributeType::String => "string",
            AttributeType::Boolean => "boolean",
            AttributeType::Json => "json",
        }
    }

    /// Whether a non-null value has the right JSON shape for this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            AttributeType::Integer => value.is_i64() || value.is_u64(),
            AttributeType::Double => value.is_number(),
            AttributeType::String => value.is_string(),
            AttributeType::Boolean => value.is_boolean(),
            AttributeType::Json => true,
        }
    }
}

impl FromStr for AttributeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "integer" | "int" | "int64" => Ok(AttributeType::Integer),
            "double" | "float" | "decimal" => Ok(AttributeType::Double),
            "string" | "text" => Ok(AttributeType::String),
            "boolean" | "bool" => Ok(AttributeType::Boolean),
            "json" | "transformable" => Ok(AttributeType::Json),
            _ => Err(Error::Configuration(format!("Unknown attribute type: {}", s))),
        }
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An attribute of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    /// Null or absent values pass validation
    #[serde(default = "default_true")]
    pub optional: bool,
    /// Transient attributes live in contexts only and are never written to a store
    #[serde(default)]
    pub transient: bool,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attribute_type,
            optional: true,
            transient: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

/// A relationship from one entity to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    /// Entity name at the other end
    pub destination: String,
    #[serde(default)]
    pub to_many: bool,
    #[serde(default = "default_true")]
    pub optional: bool,
    #[serde(default)]
    pub inverse: Option<String>,
}

impl RelationshipDescriptor {
    pub fn to_one(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            to_many: false,
            optional: true,
            inverse: None,
        }
    }

    pub fn to_many(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            to_many: true,
            ..Self::to_one(name, destination)
        }
    }

    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }
}

/// One key of an entity's default ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub key: String,
    #[serde(default = "default_true")]
    pub ascending: bool,
}

impl SortKey {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self { key: key.into(), ascending: true }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self { key: key.into(), ascending: false }
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescriptor>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescriptor>,
    #[serde(default)]
    pub default_ordering: Vec<SortKey>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            default_ordering: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn ordered_by(mut self, key: SortKey) -> Self {
        self.default_ordering.push(key);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Whether `name` is an attribute or relationship of this entity
    pub fn has_key(&self, name: &str) -> bool {
        self.attribute(name).is_some() || self.relationship(name).is_some()
    }

    /// Order two field maps by this entity's default ordering
    pub fn compare(&self, a: &BTreeMap<String, Value>, b: &BTreeMap<String, Value>) -> Ordering {
        for sort in &self.default_ordering {
            let ord = compare_values(a.get(&sort.key), b.get(&sort.key));
            let ord = if sort.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// A complete schema: entities plus named store configurations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,
    /// Configuration name -> entity names held by stores of that configuration
    #[serde(default)]
    pub configurations: BTreeMap<String, Vec<String>>,
}

impl Schema {
    pub fn new(entities: Vec<EntityDescriptor>) -> Self {
        Self {
            entities,
            configurations: BTreeMap::new(),
        }
    }

    /// Group entities under a named configuration
    pub fn with_configuration<I, S>(mut self, name: impl Into<String>, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configurations
            .insert(name.into(), entities.into_iter().map(Into::into).collect());
        self
    }

    /// Load a schema from a JSON file, or TOML when the extension is `.toml`
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let schema: Schema = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&contents)
                .map_err(|e| Error::Configuration(format!("Invalid schema {}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&contents)?
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let schema: Schema = serde_json::from_str(json)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Whether stores attached for `configuration` hold `entity`.
    /// The default configuration (`None`) holds every entity.
    pub fn configuration_contains(&self, configuration: Option<&str>, entity: &str) -> bool {
        match configuration {
            None => self.entity(entity).is_some(),
            Some(name) => self
                .configurations
                .get(name)
                .is_some_and(|entities| entities.iter().any(|e| e == entity)),
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for entity in &self.entities {
            if entity.name.is_empty() {
                return Err(Error::Configuration("Entity with empty name".to_string()));
            }
            if !names.insert(entity.name.as_str()) {
                return Err(Error::Configuration(format!("Duplicate entity: {}", entity.name)));
            }
        }

        for entity in &self.entities {
            let mut keys = HashSet::new();
            let all_keys = entity
                .attributes
                .iter()
                .map(|a| a.name.as_str())
                .chain(entity.relationships.iter().map(|r| r.name.as_str()));
            for key in all_keys {
                if key.is_empty() || key.contains('.') {
                    return Err(Error::Configuration(format!(
                        "Invalid key '{}' on entity {}",
                        key, entity.name
                    )));
                }
                if !keys.insert(key) {
                    return Err(Error::Configuration(format!(
                        "Duplicate key '{}' on entity {}",
                        key, entity.name
                    )));
                }
            }

            for rel in &entity.relationships {
                if !names.contains(rel.destination.as_str()) {
                    return Err(Error::Configuration(format!(
                        "Relationship {}.{} points at unknown entity {}",
                        entity.name, rel.name, rel.destination
                    )));
                }
            }

            for sort in &entity.default_ordering {
                if entity.attribute(&sort.key).is_none() {
                    return Err(Error::Configuration(format!(
                        "Default ordering of {} uses unknown attribute {}",
                        entity.name, sort.key
                    )));
                }
            }
        }

        for (configuration, members) in &self.configurations {
            for member in members {
                if !names.contains(member.as_str()) {
                    return Err(Error::Configuration(format!(
                        "Configuration {} lists unknown entity {}",
                        configuration, member
                    )));
                }
            }
        }

        Ok(())
    }

    /// Stable hash of the schema, recorded in every store it creates
    pub fn fingerprint(&self) -> String {
        // serde_json keeps struct field order and BTreeMap key order, so the
        // encoding is canonical for equal schemas.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&canonical).to_string()
    }
}

/// Total order over optional JSON values used for sorting fetch results.
///
/// Missing and null sort first, then booleans, numbers, strings, and finally
/// arrays and objects by their JSON text.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) | Some(Value::Object(_)) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) if rank(a) == 4 && rank(b) == 4 => x.to_string().cmp(&y.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn default_true() -> bool {
    true
}
