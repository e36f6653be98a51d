//! Object identity - URIs for every managed object
//!
//! Format: `ctxstore://<entity>/<p|t><number>`
//!
//! Examples:
//! - `ctxstore://Note/p42` - permanent, valid across contexts and restarts
//! - `ctxstore://Note/t7` - temporary, only meaningful in the context that created it

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

const SCHEME: &str = "ctxstore://";

static NEXT_TEMPORARY: AtomicU64 = AtomicU64::new(1);

/// Identity of a managed object.
///
/// Objects start with a temporary identity that is unique in the process but
/// only resolvable in the context that created them. A permanent identity is
/// allocated by the store that will hold the object and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Temporary { entity: String, serial: u64 },
    Permanent { entity: String, key: i64 },
}

impl ObjectId {
    /// Allocate a fresh temporary identity
    pub fn temporary(entity: impl Into<String>) -> Self {
        ObjectId::Temporary {
            entity: entity.into(),
            serial: NEXT_TEMPORARY.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn permanent(entity: impl Into<String>, key: i64) -> Self {
        ObjectId::Permanent { entity: entity.into(), key }
    }

    /// Entity name this object belongs to
    pub fn entity(&self) -> &str {
        match self {
            ObjectId::Temporary { entity, .. } | ObjectId::Permanent { entity, .. } => entity,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ObjectId::Temporary { .. })
    }

    /// Store key, for permanent identities
    pub fn key(&self) -> Option<i64> {
        match self {
            ObjectId::Permanent { key, .. } => Some(*key),
            ObjectId::Temporary { .. } => None,
        }
    }

    /// Parse a URI string into an ObjectId
    ///
    /// Expected format: `ctxstore://<entity>/<p|t><number>`
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidUri(format!("URI must start with {}: {}", SCHEME, uri)))?;

        let (entity, ident) = rest
            .rsplit_once('/')
            .ok_or_else(|| Error::InvalidUri(format!("URI must contain entity/id: {}", uri)))?;

        if entity.is_empty() {
            return Err(Error::InvalidUri(format!("URI has an empty entity: {}", uri)));
        }

        let mut chars = ident.chars();
        let marker = chars.next();
        let number = chars.as_str();

        match marker {
            Some('p') => {
                let key: i64 = number
                    .parse()
                    .map_err(|_| Error::InvalidUri(format!("Invalid key: {}", number)))?;
                Ok(ObjectId::permanent(entity, key))
            }
            Some('t') => {
                let serial: u64 = number
                    .parse()
                    .map_err(|_| Error::InvalidUri(format!("Invalid serial: {}", number)))?;
                Ok(ObjectId::Temporary { entity: entity.to_string(), serial })
            }
            _ => Err(Error::InvalidUri(format!("Identifier must start with p or t: {}", uri))),
        }
    }

    /// Convert to URI string
    pub fn to_uri_string(&self) -> String {
        match self {
            ObjectId::Temporary { entity, serial } => format!("{}{}/t{}", SCHEME, entity, serial),
            ObjectId::Permanent { entity, key } => format!("{}{}/p{}", SCHEME, entity, key),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri_string())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_uri_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::parse(&s).map_err(serde::de::Error::custom)
    }
}
