use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// identifier of an object in the remote store (git SHA-1 on GitHub)
///
/// kept as validated lowercase hex rather than fixed bytes since the width
/// depends on the store (40 chars for SHA-1 repos, 64 for SHA-256).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// parse and validate a hex object id
    pub fn parse(s: &str) -> Result<Self> {
        let valid_len = s.len() == 40 || s.len() == 64;
        if !valid_len || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidObjectId(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// abbreviated form for logs
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl TryFrom<String> for ObjectId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> String {
        id.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}
