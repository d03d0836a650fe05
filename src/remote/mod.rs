//! remote object store: the five git object-API calls a publish needs
//!
//! every call is a single request/response with no built-in retry. a call
//! either records its result remotely or fails as a whole.

mod github;
mod memory;

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CommitRequest, ObjectId, TreeEntry};

pub use github::{map_status, GithubStore};
pub use memory::MemoryStore;

/// payload encoding for blob creation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Utf8 => f.write_str("utf-8"),
            Encoding::Base64 => f.write_str("base64"),
        }
    }
}

/// the object-API operations, for logging and error mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    GetRef,
    CreateBlob,
    CreateTree,
    CreateCommit,
    UpdateRef,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::GetRef => "get-ref",
            Op::CreateBlob => "create-blob",
            Op::CreateTree => "create-tree",
            Op::CreateCommit => "create-commit",
            Op::UpdateRef => "update-ref",
        };
        f.write_str(s)
    }
}

/// a git-compatible object store scoped to one repository
pub trait ObjectStore: Send + Sync {
    /// current target of `ref_name` (e.g. "heads/main")
    fn get_ref(&self, ref_name: &str) -> Result<ObjectId>;

    /// store a blob; `content` is interpreted according to `encoding`
    fn create_blob(&self, content: &str, encoding: Encoding) -> Result<ObjectId>;

    /// store a tree made of `base` with `entries` applied on top
    fn create_tree(&self, entries: &[TreeEntry], base: &ObjectId) -> Result<ObjectId>;

    fn create_commit(&self, commit: &CommitRequest) -> Result<ObjectId>;

    /// move `ref_name` to `sha`; fails with `Conflict` unless fast-forward
    fn update_ref(&self, ref_name: &str, sha: &ObjectId) -> Result<()>;
}

/// upload raw bytes as a base64 blob
pub fn create_binary_blob(store: &dyn ObjectStore, content: &[u8]) -> Result<ObjectId> {
    store.create_blob(&STANDARD.encode(content), Encoding::Base64)
}

/// decode a blob payload as the store would
pub fn decode_payload(content: &str, encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Utf8 => Ok(content.as_bytes().to_vec()),
        Encoding::Base64 => STANDARD
            .decode(content.trim())
            .map_err(|e| Error::InvalidContent(format!("malformed base64: {}", e))),
    }
}

/// validate a ref name such as "heads/main"
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef("empty ref name".to_string()));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidRef(format!(
            "ref name cannot start or end with '/': {}",
            name
        )));
    }

    if name.contains("//") || name.contains("..") {
        return Err(Error::InvalidRef(format!(
            "ref name cannot contain '//' or '..': {}",
            name
        )));
    }

    if name.chars().any(|c| c.is_ascii_control() || " ~^:?*[\\".contains(c)) {
        return Err(Error::InvalidRef(format!(
            "ref name contains a forbidden character: {}",
            name
        )));
    }

    for component in name.split('/') {
        if component.starts_with('.') || component.ends_with(".lock") {
            return Err(Error::InvalidRef(format!(
                "ref component cannot start with '.' or end with '.lock': {}",
                name
            )));
        }
    }

    Ok(())
}
