use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ObjectId;

/// git mode for a regular, non-executable file
pub const MODE_FILE: &str = "100644";

/// a pending change to the repository file tree
///
/// serializes to the shape the git trees API takes. `sha: None` is sent as
/// an explicit null, which removes the path from the base tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: Option<ObjectId>,
}

impl TreeEntry {
    /// a regular file at `path` with content `sha`
    pub fn blob(path: impl Into<String>, sha: ObjectId) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self {
            path,
            mode: MODE_FILE.to_string(),
            kind: "blob".to_string(),
            sha: Some(sha),
        })
    }

    /// remove `path` from the base tree
    pub fn delete(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self {
            path,
            mode: MODE_FILE.to_string(),
            kind: "blob".to_string(),
            sha: None,
        })
    }

    pub fn is_delete(&self) -> bool {
        self.sha.is_none()
    }
}

/// an object uploaded during a publish, one per unique digest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedObject {
    /// repository path the object is stored at
    pub path: String,
    /// path the document references it by
    pub public_path: String,
    pub sha: ObjectId,
}

impl UploadedObject {
    pub fn tree_entry(&self) -> Result<TreeEntry> {
        TreeEntry::blob(self.path.clone(), self.sha.clone())
    }
}

/// validate a repository-relative path
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidPath("empty path".to_string()));
    }

    if path.starts_with('/') || path.ends_with('/') {
        return Err(Error::InvalidPath(format!(
            "path cannot start or end with '/': {}",
            path
        )));
    }

    if path.contains("//") {
        return Err(Error::InvalidPath(format!(
            "path cannot contain '//': {}",
            path
        )));
    }

    if path.contains('\0') {
        return Err(Error::InvalidPath(format!(
            "path cannot contain null byte: {}",
            path
        )));
    }

    for component in path.split('/') {
        if component == "." || component == ".." {
            return Err(Error::InvalidPath(format!(
                "path cannot contain '.' or '..': {}",
                path
            )));
        }
    }

    Ok(())
}
