use std::fmt;
use std::path::Path;

use crate::error::{IoResultExt, Result};
use crate::hash::{digest, Digest};

/// binary content waiting to be uploaded, keyed by the reference the
/// document currently uses for it
#[derive(Clone)]
pub struct PendingAsset {
    pub logical_key: String,
    pub content: Vec<u8>,
    pub content_digest: Option<Digest>,
    /// lowercase, with leading dot, empty if the source had none
    pub extension: String,
}

impl PendingAsset {
    /// asset from in-memory content; `file_name` is only used for the extension
    pub fn new(logical_key: impl Into<String>, file_name: &str, content: Vec<u8>) -> Self {
        Self {
            logical_key: logical_key.into(),
            content,
            content_digest: None,
            extension: extension_of(file_name),
        }
    }

    /// read an asset from disk
    pub fn from_file(logical_key: impl Into<String>, path: &Path) -> Result<Self> {
        let content = std::fs::read(path).with_path(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(logical_key, &file_name, content))
    }

    /// attach a digest computed elsewhere (e.g. while the file was picked)
    pub fn with_digest(mut self, d: Digest) -> Self {
        self.content_digest = Some(d);
        self
    }

    /// the content digest, computing it if it was not supplied
    pub fn digest(&self) -> Digest {
        self.content_digest.unwrap_or_else(|| digest(&self.content))
    }

    /// compute and cache the digest
    pub fn ensure_digest(&mut self) -> Digest {
        let d = self.digest();
        self.content_digest = Some(d);
        d
    }
}

impl fmt::Debug for PendingAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAsset")
            .field("logical_key", &self.logical_key)
            .field("len", &self.content.len())
            .field("content_digest", &self.content_digest)
            .field("extension", &self.extension)
            .finish()
    }
}

/// extension of a file name including the dot, lowercased
///
/// dotfiles like ".env" have no extension.
pub fn extension_of(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(0) | None => String::new(),
        Some(pos) => file_name[pos..].to_ascii_lowercase(),
    }
}

/// where uploaded assets of one category live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetLayout {
    /// repository directory assets are committed under, e.g. "public/images"
    pub assets_root: String,
    /// prefix documents reference assets by, e.g. "/images"
    pub public_prefix: String,
    pub category: String,
}

impl AssetLayout {
    pub fn new(
        assets_root: impl Into<String>,
        public_prefix: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            assets_root: assets_root.into(),
            public_prefix: public_prefix.into(),
            category: category.into(),
        }
    }

    /// repository path: `<assets_root>/<category>/<digest><ext>`
    pub fn repo_path(&self, d: &Digest, extension: &str) -> String {
        join_path(&[&self.assets_root, &self.category, &d.file_name(extension)])
    }

    /// path written into the document: `<public_prefix>/<category>/<digest><ext>`
    pub fn public_path(&self, d: &Digest, extension: &str) -> String {
        let rel = join_path(&[&self.category, &d.file_name(extension)]);
        let prefix = self.public_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            rel
        } else {
            format!("{}/{}", prefix, rel)
        }
    }
}

fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
