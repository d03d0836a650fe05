//! zine - publish site content to a git host as single atomic commits
//!
//! a site keeps its content (article and project lists, category lists,
//! images) in a GitHub repository. edits are published by writing git
//! objects directly through the git-data REST API and moving the branch
//! once, so a publish either lands completely or not at all.
//!
//! # Core concepts
//!
//! - **Document**: an ordered list of JSON records committed as one file
//! - **PendingAsset**: binary content a document record points at
//! - **Digest**: SHA-256 of asset content; names the stored file and dedups uploads
//! - **ObjectStore**: the five git object-API calls (get-ref, create-blob,
//!   create-tree, create-commit, update-ref)
//!
//! # Publish sequence
//!
//! 1. read the branch head
//! 2. upload each distinct asset once, rewrite document references to
//!    `<assets_root>/<category>/<digest><ext>`
//! 3. upload the serialized document
//! 4. build a tree on the head, commit it with the head as sole parent
//! 5. fast-forward the branch
//!
//! the branch is untouched unless step 5 succeeds.
//!
//! # Example usage
//!
//! ```no_run
//! use zine::ops::{publish_document, AssetBinding, LogProgress, PublishOptions};
//! use zine::remote::GithubStore;
//! use zine::{AssetLayout, Config, Document, PendingAsset};
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("zine.toml")).unwrap();
//! let store = GithubStore::new(&config.remote, "ghp_token").unwrap();
//!
//! let doc = Document::from_json("src/app/Tutorial/list.json", r#"[{"url": "cover.png"}]"#).unwrap();
//! let asset = PendingAsset::from_file("cover.png", Path::new("cover.png")).unwrap();
//! let binding = AssetBinding::in_place(AssetLayout::new("public/images", "/images", "project"), "url");
//!
//! let options = PublishOptions::new("main", "update projects");
//! let report = publish_document(&store, doc, vec![asset], binding, &options, &LogProgress).unwrap();
//! println!("{}", report.commit);
//! ```

mod config;
mod error;
mod hash;

pub mod ops;
pub mod remote;
pub mod types;

pub use config::{Config, DocumentProfile, PathsConfig, PublishConfig, RemoteConfig};
pub use error::{Error, ErrorKind, IoResultExt, Result};
pub use hash::{digest, digest_file, Digest, DigestWriter};
pub use types::{
    AssetLayout, CommitRequest, Document, ObjectId, PendingAsset, TreeEntry, UploadedObject,
};
