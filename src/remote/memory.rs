//! in-process object store
//!
//! behaves like the git-data API closely enough to exercise a publish end
//! to end: objects are content addressed, trees merge onto a base, and ref
//! updates are rejected unless they fast-forward. every call is logged and
//! failures can be injected per operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};
use crate::remote::{decode_payload, validate_ref_name, Encoding, ObjectStore, Op};
use crate::types::{CommitRequest, ObjectId, TreeEntry};

/// flattened tree: full path -> blob id
type FlatTree = BTreeMap<String, ObjectId>;

#[derive(Default)]
struct Inner {
    blobs: HashMap<ObjectId, Vec<u8>>,
    trees: HashMap<ObjectId, FlatTree>,
    commits: HashMap<ObjectId, CommitRequest>,
    refs: HashMap<String, ObjectId>,
    calls: Vec<Op>,
    failures: Vec<Injected>,
}

struct Injected {
    op: Op,
    error: Error,
    /// perform the operation before failing, as if the response was lost
    after: bool,
}

/// in-memory git object store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// store with `ref_name` pointing at a root commit of an empty tree
    pub fn with_ref(ref_name: &str) -> Result<Self> {
        let store = Self::new();
        store.seed(ref_name, &[])?;
        Ok(store)
    }

    /// create a root commit holding `files` and point `ref_name` at it
    pub fn seed(&self, ref_name: &str, files: &[(&str, &[u8])]) -> Result<ObjectId> {
        validate_ref_name(ref_name)?;
        let mut inner = self.lock();

        let mut tree = FlatTree::new();
        for (path, content) in files {
            let id = inner.put_blob(content.to_vec())?;
            tree.insert(path.to_string(), id);
        }
        let tree_id = inner.put_tree(tree)?;
        let commit_id = inner.put_commit(CommitRequest {
            message: "initial".to_string(),
            tree: tree_id,
            parents: vec![],
        })?;
        inner.refs.insert(ref_name.to_string(), commit_id.clone());
        Ok(commit_id)
    }

    /// move a ref without any checks, as a concurrent writer would
    pub fn set_ref(&self, ref_name: &str, sha: &ObjectId) {
        self.lock().refs.insert(ref_name.to_string(), sha.clone());
    }

    /// read a ref without recording a call
    pub fn ref_target(&self, ref_name: &str) -> Option<ObjectId> {
        self.lock().refs.get(ref_name).cloned()
    }

    /// make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: Op, error: Error) {
        self.lock().failures.push(Injected {
            op,
            error,
            after: false,
        });
    }

    /// make the next call of `op` take effect and then fail with `error`
    pub fn fail_next_after(&self, op: Op, error: Error) {
        self.lock().failures.push(Injected {
            op,
            error,
            after: true,
        });
    }

    /// operations performed so far, in order
    pub fn calls(&self) -> Vec<Op> {
        self.lock().calls.clone()
    }

    /// number of calls of `op`
    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    /// the commit object stored under `sha`
    pub fn commit(&self, sha: &ObjectId) -> Option<CommitRequest> {
        self.lock().commits.get(sha).cloned()
    }

    /// all file paths in the tree of `commit`
    pub fn tree_paths(&self, commit: &ObjectId) -> Result<Vec<String>> {
        let inner = self.lock();
        let tree = inner.resolve_tree(commit)?;
        Ok(tree.keys().cloned().collect())
    }

    /// content of `path` in the tree of `commit`
    pub fn read_path(&self, commit: &ObjectId, path: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.lock();
        let tree = inner.resolve_tree(commit)?;
        Ok(tree.get(path).and_then(|id| inner.blobs.get(id)).cloned())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not hide the store from the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// record a call and take any failure injected for it
    fn begin(&self, op: Op) -> (MutexGuard<'_, Inner>, Option<Injected>) {
        let mut inner = self.lock();
        inner.calls.push(op);
        let injected = inner
            .failures
            .iter()
            .position(|f| f.op == op)
            .map(|pos| inner.failures.remove(pos));
        (inner, injected)
    }

    /// run `f` with injection applied
    fn call<T>(&self, op: Op, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let (mut inner, injected) = self.begin(op);
        match injected {
            Some(Injected {
                error,
                after: false,
                ..
            }) => Err(error),
            Some(Injected {
                error,
                after: true,
                ..
            }) => {
                f(&mut *inner)?;
                Err(error)
            }
            None => f(&mut *inner),
        }
    }
}

impl Inner {
    fn put_blob(&mut self, content: Vec<u8>) -> Result<ObjectId> {
        let id = object_id("blob", &content)?;
        self.blobs.entry(id.clone()).or_insert(content);
        Ok(id)
    }

    fn put_tree(&mut self, tree: FlatTree) -> Result<ObjectId> {
        let id = object_id("tree", &tree)?;
        self.trees.entry(id.clone()).or_insert(tree);
        Ok(id)
    }

    fn put_commit(&mut self, commit: CommitRequest) -> Result<ObjectId> {
        let id = object_id("commit", &commit)?;
        self.commits.entry(id.clone()).or_insert(commit);
        Ok(id)
    }

    /// a tree id, or the tree of a commit id
    fn resolve_tree(&self, id: &ObjectId) -> Result<&FlatTree> {
        let tree_id = match self.commits.get(id) {
            Some(commit) => &commit.tree,
            None => id,
        };
        self.trees
            .get(tree_id)
            .ok_or_else(|| Error::NotFound(format!("tree-ish {}", id)))
    }

    fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> bool {
        let mut to_visit = vec![descendant.clone()];
        let mut visited = HashSet::new();

        while let Some(id) = to_visit.pop() {
            if id == *ancestor {
                return true;
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                to_visit.extend(commit.parents.iter().cloned());
            }
        }

        false
    }
}

impl ObjectStore for MemoryStore {
    fn get_ref(&self, ref_name: &str) -> Result<ObjectId> {
        self.call(Op::GetRef, |inner| {
            inner
                .refs
                .get(ref_name)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("ref {}", ref_name)))
        })
    }

    fn create_blob(&self, content: &str, encoding: Encoding) -> Result<ObjectId> {
        self.call(Op::CreateBlob, |inner| {
            let bytes = decode_payload(content, encoding)?;
            inner.put_blob(bytes)
        })
    }

    fn create_tree(&self, entries: &[TreeEntry], base: &ObjectId) -> Result<ObjectId> {
        self.call(Op::CreateTree, |inner| {
            let mut tree = inner.resolve_tree(base)?.clone();
            for entry in entries {
                match &entry.sha {
                    Some(sha) => {
                        if !inner.blobs.contains_key(sha) {
                            return Err(Error::InvalidContent(format!(
                                "tree entry {} references unknown blob {}",
                                entry.path, sha
                            )));
                        }
                        tree.insert(entry.path.clone(), sha.clone());
                    }
                    // a blob entry without sha removes that file only
                    None => {
                        tree.remove(&entry.path);
                    }
                }
            }
            inner.put_tree(tree)
        })
    }

    fn create_commit(&self, commit: &CommitRequest) -> Result<ObjectId> {
        self.call(Op::CreateCommit, |inner| {
            if !inner.trees.contains_key(&commit.tree) {
                return Err(Error::InvalidContent(format!("unknown tree {}", commit.tree)));
            }
            if let Some(p) = commit.parents.iter().find(|p| !inner.commits.contains_key(*p)) {
                return Err(Error::InvalidContent(format!("unknown parent {}", p)));
            }
            inner.put_commit(commit.clone())
        })
    }

    fn update_ref(&self, ref_name: &str, sha: &ObjectId) -> Result<()> {
        self.call(Op::UpdateRef, |inner| {
            let current = inner
                .refs
                .get(ref_name)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("ref {}", ref_name)))?;
            if !inner.commits.contains_key(sha) {
                return Err(Error::InvalidContent(format!("unknown commit {}", sha)));
            }
            if !inner.is_ancestor(&current, sha) {
                return Err(Error::Conflict(format!(
                    "update of {} to {} is not a fast forward",
                    ref_name,
                    sha.short()
                )));
            }
            inner.refs.insert(ref_name.to_string(), sha.clone());
            Ok(())
        })
    }
}

/// id = SHA-256 over the CBOR encoding of (kind, object)
fn object_id<T: Serialize>(kind: &str, object: &T) -> Result<ObjectId> {
    let mut bytes = Vec::new();
    ciborium::into_writer(&(kind, object), &mut bytes)?;
    ObjectId::parse(&hex::encode(Sha256::digest(&bytes)))
}
