//! publish operation - one atomic commit of documents and assets

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::ops::progress::{CancelToken, Progress, Stage, State};
use crate::ops::upload::{process_changes, AssetBinding, DocumentChange, UploadOptions};
use crate::remote::{Encoding, ObjectStore};
use crate::types::{
    validate_path, CommitRequest, Document, ObjectId, PendingAsset, TreeEntry, UploadedObject,
};

/// publish options
#[derive(Clone, Debug)]
pub struct PublishOptions {
    /// branch to advance, without the "heads/" prefix
    pub branch: String,
    pub message: String,
    /// asset uploads in flight at once
    pub upload_concurrency: usize,
    /// full restarts after a ref conflict; 0 surfaces the first conflict
    pub conflict_retries: u32,
    pub cancel: Option<CancelToken>,
}

impl PublishOptions {
    pub fn new(branch: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            message: message.into(),
            upload_concurrency: 1,
            conflict_retries: 0,
            cancel: None,
        }
    }

    fn ref_name(&self) -> String {
        format!("heads/{}", self.branch)
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// everything one publish commits
#[derive(Clone, Debug, Default)]
pub struct Changeset {
    pub documents: Vec<DocumentChange>,
    /// repository paths to remove
    pub deletions: Vec<String>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(
        mut self,
        document: Document,
        assets: Vec<PendingAsset>,
        binding: AssetBinding,
    ) -> Self {
        self.documents.push(DocumentChange {
            document,
            assets,
            binding,
        });
        self
    }

    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.deletions.push(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.deletions.is_empty()
    }

    /// every target path must be valid and named at most once
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let paths = self
            .documents
            .iter()
            .map(|d| d.document.path())
            .chain(self.deletions.iter().map(String::as_str));
        for path in paths {
            validate_path(path)?;
            if !seen.insert(path) {
                return Err(Error::InvalidPath(format!(
                    "path named twice in one publish: {}",
                    path
                )));
            }
        }
        Ok(())
    }
}

/// result of a successful publish
#[derive(Clone, Debug)]
pub struct PublishReport {
    /// head the commit was built on
    pub base: ObjectId,
    pub tree: ObjectId,
    /// new branch head
    pub commit: ObjectId,
    pub uploaded: Vec<UploadedObject>,
    /// documents as committed, with references rewritten
    pub documents: Vec<Document>,
    /// 1 unless conflict retries were needed
    pub attempts: u32,
}

/// publish a single document and its assets
pub fn publish_document(
    store: &dyn ObjectStore,
    document: Document,
    assets: Vec<PendingAsset>,
    binding: AssetBinding,
    options: &PublishOptions,
    progress: &dyn Progress,
) -> Result<PublishReport> {
    let changeset = Changeset::new().document(document, assets, binding);
    publish(store, &changeset, options, progress)
}

/// commit a changeset to the branch as a single commit
///
/// the branch ref is only written in the last step. a failure before it
/// leaves the ref exactly where it was; objects created up to that point
/// stay unreferenced in the store.
pub fn publish(
    store: &dyn ObjectStore,
    changeset: &Changeset,
    options: &PublishOptions,
    progress: &dyn Progress,
) -> Result<PublishReport> {
    if changeset.is_empty() {
        return Err(Error::NothingToPublish);
    }
    changeset.validate()?;

    let mut attempt = 1;
    loop {
        match publish_once(store, changeset, options, progress) {
            Ok(mut report) => {
                report.attempts = attempt;
                return Ok(report);
            }
            Err(e) if is_ref_conflict(&e) && attempt <= options.conflict_retries => {
                warn!(attempt, error = %e, "branch moved during publish, starting over");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn publish_once(
    store: &dyn ObjectStore,
    changeset: &Changeset,
    options: &PublishOptions,
    progress: &dyn Progress,
) -> Result<PublishReport> {
    let ref_name = options.ref_name();
    progress.on_state(State::Idle);

    let base = step(Stage::FetchRef, options, progress, || store.get_ref(&ref_name))?;
    info!(branch = %options.branch, base = %base.short(), "fetched branch head");

    let upload_options = UploadOptions {
        concurrency: options.upload_concurrency,
        cancel: options.cancel.clone(),
    };
    let outcome = step(Stage::UploadAssets, options, progress, || {
        process_changes(store, &changeset.documents, &upload_options, progress)
    })?;
    let documents = outcome.documents;
    let mut entries = outcome.entries;
    let uploaded = outcome.uploaded;
    info!(uploaded = uploaded.len(), "assets uploaded");

    let document_entries = step(Stage::CreateDocumentBlob, options, progress, || {
        let mut out = Vec::with_capacity(documents.len() + changeset.deletions.len());
        for document in &documents {
            let text = document.to_canonical_string()?;
            let sha = store.create_blob(&STANDARD.encode(text.as_bytes()), Encoding::Base64)?;
            out.push(TreeEntry::blob(document.path(), sha)?);
        }
        for path in &changeset.deletions {
            out.push(TreeEntry::delete(path.clone())?);
        }
        Ok(out)
    })?;
    entries.extend(document_entries);

    let tree = step(Stage::CreateTree, options, progress, || {
        store.create_tree(&entries, &base)
    })?;
    info!(tree = %tree.short(), entries = entries.len(), "tree created");

    let request = CommitRequest::on(base.clone(), tree.clone(), options.message.clone());
    let commit = step(Stage::CreateCommit, options, progress, || {
        store.create_commit(&request)
    })?;
    info!(commit = %commit.short(), "commit created");

    step(Stage::UpdateRef, options, progress, || {
        advance_ref(store, &ref_name, &commit)
    })?;
    info!(branch = %options.branch, commit = %commit.short(), "branch updated");

    Ok(PublishReport {
        base,
        tree,
        commit,
        uploaded,
        documents,
        attempts: 1,
    })
}

/// the branch moved between reading it and updating it
fn is_ref_conflict(e: &Error) -> bool {
    e.kind() == ErrorKind::Conflict && e.stage() == Some(Stage::UpdateRef)
}

/// move the ref, accepting a conflict that is our own earlier success
fn advance_ref(store: &dyn ObjectStore, ref_name: &str, commit: &ObjectId) -> Result<()> {
    match store.update_ref(ref_name, commit) {
        Err(Error::Conflict(message)) => match store.get_ref(ref_name) {
            Ok(current) if current == *commit => {
                info!(commit = %commit.short(), "ref already at our commit");
                Ok(())
            }
            Ok(_) => Err(Error::Conflict(message)),
            Err(e) => {
                warn!(error = %e, "could not re-read ref after conflict");
                Err(Error::Conflict(message))
            }
        },
        other => other,
    }
}

/// run one stage: honour cancellation, tag failures, report progress
fn step<T>(
    stage: Stage,
    options: &PublishOptions,
    progress: &dyn Progress,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let result = if options.cancelled() {
        Err(Error::Cancelled)
    } else {
        f()
    };

    match result {
        Ok(value) => {
            progress.on_state(stage.completes());
            Ok(value)
        }
        Err(e) => {
            progress.on_state(State::Failed(stage));
            Err(e.at(stage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest;
    use crate::ops::progress::NoProgress;
    use crate::remote::{MemoryStore, Op};
    use crate::types::AssetLayout;
    use serde_json::json;
    use std::sync::Mutex;

    const MAIN: &str = "heads/main";
    const LIST: &str = "src/app/Tutorial/list.json";

    fn options() -> PublishOptions {
        PublishOptions::new("main", "update projects")
    }

    fn binding() -> AssetBinding {
        AssetBinding::in_place(AssetLayout::new("images", "images", "project"), "url")
    }

    fn one_asset() -> (Document, Vec<PendingAsset>) {
        (
            Document::new(LIST, vec![json!({"url": "a.png"})]).unwrap(),
            vec![PendingAsset::new("a.png", "a.png", b"X".to_vec())],
        )
    }

    fn publish_one(store: &MemoryStore, opts: &PublishOptions) -> Result<PublishReport> {
        let (document, assets) = one_asset();
        publish_document(store, document, assets, binding(), opts, &NoProgress)
    }

    #[derive(Default)]
    struct States(Mutex<Vec<State>>);

    impl Progress for States {
        fn on_state(&self, state: State) {
            self.0.lock().unwrap().push(state);
        }
    }

    #[test]
    fn test_single_asset_scenario() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let before = store.ref_target(MAIN).unwrap();

        let report = publish_one(&store, &options()).unwrap();

        let h1 = digest(b"X");
        let asset_path = format!("images/project/{}.png", h1);

        // one asset blob, one document blob
        assert_eq!(store.count(Op::CreateBlob), 2);
        assert_eq!(
            store.calls(),
            vec![
                Op::GetRef,
                Op::CreateBlob,
                Op::CreateBlob,
                Op::CreateTree,
                Op::CreateCommit,
                Op::UpdateRef,
            ]
        );

        let mut paths = store.tree_paths(&report.commit).unwrap();
        paths.sort();
        let mut expected = vec![asset_path.clone(), LIST.to_string()];
        expected.sort();
        assert_eq!(paths, expected);

        assert_eq!(report.documents[0].records()[0]["url"], asset_path);
        let committed = store.read_path(&report.commit, LIST).unwrap().unwrap();
        let committed: serde_json::Value = serde_json::from_slice(&committed).unwrap();
        assert_eq!(committed, json!([{"url": asset_path}]));

        assert_eq!(store.read_path(&report.commit, &asset_path).unwrap(), Some(b"X".to_vec()));

        assert_eq!(store.ref_target(MAIN), Some(report.commit.clone()));
        assert_eq!(report.base, before);
        let commit = store.commit(&report.commit).unwrap();
        assert_eq!(commit.parents, vec![before]);
        assert_eq!(commit.message, "update projects");
        assert_eq!(report.attempts, 1);
    }

    #[test]
    fn test_shared_content_one_asset_blob() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let document = Document::new(
            LIST,
            vec![json!({"url": "a.png"}), json!({"url": "b.png"})],
        )
        .unwrap();
        let assets = vec![
            PendingAsset::new("a.png", "a.png", b"same".to_vec()),
            PendingAsset::new("b.png", "b.png", b"same".to_vec()),
        ];

        let report =
            publish_document(&store, document, assets, binding(), &options(), &NoProgress)
                .unwrap();

        // one for the asset, one for the document
        assert_eq!(store.count(Op::CreateBlob), 2);
        let records = report.documents[0].records();
        assert_eq!(records[0]["url"], records[1]["url"]);
        assert_eq!(store.tree_paths(&report.commit).unwrap().len(), 2);
    }

    #[test]
    fn test_content_shared_across_documents_uploaded_once() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let first = Document::new(LIST, vec![json!({"url": "k1"})]).unwrap();
        let second = Document::new("src/app/Share/list.json", vec![json!({"url": "k2"})]).unwrap();

        let changeset = Changeset::new()
            .document(
                first,
                vec![PendingAsset::new("k1", "a.png", b"same".to_vec())],
                binding(),
            )
            .document(
                second,
                vec![PendingAsset::new("k2", "b.png", b"same".to_vec())],
                binding(),
            );

        let report = publish(&store, &changeset, &options(), &NoProgress).unwrap();

        // one asset blob plus two document blobs
        assert_eq!(store.count(Op::CreateBlob), 3);
        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(
            report.documents[0].records()[0]["url"],
            report.documents[1].records()[0]["url"]
        );
        assert_eq!(store.tree_paths(&report.commit).unwrap().len(), 3);
    }

    #[test]
    fn test_keeps_unrelated_files() {
        let store = MemoryStore::new();
        store
            .seed(MAIN, &[("README.md", b"hi".as_slice()), (LIST, b"[]".as_slice())])
            .unwrap();

        let report = publish_one(&store, &options()).unwrap();
        let paths = store.tree_paths(&report.commit).unwrap();
        assert!(paths.contains(&"README.md".to_string()));
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn test_commit_failure_never_updates_ref() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        store.fail_next(Op::CreateCommit, Error::Network("timeout".into()));

        let err = publish_one(&store, &options()).unwrap_err();

        assert_eq!(err.stage(), Some(Stage::CreateCommit));
        assert_eq!(store.count(Op::UpdateRef), 0);
        assert_eq!(store.calls().last(), Some(&Op::CreateCommit));
    }

    #[test]
    fn test_ref_unchanged_on_failure_at_each_stage() {
        // without assets the first blob created is the document's
        let cases = [
            (Op::GetRef, Stage::FetchRef, true),
            (Op::CreateBlob, Stage::UploadAssets, true),
            (Op::CreateBlob, Stage::CreateDocumentBlob, false),
            (Op::CreateTree, Stage::CreateTree, true),
            (Op::CreateCommit, Stage::CreateCommit, true),
            (Op::UpdateRef, Stage::UpdateRef, true),
        ];

        for (op, stage, with_assets) in cases {
            let store = MemoryStore::with_ref(MAIN).unwrap();
            let before = store.ref_target(MAIN).unwrap();
            store.fail_next(op, Error::Auth("revoked".into()));

            let (document, assets) = one_asset();
            let assets = if with_assets { assets } else { vec![] };
            let err = publish_document(&store, document, assets, binding(), &options(), &NoProgress)
                .unwrap_err();

            assert_eq!(err.stage(), Some(stage), "failing {}", op);
            assert_eq!(err.kind(), ErrorKind::Auth);
            assert_eq!(store.get_ref(MAIN).unwrap(), before);
        }
    }

    #[test]
    fn test_conflict_surfaces_without_retry() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let other = publish_one(&store, &options()).unwrap().commit;

        // a concurrent writer moved the branch after we read it
        store.fail_next(Op::UpdateRef, Error::Conflict("not a fast forward".into()));
        store.clear_calls();
        let (document, _) = one_asset();
        let err = publish_document(&store, document, vec![], binding(), &options(), &NoProgress)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.stage(), Some(Stage::UpdateRef));
        assert_eq!(store.count(Op::UpdateRef), 1);
        assert_eq!(store.count(Op::CreateCommit), 1);
        assert_eq!(store.ref_target(MAIN), Some(other));
    }

    #[test]
    fn test_real_concurrent_writer_conflict() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let base = store.ref_target(MAIN).unwrap();

        // build a competing head that does not descend from our commit
        let tree = store.create_tree(&[], &base).unwrap();
        let theirs = store
            .create_commit(&CommitRequest::on(base, tree, "theirs"))
            .unwrap();

        struct MoveAfterCommit<'a> {
            store: &'a MemoryStore,
            theirs: ObjectId,
        }
        impl Progress for MoveAfterCommit<'_> {
            fn on_state(&self, state: State) {
                if state == State::CommitCreated {
                    self.store.set_ref(MAIN, &self.theirs);
                }
            }
        }

        let (document, assets) = one_asset();
        let hook = MoveAfterCommit {
            store: &store,
            theirs: theirs.clone(),
        };
        let err = publish_document(&store, document, assets, binding(), &options(), &hook)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(store.ref_target(MAIN), Some(theirs));
    }

    #[test]
    fn test_conflict_retry_starts_over() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        store.fail_next(Op::UpdateRef, Error::Conflict("moved".into()));

        let mut opts = options();
        opts.conflict_retries = 1;
        let report = publish_one(&store, &opts).unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(store.count(Op::GetRef), 3); // fetch, conflict check, fetch again
        assert_eq!(store.count(Op::UpdateRef), 2);
        assert_eq!(store.ref_target(MAIN), Some(report.commit));
    }

    #[test]
    fn test_conflict_kept_when_ref_reread_fails() {
        let store = MemoryStore::with_ref(MAIN).unwrap();

        struct ConflictThenOffline<'a>(&'a MemoryStore);
        impl Progress for ConflictThenOffline<'_> {
            fn on_state(&self, state: State) {
                if state == State::CommitCreated {
                    self.0
                        .fail_next(Op::UpdateRef, Error::Conflict("moved".into()));
                    self.0
                        .fail_next(Op::GetRef, Error::Network("connection reset".into()));
                }
            }
        }

        let (document, assets) = one_asset();
        let before = store.ref_target(MAIN);
        let err = publish_document(
            &store,
            document,
            assets,
            binding(),
            &options(),
            &ConflictThenOffline(&store),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.stage(), Some(Stage::UpdateRef));
        assert_eq!(store.count(Op::GetRef), 2);
        assert_eq!(store.ref_target(MAIN), before);
    }

    #[test]
    fn test_conflict_before_ref_update_not_retried() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        store.fail_next(Op::CreateTree, Error::Conflict("409 from create-tree".into()));

        let mut opts = options();
        opts.conflict_retries = 3;
        let err = publish_one(&store, &opts).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.stage(), Some(Stage::CreateTree));
        assert_eq!(store.count(Op::GetRef), 1);
        assert_eq!(store.count(Op::CreateTree), 1);
    }

    #[test]
    fn test_conflict_against_own_success_is_ok() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        store.fail_next_after(Op::UpdateRef, Error::Conflict("already moved".into()));

        let report = publish_one(&store, &options()).unwrap();
        assert_eq!(store.ref_target(MAIN), Some(report.commit));
        assert_eq!(store.count(Op::UpdateRef), 1);
    }

    #[test]
    fn test_missing_branch_is_not_found() {
        let store = MemoryStore::with_ref("heads/other").unwrap();
        let err = publish_one(&store, &options()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.stage(), Some(Stage::FetchRef));
        assert_eq!(store.calls(), vec![Op::GetRef]);
    }

    #[test]
    fn test_progress_states_in_order() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let states = States::default();
        let (document, assets) = one_asset();

        publish_document(&store, document, assets, binding(), &options(), &states).unwrap();

        assert_eq!(
            *states.0.lock().unwrap(),
            vec![
                State::Idle,
                State::RefFetched,
                State::AssetsUploaded,
                State::DocumentBlobCreated,
                State::TreeCreated,
                State::CommitCreated,
                State::RefUpdated,
            ]
        );
    }

    #[test]
    fn test_progress_reports_failure() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        store.fail_next(Op::CreateTree, Error::InvalidContent("bad".into()));
        let states = States::default();
        let (document, assets) = one_asset();

        publish_document(&store, document, assets, binding(), &options(), &states).unwrap_err();

        assert_eq!(
            states.0.lock().unwrap().last(),
            Some(&State::Failed(Stage::CreateTree))
        );
    }

    #[test]
    fn test_cancelled_publish_leaves_ref() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let before = store.ref_target(MAIN);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut opts = options();
        opts.cancel = Some(cancel);

        let err = publish_one(&store, &opts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(store.calls().is_empty());
        assert_eq!(store.ref_target(MAIN), before);
    }

    #[test]
    fn test_changeset_with_deletions_and_two_documents() {
        let store = MemoryStore::new();
        store
            .seed(
                MAIN,
                &[
                    ("public/blogs/old/index.md", b"old".as_slice()),
                    ("public/blogs/keep/index.md", b"keep".as_slice()),
                ],
            )
            .unwrap();

        let index = Document::new(
            "public/blogs/index.json",
            vec![json!({"slug": "keep", "cover": "blob:1"})],
        )
        .unwrap();
        let categories = Document::new(
            "public/blogs/categories.json",
            vec![json!({"name": "rust"})],
        )
        .unwrap();
        let blog_binding =
            AssetBinding::in_place(AssetLayout::new("public/images", "/images", "blog"), "cover");

        let changeset = Changeset::new()
            .document(
                index,
                vec![PendingAsset::new("blob:1", "cover.jpg", b"jpg".to_vec())],
                blog_binding.clone(),
            )
            .document(categories, vec![], blog_binding)
            .delete("public/blogs/old/index.md");

        let report = publish(&store, &changeset, &options(), &NoProgress).unwrap();
        let paths = store.tree_paths(&report.commit).unwrap();

        assert!(!paths.contains(&"public/blogs/old/index.md".to_string()));
        assert!(paths.contains(&"public/blogs/keep/index.md".to_string()));
        assert!(paths.contains(&"public/blogs/index.json".to_string()));
        assert!(paths.contains(&"public/blogs/categories.json".to_string()));
        assert!(paths.contains(&format!("public/images/blog/{}.jpg", digest(b"jpg"))));
        assert_eq!(store.count(Op::CreateCommit), 1);
        assert_eq!(store.count(Op::UpdateRef), 1);
    }

    #[test]
    fn test_empty_changeset() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let err = publish(&store, &Changeset::new(), &options(), &NoProgress).unwrap_err();
        assert!(matches!(err, Error::NothingToPublish));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let (document, _) = one_asset();
        let changeset = Changeset::new()
            .document(document, vec![], binding())
            .delete(LIST);

        let err = publish(&store, &changeset, &options(), &NoProgress).unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_republish_same_content_same_paths() {
        let store = MemoryStore::with_ref(MAIN).unwrap();
        let first = publish_one(&store, &options()).unwrap();
        let second = publish_one(&store, &options()).unwrap();

        assert_eq!(first.uploaded[0].path, second.uploaded[0].path);
        assert_eq!(second.base, first.commit);
        assert_eq!(
            store.tree_paths(&first.commit).unwrap(),
            store.tree_paths(&second.commit).unwrap()
        );
    }
}
