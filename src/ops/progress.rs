use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// a step of a publish, named by what it does
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    FetchRef,
    UploadAssets,
    CreateDocumentBlob,
    CreateTree,
    CreateCommit,
    UpdateRef,
}

impl Stage {
    /// state reached when this stage succeeds
    pub fn completes(self) -> State {
        match self {
            Stage::FetchRef => State::RefFetched,
            Stage::UploadAssets => State::AssetsUploaded,
            Stage::CreateDocumentBlob => State::DocumentBlobCreated,
            Stage::CreateTree => State::TreeCreated,
            Stage::CreateCommit => State::CommitCreated,
            Stage::UpdateRef => State::RefUpdated,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::FetchRef => "fetch-ref",
            Stage::UploadAssets => "upload-assets",
            Stage::CreateDocumentBlob => "create-document-blob",
            Stage::CreateTree => "create-tree",
            Stage::CreateCommit => "create-commit",
            Stage::UpdateRef => "update-ref",
        };
        f.write_str(s)
    }
}

/// publish state machine
///
/// `Idle -> RefFetched -> AssetsUploaded -> DocumentBlobCreated ->
/// TreeCreated -> CommitCreated -> RefUpdated`, with any step able to end
/// in `Failed` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    RefFetched,
    AssetsUploaded,
    DocumentBlobCreated,
    TreeCreated,
    CommitCreated,
    RefUpdated,
    Failed(Stage),
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::RefUpdated | State::Failed(_))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => f.write_str("idle"),
            State::RefFetched => f.write_str("ref fetched"),
            State::AssetsUploaded => f.write_str("assets uploaded"),
            State::DocumentBlobCreated => f.write_str("document blob created"),
            State::TreeCreated => f.write_str("tree created"),
            State::CommitCreated => f.write_str("commit created"),
            State::RefUpdated => f.write_str("ref updated"),
            State::Failed(stage) => write!(f, "failed at {}", stage),
        }
    }
}

/// receives checkpoints of a running publish
///
/// `on_asset` may be called from upload worker threads.
pub trait Progress: Sync {
    fn on_state(&self, _state: State) {}

    /// an asset reference was resolved to `path`; `uploaded` is false when
    /// the content was already uploaded earlier in the same publish
    fn on_asset(&self, _key: &str, _path: &str, _uploaded: bool) {}
}

/// discards all progress
pub struct NoProgress;

impl Progress for NoProgress {}

/// reports progress through tracing
pub struct LogProgress;

impl Progress for LogProgress {
    fn on_state(&self, state: State) {
        info!(%state, "publish");
    }

    fn on_asset(&self, key: &str, path: &str, uploaded: bool) {
        info!(key, path, uploaded, "asset");
    }
}

/// cooperative cancellation flag checked before each remote step
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
