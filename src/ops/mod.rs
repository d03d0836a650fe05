//! high-level publish operations

mod progress;
mod publish;
mod upload;

pub use progress::{CancelToken, LogProgress, NoProgress, Progress, Stage, State};
pub use publish::{publish, publish_document, Changeset, PublishOptions, PublishReport};
pub use upload::{
    process, process_changes, AssetBinding, ChangesOutcome, DocumentChange, UploadOptions,
    UploadOutcome,
};
