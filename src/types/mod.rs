mod asset;
mod commit;
mod document;
mod object_id;
mod tree;

pub use asset::{extension_of, AssetLayout, PendingAsset};
pub use commit::CommitRequest;
pub use document::Document;
pub use object_id::ObjectId;
pub use tree::{validate_path, TreeEntry, UploadedObject, MODE_FILE};
