use serde::{Deserialize, Serialize};

use crate::types::ObjectId;

/// a commit to create in the remote store
///
/// publishes always produce linear history, so a request built by
/// [`CommitRequest::on`] has exactly one parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub message: String,
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
}

impl CommitRequest {
    /// a commit of `tree` on top of `parent`
    pub fn on(parent: ObjectId, tree: ObjectId, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tree,
            parents: vec![parent],
        }
    }

    /// the single parent of a publish commit
    pub fn parent(&self) -> Option<&ObjectId> {
        self.parents.first()
    }
}
