use std::fmt;
use std::path::PathBuf;

use crate::ops::Stage;

/// error type for zine operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("ref conflict: {0}")]
    Conflict(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to upload asset {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("publish failed at {stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    #[error("publish cancelled")]
    Cancelled,

    #[error("nothing to publish")]
    NothingToPublish,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("document profile not found: {0}")]
    UnknownDocument(String),

    #[error("invalid digest hex: {0}")]
    InvalidDigestHex(String),

    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("invalid repository path: {0}")]
    InvalidPath(String),

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid asset spec (expected KEY=PATH): {0}")]
    InvalidAssetSpec(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// taxonomy class of a failure, looking through stage and upload wrappers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    NotFound,
    InvalidContent,
    Conflict,
    Network,
    Cancelled,
    Local,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidContent => "invalid-content",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Network => "network",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Local => "local",
        };
        f.write_str(s)
    }
}

impl Error {
    /// the innermost error, unwrapping stage and upload context
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } | Error::Upload { source, .. } => source.root(),
            other => other,
        }
    }

    /// classify the root cause
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Error::Auth(_) => ErrorKind::Auth,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidContent(_) => ErrorKind::InvalidContent,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Network(_) => ErrorKind::Network,
            Error::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Local,
        }
    }

    /// stage a publish failed at, if this came out of the assembler
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// wrap with the stage the failure happened in
    pub(crate) fn at(self, stage: Stage) -> Error {
        match self {
            // already tagged by an inner step
            e @ Error::Stage { .. } => e,
            e => Error::Stage {
                stage,
                source: Box::new(e),
            },
        }
    }
}

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
