//! Error taxonomy shared by every worker

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The server answered with something other than 200
    #[error("request to {url} failed with status {status}")]
    RequestFailed { url: String, status: u16 },

    /// Transport-level failure (DNS, connect, reset, body read)
    #[error("request to {url} failed: {source}")]
    RequestError {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{target} timed out")]
    Timeout { target: String },

    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),

    /// Tag read/write failed, or the cover it needed was unreachable
    #[error("tag error: {0}")]
    TagError(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("no plugin loaded")]
    PluginNotLoaded,

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("file system error at `{path}`: {source}")]
    FileSystemError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker stopped")]
    WorkerStopped,

    #[error("task panicked")]
    Panicked,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn tag(message: impl Into<String>) -> Self {
        Self::TagError(message.into())
    }

    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystemError {
            path: path.into(),
            source,
        }
    }

    pub fn timeout(target: impl Into<String>) -> Self {
        Self::Timeout {
            target: target.into(),
        }
    }

    /// Classify a reqwest error into the transport taxonomy
    pub fn transport(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::RequestError {
                url: url.to_string(),
                source,
            }
        }
    }
}
