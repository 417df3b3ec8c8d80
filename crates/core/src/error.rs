// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur reading a monitored transcript source.
///
/// A missing source is NOT an error at the pipeline level (the session
/// lifecycle manager may not have created it yet); readers map
/// `NotFound` to an empty chunk. The variants exist so callers that do
/// care (tests, diagnostics) can still distinguish the cases.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transcript source not found: {path}")]
    NotFound { path: PathBuf },

    #[error("permission denied reading transcript: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors that can occur persisting or loading a conversation log.
///
/// Persistence failures never abort the live pipeline — the store logs
/// them and keeps the in-memory path working.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation log not found: {path}")]
    NotFound { path: PathBuf },

    #[error("permission denied accessing conversation log: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed conversation log {path}: {source}")]
    MalformedJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}
