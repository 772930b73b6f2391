// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when reading a session transcript
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Session file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Permission denied reading file: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {message}")]
    MalformedJson { path: PathBuf, message: String },

    #[error("Empty session file: {path}")]
    EmptyFile { path: PathBuf },
}

/// Errors that can occur during session discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Session storage directory not found: {path}")]
    StorageDirNotFound { path: PathBuf },

    #[error("Cannot access session storage directory: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Home directory not found")]
    HomeDirNotFound,
}

impl ParseError {
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MalformedJson {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl DiscoveryError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::StorageDirNotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}
