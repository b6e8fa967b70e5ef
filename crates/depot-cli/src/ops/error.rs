//! Domain-specific errors for update and engine operations

use depot_core::ErrorKind;
use depot_core::extract::ExtractError;
use depot_core::manifest::ManifestError;
use depot_core::net::{BlobError, DownloadError};
use depot_core::store::StoreError;
use thiserror::Error;

use crate::store::{StateError, WriterError};

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Blob download failed: {0}")]
    Blobs(#[from] BlobError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fork '{0}' is already being updated")]
    AlreadyUpdating(String),

    #[error("Update cancelled")]
    Cancelled,

    #[error("Engine {0} is not installed")]
    EngineNotInstalled(String),

    #[error("Engine {version} is recorded but {path} is missing")]
    EngineFileMissing { version: String, path: String },

    #[error("Engine {version} has a malformed signature: {source}")]
    BadSignature {
        version: String,
        source: hex::FromHexError,
    },

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl UpdateError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Manifest(e) => e.kind(),
            Self::Download(e) => e.kind(),
            Self::Blobs(e) => e.kind(),
            Self::Extract(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Writer(e) => e.kind(),
            Self::State(e) => e.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::EngineNotInstalled(_) | Self::EngineFileMissing { .. } => ErrorKind::NotFound,
            Self::BadSignature { .. } => ErrorKind::CorruptData,
            Self::Io(_) | Self::AlreadyUpdating(_) | Self::Context { .. } => ErrorKind::Io,
        }
    }
}
