//! Content store: compressed blobs addressed by (content version, path).
//!
//! One SQLite file holds every ingested content version. Readers
//! ([`ContentStore`]) use a pool of read-only connections, each parked inside a
//! read transaction for its whole life. The single writer ([`ContentWriter`]) owns
//! the only read-write connection.

pub mod codec;
pub mod migrate;
mod reader;
mod schema;
mod writer;

pub use codec::{COMPRESSION_SAVINGS_THRESHOLD, CodecError, compress, compress_for_storage};
pub use migrate::{Migration, MigrationError, MigrationReport, Migrator, SqlMigration};
pub use reader::{ContentStore, ContentStream};
pub use schema::migrations;
pub use writer::{ContentVersion, ContentWriter, CullReport, Ingest, RetentionPolicy};

use thiserror::Error;

use crate::error::ErrorKind;
use crate::pool::PoolClosed;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{path}' is not part of content version {version_id}")]
    NotFound { version_id: i64, path: String },

    #[error("Content version {0} does not exist")]
    UnknownVersion(i64),

    #[error("Corrupt content at '{path}': {source}")]
    Corrupt { path: String, source: CodecError },

    #[error("Blob for '{path}' does not match its manifest hash")]
    HashMismatch { path: String },

    #[error("Stored path escapes the install directory: {0}")]
    UnsafePath(String),

    #[error("Unknown compression tag {tag} for '{path}'")]
    BadCompression { path: String, tag: i64 },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),

    #[error("Reader task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::UnknownVersion(_) => ErrorKind::NotFound,
            Self::Corrupt { source, .. } => match source {
                CodecError::Io(_) => ErrorKind::Io,
                _ => ErrorKind::CorruptData,
            },
            Self::BadCompression { .. } | Self::HashMismatch { .. } | Self::UnsafePath(_) => {
                ErrorKind::CorruptData
            }
            Self::Migration(_) => ErrorKind::SchemaMigrationFailed,
            Self::Sqlite(_) | Self::Io(_) | Self::PoolClosed(_) | Self::Task(_) => ErrorKind::Io,
        }
    }
}
