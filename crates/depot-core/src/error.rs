//! Error taxonomy shared by every component.
//!
//! Each module keeps its own `thiserror` enum with the detail it needs, and
//! classifies itself into one [`ErrorKind`] so callers can decide on retries and
//! user-facing messages without matching on every variant.

use std::fmt;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing manifest entry, missing content path, uncommitted version.
    NotFound,
    /// Hash mismatch, decompression underrun or overrun, bad signature.
    CorruptData,
    /// Every mirror failed.
    Unreachable,
    /// The caller cancelled the operation.
    Cancelled,
    /// A schema migration failed part way.
    SchemaMigrationFailed,
    /// Disk-level failure.
    Io,
}

impl ErrorKind {
    /// Only an exhausted mirror set is worth re-running the resolve and fetch cycle.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unreachable)
    }

    /// Short name used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::CorruptData => "corrupt data",
            Self::Unreachable => "unreachable",
            Self::Cancelled => "cancelled",
            Self::SchemaMigrationFailed => "schema migration failed",
            Self::Io => "i/o error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_retries() {
        assert!(ErrorKind::Unreachable.is_retryable());
        assert!(!ErrorKind::CorruptData.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }
}
