//! Reporter trait for dependency injection
//!
//! This trait allows core logic to report progress and status without
//! being coupled to a specific terminal or GUI implementation.

use std::fmt;

/// Where an update run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStatus {
    /// Comparing the request against the installed state.
    CheckingVersion,
    /// Nothing to do for this fork.
    UpToDate,
    /// A download is required.
    NeedsDownload,
    /// Fetching the content package.
    Downloading,
    /// Hashing the downloaded bytes.
    Verifying,
    /// Unpacking into the install directory and ingesting into the content store.
    Extracting,
    /// Fetching an engine archive.
    DownloadingEngine,
    /// Removing engines nothing refers to.
    CullingEngine,
    /// Removing old content versions.
    CullingContent,
    /// Writing the installation record.
    Committing,
    /// The installation record points at the new version.
    Committed,
    /// The run failed; nothing was committed.
    Failed,
}

impl UpdateStatus {
    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::CheckingVersion => "checking version",
            Self::UpToDate => "up to date",
            Self::NeedsDownload => "needs download",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Extracting => "extracting",
            Self::DownloadingEngine => "downloading engine",
            Self::CullingEngine => "culling engines",
            Self::CullingContent => "culling content",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states end a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::UpToDate | Self::Committed | Self::Failed)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Unit of a [`Progress`] counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    /// Bytes transferred.
    Bytes,
    /// Files processed.
    Files,
}

/// Incremental progress within one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Work done so far.
    pub current: u64,
    /// Total work, when known.
    pub total: Option<u64>,
    /// What is being counted.
    pub unit: ProgressUnit,
}

impl Progress {
    /// Byte progress.
    pub fn bytes(current: u64, total: Option<u64>) -> Self {
        Self {
            current,
            total,
            unit: ProgressUnit::Bytes,
        }
    }

    /// File progress.
    pub fn files(current: u64, total: u64) -> Self {
        Self {
            current,
            total: Some(total),
            unit: ProgressUnit::Files,
        }
    }

    /// Completion ratio in `0.0..=1.0`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.current.min(total) as f64) / (total as f64)),
            None => None,
        }
    }
}

/// Sink for status and progress events.
pub trait Reporter: Send + Sync {
    /// The named subject (a fork id or engine version) entered a new status.
    fn status(&self, subject: &str, status: UpdateStatus);

    /// Progress within the subject's current status.
    fn progress(&self, subject: &str, progress: Progress);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn status(&self, subject: &str, status: UpdateStatus) {
        (**self).status(subject, status);
    }
    fn progress(&self, subject: &str, progress: Progress) {
        (**self).progress(subject, progress);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn error(&self, msg: &str) {
        (**self).error(msg);
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn status(&self, _: &str, _: UpdateStatus) {}
    fn progress(&self, _: &str, _: Progress) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
}

/// Records every status transition. Handy for asserting state machine paths.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: std::sync::Mutex<Vec<(String, UpdateStatus)>>,
}

impl RecordingReporter {
    /// Statuses seen so far, in order.
    pub fn statuses(&self) -> Vec<(String, UpdateStatus)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl Reporter for RecordingReporter {
    fn status(&self, subject: &str, status: UpdateStatus) {
        if let Ok(mut events) = self.events.lock() {
            events.push((subject.to_string(), status));
        }
    }
    fn progress(&self, _: &str, _: Progress) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
}
