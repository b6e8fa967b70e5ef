//! Verified downloads through a mirror set.
//!
//! The body is streamed to disk while SHA-256 is computed on the fly. A digest
//! mismatch removes the file and is never retried here. Once the racer picks a
//! mirror, every read of its body is bounded by the racer's attempt timeout, so a
//! server that stops sending fails the download instead of hanging it.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use depot_schema::Sha256Digest;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::mirror::MirrorSet;
use super::race::{MirrorRacer, RaceError};
use crate::error::ErrorKind;
use crate::reporter::{Progress, Reporter, UpdateStatus};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error(transparent)]
    Race(#[from] RaceError<reqwest::Error>),

    #[error("Download stalled: no data for {0:?}")]
    Stalled(Duration),

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // A body that breaks off mid-stream is a mirror failure too.
            Self::Http(_) | Self::Stalled(_) => ErrorKind::Unreachable,
            Self::Io(_) => ErrorKind::Io,
            Self::HashMismatch { .. } => ErrorKind::CorruptData,
            Self::Race(e) => e.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Everything needed to fetch one verified file.
#[derive(Debug)]
pub struct DownloadRequest<'a> {
    pub client: &'a Client,
    pub mirrors: &'a MirrorSet,
    pub racer: &'a MirrorRacer,
    pub dest: &'a Path,
    /// Digest the body must hash to. `None` skips verification.
    pub expected: Option<&'a Sha256Digest>,
    /// Name reported alongside status and progress events.
    pub subject: &'a str,
    pub cancel: &'a CancellationToken,
}

/// A completed, verified download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub digest: Sha256Digest,
    pub bytes: u64,
    /// URL of the mirror that served the body.
    pub url: String,
}

/// Download through the fastest mirror into `dest`, reporting byte progress.
///
/// # Errors
///
/// [`DownloadError::HashMismatch`] when the body does not match `expected`; the
/// partial file is removed on every failure.
pub async fn download_verified(
    request: DownloadRequest<'_>,
    reporter: &dyn Reporter,
) -> Result<DownloadOutcome, DownloadError> {
    let result = fetch(&request, reporter).await;
    if result.is_err() {
        tokio::fs::remove_file(request.dest).await.ok();
    }
    result
}

async fn fetch(
    request: &DownloadRequest<'_>,
    reporter: &dyn Reporter,
) -> Result<DownloadOutcome, DownloadError> {
    let subject = request.subject;
    reporter.status(subject, UpdateStatus::Downloading);

    let won = request
        .mirrors
        .get(request.client, request.racer, request.cancel)
        .await?;
    let url = request.mirrors.urls()[won.index].clone();
    let response = won.value;
    let total = response.content_length();
    tracing::debug!(url = %url, total, "downloading");

    if let Some(parent) = request.dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(request.dest).await?;
    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;

    let stall = request.racer.attempt_timeout();

    loop {
        let chunk = tokio::select! {
            biased;
            () = request.cancel.cancelled() => return Err(DownloadError::Cancelled),
            chunk = within(stall, stream.next()) => chunk.map_err(DownloadError::Stalled)?,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        reporter.progress(subject, Progress::bytes(downloaded, total));
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    reporter.status(subject, UpdateStatus::Verifying);
    let bytes: [u8; 32] = hasher.finalize().into();
    let digest = Sha256Digest::from_bytes(&bytes);

    if let Some(expected) = request.expected.filter(|e| !e.matches(digest.as_str())) {
        tracing::warn!(url = %url, expected = %expected, actual = %digest, "hash mismatch");
        return Err(DownloadError::HashMismatch {
            expected: expected.to_string(),
            actual: digest.to_string(),
        });
    }

    Ok(DownloadOutcome {
        digest,
        bytes: downloaded,
        url,
    })
}

/// Await one body read. Past `limit` the read is dropped and the limit returned.
pub(crate) async fn within<T>(
    limit: Option<Duration>,
    read: impl Future<Output = T>,
) -> Result<T, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| limit),
        None => Ok(read.await),
    }
}
