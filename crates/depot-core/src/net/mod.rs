//! Networking: mirror racing, verified downloads and the blob protocol.

mod blobs;
mod download;
mod mirror;
mod race;

pub use blobs::{
    BlobError, BlobRequest, DOWNLOAD_PROTOCOL, FLAG_PRE_COMPRESSED, MAX_PROTOCOL_HEADER,
    MIN_PROTOCOL_HEADER, PROTOCOL_HEADER, check_protocol, download_blobs, fetch_manifest,
};
pub use download::{DownloadError, DownloadOutcome, DownloadRequest, download_verified};
pub use mirror::MirrorSet;
pub use race::{AttemptError, MirrorRacer, RaceError, Won};

/// HTTP client shared by every request.
///
/// # Errors
///
/// Fails when the TLS backend cannot be initialized.
pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .build()
}
