//! Blob download protocol for manifest-described content.
//!
//! `OPTIONS` on the download URL advertises the supported protocol range in
//! [`MIN_PROTOCOL_HEADER`] and [`MAX_PROTOCOL_HEADER`]. A `POST` whose body lists
//! the wanted manifest line indices as little-endian `u32`s answers with:
//!
//! ```text
//! u32 flags                 bit 0: blobs are zstd pre-compressed
//! per requested index, in request order:
//!   u32 size                uncompressed size
//!   u32 compressed size     only with bit 0 set; 0 means sent raw
//!   bytes
//! ```
//!
//! Every blob is checked against its manifest hash before it is staged. The
//! manifest itself is fetched with [`fetch_manifest`] and checked against the
//! SHA-256 the build manifest announced for it.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use depot_schema::{ContentManifest, ContentManifestError, Sha256Digest};
use futures::TryStreamExt;
use reqwest::header::{CONTENT_TYPE, USER_AGENT as USER_AGENT_HEADER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::download::within;
use crate::USER_AGENT;
use crate::error::ErrorKind;
use crate::reporter::{Progress, Reporter};

/// Protocol version this client speaks.
pub const DOWNLOAD_PROTOCOL: u32 = 1;
/// Lowest protocol the server accepts.
pub const MIN_PROTOCOL_HEADER: &str = "X-Depot-Download-Min-Protocol";
/// Highest protocol the server accepts.
pub const MAX_PROTOCOL_HEADER: &str = "X-Depot-Download-Max-Protocol";
/// Protocol the request body is written in.
pub const PROTOCOL_HEADER: &str = "X-Depot-Download-Protocol";
/// Stream flag: blobs carry a compressed size and zstd payload.
pub const FLAG_PRE_COMPRESSED: u32 = 1;
/// Largest blob the client accepts, compressed or not.
pub const MAX_BLOB_SIZE: usize = 1 << 30;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Response body broke off: {0}")]
    Body(io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Download server does not advertise its protocol versions")]
    MissingProtocol,

    #[error("Download server speaks protocols {min} to {max}, need {DOWNLOAD_PROTOCOL}")]
    UnsupportedProtocol { min: u32, max: u32 },

    #[error("Content manifest is malformed: {0}")]
    Manifest(#[from] ContentManifestError),

    #[error("Content manifest hash mismatch: expected {expected}, got {actual}")]
    ManifestHashMismatch { expected: String, actual: String },

    #[error("Manifest has no line {0}")]
    BadIndex(usize),

    #[error("Blob for '{path}' declares {size} bytes")]
    TooLarge { path: String, size: usize },

    #[error("Blob for '{path}' decompressed to the wrong size")]
    SizeMismatch { path: String },

    #[error("Blob for '{path}' does not match its manifest hash")]
    HashMismatch { path: String },

    #[error("Blob download stalled: no data for {0:?}")]
    Stalled(Duration),

    #[error("Blob download cancelled")]
    Cancelled,
}

impl BlobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_) | Self::Body(_) | Self::Stalled(_) => ErrorKind::Unreachable,
            Self::Io(_) => ErrorKind::Io,
            Self::MissingProtocol
            | Self::UnsupportedProtocol { .. }
            | Self::Manifest(_)
            | Self::ManifestHashMismatch { .. }
            | Self::BadIndex(_)
            | Self::TooLarge { .. }
            | Self::SizeMismatch { .. }
            | Self::HashMismatch { .. } => ErrorKind::CorruptData,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The server cannot serve manifest downloads at all, so the caller should
    /// use the whole-package route instead.
    pub fn is_unsupported(&self) -> bool {
        match self {
            Self::MissingProtocol | Self::UnsupportedProtocol { .. } => true,
            Self::Http(e) => matches!(
                e.status(),
                Some(StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED)
            ),
            _ => false,
        }
    }
}

/// One batch of blobs to fetch for a manifest.
#[derive(Debug)]
pub struct BlobRequest<'a> {
    pub client: &'a Client,
    /// Download endpoint of the content server.
    pub url: &'a str,
    pub manifest: &'a ContentManifest,
    /// Manifest line indices to fetch, in request order.
    pub wanted: &'a [usize],
    /// Verified blobs land here, named by their lowercase hex hash.
    pub staging: &'a Path,
    /// Longest wait for any single read.
    pub stall: Option<Duration>,
    pub subject: &'a str,
    pub cancel: &'a CancellationToken,
}

/// Download the content manifest at `url` and parse it. Returns the manifest
/// and the SHA-256 of the document.
///
/// # Errors
///
/// [`BlobError::ManifestHashMismatch`] when `expected` is given and differs,
/// [`BlobError::Manifest`] for malformed documents, transport errors otherwise.
pub async fn fetch_manifest(
    client: &Client,
    url: &str,
    expected: Option<&Sha256Digest>,
    stall: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(ContentManifest, Sha256Digest), BlobError> {
    let get = client.get(url).header(USER_AGENT_HEADER, USER_AGENT);
    let response = guard(cancel, stall, send(get)).await?;

    let mut stream = Box::pin(response.bytes_stream());
    let mut body = Vec::new();
    while let Some(chunk) =
        guard(cancel, stall, async { stream.try_next().await.map_err(BlobError::from) }).await?
    {
        body.extend_from_slice(&chunk);
    }

    let digest = Sha256Digest::compute(&body);
    if let Some(expected) = expected.filter(|e| **e != digest) {
        return Err(BlobError::ManifestHashMismatch {
            expected: expected.as_str().to_string(),
            actual: digest.as_str().to_string(),
        });
    }

    let manifest = ContentManifest::parse(&String::from_utf8_lossy(&body))?;
    tracing::debug!(url, files = manifest.len(), "content manifest fetched");
    Ok((manifest, digest))
}

/// Ask the server which protocol versions it speaks.
///
/// # Errors
///
/// [`BlobError::MissingProtocol`] when the headers are absent or unparsable,
/// [`BlobError::UnsupportedProtocol`] when the range excludes ours.
pub async fn check_protocol(client: &Client, url: &str) -> Result<u32, BlobError> {
    let response = client
        .request(Method::OPTIONS, url)
        .header(USER_AGENT_HEADER, USER_AGENT)
        .send()
        .await?
        .error_for_status()?;

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok())
    };
    let (Some(min), Some(max)) = (header(MIN_PROTOCOL_HEADER), header(MAX_PROTOCOL_HEADER)) else {
        return Err(BlobError::MissingProtocol);
    };
    tracing::debug!(url, min, max, "download server protocols");

    if min > DOWNLOAD_PROTOCOL || max < DOWNLOAD_PROTOCOL {
        return Err(BlobError::UnsupportedProtocol { min, max });
    }
    Ok(DOWNLOAD_PROTOCOL)
}

/// Fetch every wanted blob in one request and stage it under
/// `request.staging`. Returns the number of payload bytes received.
///
/// Nothing is requested when `wanted` is empty.
///
/// # Errors
///
/// Protocol, transport and verification failures; see [`BlobError`].
pub async fn download_blobs(
    request: BlobRequest<'_>,
    reporter: &dyn Reporter,
) -> Result<u64, BlobError> {
    if request.wanted.is_empty() {
        return Ok(0);
    }
    let entries = request.manifest.entries();
    let mut body = Vec::with_capacity(request.wanted.len() * 4);
    for &index in request.wanted {
        let wire = u32::try_from(index)
            .ok()
            .filter(|_| index < entries.len())
            .ok_or(BlobError::BadIndex(index))?;
        body.extend_from_slice(&wire.to_le_bytes());
    }

    guard(request.cancel, request.stall, check_protocol(request.client, request.url)).await?;

    let post = request
        .client
        .post(request.url)
        .header(USER_AGENT_HEADER, USER_AGENT)
        .header(PROTOCOL_HEADER, DOWNLOAD_PROTOCOL.to_string())
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(body);
    let response = guard(request.cancel, request.stall, send(post)).await?;

    let stream = response.bytes_stream().map_err(io::Error::other);
    let mut reader = StreamReader::new(Box::pin(stream));

    let mut flags = [0u8; 4];
    guard(request.cancel, request.stall, read_body(&mut reader, &mut flags)).await?;
    let pre_compressed = u32::from_le_bytes(flags) & FLAG_PRE_COMPRESSED != 0;

    tokio::fs::create_dir_all(request.staging).await?;
    let total = request.wanted.len() as u64;
    let mut received: u64 = 0;

    for (done, &index) in request.wanted.iter().enumerate() {
        let entry = &entries[index];
        let mut header = [0u8; 8];
        let header_len = if pre_compressed { 8 } else { 4 };
        guard(request.cancel, request.stall, read_body(&mut reader, &mut header[..header_len])).await?;

        let size = frame_len(&header[..4], &entry.path)?;
        let compressed = if pre_compressed {
            frame_len(&header[4..], &entry.path)?
        } else {
            0
        };

        let data = if compressed > 0 {
            let mut packed = vec![0u8; compressed];
            guard(request.cancel, request.stall, read_body(&mut reader, &mut packed)).await?;
            received += compressed as u64;
            let data = zstd::bulk::decompress(&packed, size).map_err(|_| BlobError::SizeMismatch {
                path: entry.path.clone(),
            })?;
            if data.len() != size {
                return Err(BlobError::SizeMismatch {
                    path: entry.path.clone(),
                });
            }
            data
        } else {
            let mut data = vec![0u8; size];
            guard(request.cancel, request.stall, read_body(&mut reader, &mut data)).await?;
            received += size as u64;
            data
        };

        if blake3::hash(&data).as_bytes() != &entry.hash {
            tracing::warn!(path = %entry.path, index, "blob hash mismatch");
            return Err(BlobError::HashMismatch {
                path: entry.path.clone(),
            });
        }
        tokio::fs::write(request.staging.join(hex::encode(entry.hash)), &data).await?;
        reporter.progress(request.subject, Progress::files(done as u64 + 1, total));
    }

    tracing::debug!(
        blobs = request.wanted.len(),
        bytes = received,
        pre_compressed,
        "blobs downloaded"
    );
    Ok(received)
}

fn frame_len(bytes: &[u8], path: &str) -> Result<usize, BlobError> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    let size = usize::try_from(u32::from_le_bytes(raw)).unwrap_or(usize::MAX);
    if size > MAX_BLOB_SIZE {
        return Err(BlobError::TooLarge {
            path: path.to_string(),
            size,
        });
    }
    Ok(size)
}

async fn send(builder: RequestBuilder) -> Result<Response, BlobError> {
    Ok(builder.send().await?.error_for_status()?)
}

async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), BlobError> {
    reader.read_exact(buf).await.map_err(BlobError::Body)?;
    Ok(())
}

/// Run one step of the exchange under the stall limit and the cancel token.
async fn guard<T>(
    cancel: &CancellationToken,
    stall: Option<Duration>,
    step: impl Future<Output = Result<T, BlobError>>,
) -> Result<T, BlobError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(BlobError::Cancelled),
        result = within(stall, step) => match result {
            Ok(inner) => inner,
            Err(limit) => Err(BlobError::Stalled(limit)),
        },
    }
}
