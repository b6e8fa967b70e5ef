//! Update orchestration for one fork.
//!
//! ```text
//! CheckingVersion ─┬─> UpToDate
//!                  └─> NeedsDownload -> Downloading -> Verifying -> Extracting
//!                        -> DownloadingEngine -> Committing -> Committed
//! ```
//!
//! Content comes from the first source that works: a stored version with the
//! same hash, the per-file manifest (fetching only blobs the store lacks), or
//! the whole package zip.
//!
//! Any error reports `Failed` and leaves the installation record untouched. The
//! record is written once, at the end, and that write is the only point where a
//! new version becomes visible.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use depot_core::UpdateStatus;
use depot_core::extract::{ExtractedFile, clear_dir, extract_zip, restore_exec_bits};
use depot_core::net::{
    BlobRequest, DownloadRequest, MirrorSet, download_blobs, download_verified, fetch_manifest,
};
use depot_core::store::CullReport;
use depot_schema::{CompressionScheme, EngineVersion, ForkId, Sha256Digest};
use tokio_util::sync::CancellationToken;

use crate::ops::engine::{cull_engines, ensure_engine};
use crate::ops::{Context, UpdateError};
use crate::store::{IngestRequest, InstalledVersion, ManifestIngestRequest};

/// Where the per-file content manifest of a build is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentManifestSource {
    /// URL of the manifest document.
    pub url: String,
    /// Blob download endpoint speaking the depot download protocol.
    pub download_url: String,
    /// Expected SHA-256 of the manifest document.
    pub hash: Option<Sha256Digest>,
}

/// Server build information for one fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub fork_id: ForkId,
    /// Content version the server announces.
    pub version: String,
    /// Expected SHA-256 of the content package, when the server publishes one.
    pub hash: Option<Sha256Digest>,
    /// Equivalent download URLs for the content package, raced in order.
    pub download_urls: Vec<String>,
    /// Per-file manifest, preferred over the package when present.
    pub manifest: Option<ContentManifestSource>,
    /// Engine version the content needs.
    pub engine_version: EngineVersion,
}

impl UpdateRequest {
    /// Hash identifying the requested content: the manifest hash when one is
    /// published, otherwise the package hash.
    pub fn content_hash(&self) -> Option<&Sha256Digest> {
        self.manifest
            .as_ref()
            .and_then(|m| m.hash.as_ref())
            .or(self.hash.as_ref())
    }

    fn known_hashes(&self) -> impl Iterator<Item = &Sha256Digest> {
        let manifest = self.manifest.as_ref().and_then(|m| m.hash.as_ref());
        manifest
            .into_iter()
            .chain(self.hash.as_ref().filter(|h| Some(*h) != manifest))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing was downloaded.
    UpToDate(InstalledVersion),
    /// A new installation record was committed.
    Updated(InstalledVersion),
}

impl UpdateOutcome {
    /// Installation record after the run.
    pub fn installation(&self) -> &InstalledVersion {
        match self {
            Self::UpToDate(i) | Self::Updated(i) => i,
        }
    }
}

/// What a garbage collection pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub engines: Vec<EngineVersion>,
    pub content: CullReport,
}

/// Content committed to the store by an earlier attempt of the same run.
#[derive(Debug, Clone)]
struct FetchedContent {
    version_id: i64,
    hash: Sha256Digest,
}

/// Resources an in-flight update has produced but not yet committed.
#[derive(Debug, Default)]
struct Pins {
    content: Option<i64>,
    engine: Option<EngineVersion>,
}

type InFlight = Arc<Mutex<HashMap<String, Pins>>>;

/// Exclusive claim on one fork for the duration of an update.
struct ForkClaim {
    in_flight: InFlight,
    fork: String,
}

impl ForkClaim {
    fn acquire(in_flight: &InFlight, fork: &str) -> Result<Self, UpdateError> {
        let mut map = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(fork) {
            return Err(UpdateError::AlreadyUpdating(fork.to_string()));
        }
        map.insert(fork.to_string(), Pins::default());
        Ok(Self {
            in_flight: Arc::clone(in_flight),
            fork: fork.to_string(),
        })
    }

    fn pin(&self, f: impl FnOnce(&mut Pins)) {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pins) = map.get_mut(&self.fork) {
            f(pins);
        }
    }
}

impl Drop for ForkClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.fork);
    }
}

/// Runs updates. Different forks may update concurrently through one `Updater`;
/// the same fork may not.
pub struct Updater {
    ctx: Context,
    in_flight: InFlight,
}

impl fmt::Debug for Updater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Updater")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl Updater {
    /// Updater over `ctx`.
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            in_flight: Arc::default(),
        }
    }

    /// Shared services this updater runs with.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Bring `request.fork_id` to the requested content and engine versions.
    ///
    /// # Errors
    ///
    /// [`UpdateError::AlreadyUpdating`] when the fork is already being updated,
    /// [`UpdateError::Cancelled`] when `cancel` fires before the commit, and the
    /// underlying failure otherwise. The installation record is unchanged on error.
    pub async fn run(
        &self,
        request: &UpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, UpdateError> {
        let fork = request.fork_id.as_str();
        let claim = ForkClaim::acquire(&self.in_flight, fork)?;

        let result = self.update(request, &claim, cancel).await;
        match &result {
            Ok(UpdateOutcome::Updated(_)) => {
                drop(claim);
                self.collect_garbage().await;
            }
            Ok(UpdateOutcome::UpToDate(_)) => {}
            Err(err) => {
                tracing::warn!(fork, error = %err, kind = %err.kind(), "update failed");
                self.ctx.reporter.status(fork, UpdateStatus::Failed);
            }
        }
        result
    }

    async fn update(
        &self,
        request: &UpdateRequest,
        claim: &ForkClaim,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, UpdateError> {
        let ctx = &self.ctx;
        let fork = request.fork_id.as_str();
        ctx.reporter.status(fork, UpdateStatus::CheckingVersion);

        let existing = ctx.state.installation(fork);
        let content_current = existing
            .as_ref()
            .is_some_and(|installed| content_matches(installed, request));
        let engine_current = existing
            .as_ref()
            .is_some_and(|installed| installed.current_engine_version == request.engine_version)
            && ctx.state.engine(request.engine_version.as_str()).is_some()
            && ctx.paths.engine_zip(&request.engine_version).is_file();

        if let Some(installed) = existing.as_ref().filter(|_| content_current && engine_current) {
            tracing::debug!(fork, version = %installed.current_version, "up to date");
            ctx.reporter.status(fork, UpdateStatus::UpToDate);
            return Ok(UpdateOutcome::UpToDate(installed.clone()));
        }

        ctx.reporter.status(fork, UpdateStatus::NeedsDownload);
        let disk_id = match &existing {
            Some(installed) => installed.disk_id,
            None => ctx.state.reserve_disk_id()?,
        };
        tracing::info!(
            fork,
            version = %request.version,
            engine = %request.engine_version,
            disk_id,
            content_current,
            "update needed"
        );

        let attempts = ctx.config.update_attempts.max(1);
        let mut fetched: Option<FetchedContent> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .attempt(request, disk_id, content_current, &mut fetched, claim, cancel)
                .await;
            match result {
                Ok(()) => break,
                Err(err) if err.kind().is_retryable() && attempt < attempts => {
                    tracing::warn!(fork, attempt, error = %err, "mirrors unreachable, retrying");
                    ctx.reporter
                        .warning(&format!("{fork}: {err}; retrying ({attempt}/{attempts})"));
                    ctx.manifest.invalidate().await;
                }
                Err(err) => return Err(err),
            }
        }

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        ctx.reporter.status(fork, UpdateStatus::Committing);
        let record = match (fetched, existing) {
            (Some(content), _) => InstalledVersion {
                fork_id: fork.to_string(),
                disk_id,
                current_version: request.version.clone(),
                current_hash: Some(content.hash),
                current_engine_version: request.engine_version.clone(),
                content_version_id: Some(content.version_id),
            },
            (None, Some(installed)) => InstalledVersion {
                current_engine_version: request.engine_version.clone(),
                ..installed
            },
            (None, None) => {
                return Err(UpdateError::context("commit", "no content was fetched"));
            }
        };
        ctx.state.commit_installation(record.clone())?;
        ctx.reporter.status(fork, UpdateStatus::Committed);
        tracing::info!(fork, version = %record.current_version, "update committed");

        Ok(UpdateOutcome::Updated(record))
    }

    /// One resolve and fetch cycle. Content fetched by an earlier cycle is kept.
    async fn attempt(
        &self,
        request: &UpdateRequest,
        disk_id: u32,
        content_current: bool,
        fetched: &mut Option<FetchedContent>,
        claim: &ForkClaim,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        if !content_current && fetched.is_none() {
            let content = self.fetch_content(request, disk_id, cancel).await?;
            claim.pin(|p| p.content = Some(content.version_id));
            *fetched = Some(content);
        }

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        claim.pin(|p| p.engine = Some(request.engine_version.clone()));
        ensure_engine(&self.ctx, &request.engine_version, cancel).await?;
        Ok(())
    }

    async fn fetch_content(
        &self,
        request: &UpdateRequest,
        disk_id: u32,
        cancel: &CancellationToken,
    ) -> Result<FetchedContent, UpdateError> {
        let ctx = &self.ctx;
        let fork = request.fork_id.as_str();

        for hash in request.known_hashes() {
            let reused = ctx
                .writer
                .reuse_version(fork.to_string(), request.version.clone(), hash.to_bytes().to_vec())
                .await?;
            if let Some(version_id) = reused {
                ctx.reporter.status(fork, UpdateStatus::Extracting);
                let files = self.install_from_store(version_id, disk_id).await?;
                tracing::info!(fork, version_id, files, "content reused from store");
                return Ok(FetchedContent {
                    version_id,
                    hash: request.content_hash().unwrap_or(hash).clone(),
                });
            }
        }

        if let Some(source) = &request.manifest {
            match self.fetch_manifest_content(request, source, disk_id, cancel).await {
                Ok(content) => return Ok(content),
                Err(UpdateError::Blobs(err))
                    if err.is_unsupported() && !request.download_urls.is_empty() =>
                {
                    tracing::warn!(fork, error = %err, "manifest download unavailable, using package");
                }
                Err(err) => return Err(err),
            }
        }

        if request.download_urls.is_empty() {
            return Err(UpdateError::context("fetch content", "no download source"));
        }
        self.fetch_package(request, disk_id, cancel).await
    }

    /// Download only the blobs the store lacks, ingest the manifest, then write
    /// the install directory from the store.
    async fn fetch_manifest_content(
        &self,
        request: &UpdateRequest,
        source: &ContentManifestSource,
        disk_id: u32,
        cancel: &CancellationToken,
    ) -> Result<FetchedContent, UpdateError> {
        let ctx = &self.ctx;
        let fork = request.fork_id.as_str();
        let stall = ctx.racer().attempt_timeout();

        ctx.reporter.status(fork, UpdateStatus::Downloading);
        let (manifest, digest) =
            fetch_manifest(&ctx.client, &source.url, source.hash.as_ref(), stall, cancel).await?;
        let manifest = Arc::new(manifest);

        let missing = ctx.writer.missing_blobs(Arc::clone(&manifest)).await?;
        tracing::info!(
            fork,
            files = manifest.len(),
            missing = missing.len(),
            "content manifest diffed against store"
        );

        let staging = tempfile::Builder::new()
            .prefix("blobs-")
            .tempdir_in(ctx.paths.tmp_dir())?;
        let bytes = download_blobs(
            BlobRequest {
                client: &ctx.client,
                url: &source.download_url,
                manifest: &manifest,
                wanted: &missing,
                staging: staging.path(),
                stall,
                subject: fork,
                cancel,
            },
            ctx.reporter.as_ref(),
        )
        .await?;
        tracing::debug!(fork, bytes, "missing blobs downloaded");

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        ctx.reporter.status(fork, UpdateStatus::Extracting);
        let ingest = ctx
            .writer
            .ingest_manifest(ManifestIngestRequest {
                fork_id: fork.to_string(),
                fork_version: request.version.clone(),
                hash: digest.to_bytes().to_vec(),
                manifest,
                staged: staging.path().to_path_buf(),
                preferred: CompressionScheme::ZStd,
                reporter: Arc::clone(&ctx.reporter),
            })
            .await?;
        let files = self.install_from_store(ingest.version_id, disk_id).await?;
        tracing::debug!(fork, files, version_id = ingest.version_id, "content stored");

        Ok(FetchedContent {
            version_id: ingest.version_id,
            hash: digest,
        })
    }

    async fn fetch_package(
        &self,
        request: &UpdateRequest,
        disk_id: u32,
        cancel: &CancellationToken,
    ) -> Result<FetchedContent, UpdateError> {
        let ctx = &self.ctx;
        let fork = request.fork_id.as_str();

        let mirrors = MirrorSet::new(request.download_urls.iter().cloned());
        let staging = tempfile::Builder::new()
            .prefix("content-")
            .tempdir_in(ctx.paths.tmp_dir())?;
        let archive = staging.path().join("package.zip");

        let outcome = download_verified(
            DownloadRequest {
                client: &ctx.client,
                mirrors: &mirrors,
                racer: &ctx.racer(),
                dest: &archive,
                expected: request.hash.as_ref(),
                subject: fork,
                cancel,
            },
            ctx.reporter.as_ref(),
        )
        .await?;
        tracing::debug!(fork, url = %outcome.url, bytes = outcome.bytes, "content downloaded");

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        ctx.reporter.status(fork, UpdateStatus::Extracting);
        let install_dir = ctx.paths.install_dir(disk_id);
        let platform = ctx.platform.clone();
        let root = install_dir.clone();
        let files = tokio::task::spawn_blocking(move || {
            clear_dir(&root)?;
            let mut files = extract_zip(&archive, &root)?;
            let marked = restore_exec_bits(&mut files, &platform)?;
            tracing::debug!(files = files.len(), marked, "package extracted");
            Ok::<_, UpdateError>(files.len())
        })
        .await
        .map_err(|e| UpdateError::context("extract task", e))??;

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        let ingest = ctx
            .writer
            .ingest(IngestRequest {
                fork_id: fork.to_string(),
                fork_version: request.version.clone(),
                hash: outcome.digest.to_bytes().to_vec(),
                root: install_dir,
                preferred: CompressionScheme::ZStd,
                reporter: Arc::clone(&ctx.reporter),
            })
            .await?;
        tracing::debug!(
            fork,
            files,
            version_id = ingest.version_id,
            reused = ingest.reused,
            "content stored"
        );

        Ok(FetchedContent {
            version_id: ingest.version_id,
            hash: request.content_hash().unwrap_or(&outcome.digest).clone(),
        })
    }

    /// Replace the install directory with the files of a stored version.
    async fn install_from_store(&self, version_id: i64, disk_id: u32) -> Result<usize, UpdateError> {
        let install_dir = self.ctx.paths.install_dir(disk_id);
        let store = self
            .ctx
            .content_store(version_id)
            .map_err(|e| UpdateError::context("open content store", format!("{e:#}")))?;
        let files = store.export(&install_dir).await?;
        mark_launchable(files, self.ctx.platform.clone()).await
    }

    /// Cull engines and content versions nothing refers to. Failures are logged
    /// and never fail the update that triggered them.
    pub async fn collect_garbage(&self) -> GcReport {
        let ctx = &self.ctx;
        let (pinned_content, pinned_engines) = {
            let map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            let content: HashSet<i64> = map.values().filter_map(|p| p.content).collect();
            let engines: HashSet<EngineVersion> =
                map.values().filter_map(|p| p.engine.clone()).collect();
            (content, engines)
        };
        let mut report = GcReport::default();

        match cull_engines(ctx, &pinned_engines) {
            Ok(engines) => report.engines = engines,
            Err(err) => {
                tracing::warn!(error = %err, "engine cull failed");
                ctx.reporter.warning(&format!("engine cull failed: {err}"));
            }
        }

        ctx.reporter.status("content", UpdateStatus::CullingContent);
        let policy = ctx.state.preferences().retention();
        let mut protected = ctx.state.referenced_content_versions();
        protected.extend(pinned_content);
        match ctx.writer.cull_versions(policy, protected).await {
            Ok(content) => {
                if !content.removed_versions.is_empty() {
                    tracing::info!(
                        versions = content.removed_versions.len(),
                        blobs = content.removed_blobs,
                        "content culled"
                    );
                }
                report.content = content;
            }
            Err(err) => {
                tracing::warn!(error = %err, "content cull failed");
                ctx.reporter.warning(&format!("content cull failed: {err}"));
            }
        }
        report
    }
}

async fn mark_launchable(
    mut files: Vec<ExtractedFile>,
    platform: String,
) -> Result<usize, UpdateError> {
    tokio::task::spawn_blocking(move || {
        let marked = restore_exec_bits(&mut files, &platform)?;
        tracing::debug!(files = files.len(), marked, "install directory written");
        Ok::<_, UpdateError>(files.len())
    })
    .await
    .map_err(|e| UpdateError::context("exec bits task", e))?
}

/// Installed content satisfies the request: same version, and same hash when both
/// sides know one.
fn content_matches(installed: &InstalledVersion, request: &UpdateRequest) -> bool {
    if installed.current_version != request.version || installed.content_version_id.is_none() {
        return false;
    }
    match (&installed.current_hash, request.content_hash()) {
        (Some(have), Some(want)) => have == want,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(version: &str, hash: Option<Sha256Digest>) -> InstalledVersion {
        InstalledVersion {
            fork_id: "fork".to_string(),
            disk_id: 1,
            current_version: version.to_string(),
            current_hash: hash,
            current_engine_version: EngineVersion::new("0.1").unwrap(),
            content_version_id: Some(1),
        }
    }

    fn request(version: &str, hash: Option<Sha256Digest>) -> UpdateRequest {
        UpdateRequest {
            fork_id: ForkId::new("fork").unwrap(),
            version: version.to_string(),
            hash,
            download_urls: vec![],
            manifest: None,
            engine_version: EngineVersion::new("0.1").unwrap(),
        }
    }

    #[test]
    fn test_version_change_needs_content() {
        assert!(!content_matches(&installed("1", None), &request("2", None)));
        assert!(content_matches(&installed("1", None), &request("1", None)));
    }

    #[test]
    fn test_hash_change_needs_content() {
        let a = Sha256Digest::compute(b"a");
        let b = Sha256Digest::compute(b"b");
        assert!(!content_matches(&installed("1", Some(a.clone())), &request("1", Some(b))));
        assert!(content_matches(&installed("1", Some(a.clone())), &request("1", Some(a.clone()))));
        // Unknown on either side falls back to the version alone.
        assert!(content_matches(&installed("1", None), &request("1", Some(a))));
    }

    #[test]
    fn test_manifest_hash_identifies_content() {
        let package = Sha256Digest::compute(b"zip");
        let listing = Sha256Digest::compute(b"manifest");
        let mut req = request("1", Some(package.clone()));
        assert_eq!(req.content_hash(), Some(&package));

        req.manifest = Some(ContentManifestSource {
            url: "http://cdn/manifest".to_string(),
            download_url: "http://cdn/download".to_string(),
            hash: Some(listing.clone()),
        });
        assert_eq!(req.content_hash(), Some(&listing));
        assert_eq!(req.known_hashes().collect::<Vec<_>>(), vec![&listing, &package]);
        assert!(content_matches(&installed("1", Some(listing)), &req));
        assert!(!content_matches(&installed("1", Some(package)), &req));
    }

    #[test]
    fn test_missing_content_version_needs_content() {
        let mut record = installed("1", None);
        record.content_version_id = None;
        assert!(!content_matches(&record, &request("1", None)));
    }

    #[test]
    fn test_claim_is_exclusive_per_fork() {
        let in_flight = InFlight::default();
        let first = ForkClaim::acquire(&in_flight, "a").unwrap();
        assert!(matches!(
            ForkClaim::acquire(&in_flight, "a"),
            Err(UpdateError::AlreadyUpdating(_))
        ));
        let other = ForkClaim::acquire(&in_flight, "b").unwrap();
        drop(first);
        ForkClaim::acquire(&in_flight, "a").unwrap();
        drop(other);
    }
}
