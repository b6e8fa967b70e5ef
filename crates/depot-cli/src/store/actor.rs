//! Writer actor: the single owner of the read-write content connection.
//!
//! `rusqlite::Connection` is not `Sync`, and the content store allows exactly one
//! writer. The connection lives on a dedicated thread and async callers talk to it
//! through [`WriterHandle`].

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;

use depot_core::store::{ContentVersion, ContentWriter, CullReport, RetentionPolicy, StoreError};
use depot_core::{ErrorKind, Progress, Reporter};
use depot_schema::{CompressionScheme, ContentManifest};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Content writer thread stopped")]
    ActorDied,
}

impl WriterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::ActorDied => ErrorKind::Io,
        }
    }
}

/// Package to ingest as a content version.
#[derive(Clone)]
pub struct IngestRequest {
    pub fork_id: String,
    pub fork_version: String,
    /// Raw SHA-256 of the package archive.
    pub hash: Vec<u8>,
    /// Directory holding the extracted package.
    pub root: PathBuf,
    pub preferred: CompressionScheme,
    pub reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for IngestRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestRequest")
            .field("fork_id", &self.fork_id)
            .field("fork_version", &self.fork_version)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Content version described by a file manifest whose missing blobs have
/// already been downloaded into `staged`.
#[derive(Clone)]
pub struct ManifestIngestRequest {
    pub fork_id: String,
    pub fork_version: String,
    /// Raw SHA-256 of the manifest document.
    pub hash: Vec<u8>,
    pub manifest: Arc<ContentManifest>,
    /// Directory holding downloaded blobs named by their hex hash.
    pub staged: PathBuf,
    pub preferred: CompressionScheme,
    pub reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for ManifestIngestRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestIngestRequest")
            .field("fork_id", &self.fork_id)
            .field("fork_version", &self.fork_version)
            .field("files", &self.manifest.len())
            .field("staged", &self.staged)
            .finish_non_exhaustive()
    }
}

/// Result of an ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub version_id: i64,
    /// An identical version was already stored and has been reused.
    pub reused: bool,
    pub files: usize,
}

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Events that can be sent to the writer actor
pub enum WriterEvent {
    Ingest {
        request: IngestRequest,
        resp: Reply<IngestOutcome>,
    },
    IngestManifest {
        request: ManifestIngestRequest,
        resp: Reply<IngestOutcome>,
    },
    ReuseVersion {
        fork_id: String,
        fork_version: String,
        hash: Vec<u8>,
        resp: Reply<Option<i64>>,
    },
    MissingBlobs {
        manifest: Arc<ContentManifest>,
        resp: Reply<Vec<usize>>,
    },
    Versions {
        resp: Reply<Vec<ContentVersion>>,
    },
    CullVersions {
        policy: RetentionPolicy,
        protected: HashSet<i64>,
        resp: Reply<CullReport>,
    },
    ClearAll {
        resp: Reply<()>,
    },
    Shutdown,
}

impl fmt::Debug for WriterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest { request, .. } => f
                .debug_struct("Ingest")
                .field("request", request)
                .finish_non_exhaustive(),
            Self::IngestManifest { request, .. } => f
                .debug_struct("IngestManifest")
                .field("request", request)
                .finish_non_exhaustive(),
            Self::ReuseVersion {
                fork_id,
                fork_version,
                ..
            } => f
                .debug_struct("ReuseVersion")
                .field("fork_id", fork_id)
                .field("fork_version", fork_version)
                .finish_non_exhaustive(),
            Self::MissingBlobs { manifest, .. } => f
                .debug_struct("MissingBlobs")
                .field("files", &manifest.len())
                .finish_non_exhaustive(),
            Self::Versions { .. } => f.debug_struct("Versions").finish_non_exhaustive(),
            Self::CullVersions { policy, .. } => f
                .debug_struct("CullVersions")
                .field("policy", policy)
                .finish_non_exhaustive(),
            Self::ClearAll { .. } => f.debug_struct("ClearAll").finish_non_exhaustive(),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// A handle to the writer actor that is Send + Sync and Clone.
#[derive(Clone)]
pub struct WriterHandle {
    sender: mpsc::Sender<WriterEvent>,
}

impl fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterHandle").finish_non_exhaustive()
    }
}

impl WriterHandle {
    /// Open the content database at `path` and spawn the writer thread.
    ///
    /// Migrations run here, before the thread starts.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or migrated, or the thread
    /// cannot be started.
    pub fn spawn(path: &Path) -> Result<Self, WriterError> {
        let (sender, receiver) = mpsc::channel();
        let writer = ContentWriter::open(path)?;

        thread::Builder::new()
            .name("depot-content-writer".to_string())
            .spawn(move || run_writer_event_loop(writer, receiver))
            .map_err(|e| WriterError::Store(e.into()))?;

        Ok(Self { sender })
    }

    /// Send one event and wait for its reply.
    async fn request<T, F>(&self, f: F) -> Result<T, WriterError>
    where
        F: FnOnce(Reply<T>) -> WriterEvent,
    {
        let (tx, rx) = oneshot::channel();
        self.sender.send(f(tx)).map_err(|_| WriterError::ActorDied)?;
        Ok(rx.await.map_err(|_| WriterError::ActorDied)??)
    }

    /// Store an extracted package as a content version, or reuse an identical one.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, WriterError> {
        self.request(|resp| WriterEvent::Ingest { request, resp }).await
    }

    /// Store a manifest-described version from already staged blobs.
    pub async fn ingest_manifest(
        &self,
        request: ManifestIngestRequest,
    ) -> Result<IngestOutcome, WriterError> {
        self.request(|resp| WriterEvent::IngestManifest { request, resp })
            .await
    }

    /// Find a stored version with content `hash` usable for this fork.
    ///
    /// An exact match is touched and returned. A match under another fork or
    /// version is duplicated under this one, sharing its blobs.
    pub async fn reuse_version(
        &self,
        fork_id: String,
        fork_version: String,
        hash: Vec<u8>,
    ) -> Result<Option<i64>, WriterError> {
        self.request(|resp| WriterEvent::ReuseVersion {
            fork_id,
            fork_version,
            hash,
            resp,
        })
        .await
    }

    /// Manifest positions whose blobs are not stored yet.
    pub async fn missing_blobs(
        &self,
        manifest: Arc<ContentManifest>,
    ) -> Result<Vec<usize>, WriterError> {
        self.request(|resp| WriterEvent::MissingBlobs { manifest, resp })
            .await
    }

    /// Every stored version, most recently used first.
    pub async fn versions(&self) -> Result<Vec<ContentVersion>, WriterError> {
        self.request(|resp| WriterEvent::Versions { resp }).await
    }

    /// Delete versions beyond `policy`, never touching `protected` ids.
    pub async fn cull_versions(
        &self,
        policy: RetentionPolicy,
        protected: HashSet<i64>,
    ) -> Result<CullReport, WriterError> {
        self.request(|resp| WriterEvent::CullVersions {
            policy,
            protected,
            resp,
        })
        .await
    }

    /// Drop every stored version and blob.
    pub async fn clear_all(&self) -> Result<(), WriterError> {
        self.request(|resp| WriterEvent::ClearAll { resp }).await
    }

    /// Ask the writer thread to exit once queued events are handled.
    pub fn shutdown(&self) {
        let _ = self.sender.send(WriterEvent::Shutdown);
    }
}

fn ingest(writer: &mut ContentWriter, request: &IngestRequest) -> Result<IngestOutcome, StoreError> {
    if let Some(version_id) =
        writer.find_version(&request.fork_id, &request.fork_version, &request.hash)?
    {
        writer.touch_version(version_id)?;
        tracing::debug!(fork = %request.fork_id, version_id, "reusing stored content version");
        return Ok(IngestOutcome {
            version_id,
            reused: true,
            files: 0,
        });
    }

    let mut tx = writer.begin_ingest()?;
    let version_id = tx.create_version(&request.fork_id, &request.fork_version, &request.hash)?;
    let files = tx.put_tree(version_id, &request.root, request.preferred, |done, total| {
        request
            .reporter
            .progress(&request.fork_id, Progress::files(done as u64, total as u64));
    })?;
    tx.commit()?;

    tracing::info!(fork = %request.fork_id, version_id, files, "content version ingested");
    Ok(IngestOutcome {
        version_id,
        reused: false,
        files,
    })
}

fn reuse_version(
    writer: &mut ContentWriter,
    fork_id: &str,
    fork_version: &str,
    hash: &[u8],
) -> Result<Option<i64>, StoreError> {
    if let Some(version_id) = writer.find_version(fork_id, fork_version, hash)? {
        writer.touch_version(version_id)?;
        tracing::debug!(fork = %fork_id, version_id, "reusing stored content version");
        return Ok(Some(version_id));
    }

    let Some(source) = writer.find_by_hash(hash)? else {
        return Ok(None);
    };
    let mut tx = writer.begin_ingest()?;
    let version_id = tx.duplicate_version(source.id, fork_id, fork_version)?;
    tx.commit()?;
    tracing::info!(
        fork = %fork_id,
        from_fork = %source.fork_id,
        version_id,
        "duplicated stored content version"
    );
    Ok(Some(version_id))
}

fn ingest_manifest(
    writer: &mut ContentWriter,
    request: &ManifestIngestRequest,
) -> Result<IngestOutcome, StoreError> {
    let mut tx = writer.begin_ingest()?;
    let version_id = tx.create_version(&request.fork_id, &request.fork_version, &request.hash)?;
    let files = tx.put_manifest(
        version_id,
        &request.manifest,
        &request.staged,
        request.preferred,
        |done, total| {
            request
                .reporter
                .progress(&request.fork_id, Progress::files(done as u64, total as u64));
        },
    )?;
    tx.commit()?;

    tracing::info!(fork = %request.fork_id, version_id, files, "content manifest ingested");
    Ok(IngestOutcome {
        version_id,
        reused: false,
        files,
    })
}

/// The actual event loop running in the background thread
// The writer and receiver are moved into this thread so the connection has
// exactly one owner.
#[allow(clippy::needless_pass_by_value)]
fn run_writer_event_loop(mut writer: ContentWriter, receiver: mpsc::Receiver<WriterEvent>) {
    while let Ok(event) = receiver.recv() {
        match event {
            WriterEvent::Ingest { request, resp } => {
                let _ = resp.send(ingest(&mut writer, &request));
            }
            WriterEvent::IngestManifest { request, resp } => {
                let _ = resp.send(ingest_manifest(&mut writer, &request));
            }
            WriterEvent::ReuseVersion {
                fork_id,
                fork_version,
                hash,
                resp,
            } => {
                let _ = resp.send(reuse_version(&mut writer, &fork_id, &fork_version, &hash));
            }
            WriterEvent::MissingBlobs { manifest, resp } => {
                let _ = resp.send(writer.missing_blobs(&manifest));
            }
            WriterEvent::Versions { resp } => {
                let _ = resp.send(writer.versions());
            }
            WriterEvent::CullVersions {
                policy,
                protected,
                resp,
            } => {
                let _ = resp.send(writer.cull_versions(&policy, &protected));
            }
            WriterEvent::ClearAll { resp } => {
                let _ = resp.send(writer.clear_all());
            }
            WriterEvent::Shutdown => break,
        }
    }
    tracing::debug!(path = %writer.path().display(), "content writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::NullReporter;
    use depot_core::store::ContentStore;
    use tempfile::tempdir;

    fn request(root: &Path, hash: u8) -> IngestRequest {
        IngestRequest {
            fork_id: "fork".to_string(),
            fork_version: "7".to_string(),
            hash: vec![hash; 32],
            root: root.to_path_buf(),
            preferred: CompressionScheme::ZStd,
            reporter: Arc::new(NullReporter),
        }
    }

    #[tokio::test]
    async fn test_ingest_then_reuse() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pkg");
        std::fs::create_dir_all(root.join("maps")).unwrap();
        std::fs::write(root.join("maps/a.yml"), "a".repeat(4096)).unwrap();
        std::fs::write(root.join("readme"), "hi").unwrap();

        let db = dir.path().join("content.db");
        let writer = WriterHandle::spawn(&db).unwrap();

        let first = writer.ingest(request(&root, 1)).await.unwrap();
        assert!(!first.reused);
        assert_eq!(first.files, 2);

        let again = writer.ingest(request(&root, 1)).await.unwrap();
        assert!(again.reused);
        assert_eq!(again.version_id, first.version_id);

        let other = writer.ingest(request(&root, 2)).await.unwrap();
        assert_ne!(other.version_id, first.version_id);

        let store = ContentStore::load(&db, first.version_id, 2).unwrap();
        assert!(store.contains("maps/a.yml"));
        assert_eq!(store.size_of("readme"), Some(2));
        assert_eq!(writer.versions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reuse_duplicates_across_forks() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pkg");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("readme"), "hi").unwrap();

        let db = dir.path().join("content.db");
        let writer = WriterHandle::spawn(&db).unwrap();
        let first = writer.ingest(request(&root, 1)).await.unwrap();

        let same = writer
            .reuse_version("fork".into(), "7".into(), vec![1; 32])
            .await
            .unwrap();
        assert_eq!(same, Some(first.version_id));

        let copied = writer
            .reuse_version("other".into(), "1".into(), vec![1; 32])
            .await
            .unwrap()
            .unwrap();
        assert_ne!(copied, first.version_id);
        let store = ContentStore::load(&db, copied, 1).unwrap();
        assert!(store.contains("readme"));

        let unknown = writer
            .reuse_version("fork".into(), "7".into(), vec![9; 32])
            .await
            .unwrap();
        assert_eq!(unknown, None);
        assert_eq!(writer.versions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_manifest_from_staged_blobs() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staged");
        std::fs::create_dir_all(&staged).unwrap();
        let data = b"manifest file".repeat(10);
        let hash = *blake3::hash(&data).as_bytes();
        std::fs::write(staged.join(hex::encode(hash)), &data).unwrap();
        let manifest = ContentManifest::from_entries([depot_schema::ContentEntry {
            hash,
            path: "bin/game".to_string(),
        }])
        .unwrap();

        let db = dir.path().join("content.db");
        let writer = WriterHandle::spawn(&db).unwrap();
        let manifest = Arc::new(manifest);
        assert_eq!(writer.missing_blobs(Arc::clone(&manifest)).await.unwrap(), vec![0]);

        let outcome = writer
            .ingest_manifest(ManifestIngestRequest {
                fork_id: "fork".to_string(),
                fork_version: "2".to_string(),
                hash: vec![5; 32],
                manifest: Arc::clone(&manifest),
                staged,
                preferred: CompressionScheme::ZStd,
                reporter: Arc::new(NullReporter),
            })
            .await
            .unwrap();
        assert_eq!(outcome.files, 1);
        assert!(writer.missing_blobs(manifest).await.unwrap().is_empty());
        let store = ContentStore::load(&db, outcome.version_id, 1).unwrap();
        assert_eq!(store.size_of("bin/game"), Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let dir = tempdir().unwrap();
        let writer = WriterHandle::spawn(&dir.path().join("content.db")).unwrap();
        writer.shutdown();
        // The thread drains and exits; later sends see a closed channel.
        let mut died = false;
        for _ in 0..50 {
            if matches!(writer.versions().await, Err(WriterError::ActorDied)) {
                died = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(died);
    }
}
