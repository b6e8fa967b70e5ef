use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use depot_schema::{CompressionScheme, ContentManifest};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use walkdir::WalkDir;

use super::migrate::Migrator;
use super::schema::migrations;
use super::{StoreError, codec};

/// Stored metadata for one content version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentVersion {
    pub id: i64,
    pub fork_id: String,
    pub fork_version: String,
    /// SHA-256 of the archive this version was ingested from.
    pub hash: Vec<u8>,
    /// RFC 3339 timestamp, refreshed whenever the version is used.
    pub last_used: String,
}

/// How many content versions survive a cull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Upper bound across every fork.
    pub max_total: usize,
    /// Upper bound for a single fork.
    pub max_per_fork: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_total: 15,
            max_per_fork: 3,
        }
    }
}

/// Outcome of [`ContentWriter::cull_versions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CullReport {
    /// Ids of the deleted content versions.
    pub removed_versions: Vec<i64>,
    /// Blobs no longer referenced by any manifest.
    pub removed_blobs: usize,
}

/// The single read-write connection to the content database.
pub struct ContentWriter {
    conn: Connection,
    path: PathBuf,
}

impl fmt::Debug for ContentWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentWriter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl ContentWriter {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Errors
    ///
    /// Fails on I/O or SQLite errors, or when a schema migration fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let report = Migrator::new(migrations())?.run(&mut conn)?;
        if !report.applied.is_empty() {
            tracing::info!(path = %path.display(), applied = ?report.applied, "content schema updated");
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Database file this writer owns.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start an ingest transaction. Nothing is visible to readers until
    /// [`Ingest::commit`].
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn begin_ingest(&mut self) -> Result<Ingest<'_>, StoreError> {
        Ok(Ingest {
            tx: self.conn.transaction()?,
        })
    }

    /// Version previously ingested for exactly this fork, version and archive hash.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn find_version(
        &self,
        fork_id: &str,
        fork_version: &str,
        hash: &[u8],
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM content_version
                 WHERE fork_id = ?1 AND fork_version = ?2 AND hash = ?3
                 ORDER BY id DESC LIMIT 1",
                params![fork_id, fork_version, hash],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Most recently used version ingested from `hash`, whatever its fork.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn find_by_hash(&self, hash: &[u8]) -> Result<Option<ContentVersion>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, fork_id, fork_version, hash, last_used FROM content_version
                 WHERE hash = ?1 ORDER BY last_used DESC, id DESC LIMIT 1",
                params![hash],
                |row| {
                    Ok(ContentVersion {
                        id: row.get(0)?,
                        fork_id: row.get(1)?,
                        fork_version: row.get(2)?,
                        hash: row.get(3)?,
                        last_used: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Positions of the manifest entries whose blob is not stored yet.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn missing_blobs(&self, manifest: &ContentManifest) -> Result<Vec<usize>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM content WHERE hash = ?1 LIMIT 1")?;
        let mut missing = Vec::new();
        let mut wanted = HashSet::new();
        for (index, entry) in manifest.entries().iter().enumerate() {
            // A blob listed twice is fetched once.
            if !stmt.exists(params![entry.hash.as_slice()])? && wanted.insert(entry.hash) {
                missing.push(index);
            }
        }
        Ok(missing)
    }

    /// Mark a version as used now.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownVersion`] if the row does not exist.
    pub fn touch_version(&self, version_id: i64) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE content_version SET last_used = ?1 WHERE id = ?2",
            params![now(), version_id],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownVersion(version_id));
        }
        Ok(())
    }

    /// Every stored version, most recently used first.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn versions(&self) -> Result<Vec<ContentVersion>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fork_id, fork_version, hash, last_used
             FROM content_version ORDER BY last_used DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ContentVersion {
                id: row.get(0)?,
                fork_id: row.get(1)?,
                fork_version: row.get(2)?,
                hash: row.get(3)?,
                last_used: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Delete versions beyond `policy`, oldest first, then every blob left
    /// without a manifest entry.
    ///
    /// Versions in `protected` are always kept but still count toward the limits.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors. Nothing is deleted on failure.
    pub fn cull_versions(
        &mut self,
        policy: &RetentionPolicy,
        protected: &HashSet<i64>,
    ) -> Result<CullReport, StoreError> {
        let versions = self.versions()?;
        let tx = self.conn.transaction()?;

        let mut per_fork: HashMap<&str, usize> = HashMap::new();
        let mut total = 0usize;
        let mut report = CullReport::default();

        for version in &versions {
            let count = per_fork.entry(version.fork_id.as_str()).or_default();
            let keep = protected.contains(&version.id)
                || (*count < policy.max_per_fork && total < policy.max_total);

            if keep {
                *count += 1;
                total += 1;
            } else {
                tracing::debug!(
                    fork = %version.fork_id,
                    version = %version.fork_version,
                    "culling content version"
                );
                tx.execute("DELETE FROM content_version WHERE id = ?1", params![version.id])?;
                report.removed_versions.push(version.id);
            }
        }

        if !report.removed_versions.is_empty() {
            report.removed_blobs = tx.execute(
                "DELETE FROM content WHERE id NOT IN (SELECT content_id FROM content_manifest)",
                [],
            )?;
            tracing::debug!(blobs = report.removed_blobs, "culled orphaned content blobs");
        }

        tx.commit()?;
        Ok(report)
    }

    /// Drop every version and blob, then reclaim the space.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn clear_all(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM content_manifest", [])?;
        tx.execute("DELETE FROM content_version", [])?;
        tx.execute("DELETE FROM content", [])?;
        tx.commit()?;
        self.conn.execute_batch("VACUUM")?;
        tracing::info!(path = %self.path.display(), "content store cleared");
        Ok(())
    }
}

/// One write transaction against the content database.
pub struct Ingest<'a> {
    tx: Transaction<'a>,
}

impl fmt::Debug for Ingest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingest").finish_non_exhaustive()
    }
}

impl Ingest<'_> {
    /// Insert a new content version row and return its id.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn create_version(
        &mut self,
        fork_id: &str,
        fork_version: &str,
        hash: &[u8],
    ) -> Result<i64, StoreError> {
        self.tx.execute(
            "INSERT INTO content_version (fork_id, fork_version, hash, last_used)
             VALUES (?1, ?2, ?3, ?4)",
            params![fork_id, fork_version, hash, now()],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Create a version for `fork_id`/`fork_version` that lists exactly the files
    /// of `source`, sharing its blobs. Returns the new version id.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownVersion`] when `source` does not exist.
    pub fn duplicate_version(
        &mut self,
        source: i64,
        fork_id: &str,
        fork_version: &str,
    ) -> Result<i64, StoreError> {
        let hash: Vec<u8> = self
            .tx
            .query_row(
                "SELECT hash FROM content_version WHERE id = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::UnknownVersion(source))?;
        let id = self.create_version(fork_id, fork_version, &hash)?;
        let files = self.tx.execute(
            "INSERT INTO content_manifest (version_id, path, content_id)
             SELECT ?1, path, content_id FROM content_manifest WHERE version_id = ?2",
            params![id, source],
        )?;
        tracing::debug!(source, id, files, "duplicated content version");
        Ok(id)
    }

    /// Link every manifest entry into `version_id`. Blobs already stored are
    /// reused; the rest are read from `staged/<hex hash>` and verified.
    /// `on_file` is called with `(done, total)` after each entry.
    ///
    /// # Errors
    ///
    /// [`StoreError::HashMismatch`] when a staged blob does not match its entry,
    /// I/O errors for missing staged blobs, SQLite errors otherwise.
    pub fn put_manifest<F>(
        &self,
        version_id: i64,
        manifest: &ContentManifest,
        staged: &Path,
        preferred: CompressionScheme,
        mut on_file: F,
    ) -> Result<usize, StoreError>
    where
        F: FnMut(usize, usize),
    {
        let total = manifest.len();
        for (done, entry) in manifest.entries().iter().enumerate() {
            let content_id = match self.blob_by_hash(&entry.hash)? {
                Some(id) => id,
                None => {
                    let data = std::fs::read(staged.join(hex::encode(entry.hash)))?;
                    if blake3::hash(&data).as_bytes() != &entry.hash {
                        return Err(StoreError::HashMismatch {
                            path: entry.path.clone(),
                        });
                    }
                    let (scheme, stored) = codec::compress_for_storage(&data, preferred)?;
                    self.insert_blob(&data, scheme, &stored)?
                }
            };
            self.link(version_id, &entry.path, content_id)?;
            on_file(done + 1, total);
        }
        Ok(total)
    }

    /// Store `data` under `path` in `version_id` using exactly `scheme`, so every
    /// codec path can be exercised. Returns the blob id.
    #[cfg(test)]
    pub(crate) fn put(
        &self,
        version_id: i64,
        path: &str,
        data: &[u8],
        scheme: CompressionScheme,
    ) -> Result<i64, StoreError> {
        let content_id = match self.existing_blob(data)? {
            Some(id) => id,
            None => {
                let stored = codec::compress(data, scheme)?;
                self.insert_blob(data, scheme, &stored)?
            }
        };
        self.link(version_id, path, content_id)?;
        Ok(content_id)
    }

    /// Like [`Ingest::put`], but falls back to uncompressed storage when
    /// compression does not pay for itself.
    ///
    /// # Errors
    ///
    /// Propagates SQLite and compression errors.
    pub fn put_stored(
        &self,
        version_id: i64,
        path: &str,
        data: &[u8],
        preferred: CompressionScheme,
    ) -> Result<i64, StoreError> {
        let content_id = match self.existing_blob(data)? {
            Some(id) => id,
            None => {
                let (scheme, stored) = codec::compress_for_storage(data, preferred)?;
                self.insert_blob(data, scheme, &stored)?
            }
        };
        self.link(version_id, path, content_id)?;
        Ok(content_id)
    }

    /// Ingest every regular file under `root` into `version_id`.
    ///
    /// Paths are stored relative to `root` with `/` separators. `on_file` is
    /// called with `(done, total)` after each file. Returns the number of files.
    ///
    /// # Errors
    ///
    /// Fails on the first unreadable file or database error.
    pub fn put_tree<F>(
        &self,
        version_id: i64,
        root: &Path,
        preferred: CompressionScheme,
        mut on_file: F,
    ) -> Result<usize, StoreError>
    where
        F: FnMut(usize, usize),
    {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        let total = files.len();
        for (done, file) in files.iter().enumerate() {
            let rel = file.strip_prefix(root).unwrap_or(file);
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let data = std::fs::read(file)?;
            self.put_stored(version_id, &key, &data, preferred)?;
            on_file(done + 1, total);
        }
        Ok(total)
    }

    /// Commit everything written through this ingest.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit()?;
        Ok(())
    }

    fn existing_blob(&self, data: &[u8]) -> Result<Option<i64>, StoreError> {
        let hash = blake3::hash(data);
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM content WHERE hash = ?1 AND size = ?2 LIMIT 1",
                params![hash.as_bytes().as_slice(), data.len() as i64],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn blob_by_hash(&self, hash: &[u8; 32]) -> Result<Option<i64>, StoreError> {
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM content WHERE hash = ?1 LIMIT 1",
                params![hash.as_slice()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn insert_blob(
        &self,
        data: &[u8],
        scheme: CompressionScheme,
        stored: &[u8],
    ) -> Result<i64, StoreError> {
        let hash = blake3::hash(data);
        self.tx.execute(
            "INSERT INTO content (hash, size, compression, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                hash.as_bytes().as_slice(),
                data.len() as i64,
                scheme.as_i64(),
                stored
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    fn link(&self, version_id: i64, path: &str, content_id: i64) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO content_manifest (version_id, path, content_id)
             VALUES (?1, ?2, ?3)",
            params![version_id, path, content_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    fn add_version(writer: &mut ContentWriter, fork: &str, ver: &str, files: &[(&str, &[u8])]) -> i64 {
        let mut ingest = writer.begin_ingest().unwrap();
        let id = ingest.create_version(fork, ver, ver.as_bytes()).unwrap();
        for (path, data) in files {
            ingest.put_stored(id, path, data, CompressionScheme::ZStd).unwrap();
        }
        ingest.commit().unwrap();
        // Spread last_used so ordering is deterministic.
        std::thread::sleep(std::time::Duration::from_millis(2));
        writer.touch_version(id).unwrap();
        id
    }

    #[test]
    fn test_identical_bytes_stored_once() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        let a = add_version(&mut writer, "f", "1", &[("x.txt", b"same bytes here")]);
        let b = add_version(&mut writer, "f", "2", &[("y.txt", b"same bytes here")]);
        assert_ne!(a, b);
        assert_eq!(count(&writer.conn, "content"), 1);
        assert_eq!(count(&writer.conn, "content_manifest"), 2);
    }

    #[test]
    fn test_uncommitted_ingest_leaves_nothing() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        {
            let mut ingest = writer.begin_ingest().unwrap();
            let id = ingest.create_version("f", "1", b"h").unwrap();
            ingest.put(id, "a", b"abc", CompressionScheme::None).unwrap();
        }
        assert_eq!(count(&writer.conn, "content_version"), 0);
        assert_eq!(count(&writer.conn, "content"), 0);
    }

    #[test]
    fn test_small_files_stored_plain() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        add_version(&mut writer, "f", "1", &[("tiny", b"ab")]);
        let tag: i64 = writer
            .conn
            .query_row("SELECT compression FROM content", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tag, CompressionScheme::None.as_i64());
    }

    #[test]
    fn test_find_version_matches_hash() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        let id = add_version(&mut writer, "fork", "1.0", &[]);
        assert_eq!(writer.find_version("fork", "1.0", b"1.0").unwrap(), Some(id));
        assert_eq!(writer.find_version("fork", "1.0", b"other").unwrap(), None);
        assert_eq!(writer.find_version("other", "1.0", b"1.0").unwrap(), None);
    }

    fn manifest_of(files: &[(&str, &[u8])]) -> ContentManifest {
        ContentManifest::from_entries(files.iter().map(|(path, data)| depot_schema::ContentEntry {
            hash: *blake3::hash(data).as_bytes(),
            path: (*path).to_string(),
        }))
        .unwrap()
    }

    fn stage(dir: &Path, data: &[u8]) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(blake3::hash(data).to_hex().as_str()), data).unwrap();
    }

    #[test]
    fn test_missing_blobs_skips_stored_and_repeated() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        add_version(&mut writer, "f", "1", &[("have", b"already stored")]);

        let manifest = manifest_of(&[
            ("a", b"new one"),
            ("b", b"already stored"),
            ("c", b"new one"),
            ("d", b"new two"),
        ]);
        assert_eq!(writer.missing_blobs(&manifest).unwrap(), vec![0, 3]);
    }

    #[test]
    fn test_put_manifest_links_stored_and_staged() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("blobs");
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        add_version(&mut writer, "f", "1", &[("old", b"shared blob bytes")]);
        stage(&staged, b"fresh blob bytes");

        let manifest = manifest_of(&[("x/shared", b"shared blob bytes"), ("fresh", b"fresh blob bytes")]);
        let mut ingest = writer.begin_ingest().unwrap();
        let id = ingest.create_version("f", "2", b"manifest").unwrap();
        let n = ingest
            .put_manifest(id, &manifest, &staged, CompressionScheme::ZStd, |_, _| {})
            .unwrap();
        ingest.commit().unwrap();

        assert_eq!(n, 2);
        assert_eq!(count(&writer.conn, "content"), 2);
        assert_eq!(count(&writer.conn, "content_manifest"), 3);
    }

    #[test]
    fn test_put_manifest_rejects_wrong_staged_bytes() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("blobs");
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        let manifest = manifest_of(&[("a", b"promised")]);
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join(blake3::hash(b"promised").to_hex().as_str()), b"swapped").unwrap();

        let mut ingest = writer.begin_ingest().unwrap();
        let id = ingest.create_version("f", "1", b"m").unwrap();
        let err = ingest
            .put_manifest(id, &manifest, &staged, CompressionScheme::ZStd, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { ref path } if path == "a"));
        drop(ingest);
        assert_eq!(count(&writer.conn, "content_version"), 0);
    }

    #[test]
    fn test_duplicate_version_shares_blobs() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        let source = add_version(&mut writer, "a", "1", &[("one", b"first file"), ("two", b"second file")]);

        let found = writer.find_by_hash(b"1").unwrap().unwrap();
        assert_eq!(found.id, source);
        assert!(writer.find_by_hash(b"nope").unwrap().is_none());

        let mut ingest = writer.begin_ingest().unwrap();
        let copy = ingest.duplicate_version(source, "b", "7").unwrap();
        ingest.commit().unwrap();

        assert_ne!(copy, source);
        assert_eq!(writer.find_version("b", "7", b"1").unwrap(), Some(copy));
        assert_eq!(count(&writer.conn, "content"), 2);
        assert_eq!(count(&writer.conn, "content_manifest"), 4);

        let mut ingest = writer.begin_ingest().unwrap();
        assert!(matches!(
            ingest.duplicate_version(99, "b", "8"),
            Err(StoreError::UnknownVersion(99))
        ));
    }

    #[test]
    fn test_touch_unknown_version() {
        let dir = tempdir().unwrap();
        let writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        assert!(matches!(
            writer.touch_version(5),
            Err(StoreError::UnknownVersion(5))
        ));
    }

    #[test]
    fn test_cull_respects_limits_and_protection() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();

        let a1 = add_version(&mut writer, "a", "1", &[("shared", b"shared payload bytes"), ("a1", b"only in a1")]);
        let a2 = add_version(&mut writer, "a", "2", &[("shared", b"shared payload bytes")]);
        let a3 = add_version(&mut writer, "a", "3", &[("a3", b"only in a3")]);
        let b1 = add_version(&mut writer, "b", "1", &[("b1", b"only in b1")]);

        let policy = RetentionPolicy {
            max_total: 10,
            max_per_fork: 1,
        };
        let protected = HashSet::from([a1]);
        let report = writer.cull_versions(&policy, &protected).unwrap();

        // a3 is newest of fork a, a1 is protected, a2 goes.
        assert_eq!(report.removed_versions, vec![a2]);
        let left: Vec<i64> = writer.versions().unwrap().iter().map(|v| v.id).collect();
        assert_eq!(left, vec![b1, a3, a1]);
        // The shared blob is still referenced by a1.
        assert_eq!(report.removed_blobs, 0);

        let report = writer.cull_versions(&policy, &HashSet::new()).unwrap();
        assert_eq!(report.removed_versions, vec![a1]);
        assert_eq!(report.removed_blobs, 2);
        assert_eq!(count(&writer.conn, "content"), 2);
    }

    #[test]
    fn test_cull_total_limit() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        let ids: Vec<i64> = (0..4)
            .map(|i| add_version(&mut writer, &format!("fork{i}"), "1", &[]))
            .collect();

        let report = writer
            .cull_versions(
                &RetentionPolicy {
                    max_total: 2,
                    max_per_fork: 5,
                },
                &HashSet::new(),
            )
            .unwrap();
        assert_eq!(report.removed_versions, vec![ids[1], ids[0]]);
    }

    #[test]
    fn test_put_tree_uses_forward_slashes() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("sub/deeper")).unwrap();
        std::fs::write(tree.join("top.txt"), b"top").unwrap();
        std::fs::write(tree.join("sub/deeper/leaf.bin"), b"leaf").unwrap();

        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        let mut ingest = writer.begin_ingest().unwrap();
        let id = ingest.create_version("f", "1", b"h").unwrap();
        let mut calls = Vec::new();
        let n = ingest
            .put_tree(id, &tree, CompressionScheme::ZStd, |done, total| calls.push((done, total)))
            .unwrap();
        ingest.commit().unwrap();

        assert_eq!(n, 2);
        assert_eq!(calls, vec![(1, 2), (2, 2)]);
        let mut stmt = writer
            .conn
            .prepare("SELECT path FROM content_manifest ORDER BY path")
            .unwrap();
        let paths: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(paths, vec!["sub/deeper/leaf.bin", "top.txt"]);
    }

    #[test]
    fn test_clear_all() {
        let dir = tempdir().unwrap();
        let mut writer = ContentWriter::open(&dir.path().join("content.db")).unwrap();
        add_version(&mut writer, "f", "1", &[("a", b"aaaaaaaaaaaaaaaaaaaaaaa")]);
        writer.clear_all().unwrap();
        assert_eq!(count(&writer.conn, "content_version"), 0);
        assert_eq!(count(&writer.conn, "content"), 0);
    }

    #[test]
    fn test_reopen_skips_migrations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("content.db");
        let mut writer = ContentWriter::open(&path).unwrap();
        add_version(&mut writer, "f", "1", &[]);
        drop(writer);

        let writer = ContentWriter::open(&path).unwrap();
        assert_eq!(writer.versions().unwrap().len(), 1);
    }
}
