use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use depot_schema::CompressionScheme;
use depot_schema::content::is_safe_relative_path;
use rusqlite::{Connection, DatabaseName, OpenFlags, OptionalExtension, params};
use zstd::stream::raw::Decoder;

use super::StoreError;
use super::codec;
use crate::extract::{ExtractedFile, clear_dir};
use crate::pool::Pool;

/// Read-only bytes of one stored file.
pub type ContentStream = Cursor<Bytes>;

#[derive(Debug, Clone, Copy)]
struct Entry {
    rowid: i64,
    size: usize,
    scheme: CompressionScheme,
}

/// One pooled reader: a read-only connection plus its own zstd context.
struct ReaderHandle {
    conn: Connection,
    zstd: Decoder<'static>,
}

impl ReaderHandle {
    fn open(db: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            db,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // Held for the connection's lifetime: every read sees one snapshot.
        conn.execute_batch("BEGIN")?;
        Ok(Self {
            conn,
            zstd: Decoder::new()?,
        })
    }

    fn read(&mut self, path: &str, entry: Entry) -> Result<Vec<u8>, StoreError> {
        let blob = self
            .conn
            .blob_open(DatabaseName::Main, "content", "data", entry.rowid, true)?;

        codec::decode(&blob, entry.scheme, entry.size, &mut self.zstd).map_err(|source| {
            StoreError::Corrupt {
                path: path.to_string(),
                source,
            }
        })
    }
}

/// Serves the files of one content version.
///
/// The manifest (path → blob) is loaded once; [`ContentStore::open`] decodes blobs
/// on demand using a bounded pool of reader connections.
pub struct ContentStore {
    db: PathBuf,
    version_id: i64,
    entries: BTreeMap<String, Entry>,
    readers: Pool<ReaderHandle>,
}

impl fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStore")
            .field("db", &self.db)
            .field("version_id", &self.version_id)
            .field("files", &self.entries.len())
            .field("readers", &self.readers)
            .finish()
    }
}

impl ContentStore {
    /// Open `pool_size` reader connections and load the manifest of `version_id`.
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be opened, the version does not exist, or a
    /// manifest row carries an unknown compression tag.
    pub fn load(db: &Path, version_id: i64, pool_size: usize) -> Result<Self, StoreError> {
        let mut handles = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            handles.push(ReaderHandle::open(db)?);
        }

        let conn = &handles[0].conn;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM content_version WHERE id = ?1",
                params![version_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UnknownVersion(version_id));
        }

        let entries = load_manifest(conn, version_id)?;
        tracing::debug!(
            version_id,
            files = entries.len(),
            readers = handles.len(),
            "content store loaded"
        );

        Ok(Self {
            db: db.to_path_buf(),
            version_id,
            entries,
            readers: Pool::new(handles),
        })
    }

    /// Content version this store serves.
    pub fn version_id(&self) -> i64 {
        self.version_id
    }

    /// Number of files in the loaded manifest.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the loaded manifest is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `path` exists in the loaded manifest.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Uncompressed size of `path`.
    pub fn size_of(&self, path: &str) -> Option<u64> {
        self.entries.get(path).map(|e| e.size as u64)
    }

    /// Every path of the loaded manifest, in sorted order. Each call starts over.
    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    /// Reader handles currently idle.
    pub fn idle_readers(&self) -> usize {
        self.readers.available()
    }

    /// Decode `path` into memory.
    ///
    /// Waits only when every pooled reader is busy. The reader goes back to the
    /// pool on every exit path.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for unknown paths, [`StoreError::Corrupt`] when the
    /// stored bytes do not decode to exactly the recorded size.
    pub async fn open(&self, path: &str) -> Result<ContentStream, StoreError> {
        let entry = *self.entries.get(path).ok_or_else(|| StoreError::NotFound {
            version_id: self.version_id,
            path: path.to_string(),
        })?;

        let mut reader = self.readers.acquire().await?;
        let path = path.to_string();
        let data = tokio::task::spawn_blocking(move || reader.read(&path, entry))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        Ok(Cursor::new(Bytes::from(data)))
    }

    /// Write every file of the version under `dest`, replacing whatever was there.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsafePath`] if a stored path would leave `dest`, plus any
    /// read or filesystem error. `dest` is left partially written on failure.
    pub async fn export(&self, dest: &Path) -> Result<Vec<ExtractedFile>, StoreError> {
        clear_dir(dest)?;

        let mut files = Vec::with_capacity(self.entries.len());
        for path in self.entries.keys() {
            if !is_safe_relative_path(path) {
                return Err(StoreError::UnsafePath(path.clone()));
            }
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let data = self.open(path).await?.into_inner();
            tokio::fs::write(&target, &data).await?;
            files.push(ExtractedFile {
                relative_path: PathBuf::from(path),
                absolute_path: target,
                is_executable: false,
            });
        }

        tracing::debug!(version_id = self.version_id, files = files.len(), dest = %dest.display(), "content exported");
        Ok(files)
    }
}

fn load_manifest(conn: &Connection, version_id: i64) -> Result<BTreeMap<String, Entry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.size, c.compression, m.path
         FROM content c
         JOIN content_manifest m ON m.content_id = c.id
         WHERE m.version_id = ?1 AND m.path NOT LIKE '%/'",
    )?;

    let rows = stmt.query_map(params![version_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut entries = BTreeMap::new();
    for row in rows {
        let (rowid, size, tag, path) = row?;
        let Ok(scheme) = CompressionScheme::from_i64(tag) else {
            return Err(StoreError::BadCompression { path, tag });
        };
        entries.insert(
            path,
            Entry {
                rowid,
                size: size as usize,
                scheme,
            },
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ContentWriter;
    use std::io::Read;
    use tempfile::tempdir;

    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545_F491_4F6C_DD1D_u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    async fn read_all(store: &ContentStore, path: &str) -> Vec<u8> {
        let mut out = Vec::new();
        store.open(path).await.unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_round_trip_every_scheme_and_size() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("content.db");
        let mut writer = ContentWriter::open(&db).unwrap();

        let big = noise(codec::zstd_chunk_size() * 2 + 333);
        let inputs: Vec<(String, Vec<u8>, CompressionScheme)> = [
            CompressionScheme::None,
            CompressionScheme::Deflate,
            CompressionScheme::ZStd,
        ]
        .into_iter()
        .flat_map(|scheme| {
            [(0usize, Vec::new()), (1, vec![42u8]), (2, big.clone())]
                .into_iter()
                .map(move |(i, data)| (format!("{scheme}/{i}.bin"), data, scheme))
        })
        .collect();

        let version = {
            let mut ingest = writer.begin_ingest().unwrap();
            let version = ingest.create_version("fork", "1.0", &[1u8; 32]).unwrap();
            for (path, data, scheme) in &inputs {
                ingest.put(version, path, data, *scheme).unwrap();
            }
            ingest.commit().unwrap();
            version
        };

        let store = ContentStore::load(&db, version, 2).unwrap();
        assert_eq!(store.len(), inputs.len());
        for (path, data, _) in &inputs {
            assert_eq!(&read_all(&store, path).await, data, "{path}");
        }
    }

    #[tokio::test]
    async fn test_missing_path_is_not_found() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("content.db");
        let mut writer = ContentWriter::open(&db).unwrap();
        let mut ingest = writer.begin_ingest().unwrap();
        let version = ingest.create_version("fork", "1.0", &[0u8; 32]).unwrap();
        ingest.commit().unwrap();

        let store = ContentStore::load(&db, version, 2).unwrap();
        let err = store.open("nope.txt").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_version() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("content.db");
        ContentWriter::open(&db).unwrap();
        assert!(matches!(
            ContentStore::load(&db, 99, 2),
            Err(StoreError::UnknownVersion(99))
        ));
    }

    #[tokio::test]
    async fn test_size_mismatch_is_corrupt() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("content.db");
        let mut writer = ContentWriter::open(&db).unwrap();
        let version = {
            let mut ingest = writer.begin_ingest().unwrap();
            let version = ingest.create_version("fork", "1.0", &[0u8; 32]).unwrap();
            ingest
                .put(version, "a.txt", b"some text, some text, some text", CompressionScheme::ZStd)
                .unwrap();
            ingest.commit().unwrap();
            version
        };
        drop(writer);

        let conn = Connection::open(&db).unwrap();
        conn.execute("UPDATE content SET size = size + 3", []).unwrap();
        drop(conn);

        let store = ContentStore::load(&db, version, 1).unwrap();
        let err = store.open("a.txt").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CorruptData);
        // The handle went back to the pool despite the failure.
        assert_eq!(store.idle_readers(), 1);
    }

    #[tokio::test]
    async fn test_parallel_opens_share_small_pool() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("content.db");
        let mut writer = ContentWriter::open(&db).unwrap();
        let version = {
            let mut ingest = writer.begin_ingest().unwrap();
            let version = ingest.create_version("fork", "1.0", &[0u8; 32]).unwrap();
            for i in 0..16 {
                let data = format!("file number {i} ").repeat(100);
                ingest
                    .put(version, &format!("dir/{i}.txt"), data.as_bytes(), CompressionScheme::ZStd)
                    .unwrap();
            }
            ingest.commit().unwrap();
            version
        };

        let store = std::sync::Arc::new(ContentStore::load(&db, version, 2).unwrap());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = std::sync::Arc::clone(&store);
            tasks.spawn(async move {
                let bytes = read_all(&store, &format!("dir/{i}.txt")).await;
                assert_eq!(bytes, format!("file number {i} ").repeat(100).into_bytes());
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
        assert_eq!(store.idle_readers(), 2);
    }

    #[tokio::test]
    async fn test_export_replaces_destination() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("content.db");
        let mut writer = ContentWriter::open(&db).unwrap();
        let version = {
            let mut ingest = writer.begin_ingest().unwrap();
            let version = ingest.create_version("fork", "1.0", &[0u8; 32]).unwrap();
            ingest.put(version, "bin/run", b"#!/bin/sh", CompressionScheme::None).unwrap();
            ingest
                .put(version, "data/a.txt", &b"aaaa".repeat(64), CompressionScheme::ZStd)
                .unwrap();
            ingest.commit().unwrap();
            version
        };

        let dest = dir.path().join("install");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), b"old").unwrap();

        let store = ContentStore::load(&db, version, 2).unwrap();
        let files = store.export(&dest).await.unwrap();

        let names: Vec<_> = files.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("bin/run"), PathBuf::from("data/a.txt")]);
        assert_eq!(std::fs::read(dest.join("bin/run")).unwrap(), b"#!/bin/sh");
        assert_eq!(std::fs::read(dest.join("data/a.txt")).unwrap(), b"aaaa".repeat(64));
        assert!(!dest.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn test_export_refuses_escaping_rows() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("content.db");
        let mut writer = ContentWriter::open(&db).unwrap();
        let version = {
            let mut ingest = writer.begin_ingest().unwrap();
            let version = ingest.create_version("fork", "1.0", &[0u8; 32]).unwrap();
            ingest.put(version, "../outside.txt", b"x", CompressionScheme::None).unwrap();
            ingest.commit().unwrap();
            version
        };

        let dest = dir.path().join("install");
        let store = ContentStore::load(&db, version, 1).unwrap();
        let err = store.export(&dest).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CorruptData);
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn test_paths_are_restartable_and_skip_directories() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("content.db");
        let mut writer = ContentWriter::open(&db).unwrap();
        let version = {
            let mut ingest = writer.begin_ingest().unwrap();
            let version = ingest.create_version("fork", "1.0", &[0u8; 32]).unwrap();
            ingest.put(version, "b.txt", b"b", CompressionScheme::None).unwrap();
            ingest.put(version, "a.txt", b"a", CompressionScheme::None).unwrap();
            ingest.put(version, "folder/", b"", CompressionScheme::None).unwrap();
            ingest.commit().unwrap();
            version
        };

        let store = ContentStore::load(&db, version, 2).unwrap();
        let first: Vec<&str> = store.paths().collect();
        let second: Vec<&str> = store.paths().collect();
        assert_eq!(first, vec!["a.txt", "b.txt"]);
        assert_eq!(first, second);
    }
}
