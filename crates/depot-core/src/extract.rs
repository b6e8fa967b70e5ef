//! Zip extraction into an install directory.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::ZipArchive;

use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Archive entry escapes the destination: {0}")]
    UnsafePath(String),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Archive(_) | Self::UnsafePath(_) => ErrorKind::CorruptData,
        }
    }
}

/// Information about an extracted file
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    /// Path relative to extraction root
    pub relative_path: PathBuf,
    /// Absolute path on disk
    pub absolute_path: PathBuf,
    /// Whether this is an executable
    pub is_executable: bool,
}

/// Remove everything inside `dir`, leaving it empty.
///
/// # Errors
///
/// Propagates filesystem errors.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(dir)
}

/// Extract a zip archive into `dest_dir`.
///
/// Entries whose names would land outside `dest_dir` abort the extraction.
/// Unix modes recorded in the archive are restored.
///
/// # Errors
///
/// [`ExtractError::UnsafePath`] for traversal attempts, archive and I/O errors
/// otherwise.
pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<Vec<ExtractedFile>, ExtractError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    fs::create_dir_all(dest_dir)?;
    let mut extracted_files = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative_path) = entry.enclosed_name() else {
            return Err(ExtractError::UnsafePath(entry.name().to_string()));
        };

        let absolute_path = dest_dir.join(&relative_path);
        if entry.is_dir() {
            fs::create_dir_all(&absolute_path)?;
            continue;
        }

        if let Some(p) = absolute_path.parent() {
            fs::create_dir_all(p)?;
        }

        let mut outfile = File::create(&absolute_path)?;
        io::copy(&mut entry, &mut outfile)?;

        #[cfg(unix)]
        let is_executable = if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&absolute_path, fs::Permissions::from_mode(mode & 0o7777))?;
            mode & 0o111 != 0
        } else {
            false
        };
        #[cfg(not(unix))]
        let is_executable = false;

        extracted_files.push(ExtractedFile {
            relative_path,
            absolute_path,
            is_executable,
        });
    }

    tracing::debug!(
        archive = %archive_path.display(),
        files = extracted_files.len(),
        "extracted"
    );
    Ok(extracted_files)
}

/// Whether `platform` names a unix-like target.
pub fn is_unix_platform(platform: &str) -> bool {
    !platform.starts_with("win")
}

/// Mark launchable files executable when installing for a unix-like platform.
///
/// Files with no extension or a `.sh` extension get `0o755`. Returns how many
/// files were changed.
///
/// # Errors
///
/// Propagates permission errors.
pub fn restore_exec_bits(files: &mut [ExtractedFile], platform: &str) -> io::Result<usize> {
    if !is_unix_platform(platform) {
        return Ok(0);
    }

    let mut changed = 0;
    for file in files.iter_mut().filter(|f| !f.is_executable) {
        let launchable = match file.relative_path.extension() {
            None => true,
            Some(ext) => ext == "sh",
        };
        if launchable && set_executable(&file.absolute_path)? {
            file.is_executable = true;
            changed += 1;
        }
    }
    Ok(changed)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(true)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<bool> {
    Ok(false)
}
