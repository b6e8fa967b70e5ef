//! Content manifest wire format.
//!
//! A content manifest lists every file of one content version, one line each,
//! after a fixed header line:
//!
//! ```text
//! Depot Content Manifest 1
//! <blake3 hex> <relative path>
//! ```
//!
//! Line order matters: the blob download protocol addresses files by their
//! zero-based position after the header.

use std::collections::HashSet;

/// First line of every content manifest.
pub const CONTENT_MANIFEST_HEADER: &str = "Depot Content Manifest 1";

/// Errors produced while parsing a content manifest.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ContentManifestError {
    /// The header line is missing or names an unknown format.
    #[error("Unknown content manifest header: {0:?}")]
    BadHeader(String),

    /// A line is not `<hash> <path>`.
    #[error("Line {line}: {reason}")]
    BadLine {
        /// One-based line number.
        line: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// The path could land outside the install directory.
    #[error("Line {line}: unsafe path {path:?}")]
    UnsafePath {
        /// One-based line number.
        line: usize,
        /// Offending path.
        path: String,
    },

    /// Two lines name the same path.
    #[error("Line {line}: duplicate path {path:?}")]
    DuplicatePath {
        /// One-based line number.
        line: usize,
        /// Offending path.
        path: String,
    },
}

/// One file of a content version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    /// BLAKE3 of the uncompressed file.
    pub hash: [u8; 32],
    /// Relative path with `/` separators.
    pub path: String,
}

/// Every file of one content version, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentManifest {
    entries: Vec<ContentEntry>,
}

impl ContentManifest {
    /// Parse a manifest document.
    ///
    /// # Errors
    ///
    /// Rejects unknown headers, malformed lines, duplicate paths and any path
    /// that is absolute or climbs out of its root.
    pub fn parse(text: &str) -> Result<Self, ContentManifestError> {
        let mut lines = text.lines();
        match lines.next() {
            Some(CONTENT_MANIFEST_HEADER) => {}
            other => {
                return Err(ContentManifestError::BadHeader(
                    other.unwrap_or_default().to_string(),
                ));
            }
        }

        let mut manifest = Self::default();
        let mut seen = HashSet::new();
        for (n, line) in lines.enumerate() {
            let line_no = n + 2;
            let (hex_hash, path) = line.split_once(' ').ok_or_else(|| ContentManifestError::BadLine {
                line: line_no,
                reason: "expected '<hash> <path>'".to_string(),
            })?;

            let mut hash = [0u8; 32];
            hex::decode_to_slice(hex_hash, &mut hash).map_err(|e| ContentManifestError::BadLine {
                line: line_no,
                reason: format!("bad hash: {e}"),
            })?;

            if !is_safe_relative_path(path) {
                return Err(ContentManifestError::UnsafePath {
                    line: line_no,
                    path: path.to_string(),
                });
            }
            if !seen.insert(path) {
                return Err(ContentManifestError::DuplicatePath {
                    line: line_no,
                    path: path.to_string(),
                });
            }

            manifest.entries.push(ContentEntry {
                hash,
                path: path.to_string(),
            });
        }
        Ok(manifest)
    }

    /// Build a manifest from already validated entries.
    ///
    /// # Errors
    ///
    /// Same path rules as [`ContentManifest::parse`].
    pub fn from_entries(
        entries: impl IntoIterator<Item = ContentEntry>,
    ) -> Result<Self, ContentManifestError> {
        Self::parse(&Self::render(entries.into_iter()))
    }

    /// Serialize back to the wire format.
    pub fn to_text(&self) -> String {
        Self::render(self.entries.iter().cloned())
    }

    fn render(entries: impl Iterator<Item = ContentEntry>) -> String {
        let mut out = String::from(CONTENT_MANIFEST_HEADER);
        out.push('\n');
        for entry in entries {
            out.push_str(&hex::encode(entry.hash));
            out.push(' ');
            out.push_str(&entry.path);
            out.push('\n');
        }
        out
    }

    /// Entries in wire order.
    pub fn entries(&self) -> &[ContentEntry] {
        &self.entries
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the version has no files.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// True for a non-empty relative path whose every component is a plain name.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains(['\\', ':', '\0'])
        && path
            .split('/')
            .all(|c| !c.is_empty() && c != "." && c != "..")
}
