use depot_schema::EngineVersion;
use dirs::home_dir;
use std::path::{Path, PathBuf};

/// Returns the data directory, or None if the user's home cannot be resolved.
pub fn try_depot_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("DEPOT_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".depot"))
}

/// On-disk layout rooted at one directory.
///
/// ```text
/// <home>/
/// ├── state.json     # installed forks and engines
/// ├── content.db     # content store (SQLite, WAL)
/// ├── engines/       # <version>.zip
/// ├── installs/      # <disk id>/ extracted packages
/// └── tmp/           # downloads in flight (same volume as engines/)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotPaths {
    root: PathBuf,
}

impl DepotPaths {
    /// Layout under an explicit root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout under `DEPOT_HOME` or `~/.depot`.
    pub fn from_env() -> Option<Self> {
        try_depot_home().map(Self::new)
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installed state file: `<home>/state.json`
    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Content database: `<home>/content.db`
    pub fn content_db(&self) -> PathBuf {
        self.root.join("content.db")
    }

    /// Engine archives: `<home>/engines`
    pub fn engines_dir(&self) -> PathBuf {
        self.root.join("engines")
    }

    /// Archive for one engine version. Always a direct child of `engines/`.
    pub fn engine_zip(&self, version: &EngineVersion) -> PathBuf {
        self.engines_dir().join(format!("{version}.zip"))
    }

    /// Extracted packages: `<home>/installs`
    pub fn installs_dir(&self) -> PathBuf {
        self.root.join("installs")
    }

    /// Install directory for one disk id.
    pub fn install_dir(&self, disk_id: u32) -> PathBuf {
        self.installs_dir().join(disk_id.to_string())
    }

    /// Temp path: `<home>/tmp`
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Create every directory of the layout.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error encountered.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.engines_dir(),
            self.installs_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Extract the filename from a URL.
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.split('/').next_back().unwrap_or("")
}
