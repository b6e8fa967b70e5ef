//! depot - game content delivery
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
//!
//! Installs and updates per-fork content packages and the engine builds they run
//! on, keeping every ingested package queryable in a local content store.
//!
//! # Architecture
//!
//! - **Actor Pattern**: the content database has a single writer, hosted on its
//!   own thread behind `WriterHandle`.
//! - **Atomic state**: `state.json` is rewritten through a temp file and rename on
//!   every change; the installation record is the only commit point of an update.
//! - **Services**: the manifest resolver and reader pools are long-lived values
//!   carried by `Context`, never globals.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.depot/
//! ├── state.json   # installed forks and engines
//! ├── content.db   # content store
//! ├── engines/     # <version>.zip
//! ├── installs/    # <disk id>/
//! └── tmp/         # downloads in flight
//! ```

pub mod cmd;
pub mod ops;
pub mod store;
pub mod ui;

pub use depot_core::paths::*;
pub use depot_core::{Config, USER_AGENT};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "depot")]
#[command(author, version = env!("DEPOT_VERSION"), about = "depot - game content delivery")]
pub struct Cli {
    /// Data directory
    #[arg(long, global = true, env = "DEPOT_HOME")]
    pub home: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Bring a fork to the version the server announces
    Update(UpdateArgs),
    /// Engine management commands
    Engine {
        #[command(subcommand)]
        command: EngineCommands,
    },
    /// Resolve an engine version against the manifest
    Resolve {
        /// Engine version or alias
        version: String,
        /// Target platform (defaults to the detected one)
        #[arg(long, env = "DEPOT_PLATFORM")]
        platform: Option<String>,
        /// Do not follow redirects
        #[arg(long)]
        no_follow: bool,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// List installed forks and engines
    List,
    /// List files stored for a fork's installed content
    Ls {
        /// Fork id
        fork: String,
    },
    /// Write one stored file to stdout
    Cat {
        /// Fork id
        fork: String,
        /// Path inside the content package
        path: String,
    },
    /// Print the engine path, version and signature a launcher needs
    #[command(name = "launch-info")]
    LaunchInfo {
        /// Fork id
        fork: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove unreferenced engines and old content versions
    Cull,
    /// Show or change how many content versions are kept
    Prefs {
        /// Content versions kept across every fork
        #[arg(long)]
        max_versions: Option<usize>,
        /// Content versions kept per fork
        #[arg(long)]
        max_fork_versions: Option<usize>,
    },
    /// Remove a fork's installation
    Remove {
        /// Fork id(s)
        #[arg(required = true)]
        forks: Vec<String>,
    },
    /// Delete every installation, engine and stored content version
    Clear {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Show the detected platform and, optionally, the best match among candidates
    Platform {
        /// Candidate platform identifiers
        available: Vec<String>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Args)]
#[command(group = clap::ArgGroup::new("source").required(true).multiple(true))]
pub struct UpdateArgs {
    /// Fork id
    #[arg(long)]
    pub fork: String,
    /// Content version
    #[arg(long)]
    pub version: String,
    /// Expected SHA-256 of the content package
    #[arg(long)]
    pub hash: Option<String>,
    /// Content package URL; repeat for mirrors, tried in order
    #[arg(long = "url", group = "source")]
    pub urls: Vec<String>,
    /// Per-file content manifest URL
    #[arg(long, group = "source", requires = "manifest_download_url")]
    pub manifest_url: Option<String>,
    /// Blob download endpoint for the manifest
    #[arg(long, requires = "manifest_url")]
    pub manifest_download_url: Option<String>,
    /// Expected SHA-256 of the content manifest
    #[arg(long, requires = "manifest_url")]
    pub manifest_hash: Option<String>,
    /// Engine version the content runs on
    #[arg(long)]
    pub engine: String,
}

#[derive(Debug, Subcommand)]
pub enum EngineCommands {
    /// Download an engine version unless it is already installed
    Ensure {
        /// Engine version or alias
        version: String,
    },
}
