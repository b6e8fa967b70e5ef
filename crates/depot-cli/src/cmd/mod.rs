//! Command implementations.

pub mod cat;
pub mod clear;
pub mod cull;
pub mod engine;
pub mod launch_info;
pub mod list;
pub mod ls;
pub mod platform;
pub mod prefs;
pub mod remove;
pub mod resolve;
pub mod update;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use depot_core::{Config, DepotPaths};
use tokio_util::sync::CancellationToken;

use crate::ops::Context;
use crate::ui::ConsoleReporter;

/// Build the operation context for `home` (or `DEPOT_HOME` / `~/.depot`).
pub fn open_context(home: Option<PathBuf>, quiet: bool) -> Result<Context> {
    let config = Config::from_env()?;
    let paths = match home {
        Some(root) => DepotPaths::new(root),
        None => DepotPaths::from_env().context("Could not determine home directory")?,
    };
    Context::open(paths, config, Arc::new(ConsoleReporter::new(quiet)))
}

/// Token cancelled on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}
