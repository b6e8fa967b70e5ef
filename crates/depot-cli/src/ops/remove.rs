//! Removing installations and wiping the data directory.

use std::collections::HashSet;

use depot_core::extract::clear_dir;

use crate::ops::engine::cull_engines;
use crate::ops::{Context, UpdateError};
use crate::store::InstalledVersion;

/// Forget `fork` and delete its install directory.
///
/// The record goes first so a crash never leaves a record pointing at a deleted
/// directory. Engines left without referrers are culled afterwards.
pub fn remove_installation(ctx: &Context, fork: &str) -> Result<InstalledVersion, UpdateError> {
    let removed = ctx.state.remove_installation(fork)?;
    let dir = ctx.paths.install_dir(removed.disk_id);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tracing::info!(fork, disk_id = removed.disk_id, "installation removed");

    cull_engines(ctx, &HashSet::new())?;
    Ok(removed)
}

/// Drop every installation, engine and stored content version.
pub async fn clear_all(ctx: &Context) -> Result<(), UpdateError> {
    ctx.state.clear()?;
    for dir in [ctx.paths.installs_dir(), ctx.paths.engines_dir(), ctx.paths.tmp_dir()] {
        clear_dir(&dir)?;
    }
    ctx.writer.clear_all().await?;
    tracing::info!(home = %ctx.paths.root().display(), "data directory cleared");
    Ok(())
}
