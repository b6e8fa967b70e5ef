use anyhow::{Result, bail};

use crate::ops::Context;

/// Show retention preferences, updating any limit that was given.
pub fn prefs(
    ctx: &Context,
    max_versions: Option<usize>,
    max_fork_versions: Option<usize>,
) -> Result<()> {
    let mut prefs = ctx.state.preferences();

    if max_versions.is_some() || max_fork_versions.is_some() {
        if max_versions == Some(0) || max_fork_versions == Some(0) {
            bail!("Retention limits must be at least 1");
        }
        if let Some(n) = max_versions {
            prefs.max_versions_to_keep = n;
        }
        if let Some(n) = max_fork_versions {
            prefs.max_fork_versions_to_keep = n;
        }
        ctx.state.set_preferences(prefs)?;
        tracing::info!(
            max_versions = prefs.max_versions_to_keep,
            max_fork_versions = prefs.max_fork_versions_to_keep,
            "retention preferences saved"
        );
    }

    println!("max-versions = {}", prefs.max_versions_to_keep);
    println!("max-fork-versions = {}", prefs.max_fork_versions_to_keep);
    Ok(())
}
