use anyhow::Result;

use crate::ops::Context;
use crate::ops::remove::remove_installation;

/// Remove fork installations.
pub fn remove(ctx: &Context, forks: &[String]) -> Result<()> {
    for fork in forks {
        let removed = remove_installation(ctx, fork)?;
        ctx.reporter.info(&format!(
            "removed {fork} ({}, disk {})",
            removed.current_version, removed.disk_id
        ));
    }
    Ok(())
}
