use anyhow::Result;

use crate::ops::{Context, Updater};

/// Run a garbage collection pass outside of an update.
pub async fn cull(ctx: Context) -> Result<()> {
    let reporter = ctx.reporter.clone();
    let report = Updater::new(ctx).collect_garbage().await;
    reporter.info(&format!(
        "removed {} engines, {} content versions, {} blobs",
        report.engines.len(),
        report.content.removed_versions.len(),
        report.content.removed_blobs
    ));
    Ok(())
}
