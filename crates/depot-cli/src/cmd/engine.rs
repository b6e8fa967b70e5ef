use anyhow::Result;

use crate::ops::Context;
use crate::ops::engine::ensure_engine;

/// Install an engine version unless it is already present.
pub async fn ensure(ctx: &Context, version: &str) -> Result<()> {
    let version = version.parse()?;
    let cancel = super::cancel_on_ctrl_c();
    let engine = ensure_engine(ctx, &version, &cancel).await?;
    let path = ctx.paths.engine_zip(&engine.version);
    ctx.reporter
        .info(&format!("engine {} at {}", engine.version, path.display()));
    Ok(())
}
