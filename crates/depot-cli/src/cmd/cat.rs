use std::io::{Read, Write};

use anyhow::{Context as _, Result};
use depot_core::store::ContentStore;

use crate::ops::Context;

/// Reader pool over the content version a fork's installation points at.
pub fn open_fork_store(ctx: &Context, fork: &str) -> Result<ContentStore> {
    let installed = ctx
        .state
        .installation(fork)
        .with_context(|| format!("Fork '{fork}' is not installed"))?;
    let version_id = installed
        .content_version_id
        .with_context(|| format!("Fork '{fork}' has no stored content"))?;
    ctx.content_store(version_id)
}

/// Write one stored file to stdout.
pub async fn cat(ctx: &Context, fork: &str, path: &str) -> Result<()> {
    let store = open_fork_store(ctx, fork)?;
    let mut stream = store.open(path).await?;

    let mut data = Vec::new();
    stream.read_to_end(&mut data)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}
