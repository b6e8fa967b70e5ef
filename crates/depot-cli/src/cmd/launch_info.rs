use anyhow::{Context as _, Result};

use crate::ops::Context;
use crate::ops::engine::launch_info as resolve_launch_info;

/// Print what a process launcher needs for the fork's engine.
pub fn launch_info(ctx: &Context, fork: &str, json: bool) -> Result<()> {
    let installed = ctx
        .state
        .installation(fork)
        .with_context(|| format!("Fork '{fork}' is not installed"))?;
    let info = resolve_launch_info(ctx, &installed.current_engine_version)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("path={}", info.artifact_path.display());
        println!("version={}", info.version);
        if let Some(signature) = &info.signature {
            println!("signature={}", hex::encode(signature));
        }
    }
    Ok(())
}
