use std::io::Write;

use anyhow::Result;

use crate::ops::Context;
use crate::ops::remove::clear_all;

/// Delete everything under the data directory except the state fingerprint.
pub async fn clear(ctx: &Context, yes: bool) -> Result<()> {
    if !yes && !confirm(&format!(
        "Delete every installation, engine and stored version under {}?",
        ctx.paths.root().display()
    ))? {
        println!("  Aborted.");
        return Ok(());
    }

    clear_all(ctx).await?;
    ctx.reporter.info("cleared");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("  {prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
