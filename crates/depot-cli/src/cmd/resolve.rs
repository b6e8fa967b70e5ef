use anyhow::Result;
use crossterm::style::Stylize;
use depot_core::manifest::Freshness;
use depot_schema::EngineVersion;
use tokio_util::sync::CancellationToken;

use crate::ops::Context;

/// Print what the manifest says about an engine version.
pub async fn resolve(
    ctx: &Context,
    version: &str,
    platform: Option<&str>,
    no_follow: bool,
    json: bool,
) -> Result<()> {
    let version: EngineVersion = version.parse()?;
    let version = &version;
    let cancel = CancellationToken::new();
    let platform = platform.unwrap_or(&ctx.platform);

    if no_follow {
        let resolved = ctx
            .manifest
            .resolve(version, false, Freshness::BestEffort, &cancel)
            .await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&resolved.entry)?);
        } else {
            println!("  {} {}", "version".dark_grey(), resolved.version.as_str().cyan());
            if let Some(target) = &resolved.entry.redirect {
                println!("  {} {target}", "redirect".dark_grey());
            }
            for name in resolved.entry.platforms.keys() {
                println!("  {} {name}", "platform".dark_grey());
            }
        }
        return Ok(());
    }

    let artifact = ctx
        .manifest
        .resolve_artifact(version, platform, &ctx.graph, Freshness::BestEffort, &cancel)
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
    } else {
        println!("  {} {}", "version".dark_grey(), artifact.version.as_str().cyan());
        println!("  {} {}", "platform".dark_grey(), artifact.platform);
        println!("  {} {}", "url".dark_grey(), artifact.url);
        println!("  {} {}", "sha256".dark_grey(), artifact.content_hash);
        println!("  {} {}", "signature".dark_grey(), artifact.signature);
    }
    Ok(())
}
