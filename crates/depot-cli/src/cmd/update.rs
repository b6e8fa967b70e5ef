use anyhow::{Context as _, Result, bail};
use depot_schema::{EngineVersion, ForkId, Sha256Digest};

use crate::UpdateArgs;
use crate::ops::{ContentManifestSource, Context, UpdateOutcome, UpdateRequest, Updater};

fn digest(value: Option<&str>, flag: &str) -> Result<Option<Sha256Digest>> {
    value
        .map(Sha256Digest::new)
        .transpose()
        .with_context(|| format!("Invalid {flag}"))
}

/// Update one fork to the announced content and engine versions.
pub async fn update(ctx: Context, args: &UpdateArgs) -> Result<()> {
    let fork = args.fork.as_str();
    let fork_id = ForkId::new(fork)?;
    let hash = digest(args.hash.as_deref(), "--hash")?;
    if args.version.trim().is_empty() {
        bail!("--version must not be empty");
    }
    let engine_version = EngineVersion::new(args.engine.as_str()).context("Invalid --engine")?;

    let manifest = match (&args.manifest_url, &args.manifest_download_url) {
        (Some(url), Some(download_url)) => Some(ContentManifestSource {
            url: url.clone(),
            download_url: download_url.clone(),
            hash: digest(args.manifest_hash.as_deref(), "--manifest-hash")?,
        }),
        (None, None) => None,
        _ => bail!("--manifest-url and --manifest-download-url go together"),
    };

    let request = UpdateRequest {
        fork_id,
        version: args.version.clone(),
        hash,
        download_urls: args.urls.clone(),
        manifest,
        engine_version,
    };

    let reporter = ctx.reporter.clone();
    let cancel = super::cancel_on_ctrl_c();
    let updater = Updater::new(ctx);
    let outcome = updater.run(&request, &cancel).await?;

    match outcome {
        UpdateOutcome::UpToDate(installed) => reporter.info(&format!(
            "{fork} is up to date ({}, engine {})",
            installed.current_version, installed.current_engine_version
        )),
        UpdateOutcome::Updated(installed) => reporter.info(&format!(
            "{fork} updated to {} (engine {})",
            installed.current_version, installed.current_engine_version
        )),
    }
    Ok(())
}
