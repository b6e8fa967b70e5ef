//! Engine archives: install, hand off to the launcher, garbage-collect.
//!
//! Engines are keyed by the version string the server asked for, which may be an
//! alias resolved through manifest redirects. The archive lives at
//! `engines/<version>.zip`; its signature is kept in the installed state.

use std::collections::HashSet;
use std::path::PathBuf;

use depot_core::UpdateStatus;
use depot_core::manifest::Freshness;
use depot_core::net::{DownloadRequest, MirrorSet, download_verified};
use depot_schema::EngineVersion;
use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use crate::ops::{Context, UpdateError};
use crate::store::InstalledEngineVersion;

/// What a process launcher needs to start the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchInfo {
    pub version: EngineVersion,
    pub artifact_path: PathBuf,
    /// Decoded signature bytes. Absent when signing is disabled.
    #[serde(serialize_with = "hex_opt")]
    pub signature: Option<Vec<u8>>,
}

fn hex_opt<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
        None => serializer.serialize_none(),
    }
}

fn decode_signature(version: &EngineVersion, signature: &str) -> Result<Vec<u8>, UpdateError> {
    hex::decode(signature).map_err(|source| UpdateError::BadSignature {
        version: version.to_string(),
        source,
    })
}

/// Make sure `version` is installed, downloading it if needed.
///
/// An engine that is recorded and present on disk costs no network requests.
pub async fn ensure_engine(
    ctx: &Context,
    version: &EngineVersion,
    cancel: &CancellationToken,
) -> Result<InstalledEngineVersion, UpdateError> {
    if let Some(installed) = ctx.state.engine(version.as_str()) {
        if ctx.paths.engine_zip(version).is_file() {
            tracing::debug!(%version, "engine already installed");
            return Ok(installed);
        }
        tracing::warn!(%version, "engine recorded but archive missing, reinstalling");
    }

    ctx.reporter.status(version.as_str(), UpdateStatus::DownloadingEngine);
    let artifact = ctx
        .manifest
        .resolve_artifact(version, &ctx.platform, &ctx.graph, Freshness::Fresh, cancel)
        .await?;
    if &artifact.version != version {
        tracing::info!(requested = %version, resolved = %artifact.version, "engine version redirected");
    }
    // A signature the launcher could not use must not reach the state file.
    decode_signature(version, &artifact.signature)?;

    let mirrors = MirrorSet::with_fallback(&ctx.config.engine_mirrors, &artifact.url);
    let staging = tempfile::Builder::new()
        .prefix("engine-")
        .tempdir_in(ctx.paths.tmp_dir())?;
    let staged = staging.path().join("engine.zip");

    download_verified(
        DownloadRequest {
            client: &ctx.client,
            mirrors: &mirrors,
            racer: &ctx.racer(),
            dest: &staged,
            expected: Some(&artifact.content_hash),
            subject: version.as_str(),
            cancel,
        },
        ctx.reporter.as_ref(),
    )
    .await?;

    if cancel.is_cancelled() {
        return Err(UpdateError::Cancelled);
    }

    let target = ctx.paths.engine_zip(version);
    tokio::fs::create_dir_all(ctx.paths.engines_dir()).await?;
    tokio::fs::rename(&staged, &target).await?;
    ctx.state.add_engine(version, &artifact.signature)?;

    tracing::info!(%version, platform = %artifact.platform, path = %target.display(), "engine installed");
    Ok(InstalledEngineVersion {
        version: version.clone(),
        signature: artifact.signature,
    })
}

/// Local archive for an installed engine.
pub fn artifact_path(ctx: &Context, version: &EngineVersion) -> Result<PathBuf, UpdateError> {
    if ctx.state.engine(version.as_str()).is_none() {
        return Err(UpdateError::EngineNotInstalled(version.to_string()));
    }
    let path = ctx.paths.engine_zip(version);
    if !path.is_file() {
        return Err(UpdateError::EngineFileMissing {
            version: version.to_string(),
            path: path.display().to_string(),
        });
    }
    Ok(path)
}

/// Signature bytes recorded for an installed engine.
pub fn signature(ctx: &Context, version: &EngineVersion) -> Result<Vec<u8>, UpdateError> {
    artifact_path(ctx, version)?;
    let installed = ctx
        .state
        .engine(version.as_str())
        .ok_or_else(|| UpdateError::EngineNotInstalled(version.to_string()))?;
    decode_signature(version, &installed.signature)
}

/// Path, version and signature the launcher needs for `version`.
pub fn launch_info(ctx: &Context, version: &EngineVersion) -> Result<LaunchInfo, UpdateError> {
    let artifact_path = artifact_path(ctx, version)?;
    let signature = if ctx.config.disable_signing {
        None
    } else {
        Some(signature(ctx, version)?)
    };
    Ok(LaunchInfo {
        version: version.clone(),
        artifact_path,
        signature,
    })
}

/// Remove every engine no installation refers to, except those in `keep`.
///
/// The archive goes first and the record second, so an interrupted cull leaves a
/// record without a file, which the next cull removes.
pub fn cull_engines(
    ctx: &Context,
    keep: &HashSet<EngineVersion>,
) -> Result<Vec<EngineVersion>, UpdateError> {
    let mut unused = ctx.state.unreferenced_engines();
    unused.retain(|v| !keep.contains(v));
    if unused.is_empty() {
        return Ok(unused);
    }

    ctx.reporter.status("engines", UpdateStatus::CullingEngine);
    for version in &unused {
        match std::fs::remove_file(ctx.paths.engine_zip(version)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        ctx.state.remove_engine(version.as_str())?;
        tracing::info!(%version, "engine culled");
    }
    Ok(unused)
}
