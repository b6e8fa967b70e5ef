//! Engine manifest resolution with a TTL cache.
//!
//! One async mutex guards the cache, so concurrent lookups that miss trigger a
//! single fetch. A miss against a still-valid cache refetches once before giving
//! up: a server may already announce a version the cached copy predates.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use depot_schema::{
    ArtifactDescriptor, BuildManifest, EngineVersion, NoCompatiblePlatform, PlatformGraph, VersionEntry,
};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ErrorKind;
use crate::net::{MirrorRacer, MirrorSet, RaceError};

/// Longest redirect chain followed before giving up.
pub const MAX_REDIRECTS: usize = 16;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Engine version '{0}' is not in the manifest")]
    NotFound(String),

    #[error("Engine version '{0}' is marked insecure")]
    Insecure(String),

    #[error("Redirect loop starting at '{start}': {}", chain.join(" -> "))]
    RedirectLoop { start: String, chain: Vec<String> },

    #[error("Redirect chain from '{0}' exceeds {max} hops", max = MAX_REDIRECTS)]
    RedirectTooLong(String),

    #[error(transparent)]
    NoPlatform(#[from] NoCompatiblePlatform),

    #[error("Manifest fetch failed: {0}")]
    Fetch(#[from] RaceError<reqwest::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Manifest fetch timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Manifest fetch cancelled")]
    Cancelled,
}

impl ManifestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_)
            | Self::Insecure(_)
            | Self::RedirectLoop { .. }
            | Self::RedirectTooLong(_)
            | Self::NoPlatform(_) => ErrorKind::NotFound,
            Self::Fetch(e) => e.kind(),
            Self::Http(_) | Self::TimedOut(_) => ErrorKind::Unreachable,
            Self::Parse(_) => ErrorKind::CorruptData,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// How stale a manifest a lookup tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Never serve an expired manifest.
    #[default]
    Fresh,
    /// Serve an expired manifest when refetching fails.
    BestEffort,
}

/// A version entry found in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Final version after redirects.
    pub version: EngineVersion,
    pub entry: VersionEntry,
    /// Redirects followed to get here.
    pub redirects: usize,
}

#[derive(Debug)]
struct CachedManifest {
    fetched_at: DateTime<Utc>,
    valid_until: Instant,
    data: Arc<BuildManifest>,
}

impl CachedManifest {
    fn is_valid(&self) -> bool {
        Instant::now() < self.valid_until
    }
}

#[derive(Debug)]
enum Lookup {
    Missing(String),
    Failed(ManifestError),
}

impl From<Lookup> for ManifestError {
    fn from(lookup: Lookup) -> Self {
        match lookup {
            Lookup::Missing(version) => Self::NotFound(version),
            Lookup::Failed(err) => err,
        }
    }
}

/// Long-lived manifest service shared by every update.
#[derive(Debug)]
pub struct ManifestResolver {
    client: Client,
    mirrors: MirrorSet,
    racer: MirrorRacer,
    ttl: Duration,
    fetch_timeout: Duration,
    cache: Mutex<Option<CachedManifest>>,
    fetches: AtomicUsize,
}

impl ManifestResolver {
    /// Resolver racing `mirrors`, caching a fetched manifest for `ttl`.
    pub fn new(
        client: Client,
        mirrors: MirrorSet,
        racer: MirrorRacer,
        ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            client,
            mirrors,
            racer,
            ttl,
            fetch_timeout,
            cache: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Resolver configured from the manifest settings of `config`.
    pub fn from_config(client: Client, config: &Config) -> Self {
        Self::new(
            client,
            MirrorSet::new(config.manifest_urls.iter().cloned()),
            MirrorRacer::new(config.mirror_stagger).with_attempt_timeout(config.attempt_timeout),
            config.manifest_ttl,
            config.manifest_timeout,
        )
    }

    /// Number of manifest fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// When the cached manifest was fetched, if there is one.
    pub async fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.cache.lock().await.as_ref().map(|c| c.fetched_at)
    }

    /// Drop the cached manifest.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Look up `version`, optionally following redirects.
    ///
    /// # Errors
    ///
    /// [`ManifestError::NotFound`] after a fresh manifest still lacks the version,
    /// [`ManifestError::Insecure`] for withdrawn builds, redirect errors for
    /// broken chains, and fetch errors when no manifest can be obtained.
    pub async fn resolve(
        &self,
        version: &EngineVersion,
        follow_redirects: bool,
        freshness: Freshness,
        cancel: &CancellationToken,
    ) -> Result<Resolved, ManifestError> {
        let mut cache = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ManifestError::Cancelled),
            guard = self.cache.lock() => guard,
        };

        if let Some(cached) = cache.as_ref().filter(|c| c.is_valid()) {
            match find(&cached.data, version, follow_redirects) {
                Err(Lookup::Missing(missing)) => {
                    tracing::debug!(%version, missing = %missing, "not in cached manifest, refetching");
                }
                other => return other.map_err(Into::into),
            }
        }

        match self.fetch(cancel).await {
            Ok(manifest) => {
                tracing::debug!(versions = manifest.len(), ttl = ?self.ttl, "manifest cached");
                let data = Arc::new(manifest);
                *cache = Some(CachedManifest {
                    fetched_at: Utc::now(),
                    valid_until: Instant::now() + self.ttl,
                    data: Arc::clone(&data),
                });
                find(&data, version, follow_redirects).map_err(Into::into)
            }
            Err(err) => match cache.as_ref() {
                Some(stale) if freshness == Freshness::BestEffort && err.kind() != ErrorKind::Cancelled => {
                    tracing::warn!(
                        error = %err,
                        fetched_at = %stale.fetched_at,
                        "manifest refresh failed, using stale copy"
                    );
                    find(&stale.data, version, follow_redirects).map_err(Into::into)
                }
                _ => Err(err),
            },
        }
    }

    /// Resolve `version` (following redirects) to the build for the platform
    /// nearest to `platform` in `graph`.
    ///
    /// # Errors
    ///
    /// Everything [`ManifestResolver::resolve`] returns, plus
    /// [`ManifestError::NoPlatform`].
    pub async fn resolve_artifact(
        &self,
        version: &EngineVersion,
        platform: &str,
        graph: &PlatformGraph,
        freshness: Freshness,
        cancel: &CancellationToken,
    ) -> Result<ArtifactDescriptor, ManifestError> {
        let resolved = self.resolve(version, true, freshness, cancel).await?;
        let found = graph.find_best(platform, resolved.entry.platforms.keys())?;
        if found.hops > 0 {
            tracing::debug!(requested = platform, using = %found.platform, hops = found.hops, "using compatible platform");
        }

        let build = resolved
            .entry
            .platforms
            .get(&found.platform)
            .ok_or_else(|| ManifestError::NotFound(resolved.version.to_string()))?;
        Ok(ArtifactDescriptor::from_build(
            &resolved.version,
            &found.platform,
            &resolved.entry,
            build,
        ))
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<BuildManifest, ManifestError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(mirrors = ?self.mirrors.urls(), "fetching manifest");

        let request = async {
            let won = self.mirrors.get(&self.client, &self.racer, cancel).await?;
            let body = won.value.text().await?;
            Ok::<_, ManifestError>(BuildManifest::from_json(&body)?)
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ManifestError::Cancelled),
            result = tokio::time::timeout(self.fetch_timeout, request) => {
                result.unwrap_or_else(|_| Err(ManifestError::TimedOut(self.fetch_timeout)))
            }
        }
    }
}

fn find(manifest: &BuildManifest, version: &EngineVersion, follow: bool) -> Result<Resolved, Lookup> {
    let mut current = version.clone();
    let mut entry = manifest
        .get(current.as_str())
        .ok_or_else(|| Lookup::Missing(current.to_string()))?;
    let mut chain = vec![current.to_string()];
    let mut seen: HashSet<EngineVersion> = HashSet::from([current.clone()]);

    if follow {
        while let Some(target) = &entry.redirect {
            if !seen.insert(target.clone()) {
                chain.push(target.to_string());
                return Err(Lookup::Failed(ManifestError::RedirectLoop {
                    start: version.to_string(),
                    chain,
                }));
            }
            if chain.len() > MAX_REDIRECTS {
                return Err(Lookup::Failed(ManifestError::RedirectTooLong(version.to_string())));
            }
            tracing::debug!(from = %current, to = %target, "following manifest redirect");
            current.clone_from(target);
            chain.push(current.to_string());
            entry = manifest
                .get(current.as_str())
                .ok_or_else(|| Lookup::Missing(current.to_string()))?;
        }
    }

    if entry.insecure {
        return Err(Lookup::Failed(ManifestError::Insecure(current.to_string())));
    }

    Ok(Resolved {
        version: current,
        entry: entry.clone(),
        redirects: chain.len() - 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "1.0": {
            "insecure": false,
            "platforms": {
                "linux-x64": {"url": "https://cdn.example/1.0/linux.zip", "sha256": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "sig": "00ff"},
                "win-x64": {"url": "https://cdn.example/1.0/win.zip", "sha256": "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", "sig": "11ee"}
            }
        },
        "1.1": {
            "platforms": {
                "linux-x64": {"url": "https://cdn.example/1.1/linux.zip", "sha256": "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc", "sig": "22dd"}
            }
        },
        "latest": {"redirect": "1.1", "platforms": {}},
        "stable": {"redirect": "latest", "platforms": {}},
        "loop-a": {"redirect": "loop-b", "platforms": {}},
        "loop-b": {"redirect": "loop-a", "platforms": {}},
        "dangling": {"redirect": "9.9", "platforms": {}},
        "0.9": {"insecure": true, "platforms": {}}
    }"#;

    fn v(s: &str) -> EngineVersion {
        EngineVersion::new(s).unwrap()
    }

    fn resolver(url: String, ttl: Duration) -> ManifestResolver {
        ManifestResolver::new(
            Client::new(),
            MirrorSet::single(url),
            MirrorRacer::new(Duration::from_millis(100)),
            ttl,
            Duration::from_secs(10),
        )
    }

    async fn serve(server: &mut mockito::Server, hits: usize) -> mockito::Mock {
        server
            .mock("GET", "/manifest.json")
            .with_body(MANIFEST)
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_cached_lookups_fetch_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = serve(&mut server, 1).await;
        let resolver = resolver(format!("{}/manifest.json", server.url()), Duration::from_secs(900));
        let cancel = CancellationToken::new();

        let first = resolver.resolve(&v("1.0"), true, Freshness::Fresh, &cancel).await.unwrap();
        let second = resolver.resolve(&v("1.1"), true, Freshness::Fresh, &cancel).await.unwrap();
        assert_eq!(first.version.as_str(), "1.0");
        assert_eq!(second.version.as_str(), "1.1");
        assert!(resolver.fetched_at().await.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_miss_on_valid_cache_refetches_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = serve(&mut server, 2).await;
        let resolver = resolver(format!("{}/manifest.json", server.url()), Duration::from_secs(900));
        let cancel = CancellationToken::new();

        resolver.resolve(&v("1.0"), true, Freshness::Fresh, &cancel).await.unwrap();
        let err = resolver.resolve(&v("7.7"), true, Freshness::Fresh, &cancel).await.unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(ref v) if v == "7.7"));
        assert_eq!(resolver.fetch_count(), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = serve(&mut server, 1).await;
        let resolver = Arc::new(resolver(
            format!("{}/manifest.json", server.url()),
            Duration::from_secs(900),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let resolver = Arc::clone(&resolver);
            tasks.spawn(async move {
                resolver
                    .resolve(&v("1.0"), true, Freshness::Fresh, &CancellationToken::new())
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap().version.as_str(), "1.0");
        }
        assert_eq!(resolver.fetch_count(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_cache_refetches() {
        let mut server = mockito::Server::new_async().await;
        let mock = serve(&mut server, 2).await;
        let resolver = resolver(format!("{}/manifest.json", server.url()), Duration::ZERO);
        let cancel = CancellationToken::new();

        resolver.resolve(&v("1.0"), true, Freshness::Fresh, &cancel).await.unwrap();
        resolver.resolve(&v("1.0"), true, Freshness::Fresh, &cancel).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_redirects() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, 1).await;
        let resolver = resolver(format!("{}/manifest.json", server.url()), Duration::from_secs(900));
        let cancel = CancellationToken::new();

        let followed = resolver.resolve(&v("stable"), true, Freshness::Fresh, &cancel).await.unwrap();
        assert_eq!(followed.version.as_str(), "1.1");
        assert_eq!(followed.redirects, 2);

        let raw = resolver.resolve(&v("latest"), false, Freshness::Fresh, &cancel).await.unwrap();
        assert_eq!(raw.version.as_str(), "latest");
        assert_eq!(raw.entry.redirect, Some(v("1.1")));

        let err = resolver.resolve(&v("loop-a"), true, Freshness::Fresh, &cancel).await.unwrap_err();
        match err {
            ManifestError::RedirectLoop { start, chain } => {
                assert_eq!(start, "loop-a");
                assert_eq!(chain, vec!["loop-a", "loop-b", "loop-a"]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_long_chain_rejected() {
        let mut manifest = BuildManifest::default();
        for i in 0..=MAX_REDIRECTS + 1 {
            manifest.versions.insert(
                v(&format!("v{i}")),
                VersionEntry {
                    redirect: Some(v(&format!("v{}", i + 1))),
                    ..VersionEntry::default()
                },
            );
        }
        let err = ManifestError::from(find(&manifest, &v("v0"), true).unwrap_err());
        assert!(matches!(err, ManifestError::RedirectTooLong(_)));
    }

    #[tokio::test]
    async fn test_insecure_rejected_distinctly() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, 1).await;
        let resolver = resolver(format!("{}/manifest.json", server.url()), Duration::from_secs(900));

        let err = resolver
            .resolve(&v("0.9"), true, Freshness::Fresh, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Insecure(ref v) if v == "0.9"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_best_effort_serves_stale_copy() {
        let mut server = mockito::Server::new_async().await;
        let ok = serve(&mut server, 1).await;
        let resolver = resolver(format!("{}/manifest.json", server.url()), Duration::ZERO);
        let cancel = CancellationToken::new();

        resolver.resolve(&v("1.0"), true, Freshness::Fresh, &cancel).await.unwrap();
        ok.remove_async().await;
        let _down = server
            .mock("GET", "/manifest.json")
            .with_status(500)
            .create_async()
            .await;

        let stale = resolver
            .resolve(&v("1.0"), true, Freshness::BestEffort, &cancel)
            .await
            .unwrap();
        assert_eq!(stale.version.as_str(), "1.0");

        let err = resolver
            .resolve(&v("1.0"), true, Freshness::Fresh, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn test_artifact_uses_nearest_platform() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, 1).await;
        let resolver = resolver(format!("{}/manifest.json", server.url()), Duration::from_secs(900));
        let graph = PlatformGraph::from_edges([
            ("linux-musl-x64", &["linux-x64"][..]),
            ("linux-x64", &["unix-x64"][..]),
        ]);
        let cancel = CancellationToken::new();

        let artifact = resolver
            .resolve_artifact(&v("latest"), "linux-musl-x64", &graph, Freshness::Fresh, &cancel)
            .await
            .unwrap();
        assert_eq!(artifact.version.as_str(), "1.1");
        assert_eq!(artifact.platform, "linux-x64");
        assert_eq!(artifact.url, "https://cdn.example/1.1/linux.zip");
        assert_eq!(artifact.signature_bytes().unwrap(), vec![0x22, 0xdd]);

        let err = resolver
            .resolve_artifact(&v("1.1"), "osx-arm64", &graph, Freshness::Fresh, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::NoPlatform(_)));
    }

    #[tokio::test]
    async fn test_dangling_redirect_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, 1).await;
        let resolver = resolver(format!("{}/manifest.json", server.url()), Duration::from_secs(900));

        let err = resolver
            .resolve(&v("dangling"), true, Freshness::Fresh, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(ref v) if v == "9.9"));
    }
}
