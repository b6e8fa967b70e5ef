//! Shared operation context.
//!
//! Groups the long-lived services every operation needs: the installed state, the
//! content writer, the manifest resolver and the HTTP client.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use depot_core::manifest::ManifestResolver;
use depot_core::net::{MirrorRacer, build_client};
use depot_core::store::ContentStore;
use depot_core::{Config, DepotPaths, Reporter};
use depot_schema::PlatformGraph;

use crate::store::{StateStore, WriterHandle};

/// Groups common state used during update and engine operations.
#[derive(Clone)]
pub struct Context {
    pub paths: DepotPaths,
    pub config: Arc<Config>,
    pub state: Arc<StateStore>,
    pub writer: WriterHandle,
    pub manifest: Arc<ManifestResolver>,
    pub graph: Arc<PlatformGraph>,
    pub client: reqwest::Client,
    pub reporter: Arc<dyn Reporter>,
    /// Platform identifier artifacts are resolved for.
    pub platform: String,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("paths", &self.paths)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create the on-disk layout, load state and start the content writer.
    pub fn open(paths: DepotPaths, config: Config, reporter: Arc<dyn Reporter>) -> Result<Self> {
        paths
            .ensure()
            .with_context(|| format!("Failed to create {}", paths.root().display()))?;

        let state = StateStore::load_or_create(&paths.state_file())
            .with_context(|| format!("Failed to load {}", paths.state_file().display()))?;
        let writer = WriterHandle::spawn(&paths.content_db())
            .with_context(|| format!("Failed to open {}", paths.content_db().display()))?;

        let client = build_client().context("Failed to build HTTP client")?;
        let graph = PlatformGraph::builtin().context("Built-in platform graph is malformed")?;
        let platform = config
            .platform
            .clone()
            .unwrap_or_else(|| graph.current_platform());
        let manifest = ManifestResolver::from_config(client.clone(), &config);

        tracing::debug!(home = %paths.root().display(), %platform, "context ready");
        Ok(Self {
            paths,
            config: Arc::new(config),
            state: Arc::new(state),
            writer,
            manifest: Arc::new(manifest),
            graph: Arc::new(graph),
            client,
            reporter,
            platform,
        })
    }

    /// Racer configured for artifact downloads.
    pub fn racer(&self) -> MirrorRacer {
        MirrorRacer::new(self.config.mirror_stagger).with_attempt_timeout(self.config.attempt_timeout)
    }

    /// Reader pool over one committed content version.
    pub fn content_store(&self, version_id: i64) -> Result<ContentStore> {
        ContentStore::load(
            &self.paths.content_db(),
            version_id,
            self.config.content_pool_size,
        )
        .with_context(|| format!("Failed to open content version {version_id}"))
    }
}
