//! Environment-driven configuration, read once at startup.

use std::time::Duration;

use thiserror::Error;

/// Default engine manifest location.
pub const DEFAULT_MANIFEST_URL: &str = "https://cdn.depot-builds.net/engine/manifest.json";

/// A variable was set but could not be parsed.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid value for {var}: '{value}' ({reason})")]
pub struct ConfigError {
    /// Variable name.
    pub var: &'static str,
    /// Raw value.
    pub value: String,
    /// What was expected.
    pub reason: &'static str,
}

/// Runtime configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Engine manifest mirrors, raced in order.
    pub manifest_urls: Vec<String>,
    /// Base URLs tried before an artifact's upstream URL.
    pub engine_mirrors: Vec<String>,
    /// How long a fetched manifest stays valid.
    pub manifest_ttl: Duration,
    /// Delay before starting the next mirror attempt.
    pub mirror_stagger: Duration,
    /// Upper bound for one mirror attempt to produce response headers.
    pub attempt_timeout: Duration,
    /// Upper bound for a whole manifest fetch.
    pub manifest_timeout: Duration,
    /// Reader connections in the content store pool.
    pub content_pool_size: usize,
    /// Resolve and fetch cycles attempted when every mirror fails.
    pub update_attempts: u32,
    /// Skip handing the signature to the launched process. Debug builds only.
    pub disable_signing: bool,
    /// Overrides the detected platform identifier.
    pub platform: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest_urls: vec![DEFAULT_MANIFEST_URL.to_string()],
            engine_mirrors: Vec::new(),
            manifest_ttl: Duration::from_secs(15 * 60),
            mirror_stagger: Duration::from_secs(3),
            attempt_timeout: Duration::from_secs(30),
            manifest_timeout: Duration::from_secs(60),
            content_pool_size: default_pool_size(),
            update_attempts: 2,
            disable_signing: false,
            platform: None,
        }
    }
}

/// `max(2, available parallelism)`.
pub fn default_pool_size() -> usize {
    num_cpus::get().max(2)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first malformed variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first malformed variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DEPOT_MANIFEST_URLS") {
            config.manifest_urls = split_list(&v);
        }
        if let Some(v) = get("DEPOT_ENGINE_MIRRORS") {
            config.engine_mirrors = split_list(&v);
        }
        if let Some(v) = get("DEPOT_MANIFEST_TTL_SECS") {
            config.manifest_ttl = Duration::from_secs(parse_num("DEPOT_MANIFEST_TTL_SECS", &v)?);
        }
        if let Some(v) = get("DEPOT_MIRROR_STAGGER_MS") {
            config.mirror_stagger =
                Duration::from_millis(parse_num("DEPOT_MIRROR_STAGGER_MS", &v)?);
        }
        if let Some(v) = get("DEPOT_ATTEMPT_TIMEOUT_SECS") {
            config.attempt_timeout =
                Duration::from_secs(parse_num("DEPOT_ATTEMPT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("DEPOT_MANIFEST_TIMEOUT_SECS") {
            config.manifest_timeout =
                Duration::from_secs(parse_num("DEPOT_MANIFEST_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("DEPOT_CONTENT_POOL_SIZE") {
            let size = parse_num("DEPOT_CONTENT_POOL_SIZE", &v)?;
            if size == 0 {
                return Err(ConfigError {
                    var: "DEPOT_CONTENT_POOL_SIZE",
                    value: v,
                    reason: "must be at least 1",
                });
            }
            config.content_pool_size = size as usize;
        }
        if let Some(v) = get("DEPOT_UPDATE_ATTEMPTS") {
            config.update_attempts = parse_num("DEPOT_UPDATE_ATTEMPTS", &v)?.max(1) as u32;
        }
        if let Some(v) = get("DEPOT_DISABLE_SIGNING") {
            let requested = v == "1" || v.eq_ignore_ascii_case("true");
            if requested && !cfg!(debug_assertions) {
                tracing::warn!("DEPOT_DISABLE_SIGNING ignored in release builds");
            }
            config.disable_signing = requested && cfg!(debug_assertions);
        }
        if let Some(v) = get("DEPOT_PLATFORM") {
            config.platform = Some(v.trim().to_string());
        }

        Ok(config)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_num(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError {
        var,
        value: value.to_string(),
        reason: "expected a non-negative integer",
    })
}
