//! Platform identifiers and the compatibility graph.
//!
//! Identifiers look like `linux-x64`, `win7-x86` or `osx-arm64`. Each identifier
//! "imports" zero or more more-general identifiers; a build published for an
//! imported identifier runs on the importing one.
//!
//! # Example
//!
//! ```
//! use depot_schema::PlatformGraph;
//!
//! let graph = PlatformGraph::builtin().unwrap();
//! let found = graph.find_best("linux-musl-x64", ["linux-x64", "win-x64"]).unwrap();
//! assert_eq!(found.platform, "linux-x64");
//! assert_eq!(found.hops, 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;
use thiserror::Error;

const BUILTIN_CATALOG: &str = include_str!("../data/platforms.json");

/// Identifier used when nothing better can be derived.
pub const UNKNOWN_PLATFORM: &str = "unknown";

/// No identifier reachable from the requested one is available.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No compatible platform for '{requested}' among [{}]", available.join(", "))]
pub struct NoCompatiblePlatform {
    /// The identifier the search started from.
    pub requested: String,
    /// What the version actually offers.
    pub available: Vec<String>,
}

/// Result of a compatibility search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMatch {
    /// Available identifier that was selected.
    pub platform: String,
    /// Number of `#import` edges between the requested identifier and the match.
    pub hops: usize,
}

#[derive(Deserialize)]
struct Catalog {
    runtimes: HashMap<String, CatalogNode>,
}

#[derive(Deserialize)]
struct CatalogNode {
    #[serde(rename = "#import", default)]
    imports: Vec<String>,
}

/// Directed compatibility graph over platform identifiers.
#[derive(Debug, Clone, Default)]
pub struct PlatformGraph {
    imports: HashMap<String, Vec<String>>,
}

impl PlatformGraph {
    /// The catalog compiled into the binary.
    ///
    /// # Errors
    ///
    /// Fails only if the embedded catalog is malformed.
    pub fn builtin() -> Result<Self, serde_json::Error> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Parse a catalog of the form `{"runtimes": {"id": {"#import": [...]}}}`.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for malformed catalogs.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let catalog: Catalog = serde_json::from_str(json)?;
        let imports = catalog
            .runtimes
            .into_iter()
            .map(|(id, node)| (id, node.imports))
            .collect();
        Ok(Self { imports })
    }

    /// Build a graph from explicit edges, mostly for tests.
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = (&'a str, &'a [&'a str])>) -> Self {
        let imports = edges
            .into_iter()
            .map(|(id, to)| (id.to_string(), to.iter().map(|s| (*s).to_string()).collect()))
            .collect();
        Self { imports }
    }

    /// Whether the identifier is a node of the graph.
    pub fn contains(&self, id: &str) -> bool {
        self.imports.contains_key(id)
    }

    /// Breadth-first search from `requested` for the nearest available identifier.
    ///
    /// Nearness always wins: an identifier one hop away beats one two hops away no
    /// matter how `available` is ordered. Within one hop level, the order of the
    /// `#import` lists decides.
    ///
    /// # Errors
    ///
    /// Returns [`NoCompatiblePlatform`] when the reachable set and `available` are
    /// disjoint.
    pub fn find_best<I, S>(
        &self,
        requested: &str,
        available: I,
    ) -> Result<PlatformMatch, NoCompatiblePlatform>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let available: Vec<String> = available
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        let wanted: HashSet<&str> = available.iter().map(String::as_str).collect();

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        queue.push_back((requested, 0));
        visited.insert(requested);

        while let Some((id, hops)) = queue.pop_front() {
            if wanted.contains(id) {
                return Ok(PlatformMatch {
                    platform: id.to_string(),
                    hops,
                });
            }

            for next in self.imports.get(id).into_iter().flatten() {
                if visited.insert(next.as_str()) {
                    queue.push_back((next.as_str(), hops + 1));
                }
            }
        }

        Err(NoCompatiblePlatform {
            requested: requested.to_string(),
            available,
        })
    }

    /// Identifier for the running process.
    ///
    /// Uses the identifier derived from the build target when the graph knows it,
    /// otherwise falls back to [`guess_platform`].
    pub fn current_platform(&self) -> String {
        let reported = reported_platform();
        if self.contains(&reported) {
            return reported;
        }

        let guess = guess_platform();
        tracing::debug!(%reported, %guess, "reported platform unknown to graph, using guess");
        guess
    }
}

/// Identifier derived from the compile target, e.g. `linux-musl-arm64`.
pub fn reported_platform() -> String {
    platform_from_parts(
        std::env::consts::OS,
        std::env::consts::ARCH,
        cfg!(target_env = "musl"),
    )
}

/// Coarse identifier from OS and architecture alone.
pub fn guess_platform() -> String {
    guess_from_parts(std::env::consts::OS, std::env::consts::ARCH)
}

fn os_name(os: &str) -> Option<&'static str> {
    match os {
        "windows" => Some("win"),
        "linux" => Some("linux"),
        "macos" => Some("osx"),
        "freebsd" => Some("freebsd"),
        _ => None,
    }
}

fn arch_name(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("x64"),
        "x86" => Some("x86"),
        "aarch64" => Some("arm64"),
        "arm" => Some("arm"),
        _ => None,
    }
}

/// Full identifier for the given `std::env::consts` values.
pub fn platform_from_parts(os: &str, arch: &str, musl: bool) -> String {
    let os = os_name(os).map_or_else(|| os.to_string(), str::to_string);
    let arch = arch_name(arch).map_or_else(|| arch.to_string(), str::to_string);
    if musl && os == "linux" {
        format!("linux-musl-{arch}")
    } else {
        format!("{os}-{arch}")
    }
}

/// Deterministic fallback: `<os>-<arch>` when both are known, the bare OS family
/// when only the OS is, and [`UNKNOWN_PLATFORM`] otherwise.
pub fn guess_from_parts(os: &str, arch: &str) -> String {
    match (os_name(os), arch_name(arch)) {
        (Some(os), Some(arch)) => format!("{os}-{arch}"),
        (Some(os), None) => os.to_string(),
        _ => UNKNOWN_PLATFORM.to_string(),
    }
}
