//! Engine build manifest wire format.
//!
//! The manifest is a JSON object keyed by version string:
//!
//! ```json
//! {
//!   "0.42.1": {
//!     "insecure": false,
//!     "redirect": null,
//!     "platforms": {
//!       "linux-x64": { "url": "https://…/engine.zip", "sha256": "…", "sig": "…" }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::Sha256Digest;
use crate::types::EngineVersion;

/// The full catalog, version → entry.
///
/// Keys and redirect targets are [`EngineVersion`]s, so a document naming a
/// version that is not a plain file name fails to parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildManifest {
    /// Versions in the catalog.
    pub versions: BTreeMap<EngineVersion, VersionEntry>,
}

/// One version in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Withdrawn builds are flagged insecure and must never be installed.
    #[serde(default)]
    pub insecure: bool,

    /// Alias target. A redirecting entry carries no builds of its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<EngineVersion>,

    /// Builds keyed by platform identifier.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformBuild>,
}

/// A downloadable build for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformBuild {
    /// Upstream download URL.
    pub url: String,
    /// SHA-256 of the archive.
    pub sha256: Sha256Digest,
    /// Hex-encoded signature handed to the launched process.
    pub sig: String,
}

impl BuildManifest {
    /// Parse a manifest document.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for malformed documents or invalid digests.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Look up a version entry.
    pub fn get(&self, version: &str) -> Option<&VersionEntry> {
        self.versions.get(version)
    }

    /// Number of versions in the catalog.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True when the catalog lists no versions.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Everything needed to fetch and hand off one artifact (version + platform).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Final (non-alias) version.
    pub version: EngineVersion,
    /// Platform the build was published for.
    pub platform: String,
    /// Upstream download URL.
    pub url: String,
    /// Expected SHA-256 of the archive.
    pub content_hash: Sha256Digest,
    /// Hex signature.
    pub signature: String,
    /// Mirrors the catalog flag. Resolution never yields an insecure descriptor.
    pub insecure: bool,
    /// Alias target of the entry, if any.
    pub redirect_to: Option<EngineVersion>,
}

impl ArtifactDescriptor {
    /// Build a descriptor from a catalog entry.
    pub fn from_build(
        version: &EngineVersion,
        platform: &str,
        entry: &VersionEntry,
        build: &PlatformBuild,
    ) -> Self {
        Self {
            version: version.clone(),
            platform: platform.to_string(),
            url: build.url.clone(),
            content_hash: build.sha256.clone(),
            signature: build.sig.clone(),
            insecure: entry.insecure,
            redirect_to: entry.redirect.clone(),
        }
    }

    /// Signature bytes, if the hex decodes.
    ///
    /// # Errors
    ///
    /// Returns the hex decode error for malformed signatures.
    pub fn signature_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "1.0.0": {
            "insecure": false,
            "platforms": {
                "linux-x64": {
                    "url": "https://cdn.example/engine-linux-x64.zip",
                    "sha256": "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855",
                    "sig": "c0ffee"
                }
            }
        },
        "latest": { "redirect": "1.0.0" },
        "0.9.0": { "insecure": true, "platforms": {} }
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = BuildManifest::from_json(SAMPLE).unwrap();
        assert_eq!(manifest.len(), 3);

        let entry = manifest.get("1.0.0").unwrap();
        assert!(!entry.insecure);
        assert!(entry.redirect.is_none());
        let build = &entry.platforms["linux-x64"];
        assert!(build.sha256.as_str().starts_with("e3b0c442"));

        let alias = manifest.get("latest").unwrap();
        assert_eq!(alias.redirect.as_ref().map(EngineVersion::as_str), Some("1.0.0"));
        assert!(alias.platforms.is_empty());

        assert!(manifest.get("0.9.0").unwrap().insecure);
    }

    #[test]
    fn test_bad_digest_rejects_document() {
        let json = r#"{"1": {"platforms": {"x": {"url": "u", "sha256": "bad", "sig": ""}}}}"#;
        assert!(BuildManifest::from_json(json).is_err());
    }

    #[test]
    fn test_traversal_version_rejects_document() {
        let key = r#"{"../../outside": {"platforms": {}}}"#;
        assert!(BuildManifest::from_json(key).is_err());

        let redirect = r#"{"stable": {"redirect": "../x"}}"#;
        assert!(BuildManifest::from_json(redirect).is_err());

        let absolute = r#"{"/tmp/engine": {"platforms": {}}}"#;
        assert!(BuildManifest::from_json(absolute).is_err());
    }

    #[test]
    fn test_descriptor_from_build() {
        let manifest = BuildManifest::from_json(SAMPLE).unwrap();
        let entry = manifest.get("1.0.0").unwrap();
        let build = &entry.platforms["linux-x64"];
        let version = EngineVersion::new("1.0.0").unwrap();
        let desc = ArtifactDescriptor::from_build(&version, "linux-x64", entry, build);

        assert_eq!(desc.version.as_str(), "1.0.0");
        assert_eq!(desc.platform, "linux-x64");
        assert_eq!(desc.signature_bytes().unwrap(), vec![0xc0, 0xff, 0xee]);
    }
}
