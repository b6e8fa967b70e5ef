use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// A validated SHA256 digest (64 hex characters)
///
/// Digests are normalized to lowercase when constructed, so two digests that differ
/// only in hex case compare equal. Manifests and servers are free to publish either
/// case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the hex portion is not exactly 64 ASCII hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);

        if hex.len() != 64 {
            anyhow::bail!(
                "Invalid SHA256 digest: expected 64 hex characters, got {} in '{s}'",
                hex.len(),
            );
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Invalid SHA256 digest: contains non-hex characters in '{s}'");
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Build a digest from raw hash output.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Hash a byte slice in one shot.
    pub fn compute(data: &[u8]) -> Self {
        let out: [u8; 32] = Sha256::digest(data).into();
        Self::from_bytes(&out)
    }

    /// Case-insensitive comparison against an arbitrary hex string.
    pub fn matches(&self, other: &str) -> bool {
        let other = other.strip_prefix("sha256:").unwrap_or(other);
        self.0.eq_ignore_ascii_case(other)
    }

    /// Decode into the raw 32 bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Validated on construction.
        let _ = hex::decode_to_slice(&self.0, &mut out);
        out
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for Sha256Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn digest_normalizes_case_and_prefix() {
        let upper = Sha256Digest::new(format!("sha256:{}", EMPTY.to_uppercase())).unwrap();
        assert_eq!(upper.as_str(), EMPTY);
        assert_eq!(upper, Sha256Digest::new(EMPTY).unwrap());
    }

    #[test]
    fn digest_rejects_bad_input() {
        assert!(Sha256Digest::new("abc").is_err());
        assert!(Sha256Digest::new("z".repeat(64)).is_err());
    }

    #[test]
    fn compute_matches_known_vector() {
        let digest = Sha256Digest::compute(b"");
        assert_eq!(digest.as_str(), EMPTY);
        assert!(digest.matches(&EMPTY.to_uppercase()));
        assert!(!digest.matches(&"0".repeat(64)));
    }

    #[test]
    fn bytes_round_trip() {
        let digest = Sha256Digest::new(EMPTY).unwrap();
        assert_eq!(Sha256Digest::from_bytes(&digest.to_bytes()), digest);
    }

    #[test]
    fn deserialize_validates() {
        let ok: Sha256Digest = serde_json::from_str(&format!("\"{EMPTY}\"")).unwrap();
        assert_eq!(ok.as_str(), EMPTY);
        assert!(serde_json::from_str::<Sha256Digest>("\"nope\"").is_err());
    }
}
