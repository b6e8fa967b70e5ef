use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// Identifier of a content fork (one installation slot per fork).
///
/// Fork ids end up in log lines and database rows, never in file paths; on-disk
/// naming always goes through the numeric disk id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkId(String);

/// Errors produced when validating schema newtypes.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TypeError {
    /// A required identifier was empty or whitespace.
    #[error("Empty field: {0}")]
    EmptyField(&'static str),

    /// The value is outside the accepted set.
    #[error("Invalid {field}: {value}")]
    Invalid {
        /// Field being parsed.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

impl ForkId {
    /// Create a validated fork id.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::EmptyField`] for empty or blank input.
    pub fn new(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(TypeError::EmptyField("fork id"));
        }
        Ok(Self(s))
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ForkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ForkId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ForkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ForkId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Engine release name as it appears in the build manifest.
///
/// Versions name files under the engines directory, so anything that could
/// escape it (separators, drive prefixes, dot segments) is rejected at parse
/// time rather than at the join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EngineVersion(String);

impl EngineVersion {
    /// Create a validated engine version.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::EmptyField`] for blank input and
    /// [`TypeError::Invalid`] for anything that is not a single path component.
    pub fn new(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(TypeError::EmptyField("engine version"));
        }
        let bad_char = s
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control());
        if bad_char || s == "." || s == ".." || s.trim() != s {
            return Err(TypeError::Invalid {
                field: "engine version",
                value: s,
            });
        }
        Ok(Self(s))
    }

    /// Borrow the raw version.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EngineVersion {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EngineVersion> for String {
    fn from(v: EngineVersion) -> Self {
        v.0
    }
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EngineVersion {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for EngineVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EngineVersion {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// How a blob is stored in the content database.
///
/// The discriminants are persisted and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionScheme {
    /// Stored verbatim.
    None,
    /// Raw deflate stream (no zlib or gzip framing).
    Deflate,
    /// Zstandard frame.
    #[default]
    ZStd,
}

impl CompressionScheme {
    /// Stable integer tag used in the database.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Deflate => 1,
            Self::ZStd => 2,
        }
    }

    /// Decode a database tag.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::Invalid`] for unknown tags.
    pub fn from_i64(tag: i64) -> Result<Self, TypeError> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Deflate),
            2 => Ok(Self::ZStd),
            other => Err(TypeError::Invalid {
                field: "compression",
                value: other.to_string(),
            }),
        }
    }

    /// Lowercase name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Deflate => "deflate",
            Self::ZStd => "zstd",
        }
    }
}

impl std::fmt::Display for CompressionScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompressionScheme {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "store" => Ok(Self::None),
            "deflate" => Ok(Self::Deflate),
            "zstd" => Ok(Self::ZStd),
            _ => Err(TypeError::Invalid {
                field: "compression",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_id_rejects_blank() {
        assert_eq!(ForkId::new("  "), Err(TypeError::EmptyField("fork id")));
        assert_eq!(ForkId::new("wizden").unwrap().as_str(), "wizden");
    }

    #[test]
    fn test_engine_version_is_a_single_component() {
        for ok in ["0.1", "2024.10.1-rc1", "v1..2", "stable"] {
            assert_eq!(EngineVersion::new(ok).unwrap().as_str(), ok);
        }
        assert_eq!(
            EngineVersion::new(""),
            Err(TypeError::EmptyField("engine version"))
        );
        for bad in ["..", ".", "../x", "a/b", "a\\b", "/etc", "C:evil", " 1.0", "1\0"] {
            assert!(
                matches!(EngineVersion::new(bad), Err(TypeError::Invalid { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_engine_version_deserialize_validates() {
        let v: EngineVersion = serde_json::from_str("\"1.2.3\"").unwrap();
        assert_eq!(v.to_string(), "1.2.3");
        assert!(serde_json::from_str::<EngineVersion>("\"../../evil\"").is_err());
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"1.2.3\"");
    }

    #[test]
    fn test_compression_tags_are_stable() {
        for scheme in [
            CompressionScheme::None,
            CompressionScheme::Deflate,
            CompressionScheme::ZStd,
        ] {
            assert_eq!(CompressionScheme::from_i64(scheme.as_i64()), Ok(scheme));
        }
        assert_eq!(CompressionScheme::ZStd.as_i64(), 2);
        assert!(CompressionScheme::from_i64(7).is_err());
    }

    #[test]
    fn test_compression_parse() {
        assert_eq!("ZSTD".parse::<CompressionScheme>(), Ok(CompressionScheme::ZStd));
        assert!("lzma".parse::<CompressionScheme>().is_err());
    }
}
