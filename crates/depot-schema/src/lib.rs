//! Shared types and wire formats for depot.
//!
//! Everything here is plain data: digests, identifiers, the engine manifest model,
//! the content manifest format and the platform compatibility graph. No I/O beyond
//! parsing.

pub mod content;
pub mod hash;
pub mod manifest;
pub mod platform;
pub mod types;

// Re-exports
pub use content::{CONTENT_MANIFEST_HEADER, ContentEntry, ContentManifest, ContentManifestError};
pub use hash::*;
pub use manifest::{ArtifactDescriptor, BuildManifest, PlatformBuild, VersionEntry};
pub use platform::{NoCompatiblePlatform, PlatformGraph, PlatformMatch};
pub use types::*;

/// Magic bytes for ZSTD compression (Little Endian: 0xFD2FB528 -> 28 B5 2F FD)
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
