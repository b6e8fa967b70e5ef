//! Persistent state owned by the CLI: the installed-state file and the content
//! writer actor.

pub mod actor;
pub mod state;

pub use actor::{IngestOutcome, IngestRequest, ManifestIngestRequest, WriterError, WriterHandle};
pub use state::{
    InstalledEngineVersion, InstalledState, InstalledVersion, Preferences, StateError, StateStore,
};
