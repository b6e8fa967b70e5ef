//! Operations behind the `depot` commands.

pub mod context;
pub mod engine;
pub mod error;
pub mod remove;
pub mod update;

pub use context::Context;
pub use error::UpdateError;
pub use update::{ContentManifestSource, GcReport, UpdateOutcome, UpdateRequest, Updater};
