//! Content delivery and storage engine for `depot`.

pub mod config;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod net;
pub mod paths;
pub mod pool;
pub mod store;

pub mod reporter;

pub use config::Config;
pub use error::ErrorKind;
pub use paths::*;
pub use reporter::{NullReporter, Progress, Reporter, UpdateStatus};

/// User Agent string for core operations
pub const USER_AGENT: &str = concat!("depot/", env!("CARGO_PKG_VERSION"));
