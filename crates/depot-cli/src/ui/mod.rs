//! Terminal output: theme, buffered lines, listings and the console reporter.

pub mod buffer;
pub mod list;
pub mod reporter;
pub mod theme;

pub use reporter::ConsoleReporter;
