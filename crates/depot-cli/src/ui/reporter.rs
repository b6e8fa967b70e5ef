//! Terminal reporter.
//!
//! Status transitions print one styled line each on stderr. Progress is throttled
//! to one line per 10% step so large downloads do not flood the terminal.

use std::collections::HashMap;
use std::io::Stderr;
use std::sync::{Mutex, PoisonError};

use crossterm::style::Stylize;
use depot_core::reporter::ProgressUnit;
use depot_core::{Progress, Reporter, UpdateStatus};

use super::buffer::OutputBuffer;
use super::theme::{Theme, format_size};

/// Writes status and progress lines to stderr.
pub struct ConsoleReporter {
    out: Mutex<OutputBuffer<Stderr>>,
    steps: Mutex<HashMap<String, u64>>,
    theme: Theme,
    quiet: bool,
}

impl std::fmt::Debug for ConsoleReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleReporter")
            .field("quiet", &self.quiet)
            .finish_non_exhaustive()
    }
}

impl ConsoleReporter {
    pub fn new(quiet: bool) -> Self {
        Self {
            out: Mutex::new(OutputBuffer::new(std::io::stderr())),
            steps: Mutex::new(HashMap::new()),
            theme: Theme::default(),
            quiet,
        }
    }

    fn line(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_plain(text);
        out.flush();
    }
}

/// Which 10% step `progress` falls in, when the total is known.
fn progress_step(progress: &Progress) -> Option<u64> {
    progress.fraction().map(|f| (f * 10.0).floor() as u64)
}

fn describe(progress: &Progress) -> String {
    match (progress.unit, progress.total) {
        (ProgressUnit::Bytes, Some(total)) => {
            format!("{} / {}", format_size(progress.current), format_size(total))
        }
        (ProgressUnit::Bytes, None) => format_size(progress.current),
        (ProgressUnit::Files, Some(total)) => format!("{} / {total} files", progress.current),
        (ProgressUnit::Files, None) => format!("{} files", progress.current),
    }
}

impl Reporter for ConsoleReporter {
    fn status(&self, subject: &str, status: UpdateStatus) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject);
        if self.quiet && !status.is_terminal() {
            return;
        }

        let (icon, color) = self.theme.status_style(status);
        let name = format!("{subject:<width$}", width = self.theme.layout.name_width);
        self.line(&format!(
            "  {} {} {}",
            icon.with(color),
            name.with(self.theme.colors.subject),
            status.label().with(color),
        ));
    }

    fn progress(&self, subject: &str, progress: Progress) {
        if self.quiet {
            return;
        }
        let Some(step) = progress_step(&progress) else {
            return;
        };
        {
            let mut steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner);
            if steps.get(subject).is_some_and(|last| *last >= step) {
                return;
            }
            steps.insert(subject.to_string(), step);
        }

        let name = format!("{subject:<width$}", width = self.theme.layout.name_width);
        self.line(&format!(
            "    {} {}",
            name.with(self.theme.colors.secondary),
            describe(&progress).with(self.theme.colors.secondary),
        ));
    }

    fn info(&self, msg: &str) {
        if !self.quiet {
            self.line(&format!("  {} {msg}", self.theme.icons.info.with(self.theme.colors.secondary)));
        }
    }

    fn warning(&self, msg: &str) {
        self.line(&format!("  {} {msg}", self.theme.icons.warning.with(self.theme.colors.warning)));
    }

    fn error(&self, msg: &str) {
        self.line(&format!("  {} {msg}", self.theme.icons.error.with(self.theme.colors.error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps() {
        assert_eq!(progress_step(&Progress::bytes(0, Some(100))), Some(0));
        assert_eq!(progress_step(&Progress::bytes(55, Some(100))), Some(5));
        assert_eq!(progress_step(&Progress::bytes(100, Some(100))), Some(10));
        assert_eq!(progress_step(&Progress::bytes(5, None)), None);
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&Progress::files(3, 10)), "3 / 10 files");
        assert_eq!(describe(&Progress::bytes(2048, Some(4096))), "2.0 KB / 4.0 KB");
    }
}
