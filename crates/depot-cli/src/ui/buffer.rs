//! Output Buffer - whole-line terminal rendering
//!
//! Lines are queued and written in one flush so concurrent status output does not
//! interleave mid-line.

use crossterm::QueueableCommand;
use crossterm::style::{Color, ResetColor, SetForegroundColor};
use std::io::{Stdout, Write};

/// A buffer that accumulates terminal commands before flushing
pub struct OutputBuffer<W: Write = Stdout> {
    out: W,
}

impl<W: Write> std::fmt::Debug for OutputBuffer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer").finish_non_exhaustive()
    }
}

impl<W: Write> OutputBuffer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Write text on a new line with color
    pub fn write_line(&mut self, text: &str, color: Color) {
        let _ = self.out.queue(SetForegroundColor(color));
        let _ = writeln!(self.out, "{text}");
        let _ = self.out.queue(ResetColor);
    }

    /// Write text without styling
    pub fn write_plain(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }

    /// Flush all queued commands to the terminal
    pub fn flush(&mut self) {
        let _ = self.out.flush();
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl Default for OutputBuffer<Stdout> {
    fn default() -> Self {
        Self::new(std::io::stdout())
    }
}
