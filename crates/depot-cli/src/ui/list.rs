//! List output formatting
//!
//! Column-aligned rendering for `depot list` and `depot ls`.

use std::io::Write;

use super::buffer::OutputBuffer;
use super::theme::{Theme, format_size};
use crossterm::style::Stylize;

/// Print column headers for the installations table
pub fn print_list_header<W: Write>(buffer: &mut OutputBuffer<W>) {
    let theme = Theme::default();

    buffer.write_line("", theme.colors.header);
    let header = format!(
        "  {:<nw$} {:<vw$} {:<vw$} {:>6}   {}",
        "fork",
        "version",
        "engine",
        "disk",
        "content",
        nw = theme.layout.name_width,
        vw = theme.layout.version_width,
    );
    buffer.write_line(&header.dark_grey().to_string(), theme.colors.header);
}

/// Print a single installation row
pub fn print_list_row<W: Write>(
    buffer: &mut OutputBuffer<W>,
    fork: &str,
    version: &str,
    engine: &str,
    disk_id: u32,
    content_version: Option<i64>,
) {
    let theme = Theme::default();

    let name_part = format!("{fork:<width$}", width = theme.layout.name_width);
    let version_part = format!("{version:<width$}", width = theme.layout.version_width);
    let engine_part = format!("{engine:<width$}", width = theme.layout.version_width);
    let disk_part = format!("{disk_id:>6}");
    let content = content_version.map_or_else(|| "-".to_string(), |id| format!("#{id}"));

    let line = format!(
        "  {} {} {} {}   {}",
        name_part.with(theme.colors.subject),
        version_part.with(theme.colors.version),
        engine_part.with(theme.colors.version),
        disk_part.with(theme.colors.secondary),
        content.with(theme.colors.secondary),
    );
    buffer.write_line(&line, theme.colors.secondary);
}

/// Print footer for the installations table
pub fn print_list_footer<W: Write>(buffer: &mut OutputBuffer<W>, forks: usize, engines: usize) {
    let theme = Theme::default();

    buffer.write_line("", theme.colors.header);
    let msg = format!("  {forks} installed, {engines} engines");
    buffer.write_line(&msg.dark_grey().to_string(), theme.colors.secondary);
}

/// Print one engine row
pub fn print_engine_row<W: Write>(
    buffer: &mut OutputBuffer<W>,
    version: &str,
    size: Option<u64>,
    in_use: bool,
) {
    let theme = Theme::default();

    let version_part = format!("{version:<width$}", width = theme.layout.name_width);
    let size_part = format!(
        "{:>width$}",
        size.map_or_else(|| "missing".to_string(), format_size),
        width = theme.layout.size_width
    );
    let marker = if in_use { "in use" } else { "unreferenced" };

    let line = format!(
        "  {} {} {}",
        version_part.with(theme.colors.subject),
        size_part.with(theme.colors.secondary),
        marker.with(theme.colors.secondary),
    );
    buffer.write_line(&line, theme.colors.secondary);
}

/// Print one stored file for `depot ls`
pub fn print_path_row<W: Write>(buffer: &mut OutputBuffer<W>, path: &str, size: u64) {
    let theme = Theme::default();
    let size_part = format!("{:>width$}", format_size(size), width = theme.layout.size_width);
    let line = format!("  {}  {path}", size_part.with(theme.colors.secondary));
    buffer.write_plain(&line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_contains_fields() {
        let mut buffer = OutputBuffer::new(Vec::new());
        print_list_row(&mut buffer, "ra", "20250101", "0.9.2", 3, Some(12));
        print_engine_row(&mut buffer, "0.9.2", None, false);
        let out = String::from_utf8(buffer.into_inner()).unwrap();

        assert!(out.contains("ra"));
        assert!(out.contains("20250101"));
        assert!(out.contains("#12"));
        assert!(out.contains("missing"));
        assert!(out.contains("unreferenced"));
    }
}
