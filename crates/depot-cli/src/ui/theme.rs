//! UI Theme - Design system constants
//!
//! Colors, icons and column widths shared by every `depot` listing and status line.

use crossterm::style::Color;
use depot_core::UpdateStatus;

/// Default theme for depot output
#[derive(Debug, Clone, Default)]
pub struct Theme {
    pub colors: ColorScheme,
    pub icons: Icons,
    pub layout: Layout,
}

/// Color scheme for UI elements
#[derive(Debug, Clone)]
pub struct ColorScheme {
    /// Fork ids and engine versions (primary content)
    pub subject: Color,
    /// Version numbers
    pub version: Color,
    /// Sizes and secondary info
    pub secondary: Color,
    /// Headers and labels
    pub header: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
    /// Active/in-progress items
    pub active: Color,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self {
            subject: Color::Cyan,
            version: Color::White,
            secondary: Color::DarkGrey,
            header: Color::DarkGrey,
            success: Color::Green,
            warning: Color::Yellow,
            error: Color::Red,
            active: Color::Blue,
        }
    }
}

/// Status icons for different states
#[derive(Debug, Clone)]
pub struct Icons {
    pub pending: &'static str,
    pub active: &'static str,
    pub success: &'static str,
    pub error: &'static str,
    pub warning: &'static str,
    pub info: &'static str,
}

impl Default for Icons {
    fn default() -> Self {
        Self {
            pending: "○",
            active: "●",
            success: "✓",
            error: "✗",
            warning: "⚠",
            info: "ℹ",
        }
    }
}

/// Column widths for listings
#[derive(Debug, Clone)]
pub struct Layout {
    pub name_width: usize,
    pub version_width: usize,
    pub size_width: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            name_width: 18,
            version_width: 14,
            size_width: 10,
        }
    }
}

impl Theme {
    /// Icon and color for a status line.
    pub fn status_style(&self, status: UpdateStatus) -> (&'static str, Color) {
        match status {
            UpdateStatus::UpToDate | UpdateStatus::Committed => {
                (self.icons.success, self.colors.success)
            }
            UpdateStatus::Failed => (self.icons.error, self.colors.error),
            UpdateStatus::CheckingVersion | UpdateStatus::NeedsDownload => {
                (self.icons.pending, self.colors.secondary)
            }
            _ => (self.icons.active, self.colors.active),
        }
    }
}

/// Format bytes for human-readable display
pub fn format_size(bytes: u64) -> String {
    let kb = bytes as f64 / 1024.0;
    let mb = kb / 1024.0;
    if mb >= 1024.0 {
        format!("{:.1} GB", mb / 1024.0)
    } else if kb >= 1024.0 {
        format!("{mb:.1} MB")
    } else if kb >= 1.0 {
        format!("{kb:.1} KB")
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1024 * 1024 * 5), "5.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }

    #[test]
    fn test_terminal_statuses_styled() {
        let theme = Theme::default();
        assert_eq!(theme.status_style(UpdateStatus::Committed).0, "✓");
        assert_eq!(theme.status_style(UpdateStatus::Failed).0, "✗");
        assert_eq!(theme.status_style(UpdateStatus::Downloading).0, "●");
    }
}
