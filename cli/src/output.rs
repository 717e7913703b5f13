//! Table and progress helpers for CLI output.

use std::collections::HashMap;

use comfy_table::{ContentArrangement, Table};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ocifs_runtime::{ProgressObserver, ProgressUpdate};
use parking_lot::Mutex;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Truncate a digest for display (`sha256:` prefix dropped, 12 hex chars).
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..hex.len().min(12)]
}

/// One progress bar per layer, drawn on stderr.
pub struct LayerProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl LayerProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{prefix:.dim} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
    }

    /// Remove every bar from the terminal.
    pub fn clear(&self) {
        for (_, bar) in self.bars.lock().drain() {
            bar.finish_and_clear();
        }
        let _ = self.multi.clear();
    }
}

impl Default for LayerProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for LayerProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        let mut bars = self.bars.lock();
        let bar = bars.entry(update.label.clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(update.total));
            bar.set_style(Self::style());
            bar.set_prefix(update.label.clone());
            bar
        });
        bar.set_position(update.transferred);
        if update.finished {
            bar.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(150 * 1024 * 1024), "150.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(short_digest("sha256:0123456789abcdef"), "0123456789ab");
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_layer_progress_tracks_labels() {
        let progress = LayerProgress::new();
        let update = |label: &str, transferred, finished| ProgressUpdate {
            label: label.to_string(),
            transferred,
            total: 100,
            bytes_per_sec: 0.0,
            finished,
        };
        progress.on_progress(&update("aaa", 10, false));
        progress.on_progress(&update("bbb", 50, false));
        progress.on_progress(&update("aaa", 100, true));

        {
            let bars = progress.bars.lock();
            assert_eq!(bars.len(), 2);
            assert_eq!(bars["aaa"].position(), 100);
            assert!(bars["aaa"].is_finished());
        }
        progress.clear();
        assert!(progress.bars.lock().is_empty());
    }
}
