//! Progress bar for a single transfer

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Progress of one file, in characters,, driven by the download state machine
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Spinner shown while waiting for metadata
    pub fn new(hash: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(format!("Requesting {}", style(hash).cyan()));
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { bar }
    }

    /// Switch to a character bar once the size is known
    pub fn start(&self, size: u64) {
        self.bar.set_length(size);
        self.bar.set_position(0);
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chars ({per_sec}, {eta}) {msg}")
        {
            self.bar.set_style(bar_style.progress_chars("█▓▒░  "));
        }
        self.bar.set_message("mining");
    }

    pub fn set_position(&self, received: u64) {
        self.bar.set_position(received);
    }

    pub fn finish(&self) {
        self.bar.finish_with_message(format!(
            "{} Download complete",
            style("✓").green().bold()
        ));
    }

    pub fn fail(&self, error: &str) {
        self.bar.abandon_with_message(format!(
            "{} Failed: {}",
            style("✗").red().bold(),
            error
        ));
    }
}
