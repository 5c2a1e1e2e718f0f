//! Terminal output for huepipe: progress spinner and colored summaries.
//!
//! Uses `indicatif` for the spinner and `console` for styling. [`RunProgress`]
//! follows a pipeline run from start to report.

use std::path::Path;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::palette::Summary;
use crate::pipeline::{Progress, RunReport};

/// Spinner that tracks the counters of a running pipeline.
pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    yellow: Style,
    dim: Style,
}

impl RunProgress {
    /// Start the spinner. With `hidden`, nothing is drawn so debug logs on
    /// stderr stay readable.
    pub fn start(source: &Path, hidden: bool) -> Self {
        let pb = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} {elapsed:.dim}") {
            pb.set_style(style);
        }
        pb.set_message(format!("Reading {}", source.display()));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            yellow: Style::new().yellow().bold(),
            dim: Style::new().dim(),
        }
    }

    pub fn update(&self, progress: &Progress) {
        self.pb.set_message(format!(
            "{} admitted, {} in flight, {} saved, {} evicted, {} retries",
            progress.admitted, progress.in_flight, progress.saved, progress.evicted, progress.retries
        ));
    }

    /// Stop the spinner and print the outcome of the run.
    pub fn finish(&self, report: &RunReport) {
        self.pb.finish_and_clear();
        let seconds = report.duration_ms as f64 / 1000.0;
        if report.evictions.is_empty() {
            println!(
                "{} Saved {} of {} images in {seconds:.1}s",
                self.green.apply_to("✓"),
                report.saved,
                report.admitted
            );
            return;
        }

        println!(
            "{} Saved {} of {} images in {seconds:.1}s, {} evicted",
            self.yellow.apply_to("!"),
            report.saved,
            report.admitted,
            report.evictions.len()
        );
        for eviction in &report.evictions {
            println!(
                "  {} {} {}",
                self.yellow.apply_to(eviction.kind),
                eviction.subject,
                self.dim.apply_to(&eviction.message)
            );
        }
    }

    /// Print the full run report as pretty JSON.
    pub fn print_report(&self, report: &RunReport) {
        self.pb.finish_and_clear();
        println!(
            "{}",
            serde_json::to_string_pretty(report).unwrap_or_default()
        );
    }
}

/// Print the summary of a single image, one swatch per prevalent color.
pub fn print_summary(image: &Path, summary: &Summary) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to(image.display()));
    for (rank, color) in summary.colors().iter().enumerate() {
        let swatch = Style::new().on_color256(nearest_ansi(color.r, color.g, color.b));
        println!("  {}. {} {}", rank + 1, swatch.apply_to("  "), color);
    }
}

/// Closest entry of the 6x6x6 color cube of the 256-color palette.
fn nearest_ansi(r: u8, g: u8, b: u8) -> u8 {
    let level = |c: u8| ((u16::from(c) * 5 + 127) / 255) as u8;
    16 + 36 * level(r) + 6 * level(g) + level(b)
}
