//! Progress reporting for TTY and non-TTY environments.
//!
//! TTY: one spinner line per run, cleared when the run ends.
//! Non-TTY: hidden bars; runs report through the log instead.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const LABEL_WIDTH: usize = 32;

fn run_style() -> Option<ProgressStyle> {
    ProgressStyle::with_template("{spinner:.green} {prefix:<32.dim} {pos:>9} published {wide_msg:.dim}")
        .ok()
}

/// Shared progress display for every run in the process.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Create new context, detecting TTY automatically.
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            is_tty: std::io::stderr().is_terminal(),
        }
    }

    /// Spinner for one run. Its position is the published record count.
    pub fn run_line(&self, label: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new_spinner());
        if let Some(style) = run_style() {
            pb.set_style(style);
        }
        pb.set_prefix(truncate_label(label));
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    /// Print a line above the spinners.
    pub fn println(&self, msg: impl AsRef<str>) {
        if self.is_tty {
            let _ = self.multi.println(msg);
        } else {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// `MultiProgress` for the log bridge
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedProgress = Arc<ProgressContext>;

/// Keep the tail of long object paths, which is the distinguishing part.
fn truncate_label(label: &str) -> String {
    let count = label.chars().count();
    if count <= LABEL_WIDTH {
        return label.to_string();
    }
    let tail: String = label.chars().skip(count - (LABEL_WIDTH - 1)).collect();
    format!("…{tail}")
}

/// Format number with thousand separators.
pub fn fmt_num(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_num_small() {
        assert_eq!(fmt_num(0), "0");
        assert_eq!(fmt_num(12), "12");
        assert_eq!(fmt_num(123), "123");
    }

    #[test]
    fn fmt_num_thousands() {
        assert_eq!(fmt_num(1_000), "1,000");
        assert_eq!(fmt_num(12_345), "12,345");
        assert_eq!(fmt_num(123_456), "123,456");
        assert_eq!(fmt_num(1_234_567_890), "1,234,567,890");
    }

    #[test]
    fn short_label_unchanged() {
        assert_eq!(truncate_label("bucket/a.zip"), "bucket/a.zip");
    }

    #[test]
    fn long_label_keeps_tail() {
        let label = format!("bucket/{}/file.json.zip", "x".repeat(40));
        let out = truncate_label(&label);
        assert_eq!(out.chars().count(), LABEL_WIDTH);
        assert!(out.ends_with("file.json.zip"));
        assert!(out.starts_with('…'));
    }
}
