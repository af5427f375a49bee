//! Progress reporting for long-running operations.
//!
//! Progress is injected into the operations that produce it rather than held
//! in a global, so callers can route it to a terminal, a GUI, or nowhere.

use std::{
    fmt,
    io::{self, Write},
    time::Duration,
};

const BAR_CELLS: usize = 50;

/// Sink for in-place progress messages.
pub trait ProgressReporter {
    /// Replaces the currently displayed progress message.
    fn report(&mut self, message: &str);
    /// Removes the currently displayed progress message.
    fn clear(&mut self);
    /// Clears the progress message and prints a permanent completion line.
    fn finish(&mut self, message: &str);
}

/// Discards every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn report(&mut self, _message: &str) {}
    fn clear(&mut self) {}
    fn finish(&mut self, _message: &str) {}
}

/// Writes progress to a terminal, overwriting the line with carriage returns.
#[derive(Debug)]
pub struct TerminalProgress<W: Write = io::Stderr> {
    out: W,
    shown: usize,
}

impl TerminalProgress {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write> TerminalProgress<W> {
    pub fn new(out: W) -> Self {
        Self { out, shown: 0 }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn erase(&mut self) -> io::Result<()> {
        if self.shown > 0 {
            write!(self.out, "\r{}\r", " ".repeat(self.shown))?;
            self.shown = 0;
        }
        Ok(())
    }
}

// Terminal write failures are not worth aborting an export over.
impl<W: Write> ProgressReporter for TerminalProgress<W> {
    fn report(&mut self, message: &str) {
        let _ = self.erase();
        let _ = write!(self.out, "{message}");
        let _ = self.out.flush();
        self.shown = message.chars().count();
    }

    fn clear(&mut self) {
        let _ = self.erase();
        let _ = self.out.flush();
    }

    fn finish(&mut self, message: &str) {
        let _ = self.erase();
        let _ = writeln!(self.out, "{message}");
        let _ = self.out.flush();
    }
}

/// One line of progress: label, time spent so far, estimated time remaining
/// and a percent bar.
#[derive(Debug, Clone, Copy)]
pub struct ProgressLine<'a> {
    pub label: &'a str,
    pub done: usize,
    pub total: usize,
    pub elapsed: Duration,
}

impl<'a> ProgressLine<'a> {
    pub fn new(label: &'a str, done: usize, total: usize, elapsed: Duration) -> Self {
        Self {
            label,
            done,
            total,
            elapsed,
        }
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f64 / self.total as f64).clamp(0.0, 1.0)
        }
    }

    /// Linear extrapolation from the average time per finished item.
    pub fn remaining(&self) -> Option<Duration> {
        if self.done == 0 {
            return None;
        }
        let left = self.total.saturating_sub(self.done) as f64;
        Some(self.elapsed.mul_f64(left / self.done as f64))
    }
}

impl fmt::Display for ProgressLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fraction = self.fraction();
        let filled = (fraction * BAR_CELLS as f64) as usize;
        let remaining = match self.remaining() {
            Some(left) => format!("{:.1}s", left.as_secs_f64()),
            None => "--".to_string(),
        };
        write!(
            f,
            "{}    Elapsed: {:.1}s    Remaining: {}    [{}{}] {}%",
            self.label,
            self.elapsed.as_secs_f64(),
            remaining,
            "#".repeat(filled),
            "-".repeat(BAR_CELLS - filled),
            (fraction * 100.0) as u32
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bar_and_estimate() {
        let line = ProgressLine::new("Exporting frame 5 of 10", 5, 10, Duration::from_secs(10));
        assert_eq!(
            line.to_string(),
            format!(
                "Exporting frame 5 of 10    Elapsed: 10.0s    Remaining: 10.0s    [{}{}] 50%",
                "#".repeat(25),
                "-".repeat(25)
            )
        );
    }

    #[test]
    fn unknown_estimate_before_first_item() {
        let line = ProgressLine::new("Rendering", 0, 10, Duration::from_millis(1300));
        assert!(line.remaining().is_none());
        let text = line.to_string();
        assert!(text.contains("Elapsed: 1.3s"), "{text}");
        assert!(text.contains("Remaining: --"));
    }

    #[test]
    fn empty_total_counts_as_complete() {
        let line = ProgressLine::new("Nothing", 0, 0, Duration::ZERO);
        assert_eq!(line.fraction(), 1.0);
    }

    #[test]
    fn terminal_progress_overwrites_in_place() {
        let mut progress = TerminalProgress::new(Vec::new());
        progress.report("abc");
        progress.report("de");
        progress.finish("done");

        let out = String::from_utf8(progress.into_inner()).unwrap();
        assert_eq!(out, "abc\r   \rde\r  \rdone\n");
    }
}
