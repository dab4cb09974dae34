//! Cumulative progress and instantaneous throughput for one imaging job.
//!
//! [`ProgressTracker`] is owned by the single consumer that handles
//! classified lines, so it needs no locking. It produces a [`RenderedLine`]
//! per progress event; drawing it is the console's business.

use std::time::{Duration, Instant};

use crate::classifier::Progress;

/// Throughput is only recomputed after at least this much time.
pub const MIN_SAMPLE_DWELL: Duration = Duration::from_millis(200);
/// With no advancement for this long, the rate baseline restarts.
pub const MAX_IDLE: Duration = Duration::from_secs(5);
/// Widest file label shown on the status line.
pub const LABEL_WIDTH: usize = 48;
/// Status lines are padded to this many columns so shorter updates erase
/// longer ones.
pub const LINE_WIDTH: usize = 120;

const ELLIPSIS: &str = "...";

/// Engine disk read/write rates in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IoRates {
    pub read_per_sec: f64,
    pub write_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct ProgressState {
    pub bytes_processed: u64,
    pub bytes_total: u64,
    pub started_at: Instant,
    pub last_sample_at: Instant,
    pub last_sample_bytes: u64,
    pub label: String,
}

/// One status line ready for in-place display.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLine {
    pub percent: f64,
    pub elapsed: Duration,
    /// Bytes per second, `None` until a sample is available.
    pub rate: Option<f64>,
    pub label: String,
    pub text: String,
}

impl RenderedLine {
    /// Carriage return plus the text padded (or cut) to `width` columns.
    pub fn overwrite(&self, width: usize) -> String {
        overwrite_line(&self.text, width)
    }
}

pub fn overwrite_line(text: &str, width: usize) -> String {
    let cut: String = text.chars().take(width).collect();
    format!("\r{cut:<width$}")
}

#[derive(Debug)]
pub struct ProgressTracker {
    state: ProgressState,
    rate: Option<f64>,
    io: Option<IoRates>,
}

impl ProgressTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            state: ProgressState {
                bytes_processed: 0,
                bytes_total: 0,
                started_at: now,
                last_sample_at: now,
                last_sample_bytes: 0,
                label: String::new(),
            },
            rate: None,
            io: None,
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn set_label(&mut self, name: &str) {
        self.state.label = truncate_label(name, LABEL_WIDTH);
    }

    pub fn set_io_rates(&mut self, rates: Option<IoRates>) {
        self.io = rates;
    }

    pub fn observe(&mut self, progress: &Progress, now: Instant) -> RenderedLine {
        let state = &mut self.state;
        // Never move backwards within a job.
        state.bytes_processed = state.bytes_processed.max(progress.processed_bytes());
        state.bytes_total = progress.total_bytes();

        let since_sample = now.saturating_duration_since(state.last_sample_at);
        if state.bytes_processed > state.last_sample_bytes {
            if since_sample >= MIN_SAMPLE_DWELL {
                let advanced = (state.bytes_processed - state.last_sample_bytes) as f64;
                self.rate = Some(advanced / since_sample.as_secs_f64());
                state.last_sample_at = now;
                state.last_sample_bytes = state.bytes_processed;
            }
        } else if since_sample > MAX_IDLE {
            state.last_sample_at = now;
            self.rate = None;
        }

        let elapsed = now.saturating_duration_since(state.started_at);
        let mut text = format!(
            "{:>5.1}% | {} | {}",
            progress.percent,
            format_elapsed(elapsed),
            self.rate.map(format_rate).unwrap_or_else(|| "--".to_string()),
        );
        if let Some(io) = self.io {
            text.push_str(&format!(
                " | R: {} W: {}",
                format_rate(io.read_per_sec),
                format_rate(io.write_per_sec)
            ));
        }
        if !state.label.is_empty() {
            text.push_str(" | ");
            text.push_str(&state.label);
        }

        RenderedLine {
            percent: progress.percent,
            elapsed,
            rate: self.rate,
            label: state.label.clone(),
            text,
        }
    }
}

/// Keeps the tail of long paths, which is the part that identifies a file.
pub fn truncate_label(name: &str, max: usize) -> String {
    let count = name.chars().count();
    if count <= max {
        return name.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let tail: String = name.chars().skip(count - keep).collect();
    format!("{ELLIPSIS}{tail}")
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: &[&str] = &["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifiedLine, classify};

    fn progress(line: &str) -> Progress {
        match classify(line, false) {
            ClassifiedLine::Progress(p) => p,
            other => panic!("not progress: {other:?}"),
        }
    }

    #[test]
    fn no_rate_before_minimum_dwell() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(t0);
        let line = tracker.observe(
            &progress("1 GiB / 10 GiB (10 % done)"),
            t0 + Duration::from_millis(50),
        );
        assert_eq!(line.rate, None);
        assert!(line.text.contains("--"));
    }

    #[test]
    fn rate_from_sliding_window() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(t0);
        tracker.observe(&progress("0 MiB / 100 MiB (0 % done)"), t0);
        let line = tracker.observe(
            &progress("50 MiB / 100 MiB (50 % done)"),
            t0 + Duration::from_secs(1),
        );
        let rate = line.rate.unwrap();
        assert!((rate - 50.0 * 1024.0 * 1024.0).abs() < 1.0);
        assert!(line.text.contains("50.0 MiB/s"));

        // Next sample measures only the new window.
        let line = tracker.observe(
            &progress("60 MiB / 100 MiB (60 % done)"),
            t0 + Duration::from_secs(2),
        );
        assert!((line.rate.unwrap() - 10.0 * 1024.0 * 1024.0).abs() < 1.0);
    }

    #[test]
    fn long_idle_resets_baseline() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(t0);
        tracker.observe(&progress("10 MiB / 100 MiB (10 % done)"), t0 + Duration::from_secs(1));
        let stalled = tracker.observe(
            &progress("10 MiB / 100 MiB (10 % done)"),
            t0 + Duration::from_secs(10),
        );
        assert_eq!(stalled.rate, None);
        assert_eq!(tracker.state().last_sample_at, t0 + Duration::from_secs(10));

        // The rate after the stall is measured from the reset point, not from
        // the last advancement nine seconds earlier.
        let resumed = tracker.observe(
            &progress("20 MiB / 100 MiB (20 % done)"),
            t0 + Duration::from_secs(11),
        );
        assert!((resumed.rate.unwrap() - 10.0 * 1024.0 * 1024.0).abs() < 1.0);
    }

    #[test]
    fn bytes_processed_never_decreases() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(t0);
        tracker.observe(&progress("5 GiB / 10 GiB (50 % done)"), t0);
        tracker.observe(&progress("4 GiB / 10 GiB (40 % done)"), t0 + Duration::from_secs(1));
        assert_eq!(tracker.state().bytes_processed, 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn label_keeps_tail_with_ellipsis() {
        let long = format!("C:\\{}\\report.docx", "deep\\".repeat(20));
        let label = truncate_label(&long, LABEL_WIDTH);
        assert_eq!(label.chars().count(), LABEL_WIDTH);
        assert!(label.starts_with("..."));
        assert!(label.ends_with("report.docx"));
        assert_eq!(truncate_label("C:\\short.txt", LABEL_WIDTH), "C:\\short.txt");
    }

    #[test]
    fn rendered_line_shows_label_and_io() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(t0);
        tracker.set_label("C:\\Windows\\notepad.exe");
        tracker.set_io_rates(Some(IoRates {
            read_per_sec: 2048.0,
            write_per_sec: 0.0,
        }));
        let line = tracker.observe(&progress("1 GiB / 4 GiB (25 % done)"), t0 + Duration::from_secs(61));
        assert!(line.text.starts_with(" 25.0% | 00:01:01"));
        assert!(line.text.contains("R: 2.0 KiB/s W: 0.0 B/s"));
        assert!(line.text.ends_with("C:\\Windows\\notepad.exe"));
    }

    #[test]
    fn overwrite_pads_to_width() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::new(t0);
        let line = tracker.observe(&progress("1 GiB / 4 GiB (25 % done)"), t0);
        let out = line.overwrite(80);
        assert!(out.starts_with('\r'));
        assert_eq!(out.chars().count(), 81);
    }

    #[test]
    fn formatting_helpers() {
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 25 * 60 + 7)), "03:25:07");
        assert_eq!(format_rate(512.0), "512.0 B/s");
        assert_eq!(format_rate(3.5 * 1024.0 * 1024.0 * 1024.0), "3.5 GiB/s");
    }
}
