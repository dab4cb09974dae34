//! Terminal output: the in-place status line, notices and final summaries.
//!
//! Uses `console` for styling and raw terminal writes, and `indicatif` for
//! the per-file retry bar. Every write goes through the one mutex inside
//! [`Console`], so the ticker task and the line consumer never interleave.

use std::sync::Arc;
use std::time::Duration;

use console::{Style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::progress::{LINE_WIDTH, RenderedLine, overwrite_line};
use crate::state_machine::{BootPhase, JobReport};

const SPINNER_FRAMES: &[char] = &['|', '/', '-', '\\'];
/// Shown next to the spinner until the first progress line arrives.
const IDLE_LABEL: &str = "working...";

struct Screen {
    term: Term,
    enabled: bool,
    /// Set while a job runs; notices outside a job leave no status line.
    active: bool,
    /// Something is on the status line and must be wiped before a notice.
    drawn: bool,
    status: Option<String>,
    frame: usize,
}

impl Screen {
    fn status_line(&self) -> Option<String> {
        if !self.active {
            return None;
        }
        let spinner = SPINNER_FRAMES[self.frame % SPINNER_FRAMES.len()];
        let label = self.status.as_deref().unwrap_or(IDLE_LABEL);
        Some(overwrite_line(&format!("{spinner} {label}"), LINE_WIDTH))
    }

    fn draw_status(&mut self) {
        if !self.enabled {
            return;
        }
        if let Some(line) = self.status_line() {
            let _ = self.term.write_str(&line);
            self.drawn = true;
        }
    }

    fn clear_status(&mut self) {
        if self.enabled && self.drawn {
            let _ = self.term.write_str(&format!("\r{:width$}\r", "", width = LINE_WIDTH));
            self.drawn = false;
        }
    }
}

/// Shared output sink for one job.
pub struct Console {
    screen: Mutex<Screen>,
    green: Style,
    red: Style,
    yellow: Style,
}

impl Console {
    /// Console on stderr, drawing only when it is an interactive terminal.
    pub fn stderr() -> Self {
        let term = Term::stderr();
        let enabled = term.is_term();
        Self::with_term(term, enabled)
    }

    /// Swallows everything; used by tests and `--json` runs.
    pub fn silent() -> Self {
        Self::with_term(Term::stderr(), false)
    }

    fn with_term(term: Term, enabled: bool) -> Self {
        Self {
            screen: Mutex::new(Screen {
                term,
                enabled,
                active: false,
                drawn: false,
                status: None,
                frame: 0,
            }),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Replaces the status line in place.
    pub fn status(&self, line: &RenderedLine) {
        let mut screen = self.screen.lock();
        screen.active = true;
        screen.status = Some(line.text.clone());
        screen.draw_status();
    }

    /// Advances the spinner on the status line, drawing a placeholder label
    /// until progress is known.
    pub fn tick(&self) {
        let mut screen = self.screen.lock();
        screen.active = true;
        screen.frame = screen.frame.wrapping_add(1);
        screen.draw_status();
    }

    /// Prints a line above the status line without tearing it.
    pub fn notice(&self, message: &str) {
        let mut screen = self.screen.lock();
        screen.clear_status();
        if screen.enabled {
            let _ = screen
                .term
                .write_line(&format!("  {} {message}", self.yellow.apply_to("!")));
        }
        screen.draw_status();
    }

    pub fn retry(&self, attempt: u32, max: u32, path: &str) {
        self.notice(&format!("Retry {attempt}/{max}: {path}"));
    }

    /// Drops the status line for good.
    pub fn finish(&self) {
        let mut screen = self.screen.lock();
        screen.clear_status();
        screen.status = None;
        screen.active = false;
    }

    /// Bar for the per-file retry pass; hidden when the console is silent.
    pub fn retry_bar(&self, len: u64) -> ProgressBar {
        if !self.screen.lock().enabled {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.cyan} Retrying skipped files [{bar:30}] {pos}/{len} {msg}")
                .expect("invalid template")
                .progress_chars("=> "),
        );
        pb
    }

    /// Final verdict, including the manual recovery command when the boot
    /// phase of a restore failed.
    pub fn summary(&self, report: &JobReport) {
        self.finish();
        let screen = self.screen.lock();
        if !screen.enabled {
            return;
        }
        let term = &screen.term;
        let result = &report.result;

        if result.success {
            let _ = term.write_line(&format!(
                "  {} {} completed successfully",
                self.green.apply_to("✓"),
                report.kind
            ));
        } else {
            let reason = result
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown failure".to_string());
            let _ = term.write_line(&format!(
                "  {} {} failed: {reason}",
                self.red.apply_to("✗"),
                report.kind
            ));
        }

        if !result.files_skipped_permanently.is_empty() {
            let _ = term.write_line(&format!(
                "  {} {} file(s) could not be captured:",
                self.yellow.apply_to("!"),
                result.files_skipped_permanently.len()
            ));
            for path in &result.files_skipped_permanently {
                let _ = term.write_line(&format!("      {path}"));
            }
        }

        if let Some(BootPhase::Failed(failure)) = &report.boot {
            let _ = term.write_line(&format!(
                "  {} Files were restored, but the volume is NOT guaranteed to boot: {}",
                self.red.apply_to("!!"),
                failure.detail
            ));
            let _ = term.write_line(&format!(
                "     Run manually: {}",
                self.yellow.apply_to(&failure.remediation)
            ));
        }
    }
}

/// Periodic "still working" indicator.
pub struct Ticker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub fn spawn(console: Arc<Console>, every: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = interval.tick() => console.tick(),
                }
            }
        });
        Self { stop, handle }
    }

    /// Signals the ticker and waits for it to finish. Never fails.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            tracing::debug!(error = %e, "ticker task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::classifier::{ClassifiedLine, classify};
    use crate::progress::ProgressTracker;

    #[tokio::test]
    async fn ticker_stops_and_is_awaited() {
        let console = Arc::new(Console::silent());
        let ticker = Ticker::spawn(Arc::clone(&console), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        ticker.stop().await;
        assert!(console.screen.lock().frame > 0);
        // Only this test holds the console once the task is gone.
        assert_eq!(Arc::strong_count(&console), 1);
    }

    #[test]
    fn silent_console_tracks_status_without_drawing() {
        let console = Console::silent();
        let mut tracker = ProgressTracker::new(Instant::now());
        let ClassifiedLine::Progress(p) = classify("1 GiB / 2 GiB (50 % done)", false) else {
            panic!("expected progress");
        };
        console.status(&tracker.observe(&p, Instant::now()));
        assert!(console.screen.lock().status.is_some());
        console.notice("hello");
        console.finish();
        assert!(console.screen.lock().status.is_none());
    }

    #[test]
    fn tick_before_progress_shows_spinner_with_placeholder() {
        let console = Console::silent();
        assert_eq!(console.screen.lock().status_line(), None);

        console.tick();
        let line = console.screen.lock().status_line().unwrap();
        assert!(line.starts_with("\r/ working..."), "{line:?}");

        console.tick();
        assert!(console.screen.lock().status_line().unwrap().starts_with("\r- working..."));

        console.finish();
        assert_eq!(console.screen.lock().status_line(), None);
    }

    #[test]
    fn status_replaces_placeholder() {
        let console = Console::silent();
        console.tick();
        let mut tracker = ProgressTracker::new(Instant::now());
        let ClassifiedLine::Progress(p) = classify("1 GiB / 2 GiB (50 % done)", false) else {
            panic!("expected progress");
        };
        console.status(&tracker.observe(&p, Instant::now()));
        let line = console.screen.lock().status_line().unwrap();
        assert!(line.contains("50.0%"));
        assert!(!line.contains("working"));
    }

    #[test]
    fn silent_retry_bar_is_hidden() {
        let console = Console::silent();
        assert!(console.retry_bar(3).is_hidden());
    }
}
