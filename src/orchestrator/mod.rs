//! Job orchestration: sequencing engine invocations and deciding verdicts.
//!
//! Both orchestrators route engine output through [`EngineSink`], the single
//! consumer that classifies lines and updates progress and skip state.

mod backup;
mod restore;

pub use backup::BackupOrchestrator;
pub use restore::{RestoreOrchestrator, current_system_drive};

use std::time::{Duration, Instant};

use crate::classifier::{ClassifiedLine, SkipReason, classify};
use crate::progress::ProgressTracker;
use crate::runner::{LineEvent, LineSink, StreamKind};
use crate::sampler::IoSampler;
use crate::skip::{PlaceholderProbe, SkipDisposition, SkipRetry};
use crate::ui::Console;

/// Spinner cadence while the engine runs.
pub const TICK_EVERY: Duration = Duration::from_millis(120);

/// Receives skippable errors from the line consumer.
pub trait SkipIntake {
    fn report(&mut self, path: &str, reason: SkipReason) -> SkipDisposition;
    fn report_unattributed(&mut self);
}

impl<P: PlaceholderProbe> SkipIntake for SkipRetry<'_, P> {
    fn report(&mut self, path: &str, reason: SkipReason) -> SkipDisposition {
        self.on_skippable_error(path, reason)
    }

    fn report_unattributed(&mut self) {
        self.on_unattributed();
    }
}

/// Classifies engine output and applies it to per-job state.
pub struct EngineSink<'s> {
    tolerate_errors: bool,
    tracker: ProgressTracker,
    console: &'s Console,
    skips: Option<&'s mut (dyn SkipIntake + 's)>,
    sampler: Option<IoSampler>,
    fatal_lines: Vec<String>,
    warnings: usize,
}

impl<'s> EngineSink<'s> {
    pub fn new(console: &'s Console, tolerate_errors: bool) -> Self {
        Self {
            tolerate_errors,
            tracker: ProgressTracker::new(Instant::now()),
            console,
            skips: None,
            sampler: None,
            fatal_lines: Vec::new(),
            warnings: 0,
        }
    }

    pub fn with_skips(mut self, skips: &'s mut (dyn SkipIntake + 's)) -> Self {
        self.skips = Some(skips);
        self
    }

    pub fn with_sampler(mut self, sampler: IoSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn fatal_lines(&self) -> &[String] {
        &self.fatal_lines
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    fn handle_stderr(&mut self, classified: ClassifiedLine) {
        match classified {
            ClassifiedLine::Warning(text) => {
                self.warnings += 1;
                tracing::warn!(line = %text, "engine warning");
            }
            ClassifiedLine::SkippableError { text, reason, path } => {
                self.handle_skippable(text, reason, path);
            }
            ClassifiedLine::FatalError(text) => {
                tracing::error!(line = %text, "engine reported a fatal error");
                self.console.notice(&text);
                self.fatal_lines.push(text);
            }
            ClassifiedLine::Unrecognized(text) => {
                tracing::debug!(line = %text, "engine stderr");
            }
            ClassifiedLine::Progress(_) | ClassifiedLine::FileMarker(_) => {}
        }
    }

    fn handle_skippable(&mut self, text: String, reason: SkipReason, path: Option<String>) {
        let Some(skips) = self.skips.as_mut() else {
            // Tolerance without a skip tracker cannot happen; be strict.
            self.fatal_lines.push(text);
            return;
        };
        let Some(path) = path else {
            skips.report_unattributed();
            self.console.notice(&format!("Skipped an unnamed file ({reason}): {text}"));
            return;
        };
        match skips.report(&path, reason) {
            SkipDisposition::Queued => {
                self.console.notice(&format!("Skipping {path} ({reason}), will retry"));
            }
            SkipDisposition::CloudOnly => {
                self.console.notice(&format!("Skipping cloud-only file {path}"));
            }
            SkipDisposition::Duplicate => {}
        }
    }
}

impl LineSink for EngineSink<'_> {
    fn on_spawn(&mut self, pid: Option<u32>) {
        if let (Some(sampler), Some(pid)) = (self.sampler.as_mut(), pid) {
            sampler.attach(pid);
        }
    }

    fn on_line(&mut self, stream: StreamKind, event: LineEvent) {
        let line = match event {
            LineEvent::Line(line) => line,
            LineEvent::EndOfStream => {
                tracing::debug!(?stream, "engine stream closed");
                return;
            }
        };

        match classify(&line, self.tolerate_errors) {
            ClassifiedLine::Progress(progress) => {
                let now = Instant::now();
                if let Some(sampler) = self.sampler.as_mut() {
                    self.tracker.set_io_rates(sampler.sample(now));
                }
                let rendered = self.tracker.observe(&progress, now);
                self.console.status(&rendered);
            }
            ClassifiedLine::FileMarker(name) => self.tracker.set_label(&name),
            // Verdicts depend on stderr only; stdout is informational.
            other if stream == StreamKind::Stdout => {
                tracing::debug!(line = ?other, "engine stdout");
            }
            other => self.handle_stderr(other),
        }
    }
}
