//! Per-file skip tracking and individual retries.
//!
//! Files that failed with a recoverable I/O condition during a tolerant
//! capture are collected here, deduplicated by path, and retried one by one
//! through the engine's single-file update command once the capture has
//! finished. Cloud placeholders are never retried. Files that stay broken
//! are appended to the skip log.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;

use crate::classifier::{SkipReason, classify};
use crate::runner::{CollectingSink, CommandSpec, ProcessLauncher};
use crate::state_machine::RetryConfig;
use crate::ui::Console;

/// Decides whether a path is a cloud-only placeholder.
pub trait PlaceholderProbe {
    fn is_cloud_only(&self, path: &Path) -> bool;
}

/// Filesystem-backed probe: a path that is not a materialized regular file,
/// or that carries a recall-on-access attribute, is cloud-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsPlaceholderProbe;

impl PlaceholderProbe for FsPlaceholderProbe {
    fn is_cloud_only(&self, path: &Path) -> bool {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => !meta.is_file() || has_recall_attribute(&meta),
            Err(_) => true,
        }
    }
}

#[cfg(windows)]
fn has_recall_attribute(meta: &std::fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    use windows_sys::Win32::Storage::FileSystem::{
        FILE_ATTRIBUTE_OFFLINE, FILE_ATTRIBUTE_RECALL_ON_DATA_ACCESS, FILE_ATTRIBUTE_RECALL_ON_OPEN,
    };

    let recall =
        FILE_ATTRIBUTE_RECALL_ON_OPEN | FILE_ATTRIBUTE_RECALL_ON_DATA_ACCESS | FILE_ATTRIBUTE_OFFLINE;
    meta.file_attributes() & recall != 0
}

#[cfg(not(windows))]
fn has_recall_attribute(_meta: &std::fs::Metadata) -> bool {
    false
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRecord {
    pub path: String,
    pub first_failure_reason: SkipReason,
    pub attempts_made: u32,
}

/// Durable, append-only record of files left out of an image.
#[derive(Debug)]
pub struct SkipLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl SkipLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<rfc3339>\t<reason>\t<attempts>\t<path>`
    pub fn append(&self, record: &SkipRecord) -> io::Result<()> {
        let _guard = self.writer.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{}\t{}\t{}\t{}",
            Utc::now().to_rfc3339(),
            record.first_failure_reason,
            record.attempts_made,
            record.path
        )
    }
}

/// What happened to a newly reported skippable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDisposition {
    /// Queued for individual retry.
    Queued,
    /// Already known; the report was folded into the existing entry.
    Duplicate,
    /// Cloud placeholder, logged without any retry.
    CloudOnly,
}

/// Where retries are sent: the freshly written image.
#[derive(Debug, Clone)]
pub struct RetryTarget {
    pub engine: PathBuf,
    pub image: PathBuf,
    pub index: u32,
}

impl RetryTarget {
    fn update_command(&self, path: &str) -> CommandSpec {
        CommandSpec::new(&self.engine)
            .arg("update")
            .arg(self.image.display().to_string())
            .arg(self.index.to_string())
            .arg(path)
    }
}

pub struct SkipRetry<'a, P> {
    probe: P,
    retry: RetryConfig,
    log: &'a SkipLog,
    seen: HashSet<String>,
    pending: Vec<SkipRecord>,
    permanent: Vec<String>,
    unattributed: u32,
}

impl<'a, P: PlaceholderProbe> SkipRetry<'a, P> {
    pub fn new(probe: P, retry: RetryConfig, log: &'a SkipLog) -> Self {
        Self {
            probe,
            retry,
            log,
            seen: HashSet::new(),
            pending: Vec::new(),
            permanent: Vec::new(),
            unattributed: 0,
        }
    }

    pub fn on_skippable_error(&mut self, path: &str, reason: SkipReason) -> SkipDisposition {
        // Windows paths compare case-insensitively.
        if !self.seen.insert(path.to_lowercase()) {
            return SkipDisposition::Duplicate;
        }

        let record = SkipRecord {
            path: path.to_string(),
            first_failure_reason: reason,
            attempts_made: 0,
        };

        if self.probe.is_cloud_only(Path::new(path)) {
            tracing::info!(%path, "cloud placeholder skipped without retry");
            self.record_permanent(record);
            return SkipDisposition::CloudOnly;
        }

        tracing::debug!(%path, %reason, "queued for retry");
        self.pending.push(record);
        SkipDisposition::Queued
    }

    /// A log write failure does not fail the job; the path still reaches
    /// the result.
    fn record_permanent(&mut self, record: SkipRecord) {
        if let Err(e) = self.log.append(&record) {
            tracing::warn!(path = %record.path, log = %self.log.path().display(), error = %e, "could not append to skip log");
        }
        self.permanent.push(record.path);
    }

    /// A skippable error that named no file; it cannot be retried.
    pub fn on_unattributed(&mut self) {
        self.unattributed += 1;
    }

    pub fn unattributed(&self) -> u32 {
        self.unattributed
    }

    pub fn pending(&self) -> &[SkipRecord] {
        &self.pending
    }

    pub fn has_reports(&self) -> bool {
        !self.seen.is_empty() || self.unattributed > 0
    }

    /// Retries every pending file and returns the paths that never made it
    /// into the image: cloud placeholders first, in report order, then the
    /// files whose retries ran out, also in report order.
    pub async fn finalize<L: ProcessLauncher>(
        mut self,
        launcher: &L,
        target: &RetryTarget,
        console: &Console,
    ) -> Vec<String> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return self.permanent;
        }

        let bar = console.retry_bar(pending.len() as u64);
        for mut record in pending {
            bar.set_message(record.path.clone());
            let recovered = self.retry_one(&mut record, launcher, target, console).await;
            bar.inc(1);

            if recovered {
                tracing::info!(path = %record.path, attempts = record.attempts_made, "recovered on retry");
                continue;
            }
            tracing::warn!(path = %record.path, attempts = record.attempts_made, "permanently skipped");
            console.notice(&format!("Skipped permanently: {}", record.path));
            self.record_permanent(record);
        }
        bar.finish_and_clear();

        self.permanent
    }

    async fn retry_one<L: ProcessLauncher>(
        &self,
        record: &mut SkipRecord,
        launcher: &L,
        target: &RetryTarget,
        console: &Console,
    ) -> bool {
        let spec = target.update_command(&record.path);
        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay()).await;
            }
            record.attempts_made = attempt;
            console.retry(attempt, self.retry.max_attempts, &record.path);

            let mut sink = CollectingSink::default();
            match launcher.run(&spec, &mut sink).await {
                Ok(exit) if exit.success() && !sink.stderr.iter().any(|l| classify(l, false).is_fatal()) => {
                    return true;
                }
                Ok(exit) => {
                    tracing::debug!(path = %record.path, attempt, code = exit.code, stderr = %sink.stderr_text(), "retry attempt failed");
                }
                Err(e) => {
                    tracing::warn!(path = %record.path, attempt, error = %e, "retry attempt could not run");
                }
            }
        }
        false
    }
}
