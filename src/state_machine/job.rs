use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FailureKind, ImagingError};

/// Compression mode handed to the imaging engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Fast,
    Maximum,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Fast => write!(f, "fast"),
            Compression::Maximum => write!(f, "maximum"),
        }
    }
}

/// Firmware mode passed to the boot configuration tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Uefi,
    Bios,
    All,
}

impl Firmware {
    pub fn flag(self) -> &'static str {
        match self {
            Firmware::Uefi => "UEFI",
            Firmware::Bios => "BIOS",
            Firmware::All => "ALL",
        }
    }
}

/// A single-letter drive reference such as `D:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveLetter(char);

impl DriveLetter {
    pub const C: Self = Self('C');

    /// Accepts `d`, `D:`, `D:\` and `D:/`; anything else is rejected.
    pub fn parse(input: &str) -> Result<Self, ImagingError> {
        let trimmed = input.trim();
        let rest = trimmed
            .strip_suffix('\\')
            .or_else(|| trimmed.strip_suffix('/'))
            .unwrap_or(trimmed);
        let rest = rest.strip_suffix(':').unwrap_or(rest);

        let mut chars = rest.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Ok(Self(c.to_ascii_uppercase())),
            _ => Err(ImagingError::Precondition(format!(
                "'{input}' is not a valid drive letter (expected e.g. D:)"
            ))),
        }
    }

    pub fn letter(self) -> char {
        self.0
    }

    /// Root directory of the volume, e.g. `D:\`.
    pub fn root(self) -> String {
        format!("{}:\\", self.0)
    }

    /// Windows folder on the volume, e.g. `D:\Windows`.
    pub fn windows_dir(self) -> String {
        format!("{}:\\Windows", self.0)
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.0)
    }
}

/// Configuration for per-file retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per file before it is logged as permanently skipped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed pause between attempts, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureParams {
    /// Volume root or directory to capture, e.g. `C:\`.
    pub source: String,
    pub destination: PathBuf,
    pub name: String,
    pub description: String,
    /// Caller-supplied exclusions, appended to the fixed set.
    pub exclusions: Vec<String>,
    pub compression: Compression,
    pub threads: u32,
    /// Best-effort mode: per-file access errors are skipped and retried.
    pub tolerate_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyParams {
    pub image: PathBuf,
    pub index: u32,
    /// Raw target as typed by the caller; validated by the restore orchestrator.
    pub target: String,
    pub firmware: Firmware,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobKind {
    Capture(CaptureParams),
    Apply(ApplyParams),
}

/// One imaging invocation. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingJob {
    pub id: String,
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
}

impl ImagingJob {
    pub fn capture(params: CaptureParams) -> Self {
        Self::new(JobKind::Capture(params))
    }

    pub fn apply(params: ApplyParams) -> Self {
        Self::new(JobKind::Apply(params))
    }

    fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            JobKind::Capture(_) => "capture",
            JobKind::Apply(_) => "apply",
        }
    }
}

/// Verdict of one orchestrator run. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub fatal_error_occurred: bool,
    pub files_skipped_permanently: Vec<String>,
    pub failure: Option<FailureKind>,
}

impl JobResult {
    pub fn failed(exit_code: Option<i32>, failure: FailureKind) -> Self {
        Self {
            success: false,
            exit_code,
            fatal_error_occurred: matches!(failure, FailureKind::FatalEngine(_)),
            files_skipped_permanently: Vec::new(),
            failure: Some(failure),
        }
    }
}

/// Secondary-phase failure of a restore: files are on disk, boot is not guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryPhaseFailure {
    pub exit_code: Option<i32>,
    pub detail: String,
    /// Exact command the operator can run to repair boot files manually.
    pub remediation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BootPhase {
    NotAttempted,
    Configured,
    Failed(SecondaryPhaseFailure),
}

/// Structured report produced at job completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub kind: String,
    pub result: JobResult,
    pub boot: Option<BootPhase>,
    pub state_transitions: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobReport {
    pub fn new(
        job: &ImagingJob,
        result: JobResult,
        boot: Option<BootPhase>,
        state_transitions: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.id.clone(),
            kind: job.kind_name().to_string(),
            result,
            boot,
            state_transitions,
            started_at: job.created_at,
            completed_at: now,
            duration_ms: (now - job.created_at).num_milliseconds(),
        }
    }

    /// Restored, but the boot configuration step did not succeed.
    pub fn is_degraded(&self) -> bool {
        matches!(self.boot, Some(BootPhase::Failed(_)))
    }
}
