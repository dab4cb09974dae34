mod job;
mod state;

pub use job::{
    ApplyParams, BootPhase, CaptureParams, Compression, DriveLetter, Firmware, ImagingJob,
    JobKind, JobReport, JobResult, RetryConfig, SecondaryPhaseFailure,
};
pub use state::{BackupState, JobState, RestoreState, StateMachine};
