use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ImagingError;

/// States of a capture job.
///
/// Flow: IDLE → EXCLUSIONS_WRITTEN → ENGINE_RUNNING → {SUCCEEDED, SKIPPED_FILES_RETRIED, FAILED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    Idle,
    ExclusionsWritten,
    EngineRunning,
    Succeeded,
    SkippedFilesRetried,
    Failed,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupState::Idle => write!(f, "IDLE"),
            BackupState::ExclusionsWritten => write!(f, "EXCLUSIONS_WRITTEN"),
            BackupState::EngineRunning => write!(f, "ENGINE_RUNNING"),
            BackupState::Succeeded => write!(f, "SUCCEEDED"),
            BackupState::SkippedFilesRetried => write!(f, "SKIPPED_FILES_RETRIED"),
            BackupState::Failed => write!(f, "FAILED"),
        }
    }
}

/// States of a restore job.
///
/// Flow: IDLE → IMAGE_APPLIED → {BOOT_CONFIGURED, BOOT_CONFIG_FAILED} → DONE.
/// A failed apply goes straight to FAILED and never touches the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreState {
    Idle,
    ImageApplied,
    BootConfigured,
    BootConfigFailed,
    Done,
    Failed,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreState::Idle => write!(f, "IDLE"),
            RestoreState::ImageApplied => write!(f, "IMAGE_APPLIED"),
            RestoreState::BootConfigured => write!(f, "BOOT_CONFIGURED"),
            RestoreState::BootConfigFailed => write!(f, "BOOT_CONFIG_FAILED"),
            RestoreState::Done => write!(f, "DONE"),
            RestoreState::Failed => write!(f, "FAILED"),
        }
    }
}

/// A state set with a fixed transition table.
pub trait JobState: Copy + Eq + fmt::Display {
    fn initial() -> Self;
    fn allows(self, next: Self) -> bool;
}

impl JobState for BackupState {
    fn initial() -> Self {
        BackupState::Idle
    }

    fn allows(self, next: Self) -> bool {
        use BackupState::*;
        matches!(
            (self, next),
            (Idle, ExclusionsWritten)
                | (Idle, Failed)
                | (ExclusionsWritten, EngineRunning)
                | (ExclusionsWritten, Failed)
                | (EngineRunning, Succeeded)
                | (EngineRunning, SkippedFilesRetried)
                | (EngineRunning, Failed)
        )
    }
}

impl JobState for RestoreState {
    fn initial() -> Self {
        RestoreState::Idle
    }

    fn allows(self, next: Self) -> bool {
        use RestoreState::*;
        matches!(
            (self, next),
            (Idle, ImageApplied)
                | (Idle, Failed)
                | (ImageApplied, BootConfigured)
                | (ImageApplied, BootConfigFailed)
                | (BootConfigured, Done)
                | (BootConfigFailed, Done)
        )
    }
}

/// Drives a job through its states and records the path taken.
#[derive(Debug, Clone)]
pub struct StateMachine<S> {
    state: S,
    history: Vec<S>,
}

impl<S: JobState> Default for StateMachine<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: JobState> StateMachine<S> {
    pub fn new() -> Self {
        Self {
            state: S::initial(),
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Move to `next`, rejecting transitions the table does not allow.
    pub fn advance(&mut self, next: S) -> Result<(), ImagingError> {
        if !self.state.allows(next) {
            return Err(ImagingError::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.history.push(self.state);
        self.state = next;
        Ok(())
    }

    /// Every visited state including the current one, rendered for reports.
    pub fn transitions(&self) -> Vec<String> {
        self.history
            .iter()
            .chain(std::iter::once(&self.state))
            .map(ToString::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_happy_path_walks_all_states() {
        let mut sm = StateMachine::<BackupState>::new();
        assert_eq!(sm.state(), BackupState::Idle);

        sm.advance(BackupState::ExclusionsWritten).unwrap();
        sm.advance(BackupState::EngineRunning).unwrap();
        sm.advance(BackupState::Succeeded).unwrap();

        assert_eq!(
            sm.transitions(),
            vec!["IDLE", "EXCLUSIONS_WRITTEN", "ENGINE_RUNNING", "SUCCEEDED"]
        );
    }

    #[test]
    fn backup_terminal_states_are_final() {
        let mut sm = StateMachine::<BackupState>::new();
        sm.advance(BackupState::Failed).unwrap();
        let err = sm.advance(BackupState::EngineRunning).unwrap_err();
        assert!(matches!(err, ImagingError::IllegalTransition { .. }));
        assert_eq!(sm.state(), BackupState::Failed);
    }

    #[test]
    fn backup_cannot_skip_engine_phase() {
        let mut sm = StateMachine::<BackupState>::new();
        sm.advance(BackupState::ExclusionsWritten).unwrap();
        assert!(sm.advance(BackupState::Succeeded).is_err());
    }

    #[test]
    fn restore_degraded_path() {
        let mut sm = StateMachine::<RestoreState>::new();
        sm.advance(RestoreState::ImageApplied).unwrap();
        sm.advance(RestoreState::BootConfigFailed).unwrap();
        sm.advance(RestoreState::Done).unwrap();
        assert_eq!(
            sm.transitions(),
            vec!["IDLE", "IMAGE_APPLIED", "BOOT_CONFIG_FAILED", "DONE"]
        );
    }

    #[test]
    fn restore_never_configures_boot_after_failed_apply() {
        let mut sm = StateMachine::<RestoreState>::new();
        sm.advance(RestoreState::Failed).unwrap();
        assert!(sm.advance(RestoreState::BootConfigured).is_err());
        assert!(sm.advance(RestoreState::BootConfigFailed).is_err());
    }

    #[test]
    fn state_display() {
        assert_eq!(BackupState::SkippedFilesRetried.to_string(), "SKIPPED_FILES_RETRIED");
        assert_eq!(RestoreState::BootConfigFailed.to_string(), "BOOT_CONFIG_FAILED");
    }
}
