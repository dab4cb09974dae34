use std::sync::Arc;

use crate::config::WardenConfig;
use crate::error::{FailureKind, ImagingError};
use crate::runner::{CollectingSink, CommandSpec, ProcessLauncher};
use crate::state_machine::{
    ApplyParams, BootPhase, DriveLetter, ImagingJob, JobKind, JobReport, JobResult, RestoreState,
    SecondaryPhaseFailure, StateMachine,
};
use crate::ui::{Console, Ticker};

use super::{EngineSink, TICK_EVERY};

/// Drive the running OS boots from, from `%SystemDrive%`, falling back to C.
pub fn current_system_drive() -> DriveLetter {
    std::env::var("SystemDrive")
        .ok()
        .and_then(|value| DriveLetter::parse(&value).ok())
        .unwrap_or(DriveLetter::C)
}

/// Applies an image to a volume, then makes the volume bootable.
pub struct RestoreOrchestrator<L> {
    launcher: L,
    config: WardenConfig,
    console: Arc<Console>,
    system_drive: DriveLetter,
}

impl<L: ProcessLauncher> RestoreOrchestrator<L> {
    pub fn new(
        launcher: L,
        config: WardenConfig,
        console: Arc<Console>,
        system_drive: DriveLetter,
    ) -> Self {
        Self {
            launcher,
            config,
            console,
            system_drive,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Runs an apply job. Precondition violations are returned as `Err`
    /// before anything is launched; everything after is in the report.
    pub async fn run(&self, job: &ImagingJob) -> Result<JobReport, ImagingError> {
        let JobKind::Apply(params) = &job.kind else {
            return Err(ImagingError::Precondition(
                "restore requires an apply job".to_string(),
            ));
        };
        let target = self.validate(params)?;
        let mut sm = StateMachine::<RestoreState>::new();

        let apply = self.apply_command(params, target);
        tracing::info!(command = %apply.command_line(), "apply started");
        let ticker = Ticker::spawn(Arc::clone(&self.console), TICK_EVERY);
        let (outcome, fatal_lines) = {
            let mut sink = EngineSink::new(&self.console, false);
            let outcome = self.launcher.run(&apply, &mut sink).await;
            (outcome, sink.fatal_lines().to_vec())
        };
        ticker.stop().await;
        self.console.finish();

        let failure = match outcome {
            Err(e) => Some(JobResult::failed(None, FailureKind::Launch(e.to_string()))),
            Ok(exit) => match fatal_lines.first() {
                Some(first) => Some(JobResult::failed(
                    Some(exit.code),
                    FailureKind::FatalEngine(first.clone()),
                )),
                None if !exit.success() => Some(JobResult::failed(
                    Some(exit.code),
                    FailureKind::ExitCode(exit.code),
                )),
                None => None,
            },
        };
        if let Some(result) = failure {
            tracing::error!(failure = ?result.failure, "apply failed");
            sm.advance(RestoreState::Failed)?;
            return Ok(JobReport::new(
                job,
                result,
                Some(BootPhase::NotAttempted),
                sm.transitions(),
            ));
        }
        sm.advance(RestoreState::ImageApplied)?;

        let boot = self.configure_boot(params, target).await;
        match &boot {
            BootPhase::Failed(failure) => {
                tracing::warn!(detail = %failure.detail, remediation = %failure.remediation, "boot configuration failed");
                self.console.notice(&format!(
                    "Image applied, but boot configuration failed: {}",
                    failure.detail
                ));
                sm.advance(RestoreState::BootConfigFailed)?;
            }
            _ => sm.advance(RestoreState::BootConfigured)?,
        }
        sm.advance(RestoreState::Done)?;

        let result = JobResult {
            success: true,
            exit_code: Some(0),
            fatal_error_occurred: false,
            files_skipped_permanently: Vec::new(),
            failure: None,
        };
        Ok(JobReport::new(job, result, Some(boot), sm.transitions()))
    }

    fn validate(&self, params: &ApplyParams) -> Result<DriveLetter, ImagingError> {
        let target = DriveLetter::parse(&params.target)?;
        if target == self.system_drive {
            return Err(ImagingError::Precondition(format!(
                "refusing to restore onto the running system volume {target}"
            )));
        }
        if !params.image.is_file() {
            return Err(ImagingError::Precondition(format!(
                "image {} does not exist",
                params.image.display()
            )));
        }
        Ok(target)
    }

    fn apply_command(&self, params: &ApplyParams, target: DriveLetter) -> CommandSpec {
        CommandSpec::new(&self.config.engine_path)
            .arg("apply")
            .arg(params.image.display().to_string())
            .arg(params.index.to_string())
            .arg(target.root())
            .arg("--check")
    }

    /// Any stderr output from the boot tool counts as failure, even with
    /// exit code 0.
    async fn configure_boot(&self, params: &ApplyParams, target: DriveLetter) -> BootPhase {
        let spec = CommandSpec::new(&self.config.boot_tool_path)
            .arg(target.windows_dir())
            .arg("/f")
            .arg(params.firmware.flag());
        let remediation = spec.command_line();
        tracing::info!(command = %remediation, "configuring boot files");

        let mut sink = CollectingSink::default();
        let (exit_code, detail) = match self.launcher.run(&spec, &mut sink).await {
            Err(e) => (None, e.to_string()),
            Ok(exit) if !exit.success() => {
                let stderr = sink.stderr_text();
                let detail = if stderr.is_empty() {
                    format!("boot tool exited with code {}", exit.code)
                } else {
                    stderr
                };
                (Some(exit.code), detail)
            }
            Ok(exit) if !sink.stderr_text().is_empty() => (Some(exit.code), sink.stderr_text()),
            Ok(_) => return BootPhase::Configured,
        };

        BootPhase::Failed(SecondaryPhaseFailure {
            exit_code,
            detail,
            remediation,
        })
    }
}
