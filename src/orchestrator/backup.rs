use std::path::Path;
use std::sync::Arc;

use crate::config::WardenConfig;
use crate::error::{FailureKind, ImagingError};
use crate::exclusions::ExclusionList;
use crate::probe::query_dirty;
use crate::runner::{CommandSpec, ProcessLauncher};
use crate::sampler::IoSampler;
use crate::skip::{PlaceholderProbe, RetryTarget, SkipLog, SkipRetry};
use crate::state_machine::{
    BackupState, CaptureParams, DriveLetter, ImagingJob, JobKind, JobReport, JobResult,
    StateMachine,
};
use crate::ui::{Console, Ticker};

use super::{EngineSink, TICK_EVERY};

/// Drives a capture job from exclusion list to verdict.
pub struct BackupOrchestrator<L, P> {
    launcher: L,
    placeholders: P,
    config: WardenConfig,
    console: Arc<Console>,
}

impl<L: ProcessLauncher, P: PlaceholderProbe + Clone> BackupOrchestrator<L, P> {
    pub fn new(launcher: L, placeholders: P, config: WardenConfig, console: Arc<Console>) -> Self {
        Self {
            launcher,
            placeholders,
            config,
            console,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Runs a capture job. Only a job of the wrong kind is an `Err`; every
    /// engine outcome is reported through the returned [`JobReport`].
    pub async fn run(&self, job: &ImagingJob, check_dirty: bool) -> Result<JobReport, ImagingError> {
        let JobKind::Capture(params) = &job.kind else {
            return Err(ImagingError::Precondition(
                "backup requires a capture job".to_string(),
            ));
        };
        let mut sm = StateMachine::<BackupState>::new();

        if check_dirty {
            self.warn_if_dirty(&params.source).await;
        }

        let mut extra = self.config.extra_exclusions.clone();
        extra.extend(params.exclusions.iter().cloned());
        let exclusions = ExclusionList::build(&extra);
        // Dropping the temp path deletes the file, whichever way we leave.
        let config_file = match exclusions.write_temp() {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(error = %e, "could not stage exclusion list");
                sm.advance(BackupState::Failed)?;
                let result = JobResult::failed(None, FailureKind::ExclusionWrite(e.to_string()));
                return Ok(JobReport::new(job, result, None, sm.transitions()));
            }
        };
        sm.advance(BackupState::ExclusionsWritten)?;
        tracing::debug!(path = %config_file.display(), entries = exclusions.entries().len(), "exclusion list staged");

        let result = self.capture(params, &config_file, &mut sm).await;

        if let Err(e) = config_file.close() {
            tracing::warn!(error = %e, "could not delete exclusion list");
        }

        Ok(JobReport::new(job, result?, None, sm.transitions()))
    }

    async fn capture(
        &self,
        params: &CaptureParams,
        config_file: &Path,
        sm: &mut StateMachine<BackupState>,
    ) -> Result<JobResult, ImagingError> {
        let spec = self.capture_command(params, config_file);
        let log = SkipLog::new(&self.config.skip_log_path);
        let mut skips = SkipRetry::new(self.placeholders.clone(), self.config.retry.clone(), &log);

        sm.advance(BackupState::EngineRunning)?;
        tracing::info!(command = %spec.command_line(), "capture started");

        let ticker = Ticker::spawn(Arc::clone(&self.console), TICK_EVERY);
        let (outcome, fatal_lines) = {
            let mut sink = EngineSink::new(&self.console, params.tolerate_errors).with_skips(&mut skips);
            if self.config.sample_io_rates {
                sink = sink.with_sampler(IoSampler::new());
            }
            let outcome = self.launcher.run(&spec, &mut sink).await;
            (outcome, sink.fatal_lines().to_vec())
        };
        ticker.stop().await;
        self.console.finish();

        let exit = match outcome {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(error = %e, "engine could not be started");
                sm.advance(BackupState::Failed)?;
                return Ok(JobResult::failed(None, FailureKind::Launch(e.to_string())));
            }
        };

        // Some failures only show up in the text; exit 0 is not enough.
        if let Some(first) = fatal_lines.first() {
            tracing::error!(code = exit.code, fatal = fatal_lines.len(), "capture failed");
            sm.advance(BackupState::Failed)?;
            return Ok(JobResult::failed(Some(exit.code), FailureKind::FatalEngine(first.clone())));
        }
        if !exit.success() {
            tracing::error!(code = exit.code, "capture exited with failure");
            sm.advance(BackupState::Failed)?;
            return Ok(JobResult::failed(Some(exit.code), FailureKind::ExitCode(exit.code)));
        }

        let files_skipped_permanently = if skips.has_reports() {
            let target = RetryTarget {
                engine: self.config.engine_path.clone(),
                image: params.destination.clone(),
                index: self.config.image_index,
            };
            let permanent = skips.finalize(&self.launcher, &target, &self.console).await;
            sm.advance(BackupState::SkippedFilesRetried)?;
            permanent
        } else {
            sm.advance(BackupState::Succeeded)?;
            Vec::new()
        };

        tracing::info!(skipped = files_skipped_permanently.len(), "capture finished");
        Ok(JobResult {
            success: true,
            exit_code: Some(exit.code),
            fatal_error_occurred: false,
            files_skipped_permanently,
            failure: None,
        })
    }

    fn capture_command(&self, params: &CaptureParams, config_file: &Path) -> CommandSpec {
        let source = match DriveLetter::parse(&params.source) {
            Ok(drive) => drive.root(),
            Err(_) => params.source.clone(),
        };
        CommandSpec::new(&self.config.engine_path)
            .arg("capture")
            .arg(source)
            .arg(params.destination.display().to_string())
            .arg(params.name.clone())
            .arg(params.description.clone())
            .arg("--snapshot")
            .arg(format!("--config={}", config_file.display()))
            .arg(format!("--compress={}", params.compression))
            .arg(format!("--threads={}", params.threads))
    }

    async fn warn_if_dirty(&self, source: &str) {
        let Ok(drive) = DriveLetter::parse(source) else {
            tracing::debug!(%source, "source is not a volume, skipping dirty check");
            return;
        };
        let verdict = query_dirty(
            &self.launcher,
            &self.config.volume_probe_path,
            &drive.to_string(),
            self.config.probe_timeout(),
        )
        .await;
        if verdict == Some(true) {
            tracing::warn!(volume = %drive, "volume is marked dirty");
            self.console.notice(&format!(
                "Volume {drive} is marked dirty; consider running chkdsk before relying on this image"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::runner::fake::{Script, ScriptedLauncher};
    use crate::skip::tests::ListedProbe;
    use crate::state_machine::{Compression, RetryConfig};

    fn config(dir: &Path) -> WardenConfig {
        WardenConfig {
            skip_log_path: dir.join("skipped.log"),
            retry: RetryConfig {
                max_attempts: 3,
                delay_ms: 0,
            },
            ..WardenConfig::default()
        }
    }

    fn capture_job(tolerate_errors: bool) -> ImagingJob {
        ImagingJob::capture(CaptureParams {
            source: "C:".into(),
            destination: PathBuf::from("E:\\backup.wim"),
            name: "System".into(),
            description: "Nightly".into(),
            exclusions: vec!["\\Games".into()],
            compression: Compression::Fast,
            threads: 4,
            tolerate_errors,
        })
    }

    fn orchestrator(
        launcher: ScriptedLauncher,
        probe: ListedProbe,
        dir: &Path,
    ) -> BackupOrchestrator<ScriptedLauncher, ListedProbe> {
        BackupOrchestrator::new(launcher, probe, config(dir), Arc::new(Console::silent()))
    }

    #[tokio::test]
    async fn clean_capture_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new([Script::exit(0)
            .stderr("Adding file: [C:\\Windows\\win.ini]")
            .stderr("50 GiB / 100 GiB (50 % done)")
            .stderr("100 GiB / 100 GiB (100 % done)")]);
        let orch = orchestrator(launcher, ListedProbe::default(), dir.path());

        let report = orch.run(&capture_job(false), false).await.unwrap();

        assert!(report.result.success);
        assert_eq!(report.result.exit_code, Some(0));
        assert_eq!(
            report.state_transitions,
            vec!["IDLE", "EXCLUSIONS_WRITTEN", "ENGINE_RUNNING", "SUCCEEDED"]
        );
    }

    #[tokio::test]
    async fn capture_command_carries_all_options() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(ScriptedLauncher::default(), ListedProbe::default(), dir.path());
        orch.run(&capture_job(false), false).await.unwrap();

        let call = &orch.launcher().calls()[0];
        assert_eq!(call.program, PathBuf::from("wimlib-imagex.exe"));
        assert_eq!(
            call.args[..6],
            ["capture", "C:\\", "E:\\backup.wim", "System", "Nightly", "--snapshot"]
        );
        assert!(call.args[6].starts_with("--config="));
        assert_eq!(call.args[7], "--compress=fast");
        assert_eq!(call.args[8], "--threads=4");
        assert_eq!(call.timeout, None);
    }

    #[tokio::test]
    async fn exit_zero_with_fatal_line_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new([
            Script::exit(0).stderr("ERROR: Failed to write the WIM file: No space left on device")
        ]);
        let orch = orchestrator(launcher, ListedProbe::default(), dir.path());

        let report = orch.run(&capture_job(true), false).await.unwrap();

        assert!(!report.result.success);
        assert!(report.result.fatal_error_occurred);
        assert_eq!(report.result.exit_code, Some(0));
        assert_eq!(report.state_transitions.last().unwrap(), "FAILED");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            ScriptedLauncher::new([Script::exit(47)]),
            ListedProbe::default(),
            dir.path(),
        );
        let report = orch.run(&capture_job(false), false).await.unwrap();
        assert!(!report.result.success);
        assert_eq!(report.result.failure, Some(FailureKind::ExitCode(47)));
        assert!(!report.result.fatal_error_occurred);
    }

    #[tokio::test]
    async fn launch_error_aborts_without_retries() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            ScriptedLauncher::new([Script::launch_failure()]),
            ListedProbe::default(),
            dir.path(),
        );
        let report = orch.run(&capture_job(true), false).await.unwrap();
        assert!(!report.result.success);
        assert!(matches!(report.result.failure, Some(FailureKind::Launch(_))));
        assert_eq!(report.result.exit_code, None);
        assert_eq!(orch.launcher().call_count(), 1);
    }

    #[tokio::test]
    async fn access_denied_without_tolerance_fails() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new([
            Script::exit(0).stderr("ERROR: Can't open \"C:\\locked.txt\": Access is denied.")
        ]);
        let orch = orchestrator(launcher, ListedProbe::default(), dir.path());
        let report = orch.run(&capture_job(false), false).await.unwrap();
        assert!(!report.result.success);
        assert_eq!(orch.launcher().call_count(), 1);
    }

    #[tokio::test]
    async fn denial_without_error_token_is_retried_when_tolerant() {
        let dir = tempfile::tempdir().unwrap();
        let denied = "Can't open \"C:\\locked.txt\" for reading: Access is denied.";
        let strict = orchestrator(
            ScriptedLauncher::new([Script::exit(0).stderr(denied)]),
            ListedProbe::default(),
            dir.path(),
        );
        let report = strict.run(&capture_job(false), false).await.unwrap();
        assert!(!report.result.success);

        let tolerant = orchestrator(
            ScriptedLauncher::new([Script::exit(0).stderr(denied), Script::exit(0)]),
            ListedProbe::default(),
            dir.path(),
        );
        let report = tolerant.run(&capture_job(true), false).await.unwrap();
        assert!(report.result.success);
        assert_eq!(tolerant.launcher().calls()[1].args[0], "update");
    }

    #[tokio::test]
    async fn skipped_file_recovered_on_second_retry() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new([
            Script::exit(0).stderr("ERROR: Can't open \"\\\\?\\C:\\locked.txt\" for reading: Access is denied."),
            Script::exit(1).stderr("ERROR: Access is denied."),
            Script::exit(0),
        ]);
        let orch = orchestrator(launcher, ListedProbe::default(), dir.path());

        let report = orch.run(&capture_job(true), false).await.unwrap();

        assert!(report.result.success);
        assert!(report.result.files_skipped_permanently.is_empty());
        assert!(!dir.path().join("skipped.log").exists());
        assert_eq!(
            report.state_transitions.last().unwrap(),
            "SKIPPED_FILES_RETRIED"
        );

        let calls = orch.launcher().calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].args, vec!["update", "E:\\backup.wim", "1", "C:\\locked.txt"]);
    }

    #[tokio::test]
    async fn exhausted_retries_are_reported_but_job_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let line = "ERROR: Can't open \"C:\\pinned.db\": The process cannot access the file because it is being used by another process";
        let launcher = ScriptedLauncher::new([
            Script::exit(0).stderr(line).stderr(line).stderr(line),
            Script::exit(1),
            Script::exit(1),
            Script::exit(1),
        ]);
        let orch = orchestrator(launcher, ListedProbe::default(), dir.path());

        let report = orch.run(&capture_job(true), false).await.unwrap();

        assert!(report.result.success);
        assert_eq!(report.result.files_skipped_permanently, vec!["C:\\pinned.db"]);
        assert_eq!(orch.launcher().call_count(), 4);
        let log = std::fs::read_to_string(dir.path().join("skipped.log")).unwrap();
        assert_eq!(log.lines().filter(|l| l.ends_with("C:\\pinned.db")).count(), 1);
    }

    #[tokio::test]
    async fn cloud_placeholder_is_never_retried() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new([
            Script::exit(0).stderr("ERROR: Can't open \"C:\\OneDrive\\video.mp4\": Access is denied.")
        ]);
        let probe = ListedProbe(vec!["C:\\OneDrive\\video.mp4".into()]);
        let orch = orchestrator(launcher, probe, dir.path());

        let report = orch.run(&capture_job(true), false).await.unwrap();

        assert!(report.result.success);
        assert_eq!(report.result.files_skipped_permanently, vec!["C:\\OneDrive\\video.mp4"]);
        assert_eq!(orch.launcher().call_count(), 1);
        let log = std::fs::read_to_string(dir.path().join("skipped.log")).unwrap();
        assert!(log.contains("\t0\tC:\\OneDrive\\video.mp4"));
    }

    #[tokio::test]
    async fn exclusion_file_is_deleted_after_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            ScriptedLauncher::new([Script::exit(2)]),
            ListedProbe::default(),
            dir.path(),
        );
        orch.run(&capture_job(false), false).await.unwrap();

        let call = &orch.launcher().calls()[0];
        let config_path = call.args[6].trim_start_matches("--config=");
        assert!(!Path::new(config_path).exists());
    }

    #[tokio::test]
    async fn dirty_check_runs_first_and_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new([
            Script::exit(0).stdout("Volume - C: is Dirty"),
            Script::exit(0),
        ]);
        let orch = orchestrator(launcher, ListedProbe::default(), dir.path());

        let report = orch.run(&capture_job(false), true).await.unwrap();

        assert!(report.result.success);
        let calls = orch.launcher().calls();
        assert_eq!(calls[0].program, PathBuf::from("fsutil.exe"));
        assert_eq!(calls[0].args, vec!["dirty", "query", "C:"]);
        assert!(calls[0].timeout.is_some());
        assert_eq!(calls[1].args[0], "capture");
    }

    #[tokio::test]
    async fn apply_job_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(ScriptedLauncher::default(), ListedProbe::default(), dir.path());
        let job = ImagingJob::apply(crate::state_machine::ApplyParams {
            image: PathBuf::from("x.wim"),
            index: 1,
            target: "D:".into(),
            firmware: crate::state_machine::Firmware::Uefi,
        });
        assert!(matches!(
            orch.run(&job, false).await,
            Err(ImagingError::Precondition(_))
        ));
        assert_eq!(orch.launcher().call_count(), 0);
    }
}
