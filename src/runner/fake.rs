//! Scripted stand-in for [`ProcessLauncher`] used by orchestrator tests.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{CommandSpec, LineEvent, LineSink, ProcessExit, ProcessLauncher, StreamKind};
use crate::error::RunnerError;

/// What one invocation prints and how it ends.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
    pub launch_fails: bool,
}

impl Script {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn stderr(mut self, line: &str) -> Self {
        self.stderr.push(line.to_string());
        self
    }

    pub fn stdout(mut self, line: &str) -> Self {
        self.stdout.push(line.to_string());
        self
    }

    pub fn launch_failure() -> Self {
        Self {
            launch_fails: true,
            ..Default::default()
        }
    }
}

/// Replays scripts in order; once exhausted every call exits 0 silently.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedLauncher {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    async fn run(
        &self,
        spec: &CommandSpec,
        sink: &mut dyn LineSink,
    ) -> Result<ProcessExit, RunnerError> {
        self.calls.lock().push(spec.clone());
        let script = self.scripts.lock().pop_front().unwrap_or_default();

        if script.launch_fails {
            return Err(RunnerError::Launch {
                program: spec.program_name(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted launch failure"),
            });
        }

        sink.on_spawn(None);
        for line in script.stdout {
            sink.on_line(StreamKind::Stdout, LineEvent::Line(line));
        }
        sink.on_line(StreamKind::Stdout, LineEvent::EndOfStream);
        for line in script.stderr {
            sink.on_line(StreamKind::Stderr, LineEvent::Line(line));
        }
        sink.on_line(StreamKind::Stderr, LineEvent::EndOfStream);

        Ok(ProcessExit {
            code: script.exit_code,
        })
    }
}
