//! Child-process supervision.
//!
//! [`ProcessLauncher`] is the seam between orchestration and the operating
//! system. [`TokioLauncher`] starts the real executable with both streams
//! piped, drains stdout and stderr on two reader tasks, and forwards every
//! line, in per-stream order, to one [`LineSink`] running on the caller's
//! task. The call only returns once the child has exited and both readers
//! have delivered [`LineEvent::EndOfStream`].

#[cfg(test)]
pub mod fake;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::RunnerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One event from a child stream. End of stream is its own variant, never
/// an empty line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Line(String),
    EndOfStream,
}

/// Receives stream events. Always called from a single task.
pub trait LineSink {
    /// Called once right after the child starts.
    fn on_spawn(&mut self, _pid: Option<u32>) {}

    fn on_line(&mut self, stream: StreamKind, event: LineEvent);
}

/// Program, arguments and an optional deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Only auxiliary commands carry a deadline; imaging runs unbounded.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn program_name(&self) -> String {
        display_name(&self.program)
    }

    /// Shell-like rendering for logs and remediation hints.
    pub fn command_line(&self) -> String {
        let mut line = self.program_name();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

fn display_name(program: &Path) -> String {
    program.display().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `-1` when the process was terminated without an exit code.
    pub code: i32,
}

impl ProcessExit {
    pub fn success(self) -> bool {
        self.code == 0
    }
}

/// Launches a command and streams its output into a sink.
pub trait ProcessLauncher {
    async fn run(
        &self,
        spec: &CommandSpec,
        sink: &mut dyn LineSink,
    ) -> Result<ProcessExit, RunnerError>;
}

/// Real launcher backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    async fn run(
        &self,
        spec: &CommandSpec,
        sink: &mut dyn LineSink,
    ) -> Result<ProcessExit, RunnerError> {
        tracing::debug!(command = %spec.command_line(), "launching");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Launch {
                program: spec.program_name(),
                source,
            })?;
        sink.on_spawn(child.id());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout_reader = tokio::spawn(pump(child.stdout.take(), StreamKind::Stdout, tx.clone()));
        let stderr_reader = tokio::spawn(pump(child.stderr.take(), StreamKind::Stderr, tx));

        let drive = async {
            // The channel closes only after both readers reported end of stream.
            while let Some((stream, event)) = rx.recv().await {
                sink.on_line(stream, event);
            }
            child.wait().await
        };

        let status = match spec.timeout {
            None => drive.await?,
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, drive).await;
                match outcome {
                    Ok(status) => status?,
                    Err(_) => {
                        stdout_reader.abort();
                        stderr_reader.abort();
                        if let Err(e) = child.start_kill() {
                            tracing::warn!(error = %e, "could not kill timed-out child");
                        }
                        return Err(RunnerError::Timeout {
                            program: spec.program_name(),
                            secs: limit.as_secs(),
                        });
                    }
                }
            }
        };

        let exit = ProcessExit {
            code: status.code().unwrap_or(-1),
        };
        tracing::debug!(program = %spec.program_name(), code = exit.code, "child exited");
        Ok(exit)
    }
}

type Event = (StreamKind, LineEvent);

/// Reads one stream to the end. Carriage returns end a line too, since
/// progress output overwrites itself with `\r` and may not see a `\n` for
/// hours.
async fn pump<R>(stream: Option<R>, kind: StreamKind, tx: mpsc::UnboundedSender<Event>)
where
    R: AsyncRead + Unpin,
{
    if let Some(stream) = stream {
        let mut reader = BufReader::new(stream);
        let mut splitter = LineSplitter::default();
        loop {
            let (lines, used) = match reader.fill_buf().await {
                Ok([]) => break,
                Ok(chunk) => (splitter.push(chunk), chunk.len()),
                Err(e) => {
                    tracing::warn!(stream = ?kind, error = %e, "stream read failed");
                    break;
                }
            };
            reader.consume(used);
            for line in lines {
                if tx.send((kind, LineEvent::Line(line))).is_err() {
                    return;
                }
            }
        }
        if let Some(tail) = splitter.finish() {
            let _ = tx.send((kind, LineEvent::Line(tail)));
        }
    }
    let _ = tx.send((kind, LineEvent::EndOfStream));
}

/// Cuts a byte stream into display lines at `\n`, `\r` or `\r\n`. Tool
/// output on Windows may not be UTF-8, so decoding is lossy.
#[derive(Debug, Default)]
struct LineSplitter {
    buf: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            let after_cr = std::mem::take(&mut self.after_cr);
            match byte {
                // Second half of a CRLF.
                b'\n' if after_cr => {}
                b'\n' => lines.push(self.take()),
                b'\r' => {
                    self.after_cr = true;
                    // Repeated redraws produce empty segments; drop them.
                    if !self.buf.is_empty() {
                        lines.push(self.take());
                    }
                }
                _ => self.buf.push(byte),
            }
        }
        lines
    }

    /// Whatever is left once the stream closed without a line ending.
    fn finish(mut self) -> Option<String> {
        (!self.buf.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

/// Buffers everything a short auxiliary command prints.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub closed: Vec<StreamKind>,
}

impl CollectingSink {
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    /// Stderr lines with surrounding blank lines removed.
    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n").trim().to_string()
    }
}

impl LineSink for CollectingSink {
    fn on_line(&mut self, stream: StreamKind, event: LineEvent) {
        match (stream, event) {
            (StreamKind::Stdout, LineEvent::Line(line)) => self.stdout.push(line),
            (StreamKind::Stderr, LineEvent::Line(line)) => self.stderr.push(line),
            (stream, LineEvent::EndOfStream) => self.closed.push(stream),
        }
    }
}
