use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Illegal state transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

/// Mechanical failures of a child process. Content is never inspected here.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("IO error while supervising child process: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a finished job is reported as failed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The exclusion list could not be staged for the engine.
    ExclusionWrite(String),
    /// The engine could not be started.
    Launch(String),
    /// The engine reported a failure in its diagnostic output.
    FatalEngine(String),
    /// The engine exited with a non-success code.
    ExitCode(i32),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ExclusionWrite(msg) => write!(f, "exclusion list not written: {msg}"),
            FailureKind::Launch(msg) => write!(f, "engine could not start: {msg}"),
            FailureKind::FatalEngine(line) => write!(f, "engine reported: {line}"),
            FailureKind::ExitCode(code) => write!(f, "engine exited with code {code}"),
        }
    }
}
