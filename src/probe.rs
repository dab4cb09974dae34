//! Advisory dirty-bit check run before a capture.

use std::path::Path;
use std::time::Duration;

use crate::runner::{CollectingSink, CommandSpec, ProcessLauncher};

/// Reads the probe's human-readable verdict. `None` when the text says
/// neither.
pub fn parse_dirty_output(text: &str) -> Option<bool> {
    let lower = text.to_lowercase();
    if lower.contains("is not dirty") {
        Some(false)
    } else if lower.contains("is dirty") {
        Some(true)
    } else {
        None
    }
}

/// Asks the probe whether `volume` is marked dirty. Launch failures and
/// timeouts are logged and reported as unknown.
pub async fn query_dirty<L: ProcessLauncher>(
    launcher: &L,
    probe: &Path,
    volume: &str,
    timeout: Duration,
) -> Option<bool> {
    let spec = CommandSpec::new(probe)
        .args(["dirty", "query", volume])
        .timeout(timeout);
    let mut sink = CollectingSink::default();

    match launcher.run(&spec, &mut sink).await {
        Ok(exit) => {
            let verdict = parse_dirty_output(&sink.stdout_text());
            if verdict.is_none() {
                tracing::debug!(code = exit.code, stderr = %sink.stderr_text(), "volume probe gave no verdict");
            }
            verdict
        }
        Err(e) => {
            tracing::warn!(%volume, error = %e, "volume probe did not run");
            None
        }
    }
}
