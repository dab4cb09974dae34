//! Exclusion list handed to the engine for a capture.
//!
//! The list is rendered in the engine's config-file format: a section header
//! followed by one volume-relative glob per line. It is staged in a uniquely
//! named temporary file that is deleted when the returned [`TempPath`] drops.

use std::collections::HashSet;
use std::io::{self, Write};

use tempfile::TempPath;

pub const LIST_HEADER: &str = "[ExclusionList]";

/// Paths never worth capturing from a live system volume.
const BUILT_IN: &[&str] = &[
    "\\$ntfs.log",
    "\\hiberfil.sys",
    "\\pagefile.sys",
    "\\swapfile.sys",
    "\\System Volume Information",
    "\\RECYCLER",
    "\\$Recycle.Bin",
    "\\Windows\\CSC",
    "\\Windows\\SoftwareDistribution\\Download",
    "\\Windows\\Temp\\*",
    "\\Users\\*\\AppData\\Local\\Temp\\*",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionList {
    entries: Vec<String>,
}

impl ExclusionList {
    /// Built-in exclusions followed by `extra`, normalized and deduplicated.
    /// Order is deterministic: first occurrence wins.
    pub fn build<S: AsRef<str>>(extra: &[S]) -> Self {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        let candidates = BUILT_IN
            .iter()
            .map(|s| s.to_string())
            .chain(extra.iter().filter_map(|s| normalize(s.as_ref())));

        for entry in candidates {
            // NTFS is case-insensitive, so is the dedup.
            if seen.insert(entry.to_lowercase()) {
                entries.push(entry);
            }
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn render(&self) -> String {
        let mut out = String::from(LIST_HEADER);
        out.push('\n');
        for entry in &self.entries {
            out.push_str(entry);
            out.push('\n');
        }
        out
    }

    /// Writes the list to a fresh temporary file. The file is removed when
    /// the returned path is dropped.
    pub fn write_temp(&self) -> io::Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix("imagewarden-exclusions-")
            .suffix(".ini")
            .tempfile()?;
        file.write_all(self.render().as_bytes())?;
        file.flush()?;
        Ok(file.into_temp_path())
    }
}

/// Turns a caller glob into a volume-relative path with a leading separator.
/// Drive prefixes are stripped; empty input is dropped.
fn normalize(raw: &str) -> Option<String> {
    let mut path = raw.trim().replace('/', "\\");
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        path.drain(..2);
    }
    let trimmed = path.trim_end_matches('\\');
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('\\') {
        Some(trimmed.to_string())
    } else {
        Some(format!("\\{trimmed}"))
    }
}
