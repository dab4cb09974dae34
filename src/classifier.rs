//! Pure classification of imaging-engine diagnostic lines.
//!
//! [`classify`] never touches the console or the filesystem; the same line
//! and tolerance flag always yield the same [`ClassifiedLine`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Substrings that mark a line as a potential error.
const ERROR_TOKENS: &[&str] = &["error", "failed", "cannot"];

/// Known-safe NTFS metadata complaints. The engine reports them with error
/// wording but the capture is still complete.
const BENIGN_SIGNATURES: &[&str] = &[
    "inconsistent mft record",
    "mft record is inconsistent",
    "unexpected mft record",
];

/// Prefixes announcing the file the engine is working on.
const FILE_MARKER_PREFIXES: &[&str] = &["Adding file: [", "Processing file: ["];

/// Prefix the engine puts in front of Win32 extended-length paths.
const EXTENDED_PATH_PREFIX: &str = "\\\\?\\";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    AccessDenied,
    SharingViolation,
    DeviceNotReady,
}

impl SkipReason {
    const SIGNATURES: &'static [(&'static str, SkipReason)] = &[
        ("access is denied", SkipReason::AccessDenied),
        ("access denied", SkipReason::AccessDenied),
        ("sharing violation", SkipReason::SharingViolation),
        ("being used by another process", SkipReason::SharingViolation),
        ("device is not ready", SkipReason::DeviceNotReady),
        ("device not ready", SkipReason::DeviceNotReady),
    ];

    fn detect(lower: &str) -> Option<Self> {
        Self::SIGNATURES
            .iter()
            .find(|(needle, _)| lower.contains(needle))
            .map(|&(_, reason)| reason)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AccessDenied => write!(f, "access denied"),
            SkipReason::SharingViolation => write!(f, "sharing violation"),
            SkipReason::DeviceNotReady => write!(f, "device not ready"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    B,
    KiB,
    MiB,
    GiB,
    TiB,
}

impl SizeUnit {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "B" | "bytes" => Some(SizeUnit::B),
            "KiB" => Some(SizeUnit::KiB),
            "MiB" => Some(SizeUnit::MiB),
            "GiB" => Some(SizeUnit::GiB),
            "TiB" => Some(SizeUnit::TiB),
            _ => None,
        }
    }

    fn multiplier(self) -> f64 {
        match self {
            SizeUnit::B => 1.0,
            SizeUnit::KiB => 1024.0,
            SizeUnit::MiB => 1024.0 * 1024.0,
            SizeUnit::GiB => 1024.0 * 1024.0 * 1024.0,
            SizeUnit::TiB => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        }
    }
}

/// `<processed> <unit> / <total> <unit> (<percent> % done)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub processed: f64,
    pub processed_unit: SizeUnit,
    pub total: f64,
    pub total_unit: SizeUnit,
    pub percent: f64,
}

impl Progress {
    pub fn processed_bytes(&self) -> u64 {
        (self.processed * self.processed_unit.multiplier()) as u64
    }

    pub fn total_bytes(&self) -> u64 {
        (self.total * self.total_unit.multiplier()) as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedLine {
    Progress(Progress),
    FileMarker(String),
    Warning(String),
    SkippableError {
        text: String,
        reason: SkipReason,
        /// The file named in the line, if one could be extracted.
        path: Option<String>,
    },
    FatalError(String),
    Unrecognized(String),
}

impl ClassifiedLine {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClassifiedLine::FatalError(_))
    }
}

/// Decides what a single engine line means.
///
/// `tolerate_errors` enables the best-effort path where per-file access
/// failures become [`ClassifiedLine::SkippableError`] instead of fatal.
pub fn classify(line: &str, tolerate_errors: bool) -> ClassifiedLine {
    if let Some(progress) = parse_progress(line) {
        return ClassifiedLine::Progress(progress);
    }
    if let Some(name) = parse_file_marker(line) {
        return ClassifiedLine::FileMarker(name);
    }

    let lower = line.to_lowercase();
    // Per-file access failures are errors even without an error token.
    let skip_reason = SkipReason::detect(&lower);
    if skip_reason.is_none() && !ERROR_TOKENS.iter().any(|token| lower.contains(token)) {
        if lower.contains("warning") {
            return ClassifiedLine::Warning(line.to_string());
        }
        return ClassifiedLine::Unrecognized(line.to_string());
    }

    if BENIGN_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return ClassifiedLine::Warning(line.to_string());
    }

    if tolerate_errors {
        if let Some(reason) = skip_reason {
            return ClassifiedLine::SkippableError {
                text: line.to_string(),
                reason,
                path: extract_path(line),
            };
        }
    }

    ClassifiedLine::FatalError(line.to_string())
}

fn parse_progress(line: &str) -> Option<Progress> {
    let open = line.rfind('(')?;
    let close = open + line[open..].find(')')?;

    let inner = line[open + 1..close].trim();
    let percent_text = inner.strip_suffix("done")?.trim_end().strip_suffix('%')?;
    let percent = parse_number(percent_text.trim())?;

    let sizes = &line[..open];
    let slash = sizes.rfind('/')?;
    let (left, right) = (&sizes[..slash], &sizes[slash + 1..]);

    let mut left_tokens = left.split_whitespace().rev();
    let processed_unit = SizeUnit::parse(left_tokens.next()?)?;
    let processed = parse_number(left_tokens.next()?)?;

    let mut right_tokens = right.split_whitespace();
    let total = parse_number(right_tokens.next()?)?;
    let total_unit = SizeUnit::parse(right_tokens.next()?)?;
    if right_tokens.next().is_some() {
        return None;
    }

    Some(Progress {
        processed,
        processed_unit,
        total,
        total_unit,
        percent,
    })
}

/// Parses a decimal written with either `.` or `,`. The last separator is
/// the decimal point; earlier ones are treated as digit grouping.
fn parse_number(text: &str) -> Option<f64> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }
    let normalized = match text.rfind(['.', ',']) {
        Some(pos) => {
            let whole: String = text[..pos].chars().filter(char::is_ascii_digit).collect();
            let frac = &text[pos + 1..];
            if frac.contains(['.', ',']) {
                return None;
            }
            format!("{whole}.{frac}")
        }
        None => text.to_string(),
    };
    normalized.parse::<f64>().ok()
}

fn parse_file_marker(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let inner = FILE_MARKER_PREFIXES
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))?
        .strip_suffix(']')?;
    Some(strip_extended_prefix(inner).to_string())
}

/// Finds the file a diagnostic refers to: the first quoted string, else the
/// first bracketed one.
fn extract_path(line: &str) -> Option<String> {
    enclosed(line, '"', '"')
        .or_else(|| enclosed(line, '[', ']'))
        .map(strip_extended_prefix)
        .filter(|path| !path.trim().is_empty())
        .map(str::to_string)
}

fn enclosed(line: &str, open: char, close: char) -> Option<&str> {
    let start = line.find(open)? + open.len_utf8();
    let len = line[start..].find(close)?;
    Some(&line[start..start + len])
}

fn strip_extended_prefix(path: &str) -> &str {
    path.strip_prefix(EXTENDED_PATH_PREFIX).unwrap_or(path)
}
