use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub const RAW_EXTENSIONS: &[&str] = &[
    "cr2", "rw2", "arw", "nef", "orf", "dng", "raf", "pef", "srw",
];

pub const CONVERSION_LOG_NAME: &str = "conversion_log.json";
pub const CORRUPT_LOG_NAME: &str = "corrupt_files.json";
pub const DELETION_LOG_NAME: &str = "deletion_log.json";
pub const CONVERSION_RUN_LOG_NAME: &str = "raw_conversion.log";
pub const DELETION_RUN_LOG_NAME: &str = "deletion_log.log";

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct RawFileRecord {
    pub path: PathBuf,
    pub extension: String,
    pub size_bytes: u64,
    pub created: Option<SystemTime>,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
}

impl RawFileRecord {
    pub fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let metadata = fs::metadata(&path)?;
        let extension = raw_extension(&path).unwrap_or_default();
        Ok(Self {
            extension,
            size_bytes: metadata.len(),
            created: metadata.created().ok(),
            modified: metadata.modified().ok(),
            accessed: metadata.accessed().ok(),
            path,
        })
    }

    pub fn key(&self) -> Option<&str> {
        ledger_key(&self.path)
    }
}

/// Ledger tables are keyed by the path text, so a path that is not valid
/// UTF-8 has no key and cannot be tracked.
pub fn ledger_key(path: &Path) -> Option<&str> {
    path.to_str()
}

pub fn raw_extension(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?.to_lowercase();
    RAW_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionEntry {
    pub output_path: String,
    pub converted_at: String,
    #[serde(alias = "file_size")]
    pub source_size_bytes: u64,
    #[serde(default)]
    pub output_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorruptEntry {
    #[serde(alias = "error_type")]
    pub error_kind: ErrorKind,
    #[serde(alias = "error")]
    pub message: String,
    #[serde(alias = "detected_at")]
    pub failed_at: String,
    #[serde(
        default,
        alias = "file_size",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionEntry {
    pub deleted_at: String,
    #[serde(alias = "original_size")]
    pub original_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_to: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    UnsupportedFormat,
    ParseError,
    Io,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::Io => "io",
            ErrorKind::Unexpected => "unexpected",
        }
    }

    pub fn is_recognized_corrupt(self) -> bool {
        !matches!(self, ErrorKind::Unexpected)
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "unsupported_format" | "LibRawFileUnsupportedError" => ErrorKind::UnsupportedFormat,
            "parse_error" | "LibRawError" | "LibRawDataError" | "LibRawIOError" => {
                ErrorKind::ParseError
            }
            "io" | "OSError" | "IOError" | "FileNotFoundError" | "PermissionError" => ErrorKind::Io,
            _ => ErrorKind::Unexpected,
        }
    }
}

impl From<ErrorKind> for String {
    fn from(value: ErrorKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
    Paused,
}

impl Severity {
    /// Number of pipeline files between space checkpoints at this severity.
    pub fn check_interval(self) -> u64 {
        match self {
            Severity::Normal => 5,
            Severity::Warning => 3,
            Severity::Critical | Severity::Paused => 1,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Normal => "NORMAL",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Paused => "PAUSED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub run_id: String,
    pub current_path: String,
    pub processed: u64,
    pub total: u64,
    pub previously_processed: u64,
    pub percent: f64,
    pub files_per_sec: f64,
    pub eta_secs: Option<f64>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    #[default]
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConversionSummary {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub total_discovered: u64,
    pub converted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub unexpected_errors: u64,
    pub corrupt_skipped: u64,
    pub partial_metadata: u64,
    pub directories_visited: u64,
    pub directories_with_raw: u64,
    pub bytes_written: u64,
    pub corrupt_files: Vec<String>,
    pub elapsed_ms: u64,
}

impl ConversionSummary {
    pub fn headline(&self) -> String {
        let mut line = format!(
            "{} converted, {} skipped, {} {}",
            self.converted,
            self.skipped,
            self.errors,
            if self.errors == 1 { "error" } else { "errors" }
        );
        if self.corrupt_skipped > 0 {
            line.push_str(&format!(", {} corrupt skipped", self.corrupt_skipped));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeletionSummary {
    pub run_id: String,
    pub planned: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub excluded: u64,
    pub deferred: u64,
    pub reclaimed_bytes: u64,
    pub cancelled: bool,
}
