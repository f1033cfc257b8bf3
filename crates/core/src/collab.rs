use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ErrorKind, RawFileRecord};

/// Tracing target for informational warnings emitted by the metadata tool.
/// Subscribers silence it unless verbose output was requested.
pub const METADATA_WARNING_TARGET: &str = "rawvert::metadata_warnings";

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeOptions {
    pub use_camera_white_balance: bool,
    pub auto_brightness: bool,
    pub output_bit_depth: u8,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            use_camera_white_balance: true,
            auto_brightness: true,
            output_bit_depth: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported or unrecognized raw format: {0}")]
    UnsupportedFormat(String),
    #[error("raw data could not be parsed: {0}")]
    Parse(String),
    #[error("I/O error while reading raw file: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected decoder failure: {0}")]
    Unexpected(String),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            DecodeError::Parse(_) => ErrorKind::ParseError,
            DecodeError::Io(_) => ErrorKind::Io,
            DecodeError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    pub fn is_recognized_corrupt(&self) -> bool {
        self.kind().is_recognized_corrupt()
    }
}

pub trait RawDecoder {
    fn decode(&self, path: &Path, options: &DecodeOptions) -> Result<RgbImage, DecodeError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataReport {
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("metadata copy failed: {0}")]
    Failed(String),
}

pub trait MetadataTransfer {
    fn copy_metadata(&self, source: &Path, target: &Path) -> Result<MetadataReport, MetadataError>;
}

#[derive(Debug, Clone)]
pub struct DcrawDecoder {
    program: PathBuf,
}

impl DcrawDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn build_args(path: &Path, options: &DecodeOptions) -> Vec<String> {
        let mut args = vec!["-c".to_string()];
        if options.use_camera_white_balance {
            args.push("-w".to_string());
        }
        if !options.auto_brightness {
            args.push("-W".to_string());
        }
        if options.output_bit_depth > 8 {
            args.push("-6".to_string());
        }
        args.push(path.to_string_lossy().to_string());
        args
    }
}

impl Default for DcrawDecoder {
    fn default() -> Self {
        Self::new("dcraw")
    }
}

impl RawDecoder for DcrawDecoder {
    fn decode(&self, path: &Path, options: &DecodeOptions) -> Result<RgbImage, DecodeError> {
        // Read failures on the source belong to the file, not to the tool.
        File::open(path)?;

        let output = Command::new(&self.program)
            .args(Self::build_args(path, options))
            .output()
            .map_err(|err| {
                DecodeError::Unexpected(format!(
                    "failed to run {}: {}",
                    self.program.display(),
                    err
                ))
            })?;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_decoder_failure(stderr.trim(), output.status.code()));
        }

        let image = image::load_from_memory_with_format(&output.stdout, ImageFormat::Pnm)
            .map_err(|err| {
                DecodeError::Unexpected(format!("decoder produced unreadable output: {err}"))
            })?;
        Ok(image.into_rgb8())
    }
}

pub fn classify_decoder_failure(stderr: &str, status: Option<i32>) -> DecodeError {
    let message = if stderr.is_empty() {
        match status {
            Some(code) => format!("decoder exited with status {code}"),
            None => "decoder terminated by signal".to_string(),
        }
    } else {
        stderr.to_string()
    };
    let lowered = message.to_lowercase();

    if lowered.contains("cannot decode") || lowered.contains("unsupported") {
        DecodeError::UnsupportedFormat(message)
    } else if lowered.contains("corrupt")
        || lowered.contains("unexpected end")
        || lowered.contains("truncated")
    {
        DecodeError::Parse(message)
    } else if lowered.contains("no such file")
        || lowered.contains("permission denied")
        || lowered.contains("i/o error")
    {
        DecodeError::Io(io::Error::other(message))
    } else {
        DecodeError::Unexpected(message)
    }
}

#[derive(Debug, Clone)]
pub struct ExiftoolTransfer {
    program: PathBuf,
}

impl ExiftoolTransfer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for ExiftoolTransfer {
    fn default() -> Self {
        Self::new("exiftool")
    }
}

impl MetadataTransfer for ExiftoolTransfer {
    fn copy_metadata(&self, source: &Path, target: &Path) -> Result<MetadataReport, MetadataError> {
        // -P keeps the file modification time set by the timestamp step.
        let output = Command::new(&self.program)
            .args(["-P", "-overwrite_original", "-TagsFromFile"])
            .arg(source)
            .arg("-all:all")
            .arg(target)
            .output()
            .map_err(|source| MetadataError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = stderr
                .lines()
                .find(|line| line.trim_start().starts_with("Error"))
                .unwrap_or_else(|| stderr.trim());
            return Err(MetadataError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                detail
            )));
        }

        Ok(MetadataReport {
            warnings: parse_tool_warnings(&stderr),
        })
    }
}

pub fn parse_tool_warnings(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Warning"))
        .map(str::to_string)
        .collect()
}

pub fn encode_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<u64, ImageError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(image)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    Ok(fs::metadata(path)?.len())
}

pub fn copy_timestamps(record: &RawFileRecord, target: &Path) -> io::Result<()> {
    let mut times = FileTimes::new();
    if let Some(accessed) = record.accessed {
        times = times.set_accessed(accessed);
    }
    if let Some(modified) = record.modified {
        times = times.set_modified(modified);
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileTimesExt;
        if let Some(created) = record.created {
            times = times.set_created(created);
        }
    }
    #[cfg(target_os = "macos")]
    {
        use std::os::macos::fs::FileTimesExt;
        if let Some(created) = record.created {
            times = times.set_created(created);
        }
    }

    let file = OpenOptions::new().write(true).open(target)?;
    file.set_times(times)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: String,
    pub program: String,
    pub available: bool,
    pub detail: Option<String>,
}

/// Checks that a helper program can be spawned. Only spawn failures count:
/// `dcraw` without arguments prints usage and exits non-zero.
pub fn probe_tool(name: &str, program: &Path, args: &[&str]) -> ToolStatus {
    match Command::new(program).args(args).output() {
        Ok(output) => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty());
            ToolStatus {
                name: name.to_string(),
                program: program.display().to_string(),
                available: true,
                detail: version,
            }
        }
        Err(err) => ToolStatus {
            name: name.to_string(),
            program: program.display().to_string(),
            available: false,
            detail: Some(format!("{err}; is {} installed and in PATH?", program.display())),
        },
    }
}

pub fn check_tools(decoder: &DcrawDecoder, metadata: &ExiftoolTransfer) -> Vec<ToolStatus> {
    vec![
        probe_tool("raw decoder", decoder.program(), &[]),
        probe_tool("metadata transfer", metadata.program(), &["-ver"]),
    ]
}
