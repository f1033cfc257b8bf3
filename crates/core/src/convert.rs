use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use image::ImageError;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::collab::{
    copy_timestamps, encode_jpeg, DcrawDecoder, DecodeOptions, ExiftoolTransfer,
    MetadataTransfer, RawDecoder, DEFAULT_JPEG_QUALITY, METADATA_WARNING_TARGET,
};
use crate::discover::Discoverer;
use crate::ledger::Ledger;
use crate::lock::DirectoryLock;
use crate::model::{
    ledger_key, ConversionEntry, ConversionSummary, CorruptEntry, ErrorKind, ProgressEvent,
    RawFileRecord, RunOutcome, Severity, MIB,
};
use crate::operator::{Operator, PauseDecision};
use crate::space::{
    SpaceConfig, SpaceMonitor, SpaceProbe, SysinfoSpaceProbe, DEFAULT_REQUIRED_BYTES,
};

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub root: PathBuf,
    pub required_bytes: u64,
    pub force: bool,
    pub verbose: bool,
    pub skip_corrupt: bool,
    pub excludes: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub jpeg_quality: u8,
    pub flush_every: u64,
    pub prediction_min_samples: u64,
    pub output_estimate_bytes: Option<u64>,
    pub decode: DecodeOptions,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            required_bytes: DEFAULT_REQUIRED_BYTES,
            force: false,
            verbose: false,
            skip_corrupt: false,
            excludes: Vec::new(),
            output_dir: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            flush_every: 5,
            prediction_min_samples: 5,
            output_estimate_bytes: None,
            decode: DecodeOptions::default(),
        }
    }
}

pub fn output_path_for(source: &Path, root: &Path, output_dir: Option<&Path>) -> PathBuf {
    let base = match output_dir {
        Some(dir) => match source.strip_prefix(root) {
            Ok(relative) => dir.join(relative),
            Err(_) => dir.join(source.file_name().unwrap_or(source.as_os_str())),
        },
        None => source.to_path_buf(),
    };
    base.with_extension("jpg")
}

#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    started: Instant,
    total: u64,
    previously_processed: u64,
    session_processed: u64,
    visited: u64,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, total: u64, previously_processed: u64) -> Self {
        Self {
            run_id: run_id.into(),
            started: Instant::now(),
            total,
            previously_processed,
            session_processed: 0,
            visited: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn visit(&mut self) {
        self.visited += 1;
    }

    pub fn finish_file(&mut self) {
        self.session_processed += 1;
    }

    pub fn session_processed(&self) -> u64 {
        self.session_processed
    }

    pub fn remaining_files(&self) -> u64 {
        self.total.saturating_sub(self.visited)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn progress(&self, current: &Path) -> ProgressEvent {
        self.progress_at(current, self.started.elapsed().as_secs_f64())
    }

    pub fn progress_at(&self, current: &Path, elapsed_secs: f64) -> ProgressEvent {
        let processed = self
            .previously_processed
            .saturating_add(self.session_processed)
            .min(self.total);
        let percent = if self.total > 0 {
            processed as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };
        let files_per_sec = if elapsed_secs > 0.0 {
            self.session_processed as f64 / elapsed_secs
        } else {
            0.0
        };
        let eta_secs = (files_per_sec > 0.0)
            .then(|| (self.total - processed) as f64 / files_per_sec);

        ProgressEvent {
            run_id: self.run_id.clone(),
            current_path: current.to_string_lossy().to_string(),
            processed,
            total: self.total,
            previously_processed: self.previously_processed,
            percent,
            files_per_sec,
            eta_secs,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

struct Converted {
    output_size: u64,
    metadata_complete: bool,
}

struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ImageError> for Failure {
    fn from(err: ImageError) -> Self {
        let kind = match err {
            ImageError::IoError(_) => ErrorKind::Io,
            _ => ErrorKind::Unexpected,
        };
        Failure::new(kind, format!("JPEG encoding failed: {err}"))
    }
}

/// Removes a half-written output unless the pipeline got far enough to keep it.
struct PartialOutput<'a> {
    path: &'a Path,
    committed: bool,
}

impl<'a> PartialOutput<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialOutput<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(self.path) {
            Ok(()) => debug!("removed partial output {}", self.path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove partial output {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}

pub struct Converter {
    options: ConvertOptions,
    decoder: Box<dyn RawDecoder>,
    metadata: Box<dyn MetadataTransfer>,
    probe: Box<dyn SpaceProbe>,
}

impl Converter {
    pub fn new(options: ConvertOptions) -> Self {
        Self {
            options,
            decoder: Box::new(DcrawDecoder::default()),
            metadata: Box::new(ExiftoolTransfer::default()),
            probe: Box::new(SysinfoSpaceProbe::new()),
        }
    }

    pub fn with_decoder(mut self, decoder: impl RawDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn with_metadata(mut self, metadata: impl MetadataTransfer + 'static) -> Self {
        self.metadata = Box::new(metadata);
        self
    }

    pub fn with_space_probe(mut self, probe: impl SpaceProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    pub fn run(self, operator: &mut dyn Operator) -> Result<ConversionSummary> {
        self.run_with_callback(operator, |_| {})
    }

    pub fn run_with_callback<F>(
        self,
        operator: &mut dyn Operator,
        mut on_progress: F,
    ) -> Result<ConversionSummary>
    where
        F: FnMut(ProgressEvent),
    {
        let Converter {
            options,
            decoder,
            metadata,
            probe,
        } = self;
        validate_convert_options(&options)?;

        let root = options
            .root
            .canonicalize()
            .with_context(|| format!("cannot access {}", options.root.display()))?;
        // The output directory is only created once pre-flight has passed.
        let space_target = match &options.output_dir {
            Some(dir) => nearest_existing_ancestor(dir).with_context(|| {
                format!("no existing parent for output directory {}", dir.display())
            })?,
            None => root.clone(),
        };

        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("convert", run_id = %run_id);
        let _entered = span.enter();

        let mut monitor = SpaceMonitor::new(
            probe,
            space_target,
            SpaceConfig {
                required_bytes: options.required_bytes,
                prediction_min_samples: options.prediction_min_samples,
                output_estimate_bytes: options.output_estimate_bytes,
                force: options.force,
            },
        );
        monitor.preflight()?;

        let _lock = DirectoryLock::acquire(&root, &run_id)?;
        let output_dir = match &options.output_dir {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("cannot create output directory {}", dir.display()))?;
                Some(dir.canonicalize()?)
            }
            None => None,
        };
        let mut ledger = Ledger::load(&root)?;
        info!(
            "loaded conversion log with {} previously converted files",
            ledger.conversion_count()
        );
        info!(
            "loaded corrupt files log with {} previously identified corrupt files",
            ledger.corrupt_count()
        );

        info!("scanning {} for raw files", root.display());
        let discoverer = Discoverer::new(&root, &options.excludes);
        let survey = discoverer.survey();
        let previously_processed = (ledger.conversion_count() + ledger.corrupt_count()) as u64;
        info!("found {} raw files to process", survey.total_files);
        if previously_processed > 0 {
            info!("already processed: {previously_processed} files");
        }

        let mut ctx = RunContext::new(run_id.clone(), survey.total_files, previously_processed);
        let mut summary = ConversionSummary {
            run_id: run_id.clone(),
            total_discovered: survey.total_files,
            directories_visited: survey.directories_visited,
            directories_with_raw: survey.directories_with_raw,
            ..ConversionSummary::default()
        };
        let pipeline = Pipeline {
            options: &options,
            root: &root,
            output_dir: output_dir.as_deref(),
            decoder: decoder.as_ref(),
            metadata: metadata.as_ref(),
        };
        let mut since_flush = 0_u64;

        'files: for record in discoverer.iter() {
            ctx.visit();
            let output = pipeline.output_path(&record);
            let (Some(key), Some(output_key)) = (record.key(), ledger_key(&output)) else {
                error!(
                    "cannot track {}: path is not valid UTF-8; rename it to convert",
                    record.path.display()
                );
                summary.errors += 1;
                summary.corrupt_files.push(record.path.display().to_string());
                continue;
            };

            if ledger.is_processed(key) {
                summary.skipped += 1;
                info!("skipping {} (found in conversion log)", record.path.display());
                continue;
            }
            if output.exists() {
                summary.skipped += 1;
                info!("skipping {} (output file already exists)", record.path.display());
                continue;
            }
            if options.skip_corrupt && ledger.is_corrupt(key) {
                summary.corrupt_skipped += 1;
                info!("skipping {} (found in corrupt files log)", record.path.display());
                continue;
            }

            if options.verbose {
                info!("processing {}", record.path.display());
            }
            match pipeline.convert(&record, &output) {
                Ok(converted) => {
                    ledger.record_conversion(
                        key,
                        ConversionEntry {
                            output_path: output_key.to_string(),
                            converted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                            source_size_bytes: record.size_bytes,
                            output_size_bytes: converted.output_size,
                        },
                    );
                    info!("converted: {} -> {}", record.path.display(), output.display());
                    summary.converted += 1;
                    summary.bytes_written += converted.output_size;
                    if !converted.metadata_complete {
                        summary.partial_metadata += 1;
                    }
                    monitor.record_output(converted.output_size);

                    since_flush += 1;
                    if since_flush >= options.flush_every {
                        since_flush = 0;
                        if let Err(err) = ledger.flush() {
                            error!("periodic ledger flush failed: {err}");
                        }
                    }
                }
                Err(failure) => {
                    if failure.kind.is_recognized_corrupt() {
                        error!(
                            "error converting {}: {}: {}",
                            record.path.display(),
                            failure.kind,
                            failure.message
                        );
                    } else {
                        error!(
                            "unexpected error processing {}: {}",
                            record.path.display(),
                            failure.message
                        );
                        summary.unexpected_errors += 1;
                    }
                    ledger.record_corrupt(
                        key,
                        CorruptEntry {
                            error_kind: failure.kind,
                            message: failure.message,
                            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                            source_size_bytes: Some(record.size_bytes),
                        },
                    );
                    summary.errors += 1;
                    summary.corrupt_files.push(key.to_string());
                }
            }

            ctx.finish_file();
            let event = ctx.progress(&record.path);
            log_progress(&event, ctx.session_processed());
            on_progress(event);

            if !monitor.note_file() {
                continue;
            }
            let remaining = ctx.remaining_files();
            let mut severity = monitor.checkpoint(remaining);
            while severity == Severity::Paused {
                let context = monitor.pause_context(remaining);
                warn!(
                    "conversion paused: need ~{:.1} MB for {} remaining file(s), {:.1} MB available",
                    context.estimated_need_bytes as f64 / MIB as f64,
                    context.remaining_files,
                    context.free_bytes as f64 / MIB as f64
                );
                severity = match operator.resolve_pause(&context) {
                    PauseDecision::Recheck => {
                        info!("re-checking free space");
                        monitor.checkpoint(remaining)
                    }
                    PauseDecision::Force => monitor.force_continue(),
                    PauseDecision::Stop => {
                        info!("stopping at operator request; saving progress");
                        summary.outcome = RunOutcome::Stopped;
                        break 'files;
                    }
                };
            }
        }

        ledger.flush()?;
        summary.elapsed_ms = ctx.elapsed_ms();
        log_summary(&summary);
        Ok(summary)
    }
}

struct Pipeline<'a> {
    options: &'a ConvertOptions,
    root: &'a Path,
    output_dir: Option<&'a Path>,
    decoder: &'a dyn RawDecoder,
    metadata: &'a dyn MetadataTransfer,
}

impl Pipeline<'_> {
    fn output_path(&self, record: &RawFileRecord) -> PathBuf {
        output_path_for(&record.path, self.root, self.output_dir)
    }

    fn convert(&self, record: &RawFileRecord, output: &Path) -> Result<Converted, Failure> {
        let image = self
            .decoder
            .decode(&record.path, &self.options.decode)
            .map_err(|err| Failure::new(err.kind(), err.to_string()))?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                Failure::new(
                    ErrorKind::Io,
                    format!("cannot create {}: {}", parent.display(), err),
                )
            })?;
        }

        let guard = PartialOutput::new(output);
        encode_jpeg(&image, output, self.options.jpeg_quality)?;
        drop(image);

        if let Err(err) = copy_timestamps(record, output) {
            warn!(
                "could not copy timestamps from {} to {}: {}",
                record.path.display(),
                output.display(),
                err
            );
        }

        let metadata_complete = match self.metadata.copy_metadata(&record.path, output) {
            Ok(report) => {
                for warning in &report.warnings {
                    warn!(target: METADATA_WARNING_TARGET, path = %record.path.display(), "{warning}");
                }
                debug!("preserved metadata for {}", record.path.display());
                true
            }
            Err(err) => {
                warn!(
                    "could not preserve metadata for {}: {}; image converted, metadata may be incomplete",
                    record.path.display(),
                    err
                );
                false
            }
        };

        let output_size = fs::metadata(output)
            .map_err(|err| {
                Failure::new(
                    ErrorKind::Io,
                    format!("cannot stat {}: {}", output.display(), err),
                )
            })?
            .len();
        guard.commit();

        Ok(Converted {
            output_size,
            metadata_complete,
        })
    }
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().ok()?.join(path)
    };
    absolute
        .ancestors()
        .find_map(|ancestor| ancestor.canonicalize().ok())
}

fn log_progress(event: &ProgressEvent, session_processed: u64) {
    info!(
        "progress: {}/{} files ({:.1}%) - {:.2} files/sec",
        event.processed, event.total, event.percent, event.files_per_sec
    );
    if event.previously_processed > 0 {
        info!(
            "  ({} previously processed, {} in this session)",
            event.previously_processed, session_processed
        );
    }
    if session_processed % 10 == 0 {
        if let Some(eta) = event.eta_secs {
            info!("  est. remaining: {:.1} min", eta / 60.0);
        }
    }
}

fn log_summary(summary: &ConversionSummary) {
    if summary.outcome == RunOutcome::Stopped {
        info!("conversion stopped before completion; progress saved");
    }
    info!("conversion complete: {}", summary.headline());
    info!(
        "visited {} directories ({} containing raw files)",
        summary.directories_visited, summary.directories_with_raw
    );
    if summary.unexpected_errors > 0 {
        warn!(
            "{} file(s) failed with unexpected errors; see the log for details",
            summary.unexpected_errors
        );
    }
    if summary.partial_metadata > 0 {
        warn!(
            "{} file(s) converted with incomplete metadata",
            summary.partial_metadata
        );
    }
    if !summary.corrupt_files.is_empty() {
        warn!("corrupt files in this run:");
        for path in &summary.corrupt_files {
            warn!("  - {path}");
        }
    }
    info!("total time: {:.1}s", summary.elapsed_ms as f64 / 1000.0);
}

fn validate_convert_options(options: &ConvertOptions) -> Result<()> {
    if !options.root.is_dir() {
        return Err(anyhow!(
            "directory {} does not exist or is not a directory",
            options.root.display()
        ));
    }
    if !(1..=100).contains(&options.jpeg_quality) {
        return Err(anyhow!("jpeg_quality must be between 1 and 100"));
    }
    if options.flush_every == 0 {
        return Err(anyhow!("flush_every must be greater than zero"));
    }
    if options.decode.output_bit_depth != 8 && options.decode.output_bit_depth != 16 {
        return Err(anyhow!("output_bit_depth must be 8 or 16"));
    }
    Ok(())
}
