use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::ledger::{load_table, DeletionLedger};
use crate::lock::DirectoryLock;
use crate::model::{ConversionEntry, DeletionEntry, DeletionSummary, CONVERSION_LOG_NAME, MIB};
use crate::operator::Operator;

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub root: PathBuf,
    pub ledger_name: String,
    pub force: bool,
    pub batch_size: Option<usize>,
    pub verbose: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            ledger_name: CONVERSION_LOG_NAME.to_string(),
            force: false,
            batch_size: None,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionCandidate {
    pub source_key: String,
    pub source: PathBuf,
    pub output: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    SourceMissing,
    OutputMissing,
    OutputEmpty,
    OutputIsSource,
    AlreadyDeleted,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExclusionReason::SourceMissing => "raw file no longer exists",
            ExclusionReason::OutputMissing => "converted file is missing",
            ExclusionReason::OutputEmpty => "converted file is empty",
            ExclusionReason::OutputIsSource => "converted file path points at the raw file",
            ExclusionReason::AlreadyDeleted => "already deleted in an earlier session",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExcludedEntry {
    pub source: String,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryGroup {
    pub directory: PathBuf,
    pub files: Vec<String>,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionPlan {
    pub candidates: Vec<DeletionCandidate>,
    pub directories: Vec<DirectoryGroup>,
    pub total_bytes: u64,
    pub excluded: Vec<ExcludedEntry>,
    pub deferred: u64,
}

impl DeletionPlan {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

pub fn build_deletion_plan(
    conversions: &BTreeMap<String, ConversionEntry>,
    deleted: Option<&DeletionLedger>,
    batch_size: Option<usize>,
) -> DeletionPlan {
    let mut plan = DeletionPlan::default();
    let mut verified = Vec::new();

    for (source, entry) in conversions {
        match verify_entry(source, entry) {
            Ok(candidate) => verified.push(candidate),
            Err(ExclusionReason::SourceMissing)
                if deleted.is_some_and(|ledger| ledger.contains(source)) =>
            {
                plan.excluded.push(ExcludedEntry {
                    source: source.clone(),
                    reason: ExclusionReason::AlreadyDeleted,
                });
            }
            Err(reason) => plan.excluded.push(ExcludedEntry {
                source: source.clone(),
                reason,
            }),
        }
    }

    if let Some(limit) = batch_size {
        if verified.len() > limit {
            info!(
                "limiting deletion to first {} files of {} total",
                limit,
                verified.len()
            );
            plan.deferred = (verified.len() - limit) as u64;
            verified.truncate(limit);
        }
    }

    let mut groups: BTreeMap<PathBuf, DirectoryGroup> = BTreeMap::new();
    for candidate in &verified {
        let directory = candidate
            .source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let group = groups
            .entry(directory.clone())
            .or_insert_with(|| DirectoryGroup {
                directory,
                files: Vec::new(),
                bytes: 0,
            });
        group.files.push(
            candidate
                .source
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
        group.bytes += candidate.size_bytes;
        plan.total_bytes += candidate.size_bytes;
    }

    plan.directories = groups.into_values().collect();
    plan.candidates = verified;
    plan
}

fn verify_entry(
    source: &str,
    entry: &ConversionEntry,
) -> Result<DeletionCandidate, ExclusionReason> {
    let source_path = PathBuf::from(source);
    let source_meta = match fs::metadata(&source_path) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Err(ExclusionReason::SourceMissing),
    };
    if entry.output_path.is_empty() {
        return Err(ExclusionReason::OutputMissing);
    }
    let output = PathBuf::from(&entry.output_path);
    let output_meta = match fs::metadata(&output) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Err(ExclusionReason::OutputMissing),
    };
    if output_meta.len() == 0 {
        return Err(ExclusionReason::OutputEmpty);
    }
    if same_file(&source_path, &output) {
        return Err(ExclusionReason::OutputIsSource);
    }

    Ok(DeletionCandidate {
        source_key: source.to_string(),
        source: source_path,
        output,
        size_bytes: source_meta.len(),
    })
}

fn same_file(left: &Path, right: &Path) -> bool {
    match (left.canonicalize(), right.canonicalize()) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

pub fn run_deletion(
    options: &DeleteOptions,
    operator: &mut dyn Operator,
) -> Result<DeletionSummary> {
    if !options.root.is_dir() {
        return Err(anyhow!(
            "directory {} does not exist or is not a directory",
            options.root.display()
        ));
    }
    let root = options
        .root
        .canonicalize()
        .with_context(|| format!("cannot access {}", options.root.display()))?;

    let run_id = Uuid::new_v4().to_string();
    let span = info_span!("delete", run_id = %run_id);
    let _entered = span.enter();
    let mut summary = DeletionSummary {
        run_id: run_id.clone(),
        ..DeletionSummary::default()
    };

    let _lock = DirectoryLock::acquire(&root, &run_id)?;
    let ledger_path = root.join(&options.ledger_name);
    if !ledger_path.exists() {
        warn!("conversion log file not found: {}", ledger_path.display());
        return Ok(summary);
    }
    let conversions = load_table::<ConversionEntry>(&ledger_path)?;
    if conversions.is_empty() {
        warn!("no converted files found in the log; nothing to delete");
        return Ok(summary);
    }

    let mut deletions = DeletionLedger::load(&root)?;
    let plan = build_deletion_plan(&conversions, Some(&deletions), options.batch_size);
    summary.planned = plan.candidates.len() as u64;
    summary.excluded = plan.excluded.len() as u64;
    summary.deferred = plan.deferred;
    log_plan(&plan, options.verbose);

    if plan.is_empty() {
        info!("no verified raw files to delete");
        return Ok(summary);
    }

    if !options.force && !operator.confirm_deletion(&plan) {
        info!("deletion cancelled");
        summary.cancelled = true;
        summary.skipped = summary.planned;
        return Ok(summary);
    }

    for candidate in &plan.candidates {
        // The tree may have changed while the plan was under review.
        match fs::metadata(&candidate.output) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            _ => {
                warn!(
                    "converted file {} disappeared; keeping {}",
                    candidate.output.display(),
                    candidate.source.display()
                );
                summary.skipped += 1;
                continue;
            }
        }

        let size = match fs::metadata(&candidate.source) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("file not found (already deleted?): {}", candidate.source.display());
                summary.skipped += 1;
                continue;
            }
            Err(err) => {
                error!("failed to read {}: {}", candidate.source.display(), err);
                summary.errors += 1;
                continue;
            }
        };

        match fs::remove_file(&candidate.source) {
            Ok(()) => {
                deletions.record(
                    &candidate.source_key,
                    DeletionEntry {
                        deleted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                        original_size_bytes: size,
                        converted_to: Some(candidate.output.display().to_string()),
                    },
                );
                info!("deleted: {}", candidate.source.display());
                summary.deleted += 1;
                summary.reclaimed_bytes += size;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("file not found (already deleted?): {}", candidate.source.display());
                summary.skipped += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                error!("permission denied when deleting: {}", candidate.source.display());
                summary.errors += 1;
            }
            Err(err) => {
                error!("failed to delete {}: {}", candidate.source.display(), err);
                summary.errors += 1;
            }
        }
    }

    deletions.flush()?;
    info!("deletion log saved to {}", deletions.path().display());
    info!(
        "deletion summary: {} deleted, {} skipped, {} errors ({:.1} MB reclaimed)",
        summary.deleted,
        summary.skipped,
        summary.errors,
        summary.reclaimed_bytes as f64 / MIB as f64
    );
    Ok(summary)
}

fn log_plan(plan: &DeletionPlan, verbose: bool) {
    for excluded in &plan.excluded {
        warn!("excluded {}: {}", excluded.source, excluded.reason);
    }
    for group in &plan.directories {
        info!(
            "{}: {} file(s), {:.1} MB",
            group.directory.display(),
            group.files.len(),
            group.bytes as f64 / MIB as f64
        );
        if verbose {
            for (index, file) in group.files.iter().enumerate() {
                info!("  {}. {}", index + 1, file);
            }
        }
    }
    info!(
        "total files to delete: {} ({:.1} MB)",
        plan.candidates.len(),
        plan.total_bytes as f64 / MIB as f64
    );
    if plan.deferred > 0 {
        info!("{} verified file(s) left for a later session", plan.deferred);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    use super::{build_deletion_plan, ExclusionReason};
    use crate::ledger::DeletionLedger;
    use crate::model::{ConversionEntry, DeletionEntry};

    fn write(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, bytes).expect("write file");
    }

    fn entry(output: &Path) -> ConversionEntry {
        ConversionEntry {
            output_path: output.to_string_lossy().to_string(),
            converted_at: "2024-01-01T00:00:00Z".to_string(),
            source_size_bytes: 3,
            output_size_bytes: 4,
        }
    }

    #[test]
    fn plan_excludes_unverified_entries_with_reasons() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        write(&root.join("a/1.cr2"), b"raw");
        write(&root.join("a/1.jpg"), b"jpeg");
        write(&root.join("b/2.cr2"), b"raw");
        write(&root.join("b/3.cr2"), b"raw");
        write(&root.join("b/3.jpg"), b"");

        let mut conversions = BTreeMap::new();
        conversions.insert(key(&root.join("a/1.cr2")), entry(&root.join("a/1.jpg")));
        conversions.insert(key(&root.join("b/2.cr2")), entry(&root.join("b/2.jpg")));
        conversions.insert(key(&root.join("b/3.cr2")), entry(&root.join("b/3.jpg")));
        conversions.insert(key(&root.join("c/4.cr2")), entry(&root.join("c/4.jpg")));
        conversions.insert(key(&root.join("a/5.cr2")), entry(&root.join("a/5.cr2")));
        write(&root.join("a/5.cr2"), b"raw");

        let plan = build_deletion_plan(&conversions, None, None);
        assert_eq!(plan.candidates.len(), 1);
        assert_eq!(plan.total_bytes, 3);
        assert_eq!(plan.directories.len(), 1);
        assert_eq!(plan.directories[0].files, vec!["1.cr2".to_string()]);

        let reasons = plan
            .excluded
            .iter()
            .map(|excluded| excluded.reason)
            .collect::<Vec<_>>();
        assert!(reasons.contains(&ExclusionReason::OutputMissing));
        assert!(reasons.contains(&ExclusionReason::OutputEmpty));
        assert!(reasons.contains(&ExclusionReason::SourceMissing));
        assert!(reasons.contains(&ExclusionReason::OutputIsSource));
    }

    #[test]
    fn batch_limit_defers_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut conversions = BTreeMap::new();
        for index in 0..4 {
            let raw = dir.path().join(format!("d{index}/{index}.nef"));
            let jpg = raw.with_extension("jpg");
            write(&raw, b"raw");
            write(&jpg, b"jpeg");
            conversions.insert(key(&raw), entry(&jpg));
        }

        let plan = build_deletion_plan(&conversions, None, Some(3));
        assert_eq!(plan.candidates.len(), 3);
        assert_eq!(plan.deferred, 1);
        assert_eq!(plan.directories.len(), 3);
        assert_eq!(plan.total_bytes, 9);
    }

    #[test]
    fn previously_deleted_sources_are_reported_as_such() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("gone.arw");
        let mut conversions = BTreeMap::new();
        conversions.insert(key(&raw), entry(&raw.with_extension("jpg")));

        let mut deleted = DeletionLedger::load(dir.path()).expect("load");
        deleted.record(
            &key(&raw),
            DeletionEntry {
                deleted_at: "2024-01-01T00:00:00Z".to_string(),
                original_size_bytes: 3,
                converted_to: None,
            },
        );

        let plan = build_deletion_plan(&conversions, Some(&deleted), None);
        assert!(plan.is_empty());
        assert_eq!(plan.excluded[0].reason, ExclusionReason::AlreadyDeleted);
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }
}
