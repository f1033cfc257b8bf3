use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error};

use crate::model::{
    ConversionEntry, CorruptEntry, DeletionEntry, CONVERSION_LOG_NAME, CORRUPT_LOG_NAME,
    DELETION_LOG_NAME,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read ledger table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger table {path} is not valid JSON (fix or move it aside before rerunning): {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize ledger table {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write ledger table {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
struct Table<T> {
    path: PathBuf,
    entries: BTreeMap<String, T>,
    dirty: bool,
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(path: PathBuf) -> Result<Self, LedgerError> {
        let entries = load_table(&path)?;
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    fn insert(&mut self, key: String, entry: T) {
        self.entries.insert(key, entry);
        self.dirty = true;
    }

    fn remove(&mut self, key: &str) -> Option<T> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    fn flush(&mut self) -> Result<(), LedgerError> {
        if !self.dirty {
            return Ok(());
        }
        let payload =
            serde_json::to_vec_pretty(&self.entries).map_err(|source| LedgerError::Serialize {
                path: self.path.clone(),
                source,
            })?;
        write_atomic(&self.path, &payload).map_err(|source| LedgerError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        debug!(
            "flushed {} entries to {}",
            self.entries.len(),
            self.path.display()
        );
        Ok(())
    }
}

pub fn load_table<T>(path: &Path) -> Result<BTreeMap<String, T>, LedgerError>
where
    T: DeserializeOwned,
{
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(LedgerError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if data.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&data).map_err(|source| LedgerError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, payload: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(payload)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Dirty tables are flushed on drop, including on early return or unwinding.
#[derive(Debug)]
pub struct Ledger {
    conversions: Table<ConversionEntry>,
    corrupt: Table<CorruptEntry>,
}

impl Ledger {
    pub fn load(root: &Path) -> Result<Self, LedgerError> {
        Self::load_with_names(root, CONVERSION_LOG_NAME, CORRUPT_LOG_NAME)
    }

    pub fn load_with_names(
        root: &Path,
        conversion_name: &str,
        corrupt_name: &str,
    ) -> Result<Self, LedgerError> {
        Ok(Self {
            conversions: Table::load(root.join(conversion_name))?,
            corrupt: Table::load(root.join(corrupt_name))?,
        })
    }

    pub fn is_processed(&self, source: &str) -> bool {
        self.conversions.entries.contains_key(source)
    }

    pub fn is_corrupt(&self, source: &str) -> bool {
        self.corrupt.entries.contains_key(source)
    }

    pub fn record_conversion(&mut self, source: &str, entry: ConversionEntry) {
        self.corrupt.remove(source);
        self.conversions.insert(source.to_string(), entry);
    }

    pub fn record_corrupt(&mut self, source: &str, entry: CorruptEntry) -> bool {
        if self.is_processed(source) {
            return false;
        }
        self.corrupt.insert(source.to_string(), entry);
        true
    }

    pub fn conversions(&self) -> &BTreeMap<String, ConversionEntry> {
        &self.conversions.entries
    }

    pub fn corrupt(&self) -> &BTreeMap<String, CorruptEntry> {
        &self.corrupt.entries
    }

    pub fn conversion_count(&self) -> usize {
        self.conversions.entries.len()
    }

    pub fn corrupt_count(&self) -> usize {
        self.corrupt.entries.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.conversions.dirty || self.corrupt.dirty
    }

    pub fn flush(&mut self) -> Result<(), LedgerError> {
        let conversions = self.conversions.flush();
        let corrupt = self.corrupt.flush();
        conversions.and(corrupt)
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if self.is_dirty() {
            if let Err(err) = self.flush() {
                error!("failed to flush ledger on shutdown: {err}");
            }
        }
    }
}

#[derive(Debug)]
pub struct DeletionLedger {
    table: Table<DeletionEntry>,
}

impl DeletionLedger {
    pub fn load(root: &Path) -> Result<Self, LedgerError> {
        Ok(Self {
            table: Table::load(root.join(DELETION_LOG_NAME))?,
        })
    }

    pub fn contains(&self, source: &str) -> bool {
        self.table.entries.contains_key(source)
    }

    pub fn record(&mut self, source: &str, entry: DeletionEntry) {
        self.table.insert(source.to_string(), entry);
    }

    pub fn entries(&self) -> &BTreeMap<String, DeletionEntry> {
        &self.table.entries
    }

    pub fn len(&self) -> usize {
        self.table.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.table.path
    }

    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.table.flush()
    }
}

impl Drop for DeletionLedger {
    fn drop(&mut self) {
        if self.table.dirty {
            if let Err(err) = self.table.flush() {
                error!("failed to flush deletion ledger on shutdown: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{DeletionLedger, Ledger, LedgerError};
    use crate::model::{
        ConversionEntry, CorruptEntry, DeletionEntry, ErrorKind, CONVERSION_LOG_NAME,
        CORRUPT_LOG_NAME, DELETION_LOG_NAME,
    };

    fn conversion(output: &str) -> ConversionEntry {
        ConversionEntry {
            output_path: output.to_string(),
            converted_at: "2026-01-01T00:00:00Z".to_string(),
            source_size_bytes: 100,
            output_size_bytes: 40,
        }
    }

    fn corrupt(message: &str) -> CorruptEntry {
        CorruptEntry {
            error_kind: ErrorKind::ParseError,
            message: message.to_string(),
            failed_at: "2026-01-01T00:00:00Z".to_string(),
            source_size_bytes: Some(100),
        }
    }

    #[test]
    fn missing_tables_load_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::load(dir.path()).expect("load");
        assert_eq!(ledger.conversion_count(), 0);
        assert_eq!(ledger.corrupt_count(), 0);
        assert!(!ledger.is_dirty());
    }

    #[test]
    fn flushed_entries_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut ledger = Ledger::load(dir.path()).expect("load");
            ledger.record_conversion("/p/a.cr2", conversion("/p/a.jpg"));
            ledger.record_corrupt("/p/b.cr2", corrupt("bad header"));
            ledger.flush().expect("flush");
            assert!(!ledger.is_dirty());
        }

        let ledger = Ledger::load(dir.path()).expect("reload");
        assert!(ledger.is_processed("/p/a.cr2"));
        assert!(ledger.is_corrupt("/p/b.cr2"));
        assert_eq!(ledger.conversions()["/p/a.cr2"].output_path, "/p/a.jpg");

        let leftovers = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name != CONVERSION_LOG_NAME && name != CORRUPT_LOG_NAME
            })
            .count();
        assert_eq!(leftovers, 0, "flush must not leave temp files behind");
    }

    #[test]
    fn drop_flushes_pending_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut ledger = Ledger::load(dir.path()).expect("load");
            ledger.record_conversion("/p/a.cr2", conversion("/p/a.jpg"));
        }
        let ledger = Ledger::load(dir.path()).expect("reload");
        assert_eq!(ledger.conversion_count(), 1);
    }

    #[test]
    fn conversion_supersedes_corrupt_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ledger = Ledger::load(dir.path()).expect("load");
        ledger.record_corrupt("/p/a.cr2", corrupt("first try"));
        ledger.record_corrupt("/p/a.cr2", corrupt("second try"));
        assert_eq!(ledger.corrupt_count(), 1);
        assert_eq!(ledger.corrupt()["/p/a.cr2"].message, "second try");

        ledger.record_conversion("/p/a.cr2", conversion("/p/a.jpg"));
        assert!(ledger.is_processed("/p/a.cr2"));
        assert!(!ledger.is_corrupt("/p/a.cr2"));
        assert!(!ledger.record_corrupt("/p/a.cr2", corrupt("late")));
        assert!(!ledger.is_corrupt("/p/a.cr2"));
    }

    #[test]
    fn unparsable_table_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CONVERSION_LOG_NAME), "{ not json").expect("write");
        let err = Ledger::load(dir.path()).expect_err("must not load");
        assert!(matches!(err, LedgerError::Parse { .. }));
    }

    #[test]
    fn flush_writes_only_changed_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ledger = Ledger::load(dir.path()).expect("load");
        ledger.record_conversion("/p/a.cr2", conversion("/p/a.jpg"));
        ledger.flush().expect("flush");
        assert!(dir.path().join(CONVERSION_LOG_NAME).exists());
        assert!(!dir.path().join(CORRUPT_LOG_NAME).exists());
    }

    #[test]
    fn deletion_ledger_merges_with_existing_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(DELETION_LOG_NAME),
            r#"{"/p/old.cr2": {"deleted_at": "2024-01-01T00:00:00", "original_size": 10, "converted_to": "/p/old.jpg"}}"#,
        )
        .expect("seed deletion log");

        {
            let mut ledger = DeletionLedger::load(dir.path()).expect("load");
            assert!(ledger.contains("/p/old.cr2"));
            ledger.record(
                "/p/new.cr2",
                DeletionEntry {
                    deleted_at: "2026-01-01T00:00:00Z".to_string(),
                    original_size_bytes: 20,
                    converted_to: None,
                },
            );
            ledger.flush().expect("flush");
        }

        let ledger = DeletionLedger::load(dir.path()).expect("reload");
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entries()["/p/old.cr2"].original_size_bytes, 10);
    }
}
