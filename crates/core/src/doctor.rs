use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::collab::{check_tools, DcrawDecoder, ExiftoolTransfer, ToolStatus};
use crate::ledger::load_table;
use crate::lock::{read_lock, LockInfo, LOCK_FILE_NAME};
use crate::model::{
    ConversionEntry, CorruptEntry, DeletionEntry, CONVERSION_LOG_NAME, CORRUPT_LOG_NAME,
    DELETION_LOG_NAME,
};
use crate::space::{SpaceProbe, SysinfoSpaceProbe, DEFAULT_REQUIRED_BYTES};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub current_dir: Option<String>,
    pub root: Option<String>,
    pub tools: Vec<ToolStatus>,
    pub free_space_bytes: Option<u64>,
    pub converted: Option<usize>,
    pub corrupt: Option<usize>,
    pub deleted: Option<usize>,
    pub lock: Option<LockInfo>,
    pub notes: Vec<String>,
}

pub fn collect_doctor_info(root: Option<&Path>) -> DoctorInfo {
    let current_dir = env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());
    let tools = check_tools(&DcrawDecoder::default(), &ExiftoolTransfer::default());

    let mut notes = Vec::new();
    for tool in tools.iter().filter(|tool| !tool.available) {
        notes.push(format!(
            "{} ({}) is not available; conversion cannot run.",
            tool.name, tool.program
        ));
    }

    let mut info = DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        current_dir,
        root: None,
        tools,
        free_space_bytes: None,
        converted: None,
        corrupt: None,
        deleted: None,
        lock: None,
        notes,
    };

    let Some(root) = root else {
        return info;
    };
    info.root = Some(root.to_string_lossy().to_string());
    if !root.is_dir() {
        info.notes.push(format!("{} is not a directory.", root.display()));
        return info;
    }

    match SysinfoSpaceProbe::new().free_bytes(root) {
        Ok(free) => {
            if free < DEFAULT_REQUIRED_BYTES {
                info.notes.push(
                    "Free space is below the default 500 MB floor; convert would need --force."
                        .to_string(),
                );
            }
            info.free_space_bytes = Some(free);
        }
        Err(err) => info.notes.push(format!("Free space unknown: {err:#}")),
    }

    match load_table::<ConversionEntry>(&root.join(CONVERSION_LOG_NAME)) {
        Ok(table) => info.converted = Some(table.len()),
        Err(err) => info.notes.push(err.to_string()),
    }
    match load_table::<CorruptEntry>(&root.join(CORRUPT_LOG_NAME)) {
        Ok(table) => info.corrupt = Some(table.len()),
        Err(err) => info.notes.push(err.to_string()),
    }
    match load_table::<DeletionEntry>(&root.join(DELETION_LOG_NAME)) {
        Ok(table) => info.deleted = Some(table.len()),
        Err(err) => info.notes.push(err.to_string()),
    }

    if root.join(LOCK_FILE_NAME).exists() {
        info.lock = read_lock(root);
        info.notes.push(format!(
            "{LOCK_FILE_NAME} is present; another run may be active. Remove it if not."
        ));
    }

    info
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::collect_doctor_info;
    use crate::lock::DirectoryLock;
    use crate::model::CONVERSION_LOG_NAME;

    #[test]
    fn reports_ledger_counts_and_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONVERSION_LOG_NAME),
            r#"{"/p/a.cr2": {"output_path": "/p/a.jpg", "converted_at": "x", "source_size_bytes": 1, "output_size_bytes": 1}}"#,
        )
        .expect("write log");
        let _lock = DirectoryLock::acquire(dir.path(), "run-doctor").expect("lock");

        let info = collect_doctor_info(Some(dir.path()));
        assert_eq!(info.converted, Some(1));
        assert_eq!(info.corrupt, Some(0));
        assert_eq!(info.deleted, Some(0));
        assert_eq!(info.lock.expect("lock info").run_id, "run-doctor");
        assert_eq!(info.tools.len(), 2);
    }

    #[test]
    fn unparsable_table_becomes_a_note() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CONVERSION_LOG_NAME), "{not json").expect("write log");

        let info = collect_doctor_info(Some(dir.path()));
        assert_eq!(info.converted, None);
        assert!(info
            .notes
            .iter()
            .any(|note| note.contains(CONVERSION_LOG_NAME)));
    }
}
