mod common;

use std::fs;
use std::path::Path;

use anyhow::Result;
use rawvert_core::ledger::load_table;
use rawvert_core::{
    run_deletion, DeleteOptions, DeletionEntry, ScriptedOperator, DELETION_LOG_NAME,
    LOCK_FILE_NAME,
};

use common::{converter, key, library_with_one_corrupt, options, write, ScriptedProbe, PLENTY};

fn converted_library(dir: &Path) -> Result<std::path::PathBuf> {
    let root = library_with_one_corrupt(dir);
    converter(options(&root), ScriptedProbe::fixed(PLENTY)).run(&mut ScriptedOperator::default())?;
    Ok(root)
}

fn delete_options(root: &Path) -> DeleteOptions {
    DeleteOptions {
        root: root.to_path_buf(),
        force: true,
        ..DeleteOptions::default()
    }
}

#[test]
fn forced_deletion_removes_only_verified_originals() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = converted_library(dir.path())?;

    let summary = run_deletion(&delete_options(&root), &mut ScriptedOperator::default())?;
    assert_eq!(summary.planned, 2);
    assert_eq!(summary.deleted, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.reclaimed_bytes, 14);

    assert!(!root.join("2024/IMG_0001.CR2").exists());
    assert!(!root.join("2024/IMG_0002.nef").exists());
    assert!(root.join("2024/IMG_0001.jpg").exists());
    assert!(root.join("2023/DSC_0003.ARW").exists());

    let deletions = load_table::<DeletionEntry>(&root.join(DELETION_LOG_NAME))?;
    assert_eq!(deletions.len(), 2);
    let entry = &deletions[&key(&root.join("2024/IMG_0001.CR2"))];
    assert_eq!(entry.original_size_bytes, 7);
    assert_eq!(
        entry.converted_to.as_deref(),
        Some(key(&root.join("2024/IMG_0001.jpg")).as_str())
    );
    assert!(!root.join(LOCK_FILE_NAME).exists());
    Ok(())
}

#[test]
fn missing_output_excludes_the_original() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = converted_library(dir.path())?;
    fs::remove_file(root.join("2024/IMG_0002.jpg"))?;

    let summary = run_deletion(&delete_options(&root), &mut ScriptedOperator::default())?;
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.excluded, 1);
    assert!(root.join("2024/IMG_0002.nef").exists());

    let deletions = load_table::<DeletionEntry>(&root.join(DELETION_LOG_NAME))?;
    assert!(!deletions.contains_key(&key(&root.join("2024/IMG_0002.nef"))));
    Ok(())
}

#[test]
fn batches_accumulate_in_one_deletion_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = converted_library(dir.path())?;
    let batched = DeleteOptions {
        batch_size: Some(1),
        ..delete_options(&root)
    };

    let first = run_deletion(&batched, &mut ScriptedOperator::default())?;
    assert_eq!(first.deleted, 1);
    assert_eq!(first.deferred, 1);

    let second = run_deletion(&batched, &mut ScriptedOperator::default())?;
    assert_eq!(second.deleted, 1);
    assert_eq!(second.deferred, 0);
    assert_eq!(second.excluded, 1);

    let deletions = load_table::<DeletionEntry>(&root.join(DELETION_LOG_NAME))?;
    assert_eq!(deletions.len(), 2);
    Ok(())
}

#[test]
fn declined_confirmation_deletes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = converted_library(dir.path())?;
    let mut operator = ScriptedOperator::default().confirming(false);

    let summary = run_deletion(
        &DeleteOptions {
            force: false,
            ..delete_options(&root)
        },
        &mut operator,
    )?;
    assert_eq!(operator.confirmations(), 1);
    assert!(summary.cancelled);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.skipped, 2);
    assert!(root.join("2024/IMG_0001.CR2").exists());
    assert!(!root.join(DELETION_LOG_NAME).exists());
    Ok(())
}

#[test]
fn confirmed_deletion_proceeds() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = converted_library(dir.path())?;
    let mut operator = ScriptedOperator::default().confirming(true);

    let summary = run_deletion(
        &DeleteOptions {
            force: false,
            ..delete_options(&root)
        },
        &mut operator,
    )?;
    assert_eq!(summary.deleted, 2);
    Ok(())
}

#[test]
fn missing_conversion_log_is_not_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write(&dir.path().join("a.cr2"), "raw");

    let summary = run_deletion(&delete_options(dir.path()), &mut ScriptedOperator::default())?;
    assert_eq!(summary.planned, 0);
    assert_eq!(summary.deleted, 0);
    assert!(dir.path().join("a.cr2").exists());
    Ok(())
}

#[test]
fn alternate_ledger_name_is_honoured() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = converted_library(dir.path())?;
    fs::rename(
        root.join(rawvert_core::CONVERSION_LOG_NAME),
        root.join("archive_log.json"),
    )?;

    let default_name = run_deletion(&delete_options(&root), &mut ScriptedOperator::default())?;
    assert_eq!(default_name.deleted, 0);

    let summary = run_deletion(
        &DeleteOptions {
            ledger_name: "archive_log.json".to_string(),
            ..delete_options(&root)
        },
        &mut ScriptedOperator::default(),
    )?;
    assert_eq!(summary.deleted, 2);
    Ok(())
}
