mod logging;
mod prompt;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand};
use rawvert_core::{
    check_tools, collect_doctor_info, run_deletion, ConvertOptions, Converter, DcrawDecoder,
    DecodeOptions, DeleteOptions, ExiftoolTransfer, RunOutcome, CONVERSION_LOG_NAME,
    CONVERSION_RUN_LOG_NAME, DELETION_RUN_LOG_NAME,
};

use crate::logging::init_tracing;
use crate::prompt::TerminalOperator;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Parser)]
#[command(
    name = "rawvert",
    version,
    about = "Convert camera raw files to JPEG, resumably and without running out of disk space."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert every raw file under a directory to JPEG.
    Convert(ConvertArgs),
    /// Delete raw originals that have a verified JPEG conversion.
    Delete(DeleteArgs),
    /// Show helper tool availability, free space and ledger state.
    Doctor(DoctorArgs),
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Directory containing raw files.
    #[arg(long = "dir", short = 'd', default_value = ".", value_name = "DIR")]
    directory: PathBuf,

    /// Required free space in MB.
    #[arg(long, default_value_t = 500, value_name = "MB")]
    space: u64,

    /// Continue even if disk space is low.
    #[arg(long)]
    force: bool,

    /// Show metadata tool warnings and per-file detail.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Do not retry files recorded as corrupt by an earlier run.
    #[arg(long)]
    skip_corrupt: bool,

    /// Exclude glob patterns (repeatable).
    #[arg(long = "exclude", value_name = "GLOB", num_args = 1.., action = ArgAction::Append)]
    exclude: Vec<String>,

    /// Write JPEGs under this directory, mirroring the source tree.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = 95)]
    quality: u8,

    /// Expected JPEG size in MB, used for space predictions until enough files are converted.
    #[arg(long, value_name = "MB")]
    estimate: Option<u64>,

    /// Raw decoder program.
    #[arg(long, default_value = "dcraw", value_name = "PROGRAM")]
    dcraw: PathBuf,

    /// Metadata transfer program.
    #[arg(long, default_value = "exiftool", value_name = "PROGRAM")]
    exiftool: PathBuf,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    /// Directory containing the conversion logs.
    #[arg(long = "dir", short = 'd', default_value = ".", value_name = "DIR")]
    directory: PathBuf,

    /// Name of the conversion log file.
    #[arg(long, default_value = CONVERSION_LOG_NAME, value_name = "NAME")]
    log: String,

    /// Delete without confirmation.
    #[arg(long)]
    force: bool,

    /// Limit the number of files to delete in one run.
    #[arg(long, value_name = "N")]
    batch: Option<usize>,

    /// List every file of the plan in the log.
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Debug, Args)]
struct DoctorArgs {
    /// Directory to inspect.
    #[arg(long = "dir", short = 'd', value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert(args) => run_convert_command(args),
        Commands::Delete(args) => run_delete_command(args),
        Commands::Doctor(args) => {
            init_tracing(None, false)?;
            run_doctor_command(args)
        }
    }
}

fn run_convert_command(args: ConvertArgs) -> Result<()> {
    let ConvertArgs {
        directory,
        space,
        force,
        verbose,
        skip_corrupt,
        exclude,
        output_dir,
        quality,
        estimate,
        dcraw,
        exiftool,
    } = args;

    if !directory.is_dir() {
        bail!(
            "the specified directory '{}' does not exist or is not a directory",
            directory.display()
        );
    }
    let _guard = init_tracing(Some((&directory, CONVERSION_RUN_LOG_NAME)), verbose)?;

    let decoder = DcrawDecoder::new(dcraw);
    let metadata = ExiftoolTransfer::new(exiftool);
    let missing = check_tools(&decoder, &metadata)
        .into_iter()
        .filter(|tool| !tool.available)
        .map(|tool| format!("{} ({})", tool.name, tool.detail.unwrap_or(tool.program)))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        bail!("required tools are unavailable: {}", missing.join("; "));
    }

    let options = ConvertOptions {
        root: directory,
        required_bytes: space.saturating_mul(MB),
        force,
        verbose,
        skip_corrupt,
        excludes: exclude,
        output_dir,
        jpeg_quality: quality,
        output_estimate_bytes: estimate.map(|mb| mb.saturating_mul(MB)),
        decode: DecodeOptions::default(),
        ..ConvertOptions::default()
    };

    let summary = Converter::new(options)
        .with_decoder(decoder)
        .with_metadata(metadata)
        .run(&mut TerminalOperator)?;

    println!();
    if summary.outcome == RunOutcome::Stopped {
        println!("Conversion stopped; progress saved. Rerun to continue.");
    }
    println!("Conversion complete: {}", summary.headline());
    println!(
        "Directories: {} visited, {} with raw files. Output written: {:.1} MB.",
        summary.directories_visited,
        summary.directories_with_raw,
        summary.bytes_written as f64 / MB as f64
    );
    if !summary.corrupt_files.is_empty() {
        println!("Corrupt files:");
        for path in &summary.corrupt_files {
            println!("- {path}");
        }
    }
    println!("Total time: {:.1}s", summary.elapsed_ms as f64 / 1000.0);

    Ok(())
}

fn run_delete_command(args: DeleteArgs) -> Result<()> {
    if !args.directory.is_dir() {
        bail!(
            "the specified directory '{}' does not exist or is not a directory",
            args.directory.display()
        );
    }
    let _guard = init_tracing(Some((&args.directory, DELETION_RUN_LOG_NAME)), args.verbose)?;

    let options = DeleteOptions {
        root: args.directory,
        ledger_name: args.log,
        force: args.force,
        batch_size: args.batch,
        verbose: args.verbose,
    };
    let summary = run_deletion(&options, &mut TerminalOperator)?;

    println!();
    println!("Deletion Summary:");
    println!("  Deleted: {}", summary.deleted);
    println!("  Skipped: {}", summary.skipped);
    println!("  Errors:  {}", summary.errors);
    if summary.excluded > 0 {
        println!("  Excluded (failed verification): {}", summary.excluded);
    }
    if summary.deferred > 0 {
        println!("  Left for a later run (--batch): {}", summary.deferred);
    }
    println!("  Reclaimed: {:.1} MB", summary.reclaimed_bytes as f64 / MB as f64);

    Ok(())
}

fn run_doctor_command(args: DoctorArgs) -> Result<()> {
    let info = collect_doctor_info(args.directory.as_deref());
    if args.json {
        let payload =
            serde_json::to_string_pretty(&info).context("failed to serialize doctor report")?;
        println!("{payload}");
        return Ok(());
    }

    println!("OS: {} ({})", info.os, info.arch);
    if let Some(current_dir) = info.current_dir {
        println!("Current directory: {}", current_dir);
    }
    for tool in &info.tools {
        println!(
            "- {} [{}] available={} {}",
            tool.name,
            tool.program,
            tool.available,
            tool.detail.as_deref().unwrap_or("")
        );
    }
    if let Some(root) = info.root {
        println!("Directory: {}", root);
    }
    if let Some(free) = info.free_space_bytes {
        println!("Free space: {}", human_bytes(free));
    }
    if let Some(converted) = info.converted {
        println!("Converted entries: {}", converted);
    }
    if let Some(corrupt) = info.corrupt {
        println!("Corrupt entries: {}", corrupt);
    }
    if let Some(deleted) = info.deleted {
        println!("Deleted entries: {}", deleted);
    }
    if let Some(lock) = info.lock {
        println!(
            "Lock held by run {} (pid {}) since {}",
            lock.run_id, lock.pid, lock.started_at
        );
    }
    for note in info.notes {
        println!("Note: {}", note);
    }

    Ok(())
}

fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
