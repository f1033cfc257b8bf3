use std::path::Path;

use anyhow::{Context, Result};
use rawvert_core::METADATA_WARNING_TARGET;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Keep the returned guard alive until exit so the log file is flushed.
pub fn init_tracing(
    log_file: Option<(&Path, &str)>,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let filter = quiet_metadata_warnings(base, verbose)?;

    let (file_layer, guard) = match log_file {
        Some((dir, name)) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(name)
                .build(dir)
                .with_context(|| format!("failed to open log file {}", dir.join(name).display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .compact(),
        )
        .with(file_layer)
        .with(filter)
        .try_init();

    Ok(guard)
}

fn quiet_metadata_warnings(filter: EnvFilter, verbose: bool) -> Result<EnvFilter> {
    if verbose {
        return Ok(filter);
    }
    let directive = format!("{METADATA_WARNING_TARGET}=off")
        .parse::<Directive>()
        .context("invalid metadata warning directive")?;
    Ok(filter.add_directive(directive))
}
