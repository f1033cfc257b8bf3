use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sysinfo::Disks;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Severity, MIB};

pub const DEFAULT_REQUIRED_BYTES: u64 = 500 * MIB;

pub trait SpaceProbe {
    fn free_bytes(&mut self, path: &Path) -> Result<u64>;
}

pub struct SysinfoSpaceProbe {
    disks: Disks,
}

impl SysinfoSpaceProbe {
    pub fn new() -> Self {
        Self {
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoSpaceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceProbe for SysinfoSpaceProbe {
    fn free_bytes(&mut self, path: &Path) -> Result<u64> {
        self.disks.refresh_list();
        let canonical = path
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", path.display()))?;

        let mut best: Option<(u64, usize)> = None;
        for disk in self.disks.list() {
            let mount = disk.mount_point();
            if !canonical.starts_with(mount) {
                continue;
            }
            let score = mount.as_os_str().len();
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((disk.available_space(), score)),
            }
        }

        best.map(|(free, _)| free)
            .ok_or_else(|| anyhow!("no mounted disk found for {}", canonical.display()))
    }
}

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error(
        "insufficient disk space: {:.2} MB free, {:.2} MB required (use --force to proceed anyway)",
        megabytes(.free_bytes),
        megabytes(.required_bytes)
    )]
    InsufficientSpace { free_bytes: u64, required_bytes: u64 },
}

fn megabytes(bytes: &u64) -> f64 {
    *bytes as f64 / MIB as f64
}

#[derive(Debug, Clone)]
pub struct SpaceConfig {
    pub required_bytes: u64,
    pub prediction_min_samples: u64,
    pub output_estimate_bytes: Option<u64>,
    pub force: bool,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            required_bytes: DEFAULT_REQUIRED_BYTES,
            prediction_min_samples: 5,
            output_estimate_bytes: None,
            force: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceState {
    pub free_bytes: u64,
    pub bytes_written: u64,
    pub samples: u64,
    pub severity: Severity,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PauseContext {
    pub free_bytes: u64,
    pub required_bytes: u64,
    pub estimated_need_bytes: u64,
    pub remaining_files: u64,
    pub average_output_bytes: u64,
}

pub fn classify(free_bytes: u64, required_bytes: u64) -> Severity {
    if free_bytes < required_bytes {
        Severity::Critical
    } else if free_bytes < required_bytes.saturating_mul(2) {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

pub struct SpaceMonitor {
    probe: Box<dyn SpaceProbe>,
    target: PathBuf,
    config: SpaceConfig,
    state: SpaceState,
    since_check: u64,
}

impl SpaceMonitor {
    pub fn new(
        probe: Box<dyn SpaceProbe>,
        target: impl Into<PathBuf>,
        config: SpaceConfig,
    ) -> Self {
        let forced = config.force;
        Self {
            probe,
            target: target.into(),
            config,
            state: SpaceState {
                free_bytes: 0,
                bytes_written: 0,
                samples: 0,
                severity: Severity::Normal,
                forced,
            },
            since_check: 0,
        }
    }

    pub fn state(&self) -> &SpaceState {
        &self.state
    }

    pub fn severity(&self) -> Severity {
        self.state.severity
    }

    pub fn required_bytes(&self) -> u64 {
        self.config.required_bytes
    }

    pub fn preflight(&mut self) -> Result<Severity> {
        let free = match self.probe.free_bytes(&self.target) {
            Ok(free) => free,
            Err(err) if self.config.force => {
                warn!("could not determine free space ({err:#}); continuing because of --force");
                return Ok(self.state.severity);
            }
            Err(err) => return Err(err.context("pre-flight disk space check failed")),
        };
        self.state.free_bytes = free;
        self.state.severity = classify(free, self.config.required_bytes);
        info!(
            "available disk space: {:.2} MB ({})",
            free as f64 / MIB as f64,
            self.state.severity
        );

        if self.state.severity == Severity::Critical {
            if !self.config.force {
                return Err(PreflightError::InsufficientSpace {
                    free_bytes: free,
                    required_bytes: self.config.required_bytes,
                }
                .into());
            }
            warn!(
                "proceeding with low disk space ({:.2} MB); some conversions may fail",
                free as f64 / MIB as f64
            );
        }
        Ok(self.state.severity)
    }

    pub fn record_output(&mut self, bytes: u64) {
        self.state.bytes_written = self.state.bytes_written.saturating_add(bytes);
        self.state.samples += 1;
    }

    pub fn average_output_bytes(&self) -> Option<u64> {
        if self.state.samples >= self.config.prediction_min_samples.max(1) {
            return Some(self.state.bytes_written / self.state.samples);
        }
        self.config.output_estimate_bytes
    }

    pub fn estimated_need(&self, remaining_files: u64) -> Option<u64> {
        self.average_output_bytes()
            .map(|average| average.saturating_mul(remaining_files))
    }

    pub fn note_file(&mut self) -> bool {
        self.since_check += 1;
        self.since_check >= self.state.severity.check_interval()
    }

    pub fn checkpoint(&mut self, remaining_files: u64) -> Severity {
        self.since_check = 0;
        let free = match self.probe.free_bytes(&self.target) {
            Ok(free) => free,
            Err(err) => {
                warn!("disk space check failed: {err:#}");
                return self.state.severity;
            }
        };
        self.state.free_bytes = free;

        let raw = classify(free, self.config.required_bytes);
        let mut severity = raw;
        if let Some(need) = self.estimated_need(remaining_files) {
            if need > free {
                warn!(
                    "predicted space issue: need ~{:.1} MB for {} remaining file(s) but only {:.1} MB available",
                    need as f64 / MIB as f64,
                    remaining_files,
                    free as f64 / MIB as f64
                );
                if !self.state.forced {
                    severity = Severity::Paused;
                }
            }
        }

        if severity != self.state.severity {
            match severity {
                Severity::Normal => info!(
                    "disk space back to normal ({:.2} MB free)",
                    free as f64 / MIB as f64
                ),
                Severity::Warning => info!(
                    "disk space getting low: {:.2} MB available",
                    free as f64 / MIB as f64
                ),
                Severity::Critical => warn!(
                    "low disk space: only {:.2} MB available, {:.2} MB recommended",
                    free as f64 / MIB as f64,
                    self.config.required_bytes as f64 / MIB as f64
                ),
                Severity::Paused => {}
            }
        }
        self.state.severity = severity;
        severity
    }

    pub fn pause_context(&self, remaining_files: u64) -> PauseContext {
        PauseContext {
            free_bytes: self.state.free_bytes,
            required_bytes: self.config.required_bytes,
            estimated_need_bytes: self.estimated_need(remaining_files).unwrap_or(0),
            remaining_files,
            average_output_bytes: self.average_output_bytes().unwrap_or(0),
        }
    }

    pub fn force_continue(&mut self) -> Severity {
        self.state.forced = true;
        self.state.severity = classify(self.state.free_bytes, self.config.required_bytes);
        warn!(
            "space override: continuing despite predicted shortage (severity {})",
            self.state.severity
        );
        self.state.severity
    }
}
