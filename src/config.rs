//! Configuration consumed from the host
//!
//! Loading and layering configuration is the host's concern; this module only
//! defines the typed shape (serde, with defaults for every field) and the
//! preconditions each component relies on.

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration for all warden components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub validator: ValidatorConfig,
    pub sandbox: SandboxConfig,
    pub monitor: MonitorConfig,
}

impl WardenConfig {
    /// Check every component's preconditions
    pub fn validate(&self) -> Result<()> {
        self.validator.validate()?;
        self.sandbox.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// File validator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Absolute size ceiling in bytes; larger files are Dangerous
    pub max_file_size: u64,
    /// Per-MIME size ceilings in bytes; exceeding one is Suspicious
    pub type_size_limits: HashMap<String, u64>,
    /// When non-empty, files must live under one of these directories
    pub allowed_directories: Vec<PathBuf>,
    /// Files under these directories are Dangerous
    pub restricted_directories: Vec<PathBuf>,
    /// Bytes scanned for markup/script signatures
    pub content_scan_bytes: usize,
    /// Bytes of a PDF scanned for interactive actions
    pub pdf_scan_bytes: usize,
    /// Uncompressed/compressed ratio above which an archive is Suspicious
    pub max_compression_ratio: f64,
    /// Deepest allowed path nesting inside an archive
    pub max_archive_depth: usize,
    /// Most entries allowed inside an archive
    pub max_archive_entries: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        let mut type_size_limits = HashMap::new();
        type_size_limits.insert("application/pdf".to_string(), 50 * MIB);
        type_size_limits.insert("application/zip".to_string(), 100 * MIB);
        type_size_limits.insert("text/plain".to_string(), 10 * MIB);
        type_size_limits.insert("text/html".to_string(), 10 * MIB);
        type_size_limits.insert(
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string(),
            50 * MIB,
        );
        type_size_limits.insert(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
            50 * MIB,
        );
        type_size_limits.insert(
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
                .to_string(),
            100 * MIB,
        );

        Self {
            max_file_size: 100 * MIB,
            type_size_limits,
            allowed_directories: Vec::new(),
            restricted_directories: Vec::new(),
            content_scan_bytes: 8 * 1024,
            pdf_scan_bytes: 64 * 1024,
            max_compression_ratio: 100.0,
            max_archive_depth: 20,
            max_archive_entries: 10_000,
        }
    }
}

const MIB: u64 = 1024 * 1024;

impl ValidatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(WardenError::Config(
                "validator.max_file_size must be greater than zero".into(),
            ));
        }
        if let Some((mime, _)) = self.type_size_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(WardenError::Config(format!(
                "validator.type_size_limits[{}] must be greater than zero",
                mime
            )));
        }
        if self.content_scan_bytes == 0 || self.pdf_scan_bytes == 0 {
            return Err(WardenError::Config(
                "validator scan windows must be greater than zero".into(),
            ));
        }
        if !self.max_compression_ratio.is_finite() || self.max_compression_ratio <= 1.0 {
            return Err(WardenError::Config(format!(
                "validator.max_compression_ratio must be a finite value above 1, got {}",
                self.max_compression_ratio
            )));
        }
        if self.max_archive_depth == 0 || self.max_archive_entries == 0 {
            return Err(WardenError::Config(
                "validator archive limits must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Isolation strength for plugin execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Separate process, reduced environment, rlimits, wall-clock watchdog
    #[default]
    Isolated,
    /// No process boundary for callables; wall-clock timeout only.
    /// Only for code the host already trusts. A callable that overruns is
    /// abandoned, not killed, and keeps its concurrency slot until it returns.
    Trusted,
}

/// Resource ceilings for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Address-space ceiling in bytes
    pub max_memory: u64,
    pub max_cpu_seconds: u64,
    pub max_wall_seconds: u64,
    pub max_open_files: u64,
    pub max_processes: u64,
    /// Largest file the child may write, in bytes
    pub max_output_file_size: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_memory: 512 * MIB,
            max_cpu_seconds: 30,
            max_wall_seconds: 60,
            max_open_files: 64,
            max_processes: 16,
            max_output_file_size: 16 * MIB,
        }
    }
}

impl SandboxLimits {
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("max_memory", self.max_memory),
            ("max_cpu_seconds", self.max_cpu_seconds),
            ("max_wall_seconds", self.max_wall_seconds),
            ("max_open_files", self.max_open_files),
            ("max_processes", self.max_processes),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);

        match zero {
            Some((name, _)) => Err(WardenError::Config(format!(
                "sandbox limit {} must be greater than zero",
                name
            ))),
            None => Ok(()),
        }
    }
}

/// Plugin sandbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    /// Limits used when the caller doesn't pass its own
    pub default_limits: SandboxLimits,
    /// Concurrent executions allowed across the sandbox instance
    pub max_concurrent: usize,
    /// Environment variables inherited by the child
    pub env_allowlist: Vec<String>,
    /// Captured bytes per output stream
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Isolated,
            default_limits: SandboxLimits::default(),
            max_concurrent: 4,
            env_allowlist: ["PATH", "LANG", "LC_ALL", "LD_LIBRARY_PATH", "SYSTEMROOT"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_output_bytes: MIB as usize,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(WardenError::Config(
                "sandbox.max_concurrent must be greater than zero".into(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(WardenError::Config(
                "sandbox.max_output_bytes must be greater than zero".into(),
            ));
        }
        self.default_limits.validate()
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Security event monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Ring log capacity; oldest events are evicted beyond it
    pub log_capacity: usize,
    /// Trailing window for per-(type, source) rate tracking
    pub rate_window_secs: u64,
    /// Events per key within the window above which activity is escalated
    pub rate_threshold: usize,
    /// Period of the background correlation pass
    pub correlation_interval_secs: u64,
    /// How far back the correlation pass looks
    pub correlation_lookback_secs: u64,
    /// Malicious-file events above which a High escalation is raised
    pub dangerous_file_threshold: usize,
    /// Unauthorized-access events above which a Medium escalation is raised
    pub unauthorized_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_capacity: 1000,
            rate_window_secs: 3600,
            rate_threshold: 5,
            correlation_interval_secs: 60,
            correlation_lookback_secs: 300,
            dangerous_file_threshold: 3,
            unauthorized_threshold: 5,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_capacity == 0 {
            return Err(WardenError::Config(
                "monitor.log_capacity must be greater than zero".into(),
            ));
        }
        if self.rate_window_secs == 0
            || self.correlation_interval_secs == 0
            || self.correlation_lookback_secs == 0
        {
            return Err(WardenError::Config(
                "monitor windows and intervals must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
