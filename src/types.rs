//! Core value types shared by the validator, sandbox, and monitor
//!
//! All types serialize with snake_case enum tags so they can be handed to
//! external sinks unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Risk classification
// ---------------------------------------------------------------------------

/// How dangerous a file is believed to be.
///
/// `Safe < Suspicious < Dangerous` is a total order. `Unknown` sits outside
/// it: comparing `Unknown` with any known level yields `None`.
/// Combine levels with [`RiskLevel::merge`], never with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Suspicious,
    Dangerous,
    /// Classification could not complete
    Unknown,
}

impl RiskLevel {
    fn rank(self) -> Option<u8> {
        match self {
            RiskLevel::Safe => Some(0),
            RiskLevel::Suspicious => Some(1),
            RiskLevel::Dangerous => Some(2),
            RiskLevel::Unknown => None,
        }
    }

    /// Merge two levels.
    ///
    /// Known levels combine by maximum. `Unknown` is absorbing: an incomplete
    /// pipeline can't vouch for any earlier verdict, so the merged result is
    /// `Unknown` even over `Dangerous`.
    pub fn merge(self, other: RiskLevel) -> RiskLevel {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => {
                if a >= b {
                    self
                } else {
                    other
                }
            }
            _ => RiskLevel::Unknown,
        }
    }

    /// Whether a caller may proceed to conversion/sanitization.
    pub fn is_cleared(self) -> bool {
        matches!(self, RiskLevel::Safe | RiskLevel::Suspicious)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Suspicious => "suspicious",
            RiskLevel::Dangerous => "dangerous",
            RiskLevel::Unknown => "unknown",
        }
    }
}

impl PartialOrd for RiskLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one file.
///
/// Invariant: `risk() == Safe` iff `reasons()` is empty. Reasons are
/// append-only and kept in the order stages produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileValidation {
    path: PathBuf,
    risk: RiskLevel,
    reasons: Vec<String>,
    detected_type: String,
    size: u64,
    content_hash: String,
    metadata: Map<String, Value>,
}

impl FileValidation {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            risk: RiskLevel::Safe,
            reasons: Vec::new(),
            detected_type: String::new(),
            size: 0,
            content_hash: String::new(),
            metadata: Map::new(),
        }
    }

    /// Record a finding. The risk only ever moves up (or to `Unknown`).
    pub(crate) fn flag(&mut self, level: RiskLevel, reason: impl Into<String>) {
        if level == RiskLevel::Safe {
            return;
        }
        let merged = self.risk.merge(level);
        if merged == RiskLevel::Unknown && self.risk != RiskLevel::Unknown {
            self.metadata
                .insert("partial_risk".into(), Value::from(self.risk.as_str()));
        }
        self.risk = merged;
        self.reasons.push(reason.into());
    }

    pub(crate) fn set_detected_type(&mut self, mime: &str) {
        self.detected_type = mime.to_string();
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub(crate) fn set_content_hash(&mut self, hash: String) {
        self.content_hash = hash;
    }

    pub(crate) fn insert_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn risk(&self) -> RiskLevel {
        self.risk
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn detected_type(&self) -> &str {
        &self.detected_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hex SHA-256 of the content, empty when hashing was skipped
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// True when any reason contains `needle` (case-insensitive)
    pub fn has_reason(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.reasons
            .iter()
            .any(|r| r.to_lowercase().contains(&needle))
    }
}

// ---------------------------------------------------------------------------
// Sandbox outcomes
// ---------------------------------------------------------------------------

/// Why a sandboxed execution did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum SandboxFailure {
    /// Wall-clock or CPU-time ceiling hit, or execution cancelled
    #[error("timeout: {0}")]
    Timeout(String),
    /// Address-space ceiling hit
    #[error("memory exceeded: {0}")]
    MemoryExceeded(String),
    /// Non-zero exit, fatal signal, or plugin-reported failure
    #[error("crashed: {0}")]
    Crashed(String),
    /// Child finished but its output envelope could not be parsed
    #[error("invalid output: {0}")]
    InvalidOutput(String),
    /// The isolation boundary could not be constructed
    #[error("isolation setup error: {0}")]
    IsolationSetup(String),
}

impl SandboxFailure {
    pub fn detail(&self) -> &str {
        match self {
            SandboxFailure::Timeout(d)
            | SandboxFailure::MemoryExceeded(d)
            | SandboxFailure::Crashed(d)
            | SandboxFailure::InvalidOutput(d)
            | SandboxFailure::IsolationSetup(d) => d,
        }
    }
}

/// Resources consumed by one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User + system CPU time
    pub cpu_seconds: f64,
    /// Peak resident set size in bytes (0 when unavailable)
    pub peak_memory: u64,
    pub wall_seconds: f64,
}

/// Outcome of one plugin execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxFailure>,
    pub resource_usage: ResourceUsage,
}

impl SandboxResult {
    pub fn ok(result: Value, resource_usage: ResourceUsage) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            resource_usage,
        }
    }

    pub fn failed(error: SandboxFailure, resource_usage: ResourceUsage) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            resource_usage,
        }
    }

    /// Build a result for an execution whose isolation boundary never came up.
    ///
    /// `PluginSandbox::execute` returns such failures as `Err`; hosts that
    /// want to report them to the monitor convert them with this.
    pub fn setup_failed(detail: impl Into<String>) -> Self {
        Self::failed(
            SandboxFailure::IsolationSetup(detail.into()),
            ResourceUsage::default(),
        )
    }
}

// ---------------------------------------------------------------------------
// Security events
// ---------------------------------------------------------------------------

/// Kind of security event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    FileUpload,
    FileValidationFailed,
    MaliciousFileDetected,
    PluginExecution,
    PluginViolation,
    UnauthorizedAccess,
    AuthenticationFailure,
    ConfigurationChange,
    /// Escalation emitted by the monitor itself
    SuspiciousActivity,
}

impl SecurityEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityEventType::FileUpload => "file_upload",
            SecurityEventType::FileValidationFailed => "file_validation_failed",
            SecurityEventType::MaliciousFileDetected => "malicious_file_detected",
            SecurityEventType::PluginExecution => "plugin_execution",
            SecurityEventType::PluginViolation => "plugin_violation",
            SecurityEventType::UnauthorizedAccess => "unauthorized_access",
            SecurityEventType::AuthenticationFailure => "authentication_failure",
            SecurityEventType::ConfigurationChange => "configuration_change",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a security event
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A recorded security event.
///
/// Immutable once recorded except for `resolved`, which only an operator
/// flips through `SecurityEventMonitor::resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub source: String,
    pub description: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub resolved: bool,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: Severity,
        source: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            severity,
            source: source.into(),
            description: description.into(),
            details: Map::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            resolved: false,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp (Unix milliseconds)
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Event describing a file classification
    pub fn from_validation(validation: &FileValidation, source: impl Into<String>) -> Self {
        let (event_type, severity) = match validation.risk() {
            RiskLevel::Safe => (SecurityEventType::FileUpload, Severity::Low),
            RiskLevel::Suspicious => (SecurityEventType::FileValidationFailed, Severity::Medium),
            RiskLevel::Dangerous => (SecurityEventType::MaliciousFileDetected, Severity::High),
            RiskLevel::Unknown => (SecurityEventType::FileValidationFailed, Severity::Medium),
        };
        let description = if validation.reasons().is_empty() {
            format!("File {} passed validation", validation.path().display())
        } else {
            format!(
                "File {} classified {}: {}",
                validation.path().display(),
                validation.risk(),
                validation.reasons().join("; ")
            )
        };

        Self::new(event_type, severity, source, description)
            .with_detail("path", validation.path().display().to_string())
            .with_detail("risk", validation.risk().as_str())
            .with_detail("reasons", validation.reasons().to_vec())
            .with_detail("detected_type", validation.detected_type())
            .with_detail("size", validation.size())
            .with_detail("content_hash", validation.content_hash())
    }

    /// Event describing a plugin execution outcome
    pub fn from_sandbox(
        result: &SandboxResult,
        plugin: &str,
        source: impl Into<String>,
    ) -> Self {
        let (event_type, severity, description) = match &result.error {
            None => (
                SecurityEventType::PluginExecution,
                Severity::Low,
                format!("Plugin {} completed", plugin),
            ),
            Some(failure @ (SandboxFailure::Timeout(_) | SandboxFailure::MemoryExceeded(_))) => (
                SecurityEventType::PluginViolation,
                Severity::High,
                format!("Plugin {} hit a resource ceiling: {}", plugin, failure),
            ),
            Some(failure) => (
                SecurityEventType::PluginViolation,
                Severity::Medium,
                format!("Plugin {} failed: {}", plugin, failure),
            ),
        };

        let mut event = Self::new(event_type, severity, source, description)
            .with_detail("plugin", plugin)
            .with_detail("success", result.success)
            .with_detail("cpu_seconds", result.resource_usage.cpu_seconds)
            .with_detail("peak_memory", result.resource_usage.peak_memory)
            .with_detail("wall_seconds", result.resource_usage.wall_seconds);
        if let Some(failure) = &result.error {
            event = event.with_detail(
                "error",
                serde_json::to_value(failure).unwrap_or(Value::Null),
            );
        }
        event
    }
}
