//! # a3s-warden
//!
//! Intake security for the A3S ecosystem: risk classification of uploaded
//! files, sanitization of converted content, resource-bounded plugin
//! execution, and security event correlation.
//!
//! ## Overview
//!
//! A host wires the components together in this order:
//!
//! 1. [`FileValidator::validate`] classifies a file as `Safe`, `Suspicious`,
//!    `Dangerous` or `Unknown`, with one reason per finding.
//! 2. Only `Safe`/`Suspicious` files proceed to conversion; the converted
//!    output goes through [`sanitize_markdown`], [`sanitize_html`] and
//!    [`sanitize_filename`].
//! 3. Conversion plugins run inside a [`PluginSandbox`].
//! 4. Every classification and plugin outcome is reported to a
//!    [`SecurityEventMonitor`], which escalates bursts.
//!
//! The ordering is the host's contract; nothing here enforces it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_warden::{FileValidator, SecurityEvent, SecurityEventMonitor, WardenConfig};
//!
//! # fn example() -> a3s_warden::Result<()> {
//! let config = WardenConfig::default();
//! let validator = FileValidator::new(config.validator)?;
//! let monitor = SecurityEventMonitor::new(config.monitor)?;
//!
//! let validation = validator.validate("/uploads/report.pdf");
//! monitor.record(SecurityEvent::from_validation(&validation, "upload-api"));
//!
//! if validation.risk().is_cleared() {
//!     println!("sha256 {}", validation.content_hash());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **sniff**: magic-byte content type detection
//! - **validator**: the staged classification pipeline
//! - **sanitizer**: markdown, HTML and filename rewriting
//! - **sandbox**: isolated child processes with rlimits and a watchdog
//! - **monitor**: ring log, rate windows, correlation and alert callbacks

pub mod config;
pub mod error;
pub mod monitor;
pub mod sandbox;
pub mod sanitizer;
pub mod sniff;
pub mod types;
pub mod validator;

// Re-export core types
pub use config::{
    MonitorConfig, SandboxConfig, SandboxLimits, SandboxMode, ValidatorConfig, WardenConfig,
};
pub use error::{Result, WardenError};
pub use monitor::{AlertCallback, MonitorStats, SecurityEventMonitor};
pub use sandbox::{
    CancelHandle, Executable, Plugin, PluginCommand, PluginInput, PluginSandbox, RunningPlugin,
};
pub use sanitizer::{sanitize_filename, sanitize_html, sanitize_markdown};
pub use sniff::MimeType;
pub use types::{
    FileValidation, ResourceUsage, RiskLevel, SandboxFailure, SandboxResult, SecurityEvent,
    SecurityEventType, Severity,
};
pub use validator::FileValidator;
