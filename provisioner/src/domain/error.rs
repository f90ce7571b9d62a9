//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use thiserror::Error;

// ── Provisioning errors ───────────────────────────────────────────────────────

/// Failures that end a provisioning job or reject a request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Infra request rejected: {0}")]
    InfraCall(String),

    #[error("Timeout waiting infra result (task {task_id})")]
    InfraTimeout { task_id: String },

    #[error("Provision infra FAILED: {0}")]
    InfraResult(String),

    #[error("No available port in range {min}-{max}")]
    ResourceExhausted { min: u16, max: u16 },

    #[error("Job '{0}' not found.")]
    JobNotFound(String),

    #[error("Virtual desktop '{0}' not found.")]
    DesktopNotFound(String),
}

// ── Automation errors ─────────────────────────────────────────────────────────

/// Errors raised by tracked automation job management.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AutomationError {
    #[error("Automation job '{0}' not found.")]
    JobNotFound(String),

    #[error("Automation job '{0}' already finished.")]
    AlreadyFinished(String),
}
