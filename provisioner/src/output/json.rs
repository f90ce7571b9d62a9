//! JSON output helpers.
//!
//! Every `--json` code path prints one pretty-printed document on stdout;
//! failures use the error-object schema below.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::domain::error::{AutomationError, ProvisionError};

/// Renders any read model as pretty JSON.
pub struct JsonRenderer;

impl JsonRenderer {
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", to_pretty(value)?);
        Ok(())
    }
}

/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_pretty<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("JSON serialization failed")
}

/// Format a JSON error object.
///
/// Output (pretty-printed):
/// ```json
/// {
///   "error": true,
///   "message": "...",
///   "code": "..."
/// }
/// ```
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn format_error(message: &str, code: &str) -> Result<String> {
    let obj = serde_json::json!({
        "error": true,
        "message": message,
        "code": code,
    });
    to_pretty(&obj)
}

/// Stable code for the `code` field of a JSON error object.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(e) = err.downcast_ref::<ProvisionError>() {
        return match e {
            ProvisionError::Validation(_) => "VALIDATION_FAILED",
            ProvisionError::InfraCall(_) => "INFRA_REJECTED",
            ProvisionError::InfraTimeout { .. } => "INFRA_TIMEOUT",
            ProvisionError::InfraResult(_) => "INFRA_FAILED",
            ProvisionError::ResourceExhausted { .. } => "PORTS_EXHAUSTED",
            ProvisionError::JobNotFound(_) => "JOB_NOT_FOUND",
            ProvisionError::DesktopNotFound(_) => "DESKTOP_NOT_FOUND",
        };
    }
    match err.downcast_ref::<AutomationError>() {
        Some(AutomationError::JobNotFound(_)) => "AUTOMATION_JOB_NOT_FOUND",
        Some(AutomationError::AlreadyFinished(_)) => "AUTOMATION_JOB_FINISHED",
        None => "ERROR",
    }
}
