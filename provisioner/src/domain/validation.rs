//! Request validation. Every check returns a `Result`; nothing here panics or
//! performs I/O.

use std::collections::BTreeMap;

use vdi_common::{AppDefinition, AppRequest, ProvisionMode, ProvisionRequest};

use crate::domain::error::ProvisionError;

/// Fields every desktop needs before any infrastructure is requested.
pub const REQUIRED_IDENTITY_FIELDS: [&str; 4] =
    ["name", "username_of_vdi", "user_id", "project_id"];

/// Validate a whole request against the app catalog.
///
/// # Errors
///
/// Returns `ProvisionError::Validation` naming the first problem found.
pub fn validate_request(
    mode: ProvisionMode,
    request: &ProvisionRequest,
    catalog: &[AppDefinition],
) -> Result<(), ProvisionError> {
    validate_identity(request)?;
    for app in &request.apps {
        let def = catalog
            .iter()
            .find(|d| d.code == app.code)
            .ok_or_else(|| ProvisionError::Validation(format!("unknown app '{}'", app.code)))?;
        validate_app_vars(def, app)?;
    }
    validate_domain_plan(mode, request)
}

/// # Errors
///
/// Returns `ProvisionError::Validation` listing every blank identity field.
pub fn validate_identity(request: &ProvisionRequest) -> Result<(), ProvisionError> {
    let values = [
        &request.name,
        &request.username_of_vdi,
        &request.user_id,
        &request.project_id,
    ];
    let missing: Vec<&str> = REQUIRED_IDENTITY_FIELDS
        .iter()
        .zip(values)
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| *k)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )))
    }
}

/// # Errors
///
/// Returns `ProvisionError::Validation` when a required variable is absent or blank.
pub fn validate_app_vars(def: &AppDefinition, app: &AppRequest) -> Result<(), ProvisionError> {
    let missing = missing_vars(&def.required_vars, &app.vars);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "app '{}' missing required vars: {}",
            def.code,
            missing.join(", ")
        )))
    }
}

/// Required keys that are absent or hold only whitespace.
#[must_use]
pub fn missing_vars(required: &[String], vars: &BTreeMap<String, String>) -> Vec<String> {
    required
        .iter()
        .filter(|k| vars.get(*k).is_none_or(|v| v.trim().is_empty()))
        .cloned()
        .collect()
}

/// # Errors
///
/// Returns `ProvisionError::Validation` when the domain section lacks what the mode needs.
pub fn validate_domain_plan(
    mode: ProvisionMode,
    request: &ProvisionRequest,
) -> Result<(), ProvisionError> {
    let Some(plan) = &request.domain else {
        return Ok(());
    };
    let needed: Vec<(&str, &str)> = if mode.is_incremental() {
        vec![
            ("ou_name", plan.ou_name.as_str()),
            ("group_name", plan.group_name.as_str()),
            ("user_pass", plan.user_pass.as_str()),
        ]
    } else if mode == ProvisionMode::Organization && plan.bootstrap_controller {
        vec![
            ("domain_name", plan.domain_name.as_str()),
            ("ou_name", plan.ou_name.as_str()),
            ("admin_user_name", plan.admin_user_name.as_str()),
            ("admin_user_pass", plan.admin_user_pass.as_str()),
        ]
    } else {
        Vec::new()
    };
    let missing: Vec<&str> = needed
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "domain plan missing: {}",
            missing.join(", ")
        )))
    }
}

/// Windows version used for per-desktop roles: first app override, then the
/// request's, then `default`.
#[must_use]
pub fn pick_win_version(request: &ProvisionRequest, default: &str) -> String {
    request
        .apps
        .iter()
        .filter_map(|a| a.win_version.as_deref())
        .chain(request.win_version.as_deref())
        .find(|v| !v.trim().is_empty())
        .unwrap_or(default)
        .to_string()
}
