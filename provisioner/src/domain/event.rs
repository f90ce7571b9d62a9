//! Decoding of provider result messages into one tagged event type.
//!
//! Messages arrive as JSON (success and delete results) or as free text
//! (errors, sometimes with embedded JSON). The shape is chosen by which
//! fields are present, then decoded into a normalized instance list before
//! any business logic sees it.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use vdi_common::InstanceAddress;

use crate::domain::text::strip_control;

/// Resource type carrying compute instances in provider output.
pub const COMPUTE_RESOURCE_TYPE: &str = "openstack_compute_instance_v2";

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r#"identifier['"]\s*[:=]\s*['"]([^'"]+)['"]"#).expect("valid regex")
});

// ── Event types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraEvent {
    Success {
        task_id: String,
        payload: SuccessPayload,
    },
    Error {
        task_id: String,
        message: String,
    },
    DeleteResult {
        task_id: String,
        ok: bool,
        raw: String,
    },
}

impl InfraEvent {
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::Success { task_id, .. }
            | Self::Error { task_id, .. }
            | Self::DeleteResult { task_id, .. } => task_id,
        }
    }
}

/// The three success layouts the provider emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessPayload {
    /// `created_resources` only.
    SingleVm { resources: Vec<CreatedResource> },
    /// `created_resources` plus `pfsense_config.network` naming the external address.
    Organization {
        resources: Vec<CreatedResource>,
        networks: Vec<ApplianceNetwork>,
    },
    /// `added_resources`, a flat list of instances added to an existing project.
    BatchAddResource { added: Vec<AddedResource> },
}

impl SuccessPayload {
    /// Flatten to one `{instance_id, local_ip, public_ip}` entry per instance.
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceAddress> {
        match self {
            Self::SingleVm { resources } => compute_instances(resources, None),
            Self::Organization {
                resources,
                networks,
            } => {
                let external = networks
                    .iter()
                    .filter_map(|n| n.fixed_ip_v4.as_deref())
                    .find(|ip| !ip.trim().is_empty());
                compute_instances(resources, external)
            }
            Self::BatchAddResource { added } => added
                .iter()
                .map(|a| InstanceAddress {
                    instance_id: a.instance_id.clone(),
                    local_ip: a.access_ip_v4.clone(),
                    public_ip: None,
                })
                .collect(),
        }
    }
}

fn compute_instances(
    resources: &[CreatedResource],
    public_ip: Option<&str>,
) -> Vec<InstanceAddress> {
    resources
        .iter()
        .filter(|r| r.kind == COMPUTE_RESOURCE_TYPE)
        .flat_map(|r| r.instances.iter())
        .filter_map(|i| i.attributes.as_ref())
        .filter_map(|a| {
            Some(InstanceAddress {
                instance_id: a.id.clone()?,
                local_ip: a.access_ip_v4.clone().unwrap_or_default(),
                public_ip: public_ip.map(str::to_string),
            })
        })
        .collect()
}

// ── Wire shapes ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedResource {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub instances: Vec<ResourceInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceInstance {
    #[serde(default)]
    pub attributes: Option<InstanceAttributes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceAttributes {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub access_ip_v4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplianceNetwork {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fixed_ip_v4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddedResource {
    #[serde(alias = "id")]
    pub instance_id: String,
    #[serde(default)]
    pub access_ip_v4: String,
}

#[derive(Deserialize)]
struct PfsenseConfig {
    #[serde(default)]
    network: Vec<ApplianceNetwork>,
}

#[derive(Deserialize)]
struct SuccessEnvelope {
    #[serde(default)]
    created_resources: Option<Vec<CreatedResource>>,
    #[serde(default)]
    added_resources: Option<Vec<AddedResource>>,
    #[serde(default)]
    pfsense_config: Option<PfsenseConfig>,
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// A message that cannot be tied to any task.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("infra message dropped: {reason}")]
pub struct UndecodableEvent {
    pub reason: &'static str,
}

/// Decode one raw channel message.
///
/// # Errors
///
/// Returns `UndecodableEvent` when no task identifier can be recovered.
pub fn decode(body: &str) -> Result<InfraEvent, UndecodableEvent> {
    let cleaned = strip_control(body);

    if let Ok(whole) = serde_json::from_str::<Value>(&cleaned) {
        if is_delete_result(&whole) {
            let task_id = identifier_of(&whole).ok_or(UndecodableEvent {
                reason: "delete result without identifier",
            })?;
            return Ok(InfraEvent::DeleteResult {
                task_id,
                ok: result_flag(&whole["result"]),
                raw: body.to_string(),
            });
        }
    }

    if let Some(candidate) = outer_json(&cleaned) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if has_resources(&value) {
                if let (Some(task_id), Ok(payload)) =
                    (identifier_of(&value), success_payload(value))
                {
                    return Ok(InfraEvent::Success { task_id, payload });
                }
            }
        }
    }

    let task_id = IDENTIFIER
        .captures(&cleaned)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(UndecodableEvent {
            reason: "no identifier in message",
        })?;
    Ok(InfraEvent::Error {
        task_id,
        message: cleaned.trim().to_string(),
    })
}

fn is_delete_result(v: &Value) -> bool {
    v.get("identifier").is_some() && v.get("result").is_some() && !has_resources(v)
}

fn has_resources(v: &Value) -> bool {
    v.get("created_resources").is_some() || v.get("added_resources").is_some()
}

fn identifier_of(v: &Value) -> Option<String> {
    match v.get("identifier")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn result_flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn outer_json(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

fn success_payload(value: Value) -> Result<SuccessPayload, serde_json::Error> {
    let envelope: SuccessEnvelope = serde_json::from_value(value)?;
    if let Some(added) = envelope.added_resources {
        return Ok(SuccessPayload::BatchAddResource { added });
    }
    let resources = envelope.created_resources.unwrap_or_default();
    Ok(match envelope.pfsense_config {
        Some(cfg) if !cfg.network.is_empty() => SuccessPayload::Organization {
            resources,
            networks: cfg.network,
        },
        _ => SuccessPayload::SingleVm { resources },
    })
}
