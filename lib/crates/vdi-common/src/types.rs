use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Provisioning mode ─────────────────────────────────────────────────────────

/// How a batch of desktops is provisioned and where its public address comes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ProvisionMode {
    /// Single tenant; desktops share one configured public address.
    Personal,
    /// Multi tenant; the provider allocates a dedicated external network.
    Organization,
    /// Adds desktops to an existing organization project.
    AddResourceOrganization,
    /// Adds desktops to an existing personal project.
    AddResourcePersonal,
}

impl ProvisionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Organization => "organization",
            Self::AddResourceOrganization => "add_resource_organization",
            Self::AddResourcePersonal => "add_resource_personal",
        }
    }

    /// Incremental modes reuse the project's existing public address and domain.
    #[must_use]
    pub fn is_incremental(self) -> bool {
        matches!(
            self,
            Self::AddResourceOrganization | Self::AddResourcePersonal
        )
    }

    /// Only organization mode gets a dedicated appliance interface.
    #[must_use]
    pub fn assigns_interface(self) -> bool {
        self == Self::Organization
    }
}

impl fmt::Display for ProvisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown mode string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provisioning mode '{0}'")]
pub struct UnknownMode(pub String);

impl FromStr for ProvisionMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "personal" => Ok(Self::Personal),
            "organization" => Ok(Self::Organization),
            "add_resource_organization" => Ok(Self::AddResourceOrganization),
            "add_resource_personal" => Ok(Self::AddResourcePersonal),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

// ── Jobs and timeline ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    PartialFailed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::PartialFailed)
    }
}

/// One submitted provisioning batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningJob {
    pub id: String,
    pub mode: ProvisionMode,
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub status: JobStatus,
    pub total_vms: u32,
    pub success_vms: u32,
    pub failed_vms: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningJob {
    #[must_use]
    pub fn new(
        id: String,
        mode: ProvisionMode,
        requester: String,
        region: Option<String>,
        total_vms: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            mode,
            requester,
            region,
            status: JobStatus::Pending,
            total_vms,
            success_vms: 0,
            failed_vms: 0,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Info,
    Success,
    Failed,
}

/// Append-only timeline entry. `vd_id` is `None` for job-level steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStep {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vd_id: Option<String>,
    pub step: String,
    pub status: StepStatus,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

// ── Infra tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfraTaskStatus {
    Provisioning,
    Success,
    Failed,
    Deleting,
    Deleted,
    DeleteFailed,
}

impl InfraTaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Provisioning | Self::Deleting)
    }
}

/// One compute instance reported by the provider, already normalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceAddress {
    pub instance_id: String,
    pub local_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

/// What a deletion task should clean up once the provider confirms it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeleteTarget {
    Desktop { vd_id: String, instance_id: String },
    Project { project_id: String },
}

/// Durable record of one provider request and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraTask {
    pub task_id: String,
    pub status: InfraTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra_id: Option<String>,
    #[serde(default)]
    pub expected_count: u32,
    #[serde(default)]
    pub instances: Vec<InstanceAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_target: Option<DeleteTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InfraTask {
    #[must_use]
    pub fn new(task_id: &str, status: InfraTaskStatus, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            infra_id: None,
            expected_count: 0,
            instances: Vec::new(),
            error: None,
            delete_target: None,
            raw_result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Virtual desktops ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesktopStatus {
    Created,
    AssignIfError,
    NatError,
    AppError,
    Ready,
    ReadyWithWarn,
    Error,
}

impl DesktopStatus {
    /// Statuses counted as a successful desktop in the job aggregate.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::ReadyWithWarn)
    }
}

/// Directory metadata recorded on a desktop that hosts or joined a domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainInfo {
    pub domain_name: String,
    pub ou_name: String,
    pub admin_user: String,
    pub admin_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualDesktop {
    pub id: String,
    pub name: String,
    pub job_id: String,
    pub project_id: String,
    pub user_id: String,
    pub instance_id: String,
    pub ip_local: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_public: Option<String>,
    pub rdp_port_public: u16,
    pub winrm_port_public: u16,
    pub local_port: u16,
    pub admin_username: String,
    pub password: String,
    #[serde(default)]
    pub is_domain_controller: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainInfo>,
    pub status: DesktopStatus,
    #[serde(default)]
    pub winrm_disabled: bool,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Applications ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppActionType {
    #[default]
    Install,
    Config,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Per-desktop, per-app deployment record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppDeployment {
    pub id: String,
    pub job_id: String,
    pub vd_id: String,
    pub app_code: String,
    pub action_type: AppActionType,
    pub status: AppStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ── Automation jobs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutomationStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl AutomationStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of a tracked automation job's retry state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationJob {
    pub id: String,
    pub status: AutomationStatus,
    /// 1-based number of the attempt currently or last running; 0 before the first.
    pub attempt: u32,
    pub max_retries: u32,
    /// Delay before the next attempt, set while a retry is scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_backoff_ms: Option<u64>,
    pub log_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// One application the caller wants installed or configured on every desktop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AppRequest {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<AppActionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_version: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Directory-service work requested alongside the desktops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DomainPlan {
    /// Organization mode: promote the first desktop to domain controller.
    #[serde(default)]
    pub bootstrap_controller: bool,
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub ou_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub admin_user_name: String,
    #[serde(default)]
    pub admin_user_pass: String,
    /// Password for accounts created for new desktops in incremental modes.
    #[serde(default)]
    pub user_pass: String,
}

fn default_count() -> u32 {
    1
}

/// A provisioning request as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username_of_vdi: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub base_vol_id: String,
    #[serde(default)]
    pub vol_size: u32,
    #[serde(default)]
    pub flavor_id: String,
    #[serde(default)]
    pub vol_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_version: Option<String>,
    #[serde(default)]
    pub apps: Vec<AppRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainPlan>,
}
