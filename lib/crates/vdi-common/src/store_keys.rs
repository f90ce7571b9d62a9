/// Valkey key prefixes for provisioner state
pub mod keys {
    /// Provisioning jobs
    /// Format: vdi:job:{job_id}
    /// Value: JSON-serialized ProvisioningJob
    pub const JOB: &str = "vdi:job";

    /// Job timeline (list, append-only)
    /// Format: vdi:job:{job_id}:steps
    /// Value: JSON-serialized JobStep per element
    pub const JOB_STEPS_SUFFIX: &str = "steps";

    /// Desktops created by a job (set of desktop ids)
    /// Format: vdi:job:{job_id}:desktops
    pub const JOB_DESKTOPS_SUFFIX: &str = "desktops";

    /// Virtual desktops
    /// Format: vdi:desktop:{vd_id}
    /// Value: JSON-serialized VirtualDesktop
    pub const DESKTOP: &str = "vdi:desktop";

    /// App deployments of one desktop (hash: deployment id -> JSON AppDeployment)
    /// Format: vdi:desktop:{vd_id}:apps
    pub const DESKTOP_APPS_SUFFIX: &str = "apps";

    /// Desktops of a project (set of desktop ids)
    /// Format: vdi:project:{project_id}:desktops
    pub const PROJECT: &str = "vdi:project";

    /// Project members (set of user ids)
    /// Format: vdi:project:{project_id}:members
    pub const PROJECT_MEMBERS_SUFFIX: &str = "members";

    /// Project soft-delete marker
    /// Format: vdi:project:{project_id}:deleted
    /// Value: RFC 3339 timestamp
    pub const PROJECT_DELETED_SUFFIX: &str = "deleted";

    /// Users whose credentials must be reset before next login (set of user ids)
    pub const CREDENTIAL_RESETS: &str = "vdi:users:credential_reset";

    /// Public NAT ports currently reserved by any desktop (set)
    pub const PORTS: &str = "vdi:ports";

    /// Infra tasks
    /// Format: vdi:infra_task:{task_id}
    /// Value: JSON-serialized InfraTask
    pub const INFRA_TASK: &str = "vdi:infra_task";

    /// Provider result events (stream, field `body`)
    pub const INFRA_EVENTS: &str = "vdi:infra:events";
}

#[must_use]
pub fn job_key(job_id: &str) -> String {
    format!("{}:{job_id}", keys::JOB)
}

#[must_use]
pub fn job_steps_key(job_id: &str) -> String {
    format!("{}:{job_id}:{}", keys::JOB, keys::JOB_STEPS_SUFFIX)
}

#[must_use]
pub fn job_desktops_key(job_id: &str) -> String {
    format!("{}:{job_id}:{}", keys::JOB, keys::JOB_DESKTOPS_SUFFIX)
}

#[must_use]
pub fn desktop_key(vd_id: &str) -> String {
    format!("{}:{vd_id}", keys::DESKTOP)
}

#[must_use]
pub fn desktop_apps_key(vd_id: &str) -> String {
    format!("{}:{vd_id}:{}", keys::DESKTOP, keys::DESKTOP_APPS_SUFFIX)
}

#[must_use]
pub fn project_desktops_key(project_id: &str) -> String {
    format!("{}:{project_id}:desktops", keys::PROJECT)
}

#[must_use]
pub fn project_members_key(project_id: &str) -> String {
    format!("{}:{project_id}:{}", keys::PROJECT, keys::PROJECT_MEMBERS_SUFFIX)
}

#[must_use]
pub fn project_deleted_key(project_id: &str) -> String {
    format!("{}:{project_id}:{}", keys::PROJECT, keys::PROJECT_DELETED_SUFFIX)
}

#[must_use]
pub fn infra_task_key(task_id: &str) -> String {
    format!("{}:{task_id}", keys::INFRA_TASK)
}
