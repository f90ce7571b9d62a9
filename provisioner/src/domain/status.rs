//! Read models returned by status queries.

use serde::Serialize;
use vdi_common::{AppDeployment, InfraTaskStatus, JobStep, ProvisioningJob, VirtualDesktop};

const MASK: &str = "********";

/// A job with its desktops and full timeline.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job: ProvisioningJob,
    pub desktops: Vec<DesktopSnapshot>,
    /// Job-level entries (no desktop).
    pub timeline: Vec<JobStep>,
}

/// One desktop with credentials masked, its app deployments and timeline.
#[derive(Debug, Clone, Serialize)]
pub struct DesktopSnapshot {
    pub desktop: VirtualDesktop,
    pub apps: Vec<AppDeployment>,
    pub timeline: Vec<JobStep>,
}

impl JobSnapshot {
    /// Split `steps` between the job and its desktops.
    #[must_use]
    pub fn assemble(
        job: ProvisioningJob,
        desktops: Vec<(VirtualDesktop, Vec<AppDeployment>)>,
        steps: Vec<JobStep>,
    ) -> Self {
        let (timeline, per_desktop): (Vec<_>, Vec<_>) =
            steps.into_iter().partition(|s| s.vd_id.is_none());
        let desktops = desktops
            .into_iter()
            .map(|(desktop, apps)| {
                let timeline = per_desktop
                    .iter()
                    .filter(|s| s.vd_id.as_deref() == Some(desktop.id.as_str()))
                    .cloned()
                    .collect();
                DesktopSnapshot {
                    desktop: masked(desktop),
                    apps,
                    timeline,
                }
            })
            .collect();
        Self {
            job,
            desktops,
            timeline,
        }
    }
}

/// Outcome of a deletion request as seen by the caller. `status` is `None`
/// when no result arrived within the wait policy.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeletionReport {
    pub task_id: String,
    pub status: Option<InfraTaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeletionReport {
    #[must_use]
    pub fn confirmed(&self) -> bool {
        self.status == Some(InfraTaskStatus::Deleted)
    }
}

fn masked(mut desktop: VirtualDesktop) -> VirtualDesktop {
    if !desktop.password.is_empty() {
        desktop.password = MASK.to_string();
    }
    if let Some(domain) = desktop.domain.as_mut() {
        domain.admin_password = MASK.to_string();
    }
    desktop
}
