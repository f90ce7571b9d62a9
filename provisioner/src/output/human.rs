//! Human-readable terminal renderer.

use owo_colors::OwoColorize as _;
use vdi_common::{
    AppStatus, AutomationJob, AutomationStatus, DesktopStatus, InfraTaskStatus, JobStatus,
    StepStatus,
};

use crate::domain::status::{DeletionReport, DesktopSnapshot, JobSnapshot};
use crate::output::OutputContext;

/// Renders read models as human-readable terminal output using `OutputContext`.
pub struct HumanRenderer<'a> {
    ctx: &'a OutputContext,
}

impl<'a> HumanRenderer<'a> {
    /// Create a new `HumanRenderer` wrapping the given output context.
    #[must_use]
    pub fn new(ctx: &'a OutputContext) -> Self {
        Self { ctx }
    }

    /// Render a provisioning job with its desktops.
    pub fn render_job(&self, snapshot: &JobSnapshot) {
        let job = &snapshot.job;
        self.ctx.header(&format!("Job {}", job.id));
        let label = job_status_display(job.status);
        let status = label.style(self.ctx.styles.job(job.status)).to_string();
        self.ctx.kv("Status:", &status);
        self.ctx.kv("Mode:", job.mode.as_str());
        self.ctx.kv("Requester:", &job.requester);
        if let Some(region) = &job.region {
            self.ctx.kv("Region:", region);
        }
        self.ctx.kv(
            "Desktops:",
            &format!(
                "{} ready, {} failed, {} total",
                job.success_vms, job.failed_vms, job.total_vms
            ),
        );

        for step in snapshot
            .timeline
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
        {
            self.ctx.error(&format!("{}: {}", step.step, step.detail));
        }

        for desktop in &snapshot.desktops {
            if !self.ctx.quiet {
                println!();
            }
            self.render_desktop(desktop);
        }

        if let Some(message) = job.message.as_deref().filter(|m| !m.is_empty()) {
            if !self.ctx.quiet {
                println!();
            }
            self.ctx.header("Summary:");
            for line in message.lines() {
                self.ctx.kv("", line);
            }
        }
    }

    fn render_desktop(&self, snapshot: &DesktopSnapshot) {
        let vd = &snapshot.desktop;
        let label = desktop_status_display(vd.status);
        let status = label.style(self.ctx.styles.desktop(vd.status));
        let line = format!("{} ({status})", vd.name);
        if vd.status.is_ready() {
            self.ctx.success(&line);
        } else if vd.status == DesktopStatus::Created {
            self.ctx.info(&line);
        } else {
            self.ctx.warn(&line);
        }
        if let Some(ip) = &vd.ip_public {
            self.ctx.kv("  RDP:", &format!("{ip}:{}", vd.rdp_port_public));
        }
        self.ctx.kv("  Local IP:", &vd.ip_local);
        self.ctx.kv("  Account:", &vd.admin_username);
        if let Some(domain) = &vd.domain {
            let role = if vd.is_domain_controller {
                "controller"
            } else {
                "member"
            };
            self.ctx
                .kv("  Domain:", &format!("{} ({role})", domain.domain_name));
        }
        for app in &snapshot.apps {
            let status = match app.status {
                AppStatus::Pending => "pending",
                AppStatus::Running => "running",
                AppStatus::Success => "installed",
                AppStatus::Failed => "failed",
            };
            self.ctx.kv(&format!("  {}:", app.app_code), status);
        }
        if let Some(failed) = snapshot
            .timeline
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Failed)
        {
            self.ctx
                .kv("  Failed at:", &format!("{} -> {}", failed.step, failed.detail));
        }
    }

    /// Render a tracked automation job.
    pub fn render_automation(&self, job: &AutomationJob) {
        let line = format!(
            "{} {} (attempt {}/{})",
            job.id,
            automation_status_display(job.status),
            job.attempt,
            job.max_retries + 1
        );
        match job.status {
            AutomationStatus::Success => self.ctx.success(&line),
            AutomationStatus::Failed => self.ctx.error(&line),
            AutomationStatus::Cancelled => self.ctx.warn(&line),
            AutomationStatus::Pending | AutomationStatus::Running => self.ctx.info(&line),
        }
        if let Some(delay) = job.next_backoff_ms {
            self.ctx.kv("Next retry in:", &format!("{delay} ms"));
        }
        self.ctx.kv("Log:", &job.log_path);
    }

    /// Render the outcome of a deletion request.
    pub fn render_deletion(&self, report: &DeletionReport) {
        match report.status {
            Some(InfraTaskStatus::Deleted) => {
                self.ctx.success(&format!("Deleted (task {})", report.task_id));
            }
            Some(InfraTaskStatus::Deleting) => self.ctx.info(&format!(
                "Deletion requested (task {})",
                report.task_id
            )),
            Some(status) => self.ctx.error(&format!(
                "Deletion did not complete (task {}, {status:?}): {}",
                report.task_id,
                report.error.as_deref().unwrap_or("no detail")
            )),
            None => self.ctx.warn(&format!(
                "Deletion requested; no result yet (task {})",
                report.task_id
            )),
        }
    }

    /// Print a remote log verbatim.
    pub fn render_log(&self, body: &str) {
        if !self.ctx.quiet {
            print!("{body}");
            if !body.ends_with('\n') {
                println!();
            }
        }
    }

    /// Render the CLI version information.
    pub fn render_version(&self, version: &str) {
        if self.ctx.quiet {
            return;
        }
        println!("vdi-provisioner {}", version.style(self.ctx.styles.bold));
    }
}

#[must_use]
pub fn job_status_display(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Success => "success",
        JobStatus::Failed => "failed",
        JobStatus::PartialFailed => "partially failed",
    }
}

#[must_use]
pub fn desktop_status_display(status: DesktopStatus) -> &'static str {
    match status {
        DesktopStatus::Created => "created",
        DesktopStatus::AssignIfError => "interface assignment failed",
        DesktopStatus::NatError => "NAT failed",
        DesktopStatus::AppError => "app install failed",
        DesktopStatus::Ready => "ready",
        DesktopStatus::ReadyWithWarn => "ready, WinRM still enabled",
        DesktopStatus::Error => "error",
    }
}

#[must_use]
pub fn automation_status_display(status: AutomationStatus) -> &'static str {
    match status {
        AutomationStatus::Pending => "pending",
        AutomationStatus::Running => "running",
        AutomationStatus::Success => "succeeded",
        AutomationStatus::Failed => "failed",
        AutomationStatus::Cancelled => "cancelled",
    }
}
