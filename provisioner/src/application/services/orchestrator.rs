//! Application service: end-to-end desktop provisioning.
//!
//! `submit` records the job and returns at once; `run` drives it on a
//! background task: validate, one infra request for the batch, wait for the
//! correlated result, then one staggered pipeline per returned instance.
//! A pipeline failure only affects its own desktop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;
use vdi_common::{
    AppActionType, AppDeployment, AppRequest, AppStatus, DesktopStatus, DomainInfo, DomainPlan,
    InfraTaskStatus, InstanceAddress, JobStatus, JobStep, ProvisionMode, ProvisionRequest,
    ProvisionerConfig, ProvisioningJob, StepStatus, VirtualDesktop,
};

use crate::application::ports::{
    Clock, InfraProvider, InfraSpec, NetworkProbe, ProvisioningStore,
};
use crate::application::services::automation::{
    AutomationExecutor, ControllerBootstrap, DirectoryAccount, DomainJoin, NatRule, WinRmTarget,
};
use crate::application::services::infra_tasks::{InfraTaskStore, WaitOutcome};
use crate::application::services::port_allocator::PortAllocator;
use crate::domain::error::ProvisionError;
use crate::domain::status::JobSnapshot;
use crate::domain::summary::build_summary;
use crate::domain::text::{
    MAX_DETAIL, MAX_INFRA_ERROR, MAX_MESSAGE, clamp, gateway_ip, interface_name, sanitize,
};
use crate::domain::validation::{pick_win_version, validate_request};

/// Collaborators of the orchestrator.
pub struct OrchestratorParts {
    pub store: Arc<dyn ProvisioningStore>,
    pub infra: Arc<dyn InfraProvider>,
    pub tasks: Arc<InfraTaskStore>,
    pub automation: Arc<AutomationExecutor>,
    pub ports: Arc<PortAllocator>,
    pub probe: Arc<dyn NetworkProbe>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<ProvisionerConfig>,
}

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobTicket {
    pub job_id: String,
    pub handle: JoinHandle<()>,
}

pub struct Orchestrator {
    store: Arc<dyn ProvisioningStore>,
    infra: Arc<dyn InfraProvider>,
    tasks: Arc<InfraTaskStore>,
    automation: Arc<AutomationExecutor>,
    ports: Arc<PortAllocator>,
    probe: Arc<dyn NetworkProbe>,
    clock: Arc<dyn Clock>,
    config: Arc<ProvisionerConfig>,
}

/// Per-job input shared by all pipelines of the job.
struct JobInput {
    job_id: String,
    mode: ProvisionMode,
    request: ProvisionRequest,
    instance_count: usize,
    win_version: String,
}

impl Orchestrator {
    #[must_use]
    pub fn new(parts: OrchestratorParts) -> Self {
        let OrchestratorParts {
            store,
            infra,
            tasks,
            automation,
            ports,
            probe,
            clock,
            config,
        } = parts;
        Self {
            store,
            infra,
            tasks,
            automation,
            ports,
            probe,
            clock,
            config,
        }
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// Persist a PENDING job and start it in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the job record cannot be persisted.
    pub async fn submit(
        self: &Arc<Self>,
        mode: ProvisionMode,
        request: ProvisionRequest,
        region: Option<String>,
    ) -> Result<JobTicket> {
        let job_id = Uuid::new_v4().to_string();
        let job = ProvisioningJob::new(
            job_id.clone(),
            mode,
            request.user_id.clone(),
            region.clone(),
            request.count.max(1),
            self.clock.now(),
        );
        self.store.insert_job(&job).await?;
        tracing::info!(
            job_id = %job_id,
            %mode,
            count = job.total_vms,
            "provisioning job submitted"
        );

        let this = Arc::clone(self);
        let id = job_id.clone();
        let handle = tokio::spawn(async move {
            let worker = Arc::clone(&this);
            let worker_id = id.clone();
            let outcome = tokio::spawn(async move {
                worker
                    .run(&worker_id, mode, request, region.as_deref())
                    .await
            })
            .await;
            let crash = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("Exception: {e:#}")),
                Err(e) => Some(format!("Exception: {e}")),
            };
            if let Some(message) = crash {
                tracing::error!(job_id = %id, %message, "provisioning job crashed");
                this.fail_job(&id, &message).await;
            }
        });
        Ok(JobTicket { job_id, handle })
    }

    /// Drive one job to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error only for store failures outside a pipeline; the
    /// caller turns those into a FAILED job.
    pub async fn run(
        self: &Arc<Self>,
        job_id: &str,
        mode: ProvisionMode,
        request: ProvisionRequest,
        region: Option<&str>,
    ) -> Result<()> {
        let mut job = self.load_job(job_id).await?;
        job.status = JobStatus::Running;
        job.updated_at = self.clock.now();
        self.store.update_job(&job).await?;

        if let Err(e) = validate_request(mode, &request, &self.config.apps) {
            self.step(job_id, None, "validate", StepStatus::Failed, &e.to_string())
                .await?;
            return self.finish_failed(job, &e.to_string()).await;
        }

        let task_id = Uuid::new_v4().to_string();
        let expected = request.count.max(1);
        let waiter = self.tasks.create_provisioning(&task_id, expected).await?;
        self.step(
            job_id,
            None,
            "create_instance",
            StepStatus::Info,
            &format!("taskId={task_id}"),
        )
        .await?;

        let spec = InfraSpec {
            base_vol_id: request.base_vol_id.clone(),
            vol_size: request.vol_size,
            flavor_id: request.flavor_id.clone(),
            vol_type: request.vol_type.clone(),
            count: expected,
            user_id: request.user_id.clone(),
            project_id: request.project_id.clone(),
        };
        if let Err(e) = self.submit_infra(mode, &spec, &task_id, region).await {
            let message = ProvisionError::InfraCall(format!("{e:#}")).to_string();
            self.tasks.abandon(&task_id, &message).await?;
            self.step(job_id, None, "create_instance", StepStatus::Failed, &message)
                .await?;
            return self.finish_failed(job, &message).await;
        }

        let infra = &self.config.infra;
        let outcome = self
            .tasks
            .await_terminal(&task_id, waiter, infra.result_timeout(), infra.grace())
            .await;
        let task = match outcome {
            WaitOutcome::Done(task) => task,
            WaitOutcome::Failed(reason) => {
                let message = format!(
                    "{}: {reason}",
                    ProvisionError::InfraTimeout {
                        task_id: task_id.clone()
                    }
                );
                self.step(job_id, None, "create_instance", StepStatus::Failed, &message)
                    .await?;
                return self.finish_failed(job, &message).await;
            }
            WaitOutcome::TimedOut => {
                let message = ProvisionError::InfraTimeout {
                    task_id: task_id.clone(),
                }
                .to_string();
                self.step(job_id, None, "create_instance", StepStatus::Failed, &message)
                    .await?;
                return self.finish_failed(job, &message).await;
            }
        };

        if task.status != InfraTaskStatus::Success {
            let reason = task.error.as_deref().unwrap_or("no error detail");
            let message = ProvisionError::InfraResult(clamp(reason, MAX_INFRA_ERROR)).to_string();
            self.step(job_id, None, "create_instance", StepStatus::Failed, &message)
                .await?;
            return self.finish_failed(job, &message).await;
        }
        if task.instances.is_empty() {
            let message =
                ProvisionError::InfraResult("no instances returned".to_string()).to_string();
            self.step(job_id, None, "create_instance", StepStatus::Failed, &message)
                .await?;
            return self.finish_failed(job, &message).await;
        }

        job.total_vms = u32::try_from(task.instances.len()).unwrap_or(u32::MAX);
        job.updated_at = self.clock.now();
        self.store.update_job(&job).await?;
        self.step(
            job_id,
            None,
            "create_instance",
            StepStatus::Success,
            &format!("instances={}", task.instances.len()),
        )
        .await?;

        let input = Arc::new(JobInput {
            job_id: job_id.to_string(),
            mode,
            win_version: pick_win_version(&request, &self.config.desktop.default_win_version),
            instance_count: task.instances.len(),
            request,
        });
        let stagger = self.config.network.stagger();
        let mut pipelines = JoinSet::new();
        for (index, instance) in task.instances.into_iter().enumerate() {
            let this = Arc::clone(self);
            let input = Arc::clone(&input);
            pipelines.spawn(async move {
                let delay = stagger.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
                this.clock.sleep(delay).await;
                Pipeline::new(&this, &input, index, instance).run().await
            });
        }

        while let Some(joined) = pipelines.join_next().await {
            let succeeded = joined.unwrap_or_else(|e| {
                tracing::error!(job_id, error = %e, "desktop pipeline aborted");
                false
            });
            if succeeded {
                job.success_vms += 1;
            } else {
                job.failed_vms += 1;
            }
            job.updated_at = self.clock.now();
            if let Err(e) = self.store.update_job(&job).await {
                tracing::warn!(job_id, error = %e, "failed to persist job counters");
            }
        }

        job.status = match (job.success_vms, job.failed_vms) {
            (_, 0) => JobStatus::Success,
            (0, _) => JobStatus::Failed,
            _ => JobStatus::PartialFailed,
        };
        job.message = Some(clamp(&self.summary(job_id).await?, MAX_MESSAGE));
        job.updated_at = self.clock.now();
        self.store.update_job(&job).await?;
        tracing::info!(
            job_id,
            status = ?job.status,
            success = job.success_vms,
            failed = job.failed_vms,
            "provisioning job finished"
        );
        Ok(())
    }

    /// Read-only snapshot of a job, its desktops and timelines.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::JobNotFound` for an unknown id, or a store error.
    pub async fn get_status(&self, job_id: &str) -> Result<JobSnapshot> {
        let job = self.load_job(job_id).await?;
        let mut desktops = Vec::new();
        for desktop in self.store.desktops_for_job(job_id).await? {
            let apps = self.store.deployments_for_desktop(&desktop.id).await?;
            desktops.push((desktop, apps));
        }
        let steps = self.store.steps(job_id).await?;
        Ok(JobSnapshot::assemble(job, desktops, steps))
    }

    // ── Job helpers ───────────────────────────────────────────────────────────

    async fn submit_infra(
        &self,
        mode: ProvisionMode,
        spec: &InfraSpec,
        task_id: &str,
        region: Option<&str>,
    ) -> Result<()> {
        match self.infra.submit(mode, spec, task_id, region).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(task_id, error = %first, "infra submission failed; retrying once");
                self.infra.submit(mode, spec, task_id, region).await
            }
        }
    }

    async fn load_job(&self, job_id: &str) -> Result<ProvisioningJob> {
        Ok(self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| ProvisionError::JobNotFound(job_id.to_string()))?)
    }

    async fn finish_failed(&self, mut job: ProvisioningJob, message: &str) -> Result<()> {
        job.status = JobStatus::Failed;
        job.message = Some(clamp(message, MAX_MESSAGE));
        job.updated_at = self.clock.now();
        self.store.update_job(&job).await?;
        tracing::warn!(job_id = %job.id, %message, "provisioning job failed");
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, message: &str) {
        if let Err(e) = self
            .step(job_id, None, "exception", StepStatus::Failed, message)
            .await
        {
            tracing::warn!(job_id, error = %e, "failed to record exception step");
        }
        let updated = async {
            let job = self.load_job(job_id).await?;
            self.finish_failed(job, message).await
        }
        .await;
        if let Err(e) = updated {
            tracing::error!(job_id, error = %e, "failed to record job failure");
        }
    }

    async fn summary(&self, job_id: &str) -> Result<String> {
        let names: HashMap<String, String> = self
            .store
            .desktops_for_job(job_id)
            .await?
            .into_iter()
            .map(|d| (d.id, d.name))
            .collect();
        let steps = self.store.steps(job_id).await?;
        Ok(build_summary(&steps, &names))
    }

    async fn step(
        &self,
        job_id: &str,
        vd_id: Option<&str>,
        step: &str,
        status: StepStatus,
        detail: &str,
    ) -> Result<()> {
        let entry = JobStep {
            job_id: job_id.to_string(),
            vd_id: vd_id.map(str::to_string),
            step: step.to_string(),
            status,
            detail: sanitize(detail, MAX_DETAIL),
            created_at: self.clock.now(),
        };
        self.store.append_step(&entry).await
    }
}

// ── Per-desktop pipeline ──────────────────────────────────────────────────────

/// One instance's pipeline. `desktop` mirrors the last persisted state so the
/// error path knows what to clean up.
struct Pipeline<'a> {
    orch: &'a Orchestrator,
    input: &'a JobInput,
    index: usize,
    instance: InstanceAddress,
    sub_id: String,
    desktop: Option<VirtualDesktop>,
}

impl<'a> Pipeline<'a> {
    fn new(
        orch: &'a Orchestrator,
        input: &'a JobInput,
        index: usize,
        instance: InstanceAddress,
    ) -> Self {
        Self {
            orch,
            input,
            index,
            instance,
            sub_id: format!("{}_{}", input.job_id, index + 1),
            desktop: None,
        }
    }

    async fn run(mut self) -> bool {
        match self.steps().await {
            Ok(succeeded) => succeeded,
            Err(e) => {
                self.on_error(&e).await;
                false
            }
        }
    }

    async fn steps(&mut self) -> Result<bool> {
        let orch = self.orch;
        let input = self.input;
        let request = &input.request;
        let network = &orch.config.network;

        // a. ports + record
        let public_ip = self.resolve_public_ip().await?;
        let (rdp_port, winrm_port) = orch.ports.allocate_pair().await?;
        let now = orch.clock.now();
        let mut vd = VirtualDesktop {
            id: Uuid::new_v4().to_string(),
            name: self.desktop_name(),
            job_id: input.job_id.clone(),
            project_id: request.project_id.clone(),
            user_id: request.user_id.clone(),
            instance_id: self.instance.instance_id.clone(),
            ip_local: self.instance.local_ip.clone(),
            ip_public: public_ip,
            rdp_port_public: rdp_port,
            winrm_port_public: winrm_port,
            local_port: network.rdp_local_port,
            admin_username: request.username_of_vdi.clone(),
            password: orch.config.desktop.admin_password.clone(),
            is_domain_controller: false,
            domain: None,
            status: DesktopStatus::Created,
            winrm_disabled: false,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.save(&mut vd).await {
            orch.ports.release(rdp_port).await;
            orch.ports.release(winrm_port).await;
            return Err(e);
        }
        self.log(&vd, "save_db", StepStatus::Success, &format!("vdId={}", vd.id))
            .await?;

        // c. tenant interface
        if input.mode.assigns_interface() && !self.assign_interface(&mut vd).await? {
            return Ok(false);
        }

        // d. NAT rules
        let Some(wan_ip) = vd.ip_public.clone() else {
            return self
                .fail(
                    &mut vd,
                    DesktopStatus::NatError,
                    "create_nat",
                    &format!("No public IP available for mode {}", input.mode),
                )
                .await;
        };
        let rdp = orch
            .automation
            .nat_create(
                &self.sub_id,
                &NatRule {
                    wan_ip: wan_ip.clone(),
                    public_port: vd.rdp_port_public,
                    local_ip: vd.ip_local.clone(),
                    local_port: network.rdp_local_port,
                },
            )
            .await;
        if !rdp.ok {
            return self
                .fail(&mut vd, DesktopStatus::NatError, "create_nat", &rdp.log_path)
                .await;
        }
        self.log(&vd, "create_nat", StepStatus::Success, &rdp.log_path)
            .await?;

        let winrm = orch
            .automation
            .nat_create(
                &format!("{}_winrm", self.sub_id),
                &NatRule {
                    wan_ip: wan_ip.clone(),
                    public_port: vd.winrm_port_public,
                    local_ip: vd.ip_local.clone(),
                    local_port: network.winrm_local_port,
                },
            )
            .await;
        if !winrm.ok {
            return self
                .fail(&mut vd, DesktopStatus::NatError, "create_nat_winrm", &winrm.log_path)
                .await;
        }
        self.log(&vd, "create_nat_winrm", StepStatus::Success, &winrm.log_path)
            .await?;

        // From here on the WinRM rule exists and is removed on every exit.
        let configured = self.configure(&mut vd, &wan_ip).await?;
        self.remove_winrm_nat(&vd, &wan_ip, "delete_nat_winrm").await?;
        if !configured {
            return Ok(false);
        }

        vd.status = if vd.winrm_disabled || vd.is_domain_controller {
            DesktopStatus::Ready
        } else {
            DesktopStatus::ReadyWithWarn
        };
        self.save(&mut vd).await?;
        tracing::info!(
            job_id = %input.job_id,
            vd_id = %vd.id,
            status = ?vd.status,
            "desktop ready"
        );
        Ok(true)
    }

    /// Steps e to g plus the WinRM disable. Returns `false` after marking the
    /// desktop failed.
    async fn configure(&mut self, vd: &mut VirtualDesktop, wan_ip: &str) -> Result<bool> {
        let orch = self.orch;
        let target = WinRmTarget {
            host: wan_ip.to_string(),
            port: vd.winrm_port_public,
            user: vd.admin_username.clone(),
            password: vd.password.clone(),
        };

        // e. reachability
        if !self.wait_for_winrm(vd, &target).await? {
            return Ok(false);
        }

        // f. apps
        if !self.install_apps(vd, &target).await? {
            return self
                .fail(vd, DesktopStatus::AppError, "apps", "One or more apps failed")
                .await;
        }
        let app_count = self.input.request.apps.len();
        self.log(vd, "apps", StepStatus::Success, &format!("{app_count} app(s)"))
            .await?;

        // g. domain
        if !self.domain_setup(vd, &target).await? {
            return Ok(false);
        }

        // WinRM stays enabled on a controller so later joins can reach it.
        if !vd.is_domain_controller {
            let disabled = orch
                .automation
                .winrm_disable(&self.sub_id, &target, &self.input.win_version)
                .await;
            vd.winrm_disabled = disabled.ok;
            let status = if disabled.ok {
                StepStatus::Success
            } else {
                StepStatus::Failed
            };
            self.log(vd, "winrm_disable", status, &disabled.log_path)
                .await?;
        }
        Ok(true)
    }

    async fn resolve_public_ip(&self) -> Result<Option<String>> {
        let orch = self.orch;
        let ip = match self.input.mode {
            ProvisionMode::Personal => Some(orch.config.network.shared_public_ip.clone()),
            ProvisionMode::Organization => self.instance.public_ip.clone(),
            ProvisionMode::AddResourceOrganization | ProvisionMode::AddResourcePersonal => orch
                .store
                .desktops_for_project(&self.input.request.project_id)
                .await?
                .into_iter()
                .filter(|d| d.job_id != self.input.job_id)
                .find_map(|d| d.ip_public),
        };
        Ok(ip.filter(|ip| !ip.trim().is_empty()))
    }

    async fn assign_interface(&mut self, vd: &mut VirtualDesktop) -> Result<bool> {
        let user_id = &self.input.request.user_id;
        let name = interface_name(user_id);
        let Some(gateway) = gateway_ip(&vd.ip_local) else {
            return self
                .fail(
                    vd,
                    DesktopStatus::AssignIfError,
                    "assign_interface",
                    &format!("invalid local address '{}'", vd.ip_local),
                )
                .await;
        };
        self.log(
            vd,
            "assign_interface",
            StepStatus::Info,
            &format!("assign_name={name}, assign_ip={gateway}/24"),
        )
        .await?;
        let outcome = self
            .orch
            .automation
            .assign_interface(&self.sub_id, &name, user_id, &gateway)
            .await;
        if !outcome.ok {
            return self
                .fail(vd, DesktopStatus::AssignIfError, "assign_interface", &outcome.log_path)
                .await;
        }
        self.log(vd, "assign_interface", StepStatus::Success, &outcome.log_path)
            .await?;
        Ok(true)
    }

    async fn wait_for_winrm(
        &mut self,
        vd: &mut VirtualDesktop,
        target: &WinRmTarget,
    ) -> Result<bool> {
        let orch = self.orch;
        let network = &orch.config.network;
        let attempts = network.winrm_probe_attempts.max(1);
        for attempt in 1..=attempts {
            match orch
                .probe
                .check_tcp_connectivity(&target.host, target.port)
                .await
            {
                Ok(true) => {
                    self.log(
                        vd,
                        "winrm_probe",
                        StepStatus::Info,
                        &format!(
                            "{}:{} reachable after {attempt} attempt(s)",
                            target.host, target.port
                        ),
                    )
                    .await?;
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(vd_id = %vd.id, attempt, error = %e, "WinRM probe error"),
            }
            if attempt < attempts {
                orch.clock.sleep(network.winrm_probe_delay()).await;
            }
        }
        self.fail(
            vd,
            DesktopStatus::NatError,
            "winrm_probe",
            &format!(
                "{}:{} not reachable after {attempts} attempt(s)",
                target.host, target.port
            ),
        )
        .await
    }

    async fn install_apps(&self, vd: &VirtualDesktop, target: &WinRmTarget) -> Result<bool> {
        let orch = self.orch;
        let apps = &self.input.request.apps;
        if apps.is_empty() {
            return Ok(true);
        }

        let mut seeded = Vec::with_capacity(apps.len());
        for app in apps {
            let deployment = AppDeployment {
                id: Uuid::new_v4().to_string(),
                job_id: self.input.job_id.clone(),
                vd_id: vd.id.clone(),
                app_code: app.code.clone(),
                action_type: self.action_type(app),
                status: AppStatus::Pending,
                log_path: None,
                started_at: None,
                finished_at: None,
            };
            orch.store.save_deployment(&deployment).await?;
            seeded.push((app, deployment));
        }

        let results = join_all(
            seeded
                .into_iter()
                .map(|(app, deployment)| self.install_app(vd, target, app, deployment)),
        )
        .await;

        let mut all_ok = true;
        for result in results {
            all_ok &= result?;
        }
        Ok(all_ok)
    }

    async fn install_app(
        &self,
        vd: &VirtualDesktop,
        target: &WinRmTarget,
        app: &AppRequest,
        mut deployment: AppDeployment,
    ) -> Result<bool> {
        let orch = self.orch;
        let step = format!("install:{}", app.code);
        let role = orch
            .config
            .app(&app.code)
            .map_or(app.code.as_str(), |def| def.role_name())
            .to_string();

        deployment.status = AppStatus::Running;
        deployment.started_at = Some(orch.clock.now());
        orch.store.save_deployment(&deployment).await?;
        self.log(vd, &step, StepStatus::Info, "start").await?;

        let mut vars: BTreeMap<String, String> = app.vars.clone();
        if let Some(version) = app.win_version.as_deref().filter(|v| !v.trim().is_empty()) {
            vars.insert("win_version".to_string(), version.to_string());
        } else {
            vars.insert("win_version".to_string(), self.input.win_version.clone());
        }
        let action = match deployment.action_type {
            AppActionType::Install => "INSTALL",
            AppActionType::Config => "CONFIG",
        };
        vars.insert("action_type".to_string(), action.to_string());

        let outcome = orch
            .automation
            .run_app(&self.sub_id, target, &role, &app.code, &vars)
            .await;

        deployment.status = if outcome.ok {
            AppStatus::Success
        } else {
            AppStatus::Failed
        };
        deployment.log_path = Some(outcome.log_path.clone());
        deployment.finished_at = Some(orch.clock.now());
        orch.store.save_deployment(&deployment).await?;
        let status = if outcome.ok {
            StepStatus::Success
        } else {
            StepStatus::Failed
        };
        self.log(vd, &step, status, &outcome.log_path).await?;
        Ok(outcome.ok)
    }

    fn action_type(&self, app: &AppRequest) -> AppActionType {
        app.action_type.unwrap_or_else(|| {
            self.orch
                .config
                .app(&app.code)
                .map_or(AppActionType::default(), |def| def.action_type)
        })
    }

    async fn domain_setup(
        &mut self,
        vd: &mut VirtualDesktop,
        target: &WinRmTarget,
    ) -> Result<bool> {
        let Some(plan) = self.input.request.domain.clone() else {
            return Ok(true);
        };
        match self.input.mode {
            ProvisionMode::Organization if plan.bootstrap_controller && self.index == 0 => {
                self.bootstrap_controller(vd, target, &plan).await
            }
            mode if mode.is_incremental() => self.join_existing_domain(vd, target, &plan).await,
            _ => Ok(true),
        }
    }

    async fn bootstrap_controller(
        &mut self,
        vd: &mut VirtualDesktop,
        target: &WinRmTarget,
        plan: &DomainPlan,
    ) -> Result<bool> {
        let outcome = self
            .orch
            .automation
            .dc_bootstrap(
                &self.sub_id,
                target,
                &ControllerBootstrap {
                    domain_name: plan.domain_name.clone(),
                    ou_name: plan.ou_name.clone(),
                    admin_group_name: plan.group_name.clone(),
                    admin_user_name: plan.admin_user_name.clone(),
                    admin_user_pass: plan.admin_user_pass.clone(),
                },
            )
            .await;
        if !outcome.ok {
            return self
                .fail(vd, DesktopStatus::Error, "dc_bootstrap", &outcome.log_path)
                .await;
        }
        vd.is_domain_controller = true;
        vd.domain = Some(DomainInfo {
            domain_name: plan.domain_name.clone(),
            ou_name: plan.ou_name.clone(),
            admin_user: plan.admin_user_name.clone(),
            admin_password: plan.admin_user_pass.clone(),
        });
        self.save(vd).await?;
        self.log(vd, "dc_bootstrap", StepStatus::Success, &outcome.log_path)
            .await?;
        Ok(true)
    }

    async fn join_existing_domain(
        &mut self,
        vd: &mut VirtualDesktop,
        target: &WinRmTarget,
        plan: &DomainPlan,
    ) -> Result<bool> {
        let orch = self.orch;
        let controller = orch
            .store
            .desktops_for_project(&vd.project_id)
            .await?
            .into_iter()
            .find(|d| d.is_domain_controller && d.domain.is_some());
        let Some((dc, domain, wan_ip)) = controller.and_then(|dc| {
            let domain = dc.domain.clone()?;
            let wan_ip = dc.ip_public.clone().filter(|ip| !ip.trim().is_empty())?;
            Some((dc, domain, wan_ip))
        }) else {
            return self
                .fail(
                    vd,
                    DesktopStatus::Error,
                    "ad_account",
                    "No domain controller with a public address in project",
                )
                .await;
        };

        // Temporary WinRM rule towards the controller.
        let dc_sub = format!("{}_dc", self.sub_id);
        let opened = orch
            .automation
            .nat_create(
                &dc_sub,
                &NatRule {
                    wan_ip: wan_ip.clone(),
                    public_port: dc.winrm_port_public,
                    local_ip: dc.ip_local.clone(),
                    local_port: orch.config.network.winrm_local_port,
                },
            )
            .await;
        if !opened.ok {
            return self
                .fail(vd, DesktopStatus::Error, "ad_account", &opened.log_path)
                .await;
        }

        let account_name = self.account_name();
        let created = orch
            .automation
            .ad_account_create(
                &self.sub_id,
                &WinRmTarget {
                    host: wan_ip.clone(),
                    port: dc.winrm_port_public,
                    user: dc.admin_username.clone(),
                    password: dc.password.clone(),
                },
                &DirectoryAccount {
                    domain_name: domain.domain_name.clone(),
                    ou_name: plan.ou_name.clone(),
                    group_name: plan.group_name.clone(),
                    user_name: account_name.clone(),
                    password: plan.user_pass.clone(),
                },
            )
            .await;
        let closed = orch
            .automation
            .nat_delete(&format!("{dc_sub}_del"), &wan_ip, dc.winrm_port_public)
            .await;
        if !closed.ok {
            tracing::warn!(
                dc = %dc.id,
                log = %closed.log_path,
                "failed to close temporary controller WinRM rule"
            );
        }
        if !created.ok {
            return self
                .fail(vd, DesktopStatus::Error, "ad_account", &created.log_path)
                .await;
        }
        self.log(vd, "ad_account", StepStatus::Success, &created.log_path)
            .await?;

        let joined = orch
            .automation
            .join_domain(
                &self.sub_id,
                target,
                &DomainJoin {
                    win_version: self.input.win_version.clone(),
                    domain_name: domain.domain_name.clone(),
                    controller_ip: dc.ip_local.clone(),
                    domain_user: domain.admin_user.clone(),
                    domain_password: domain.admin_password.clone(),
                    rdp_grant_user: account_name.clone(),
                },
            )
            .await;
        if !joined.ok {
            return self
                .fail(vd, DesktopStatus::Error, "join_domain", &joined.log_path)
                .await;
        }
        vd.domain = Some(DomainInfo {
            domain_name: domain.domain_name,
            ou_name: plan.ou_name.clone(),
            admin_user: account_name,
            admin_password: plan.user_pass.clone(),
        });
        self.save(vd).await?;
        self.log(vd, "join_domain", StepStatus::Success, &joined.log_path)
            .await?;
        Ok(true)
    }

    async fn remove_winrm_nat(&self, vd: &VirtualDesktop, wan_ip: &str, step: &str) -> Result<()> {
        let outcome = self
            .orch
            .automation
            .nat_delete(&format!("{}_winrm_del", self.sub_id), wan_ip, vd.winrm_port_public)
            .await;
        let status = if outcome.ok {
            StepStatus::Success
        } else {
            StepStatus::Failed
        };
        self.log(vd, step, status, &outcome.log_path).await
    }

    /// Unexpected error: record it, mark ERROR if the desktop never left
    /// CREATED, and drop the WinRM rule if one may exist.
    async fn on_error(&mut self, error: &anyhow::Error) {
        let job_id = self.input.job_id.clone();
        tracing::error!(
            job_id = %job_id,
            index = self.index,
            error = %format!("{error:#}"),
            "desktop pipeline error"
        );
        let vd_id = self.desktop.as_ref().map(|d| d.id.clone());
        if let Err(e) = self
            .orch
            .step(
                &job_id,
                vd_id.as_deref(),
                "exception",
                StepStatus::Failed,
                &format!("{}: {error:#}", error_kind(error)),
            )
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "failed to record pipeline exception");
        }

        let Some(mut vd) = self.desktop.take() else {
            return;
        };
        if vd.status == DesktopStatus::Created {
            vd.status = DesktopStatus::Error;
            vd.updated_at = self.orch.clock.now();
            if let Err(e) = self.orch.store.save_desktop(&vd).await {
                tracing::error!(vd_id = %vd.id, error = %e, "failed to mark desktop ERROR");
            }
        }
        if let Some(wan_ip) = vd.ip_public.clone() {
            let _ = self
                .remove_winrm_nat(&vd, &wan_ip, "delete_nat_winrm_on_error")
                .await;
        }
    }

    async fn fail(
        &mut self,
        vd: &mut VirtualDesktop,
        status: DesktopStatus,
        step: &str,
        detail: &str,
    ) -> Result<bool> {
        vd.status = status;
        self.save(vd).await?;
        self.log(vd, step, StepStatus::Failed, detail).await?;
        tracing::warn!(vd_id = %vd.id, ?status, step, "desktop pipeline stopped");
        Ok(false)
    }

    async fn save(&mut self, vd: &mut VirtualDesktop) -> Result<()> {
        vd.updated_at = self.orch.clock.now();
        self.orch.store.save_desktop(vd).await?;
        self.desktop = Some(vd.clone());
        Ok(())
    }

    async fn log(
        &self,
        vd: &VirtualDesktop,
        step: &str,
        status: StepStatus,
        detail: &str,
    ) -> Result<()> {
        self.orch
            .step(&self.input.job_id, Some(&vd.id), step, status, detail)
            .await
    }

    fn desktop_name(&self) -> String {
        let name = &self.input.request.name;
        if self.input.instance_count > 1 {
            format!("{name}-{}", self.index + 1)
        } else {
            name.clone()
        }
    }

    fn account_name(&self) -> String {
        let user = &self.input.request.username_of_vdi;
        if self.input.instance_count > 1 {
            format!("{user}{}", self.index + 1)
        } else {
            user.clone()
        }
    }
}

/// Short label for the exception step: the typed error name when known.
fn error_kind(error: &anyhow::Error) -> &'static str {
    if error.downcast_ref::<ProvisionError>().is_some() {
        "ProvisionError"
    } else {
        "Error"
    }
}
