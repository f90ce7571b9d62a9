//! Application service: remote automation through the automation host.
//!
//! Two kinds of work run here:
//!
//! * ad-hoc steps (NAT rules, interface assignment, single roles, apps) that
//!   run once and report a boolean with the remote log path, and
//! * tracked jobs, which own an explicit attempt/backoff state machine, can
//!   be cancelled, and are queried by id.
//!
//! Imports only from `crate::domain` and `crate::application::ports`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use vdi_common::{AutomationConfig, AutomationJob, AutomationStatus};

use crate::application::ports::{Clock, ExecOutcome, KillSwitch, RemoteHost};
use crate::application::services::process_registry::ProcessRegistry;
use crate::domain::error::AutomationError;
use crate::domain::playbook::{
    AttemptLayout, append_log_line, extra_vars, kill_remote_script, marked_script, role_playbook,
    role_script, tracked_attempt_script, winrm_inventory,
};

/// Timeout for bookkeeping commands (log lines, remote kill).
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);

// ── Step inputs ───────────────────────────────────────────────────────────────

/// Result of one ad-hoc step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub ok: bool,
    pub log_path: String,
}

/// WinRM endpoint and credentials of one desktop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinRmTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Port forward on the network appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub wan_ip: String,
    pub public_port: u16,
    pub local_ip: String,
    pub local_port: u16,
}

/// Post-promotion setup of a new domain controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerBootstrap {
    pub domain_name: String,
    pub ou_name: String,
    pub admin_group_name: String,
    pub admin_user_name: String,
    pub admin_user_pass: String,
}

/// Directory account created on an existing controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryAccount {
    pub domain_name: String,
    pub ou_name: String,
    pub group_name: String,
    pub user_name: String,
    pub password: String,
}

/// Enrollment of a desktop into a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainJoin {
    pub win_version: String,
    pub domain_name: String,
    pub controller_ip: String,
    pub domain_user: String,
    pub domain_password: String,
    pub rdp_grant_user: String,
}

/// A tracked multi-host role run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedJobSpec {
    pub id: String,
    pub targets: Vec<String>,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub roles: Vec<String>,
    pub win_version: Option<String>,
    pub extra_vars: BTreeMap<String, String>,
}

// ── Executor ──────────────────────────────────────────────────────────────────

pub struct AutomationExecutor {
    host: Arc<dyn RemoteHost>,
    clock: Arc<dyn Clock>,
    settings: AutomationConfig,
    registry: ProcessRegistry,
    jobs: Mutex<HashMap<String, AutomationJob>>,
}

impl AutomationExecutor {
    #[must_use]
    pub fn new(
        host: Arc<dyn RemoteHost>,
        clock: Arc<dyn Clock>,
        settings: AutomationConfig,
    ) -> Self {
        Self {
            host,
            clock,
            settings,
            registry: ProcessRegistry::new(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &AutomationConfig {
        &self.settings
    }

    // ── Appliance steps ───────────────────────────────────────────────────────

    /// Forward `rule.public_port` on `rule.wan_ip` to the desktop.
    pub async fn nat_create(&self, sub_id: &str, rule: &NatRule) -> StepOutcome {
        let public_port = rule.public_port.to_string();
        let local_port = rule.local_port.to_string();
        let extra = extra_vars(&[
            ("wan_ip", rule.wan_ip.as_str()),
            ("destination_port", public_port.as_str()),
            ("target", rule.local_ip.as_str()),
            ("localip", rule.local_ip.as_str()),
            ("local_port", local_port.as_str()),
        ]);
        self.run_appliance(sub_id, "nat", "NAT", "create_nat.yml", &extra)
            .await
    }

    pub async fn nat_delete(&self, sub_id: &str, wan_ip: &str, public_port: u16) -> StepOutcome {
        let port = public_port.to_string();
        let extra = extra_vars(&[("wan_ip", wan_ip), ("port", port.as_str())]);
        self.run_appliance(sub_id, "nat_delete", "NAT DELETE", "delete-nat.yml", &extra)
            .await
    }

    /// Give a tenant its own static /24 interface on the appliance.
    pub async fn assign_interface(
        &self,
        sub_id: &str,
        name: &str,
        description: &str,
        gateway_ip: &str,
    ) -> StepOutcome {
        let extra = extra_vars(&[
            ("assign_name", name),
            ("assign_type", "static"),
            ("assign_descr", description),
            ("assign_ip", gateway_ip),
            ("assign_mask", "24"),
        ]);
        self.run_appliance(
            sub_id,
            "assign_interface",
            "ASSIGN",
            "enable-assign-interface.yml",
            &extra,
        )
        .await
    }

    // ── Desktop roles ─────────────────────────────────────────────────────────

    pub async fn winrm_disable(
        &self,
        sub_id: &str,
        target: &WinRmTarget,
        win_version: &str,
    ) -> StepOutcome {
        let vars = BTreeMap::from([
            ("win_version".to_string(), win_version.to_string()),
            ("winrm_action".to_string(), "remove".to_string()),
        ]);
        self.run_role(sub_id, target, "winrm_disable", &vars, "winrm_disable")
            .await
    }

    pub async fn dc_bootstrap(
        &self,
        sub_id: &str,
        target: &WinRmTarget,
        plan: &ControllerBootstrap,
    ) -> StepOutcome {
        let vars = BTreeMap::from([
            ("domain_name".to_string(), plan.domain_name.clone()),
            ("ou_name".to_string(), plan.ou_name.clone()),
            ("admin_group_name".to_string(), plan.admin_group_name.clone()),
            ("admin_user_name".to_string(), plan.admin_user_name.clone()),
            ("admin_user_pass".to_string(), plan.admin_user_pass.clone()),
        ]);
        self.run_role(sub_id, target, "dc_post_bootstrap", &vars, "dc_post_bootstrap")
            .await
    }

    pub async fn ad_account_create(
        &self,
        sub_id: &str,
        controller: &WinRmTarget,
        account: &DirectoryAccount,
    ) -> StepOutcome {
        let vars = BTreeMap::from([
            ("domain_name".to_string(), account.domain_name.clone()),
            ("ou_name".to_string(), account.ou_name.clone()),
            ("group_name".to_string(), account.group_name.clone()),
            ("new_user_name".to_string(), account.user_name.clone()),
            ("new_user_pass".to_string(), account.password.clone()),
        ]);
        self.run_role(
            sub_id,
            controller,
            "ad_account_bootstrap",
            &vars,
            "ad_account_bootstrap",
        )
        .await
    }

    pub async fn join_domain(
        &self,
        sub_id: &str,
        target: &WinRmTarget,
        join: &DomainJoin,
    ) -> StepOutcome {
        let vars = BTreeMap::from([
            ("win_version".to_string(), join.win_version.clone()),
            ("domain_name".to_string(), join.domain_name.clone()),
            ("domain_controller_ip".to_string(), join.controller_ip.clone()),
            ("domain_user".to_string(), join.domain_user.clone()),
            ("domain_password".to_string(), join.domain_password.clone()),
            ("rdp_grant_user".to_string(), join.rdp_grant_user.clone()),
        ]);
        self.run_role(sub_id, target, "join_domain", &vars, "join_domain")
            .await
    }

    /// Install or configure one catalog app. The log is keyed by app code.
    pub async fn run_app(
        &self,
        sub_id: &str,
        target: &WinRmTarget,
        role: &str,
        app_code: &str,
        vars: &BTreeMap<String, String>,
    ) -> StepOutcome {
        self.run_role(sub_id, target, role, vars, app_code).await
    }

    async fn run_appliance(
        &self,
        sub_id: &str,
        suffix: &str,
        tag: &str,
        playbook: &str,
        extra: &str,
    ) -> StepOutcome {
        let s = &self.settings;
        let log_path = format!("{}/{sub_id}_{suffix}.log", s.logs_dir);
        let command = format!(
            "ansible-playbook {}/{playbook} -i {} {extra}",
            s.appliance_playbooks_dir, s.appliance_inventory
        );
        let script = marked_script(tag, &command, &log_path, &s.logs_dir);
        self.run_once(&script, log_path).await
    }

    async fn run_role(
        &self,
        sub_id: &str,
        target: &WinRmTarget,
        role: &str,
        vars: &BTreeMap<String, String>,
        log_tag: &str,
    ) -> StepOutcome {
        let s = &self.settings;
        let file_id = format!("{sub_id}_{log_tag}");
        let inventory = format!("{}/inventory_{file_id}.ini", s.jobs_dir);
        let playbook = format!("{}/playbook_{file_id}.yml", s.jobs_dir);
        let log_path = format!("{}/{file_id}.log", s.logs_dir);

        let uploaded = self
            .upload_pair(
                &inventory,
                &winrm_inventory(
                    std::slice::from_ref(&target.host),
                    target.port,
                    &target.user,
                    &target.password,
                ),
                &playbook,
                &role_playbook(&[role.to_string()], vars),
            )
            .await;
        if let Err(e) = uploaded {
            tracing::warn!(role, sub_id, error = %e, "failed to upload automation files");
            return StepOutcome {
                ok: false,
                log_path,
            };
        }

        let script = role_script(
            &s.roles_dir,
            &log_tag.to_ascii_uppercase(),
            &inventory,
            &playbook,
            &log_path,
            &s.logs_dir,
        );
        self.run_once(&script, log_path).await
    }

    async fn run_once(&self, script: &str, log_path: String) -> StepOutcome {
        let kill = KillSwitch::new();
        let ok = match self
            .host
            .run(script, self.settings.exec_timeout(), &kill)
            .await
        {
            Ok(outcome) => {
                if !outcome.success() {
                    tracing::info!(log = %log_path, ?outcome, "automation step failed");
                }
                outcome.success()
            }
            Err(e) => {
                tracing::warn!(log = %log_path, error = %e, "automation step could not run");
                false
            }
        };
        StepOutcome { ok, log_path }
    }

    async fn upload_pair(
        &self,
        inventory_path: &str,
        inventory: &str,
        playbook_path: &str,
        playbook: &str,
    ) -> Result<()> {
        self.host
            .upload(inventory_path, inventory)
            .await
            .with_context(|| format!("failed to upload {inventory_path}"))?;
        self.host
            .upload(playbook_path, playbook)
            .await
            .with_context(|| format!("failed to upload {playbook_path}"))
    }

    // ── Tracked jobs ──────────────────────────────────────────────────────────

    /// Upload the job's files and start it on its own task.
    ///
    /// # Errors
    ///
    /// Returns an error if the job lacks an id, a target or a role, if the id
    /// is already in use, or if the job files cannot be uploaded.
    pub async fn submit(self: &Arc<Self>, spec: TrackedJobSpec) -> Result<String> {
        let kill = self.prepare(&spec).await?;
        let this = Arc::clone(self);
        let job_id = spec.id.clone();
        tokio::spawn(async move {
            this.run_tracked(&spec.id, kill).await;
        });
        Ok(job_id)
    }

    /// Upload the job's files and drive it to a terminal state in place.
    ///
    /// # Errors
    ///
    /// See [`AutomationExecutor::submit`].
    pub async fn run(&self, spec: &TrackedJobSpec) -> Result<AutomationJob> {
        let kill = self.prepare(spec).await?;
        Ok(self.run_tracked(&spec.id, kill).await)
    }

    async fn prepare(&self, spec: &TrackedJobSpec) -> Result<KillSwitch> {
        if spec.id.trim().is_empty() {
            bail!("automation job id is required");
        }
        if spec.targets.is_empty() || spec.roles.is_empty() {
            bail!("automation job '{}' needs at least one target and one role", spec.id);
        }
        if self.lock_jobs().contains_key(&spec.id) {
            bail!("automation job '{}' already exists", spec.id);
        }

        let s = &self.settings;
        let mut vars = spec.extra_vars.clone();
        if let Some(version) = spec.win_version.as_deref().filter(|v| !v.trim().is_empty()) {
            vars.insert("win_version".to_string(), version.to_string());
        }
        self.upload_pair(
            &self.inventory_path(&spec.id),
            &winrm_inventory(&spec.targets, spec.port, &spec.user, &spec.password),
            &self.playbook_path(&spec.id),
            &role_playbook(&spec.roles, &vars),
        )
        .await?;

        let job = AutomationJob {
            id: spec.id.clone(),
            status: AutomationStatus::Pending,
            attempt: 0,
            max_retries: s.max_retries,
            next_backoff_ms: None,
            log_path: self.log_path(&spec.id),
            message: None,
            updated_at: self.clock.now(),
        };
        self.lock_jobs().insert(spec.id.clone(), job);

        let kill = KillSwitch::new();
        self.registry.register(&spec.id, kill.clone());
        Ok(kill)
    }

    /// Attempt loop: run, and on failure wait `attempt * backoff` and retry
    /// until `max_retries` retries are spent. A flipped kill switch ends the
    /// loop; the canceller owns the final status.
    async fn run_tracked(&self, job_id: &str, kill: KillSwitch) -> AutomationJob {
        let s = &self.settings;
        let inventory = self.inventory_path(job_id);
        let playbook = self.playbook_path(job_id);
        let log_path = self.log_path(job_id);
        let layout = AttemptLayout {
            job_id,
            roles_dir: &s.roles_dir,
            logs_dir: &s.logs_dir,
            pids_dir: &s.pids_dir,
            inventory: &inventory,
            playbook: &playbook,
            log_path: &log_path,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if kill.is_killed()
                || !self.transition(job_id, |job| {
                    job.status = AutomationStatus::Running;
                    job.attempt = attempt;
                    job.next_backoff_ms = None;
                })
            {
                break;
            }
            self.append_log(job_id, &format!("===== ATTEMPT #{attempt} START ====="))
                .await;
            tracing::info!(job_id, attempt, max = s.max_retries + 1, "automation attempt");

            let script = tracked_attempt_script(&layout, attempt);
            let succeeded = match self.host.run(&script, s.exec_timeout(), &kill).await {
                Ok(ExecOutcome::Exited(0)) => true,
                Ok(ExecOutcome::Exited(code)) => {
                    tracing::info!(job_id, attempt, code, "automation attempt failed");
                    false
                }
                Ok(ExecOutcome::TimedOut) => {
                    self.append_log(job_id, "===== TIMEOUT -> killing remote processes =====")
                        .await;
                    self.kill_remote(job_id).await;
                    false
                }
                Ok(ExecOutcome::Killed) => break,
                Err(e) => {
                    self.append_log(
                        job_id,
                        &format!("===== ATTEMPT #{attempt} EXCEPTION -> {e} ====="),
                    )
                    .await;
                    tracing::warn!(job_id, attempt, error = %e, "automation attempt errored");
                    false
                }
            };
            if kill.is_killed() {
                break;
            }

            if succeeded {
                self.append_log(job_id, &format!("===== ATTEMPT #{attempt} RESULT: SUCCESS ====="))
                    .await;
                self.finish(job_id, AutomationStatus::Success, None);
                break;
            }

            if attempt <= s.max_retries {
                let delay = s.retry_backoff_ms.saturating_mul(u64::from(attempt));
                self.append_log(
                    job_id,
                    &format!("===== ATTEMPT #{attempt} RESULT: FAILED -> RETRY in {delay} ms ====="),
                )
                .await;
                self.transition(job_id, |job| job.next_backoff_ms = Some(delay));
                tokio::select! {
                    () = self.clock.sleep(Duration::from_millis(delay)) => {}
                    () = kill.killed() => break,
                }
            } else {
                self.append_log(
                    job_id,
                    &format!("===== ATTEMPT #{attempt} RESULT: FAILED (NO MORE RETRIES) ====="),
                )
                .await;
                self.finish(
                    job_id,
                    AutomationStatus::Failed,
                    Some(format!("failed after {attempt} attempt(s)")),
                );
                break;
            }
        }

        self.registry.remove(job_id);
        let job = self.lock_jobs().get(job_id).cloned();
        match job {
            Some(job) => job,
            None => AutomationJob {
                id: job_id.to_string(),
                status: AutomationStatus::Failed,
                attempt,
                max_retries: s.max_retries,
                next_backoff_ms: None,
                log_path,
                message: Some("job record vanished".to_string()),
                updated_at: self.clock.now(),
            },
        }
    }

    /// Stop a tracked job: kill the local process, best-effort kill on the
    /// automation host, mark CANCELLED.
    ///
    /// # Errors
    ///
    /// Returns `AutomationError::JobNotFound` for an unknown id and
    /// `AutomationError::AlreadyFinished` when the job is already terminal.
    pub async fn cancel(&self, job_id: &str) -> Result<AutomationJob, AutomationError> {
        {
            let jobs = self.lock_jobs();
            let job = jobs
                .get(job_id)
                .ok_or_else(|| AutomationError::JobNotFound(job_id.to_string()))?;
            if job.status.is_terminal() {
                return Err(AutomationError::AlreadyFinished(job_id.to_string()));
            }
        }

        self.append_log(job_id, "===== CANCEL REQUESTED -> killing remote processes =====")
            .await;
        if let Some(switch) = self.registry.remove(job_id) {
            switch.kill();
        }
        self.kill_remote(job_id).await;
        self.append_log(job_id, "===== CANCELLED =====").await;

        let now = self.clock.now();
        let mut jobs = self.lock_jobs();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| AutomationError::JobNotFound(job_id.to_string()))?;
        job.status = AutomationStatus::Cancelled;
        job.next_backoff_ms = None;
        job.message = Some("cancelled".to_string());
        job.updated_at = now;
        tracing::info!(job_id, "automation job cancelled");
        Ok(job.clone())
    }

    /// # Errors
    ///
    /// Returns `AutomationError::JobNotFound` for an unknown id.
    pub fn status(&self, job_id: &str) -> Result<AutomationJob, AutomationError> {
        self.lock_jobs()
            .get(job_id)
            .cloned()
            .ok_or_else(|| AutomationError::JobNotFound(job_id.to_string()))
    }

    /// Read any remote automation log.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read from the automation host.
    pub async fn read_log(&self, path: &str) -> Result<String> {
        if path.trim().is_empty() {
            bail!("log path is empty");
        }
        self.host
            .read_file(path)
            .await
            .with_context(|| format!("failed to read remote log {path}"))
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn inventory_path(&self, job_id: &str) -> String {
        format!("{}/inventory_{job_id}.ini", self.settings.jobs_dir)
    }

    fn playbook_path(&self, job_id: &str) -> String {
        format!("{}/playbook_{job_id}.yml", self.settings.jobs_dir)
    }

    #[must_use]
    pub fn log_path(&self, job_id: &str) -> String {
        format!("{}/{job_id}.log", self.settings.logs_dir)
    }

    /// Apply `change` unless the job is already terminal.
    fn transition(&self, job_id: &str, change: impl FnOnce(&mut AutomationJob)) -> bool {
        let now = self.clock.now();
        let mut jobs = self.lock_jobs();
        match jobs.get_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                change(job);
                job.updated_at = now;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, job_id: &str, status: AutomationStatus, message: Option<String>) {
        self.transition(job_id, |job| {
            job.status = status;
            job.next_backoff_ms = None;
            job.message = message;
        });
    }

    async fn append_log(&self, job_id: &str, message: &str) {
        let stamp = self.clock.now().format("%Y-%m-%d %H:%M:%S").to_string();
        let script = format!(
            "mkdir -p {}; {}",
            self.settings.logs_dir,
            append_log_line(&self.log_path(job_id), &stamp, message)
        );
        if let Err(e) = self
            .host
            .run(&script, HOUSEKEEPING_TIMEOUT, &KillSwitch::new())
            .await
        {
            tracing::warn!(job_id, error = %e, "failed to append remote log line");
        }
    }

    async fn kill_remote(&self, job_id: &str) {
        let script = kill_remote_script(&self.settings.pids_dir, job_id);
        if let Err(e) = self
            .host
            .run(&script, HOUSEKEEPING_TIMEOUT, &KillSwitch::new())
            .await
        {
            tracing::warn!(job_id, error = %e, "remote kill failed");
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, AutomationJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
