//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and the shared data model,
//! never from `crate::infra`, `crate::commands`, or `crate::output`.
//!
//! Services hold ports as `Arc<dyn Port>` so one engine can be shared by the
//! background job tasks, the event consumer and the timeout sweeper.

use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use vdi_common::{
    AppDeployment, InfraTask, JobStep, ProvisionMode, ProvisioningJob, VirtualDesktop,
};

// ── Value Types ───────────────────────────────────────────────────────────────

/// Parameters of one batch submission to the infrastructure provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraSpec {
    pub base_vol_id: String,
    pub vol_size: u32,
    pub flavor_id: String,
    pub vol_type: String,
    pub count: u32,
    pub user_id: String,
    pub project_id: String,
}

/// How a remote execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The remote command exited; `0` is success.
    Exited(i32),
    /// The execution timeout fired and the local process was killed.
    TimedOut,
    /// The process was killed through its `KillSwitch`.
    Killed,
}

impl ExecOutcome {
    #[must_use]
    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

/// Handle used to forcibly stop one running local process.
///
/// Cloning shares the same switch; flipping it once is permanent.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl KillSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `kill` has been called.
    pub async fn killed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|killed| *killed).await;
    }
}

// ── Persistence Ports ─────────────────────────────────────────────────────────

/// Durable store for jobs, timeline, infra tasks, desktops and deployments.
#[async_trait]
pub trait ProvisioningStore: Send + Sync {
    async fn insert_job(&self, job: &ProvisioningJob) -> Result<()>;
    async fn update_job(&self, job: &ProvisioningJob) -> Result<()>;
    async fn job(&self, job_id: &str) -> Result<Option<ProvisioningJob>>;

    /// Append one timeline entry. Entries are never rewritten.
    async fn append_step(&self, step: &JobStep) -> Result<()>;
    /// Timeline of a job in append order.
    async fn steps(&self, job_id: &str) -> Result<Vec<JobStep>>;

    async fn save_task(&self, task: &InfraTask) -> Result<()>;
    async fn task(&self, task_id: &str) -> Result<Option<InfraTask>>;

    async fn save_desktop(&self, desktop: &VirtualDesktop) -> Result<()>;
    async fn desktop(&self, vd_id: &str) -> Result<Option<VirtualDesktop>>;
    async fn desktops_for_job(&self, job_id: &str) -> Result<Vec<VirtualDesktop>>;
    /// Desktops of a project that are not soft-deleted.
    async fn desktops_for_project(&self, project_id: &str) -> Result<Vec<VirtualDesktop>>;

    /// Atomically claim a public port. Returns `false` if already claimed.
    async fn reserve_port(&self, port: u16) -> Result<bool>;
    async fn release_port(&self, port: u16) -> Result<()>;

    async fn save_deployment(&self, deployment: &AppDeployment) -> Result<()>;
    async fn deployments_for_desktop(&self, vd_id: &str) -> Result<Vec<AppDeployment>>;
}

/// Project membership and credentials, owned outside the provisioner.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    /// Soft-delete every user link of the project; returns affected user ids.
    async fn remove_memberships(&self, project_id: &str) -> Result<Vec<String>>;
    /// Force a credential reset for the given users.
    async fn reset_credentials(&self, user_ids: &[String]) -> Result<()>;
    async fn mark_project_deleted(&self, project_id: &str) -> Result<()>;
}

// ── Infrastructure Provider Port ──────────────────────────────────────────────

/// Synchronous submission side of the provider. Results arrive later as
/// events correlated by `task_id`.
#[async_trait]
pub trait InfraProvider: Send + Sync {
    async fn submit(
        &self,
        mode: ProvisionMode,
        spec: &InfraSpec,
        task_id: &str,
        region: Option<&str>,
    ) -> Result<()>;
    async fn delete_instance(
        &self,
        instance_id: &str,
        task_id: &str,
        region: Option<&str>,
    ) -> Result<()>;
    async fn destroy_project(
        &self,
        project_id: &str,
        task_id: &str,
        region: Option<&str>,
    ) -> Result<()>;
}

// ── Remote Automation Port ────────────────────────────────────────────────────

/// The remote automation host: file upload plus single-command execution.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Write `content` to `remote_path`, creating parent directories.
    async fn upload(&self, remote_path: &str, content: &str) -> Result<()>;
    /// Run `script` in a remote shell. The local process is killed when
    /// `timeout` expires or `kill` is flipped.
    async fn run(&self, script: &str, timeout: Duration, kill: &KillSwitch) -> Result<ExecOutcome>;
    /// Read a remote text file.
    async fn read_file(&self, remote_path: &str) -> Result<String>;
}

// ── Command Runner Port ───────────────────────────────────────────────────────

/// Abstracts local process execution so infrastructure can be swapped or mocked.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a program, capturing output. On timeout the child is killed.
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output>;
    /// Run a program with stdin piped from `input`.
    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        input: &[u8],
        timeout: Duration,
    ) -> Result<Output>;
    /// Run a program that can be stopped by `kill` or by `timeout`.
    async fn run_killable(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
        kill: &KillSwitch,
    ) -> Result<ExecOutcome>;
}

// ── Network Probe Port ────────────────────────────────────────────────────────

/// Abstracts network connectivity checks so application services can be tested
/// without real network access.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Check TCP connectivity to the given host and port.
    async fn check_tcp_connectivity(&self, host: &str, port: u16) -> Result<bool>;
}

// ── Clock Port ────────────────────────────────────────────────────────────────

/// Time source for deadlines, stagger delays and poll loops.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}
