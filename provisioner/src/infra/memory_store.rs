//! In-process `ProvisioningStore` and `ProjectDirectory`.
//!
//! Used by tests and by `--ephemeral` runs where nothing outlives the process.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use vdi_common::{AppDeployment, InfraTask, JobStep, ProvisioningJob, VirtualDesktop};

use crate::application::ports::{ProjectDirectory, ProvisioningStore};

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, ProvisioningJob>,
    steps: HashMap<String, Vec<JobStep>>,
    tasks: HashMap<String, InfraTask>,
    /// Insertion order is kept so lookups are deterministic.
    desktops: BTreeMap<(u64, String), VirtualDesktop>,
    desktop_seq: HashMap<String, u64>,
    next_seq: u64,
    ports: HashSet<u16>,
    deployments: HashMap<String, Vec<AppDeployment>>,
    members: HashMap<String, BTreeSet<String>>,
    credential_resets: BTreeSet<String>,
    deleted_projects: BTreeSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_member(&self, project_id: &str, user_id: &str) {
        self.lock()
            .members
            .entry(project_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    #[must_use]
    pub fn members(&self, project_id: &str) -> Vec<String> {
        self.lock()
            .members
            .get(project_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn credential_resets(&self) -> Vec<String> {
        self.lock().credential_resets.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_project_deleted(&self, project_id: &str) -> bool {
        self.lock().deleted_projects.contains(project_id)
    }

    #[must_use]
    pub fn reserved_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().ports.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    fn desktops_where(&self, keep: impl Fn(&VirtualDesktop) -> bool) -> Vec<VirtualDesktop> {
        self.lock()
            .desktops
            .values()
            .filter(|d| keep(d))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProvisioningStore for MemoryStore {
    async fn insert_job(&self, job: &ProvisioningJob) -> Result<()> {
        let mut tables = self.lock();
        if tables.jobs.contains_key(&job.id) {
            anyhow::bail!("job {} already exists", job.id);
        }
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &ProvisioningJob) -> Result<()> {
        self.lock().jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn job(&self, job_id: &str) -> Result<Option<ProvisioningJob>> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    async fn append_step(&self, step: &JobStep) -> Result<()> {
        self.lock()
            .steps
            .entry(step.job_id.clone())
            .or_default()
            .push(step.clone());
        Ok(())
    }

    async fn steps(&self, job_id: &str) -> Result<Vec<JobStep>> {
        Ok(self.lock().steps.get(job_id).cloned().unwrap_or_default())
    }

    async fn save_task(&self, task: &InfraTask) -> Result<()> {
        self.lock().tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn task(&self, task_id: &str) -> Result<Option<InfraTask>> {
        Ok(self.lock().tasks.get(task_id).cloned())
    }

    async fn save_desktop(&self, desktop: &VirtualDesktop) -> Result<()> {
        let mut tables = self.lock();
        let seq = match tables.desktop_seq.get(&desktop.id) {
            Some(seq) => *seq,
            None => {
                let seq = tables.next_seq;
                tables.next_seq += 1;
                tables.desktop_seq.insert(desktop.id.clone(), seq);
                seq
            }
        };
        tables
            .desktops
            .insert((seq, desktop.id.clone()), desktop.clone());
        Ok(())
    }

    async fn desktop(&self, vd_id: &str) -> Result<Option<VirtualDesktop>> {
        let tables = self.lock();
        Ok(tables
            .desktop_seq
            .get(vd_id)
            .and_then(|seq| tables.desktops.get(&(*seq, vd_id.to_string())))
            .cloned())
    }

    async fn desktops_for_job(&self, job_id: &str) -> Result<Vec<VirtualDesktop>> {
        Ok(self.desktops_where(|d| d.job_id == job_id))
    }

    async fn desktops_for_project(&self, project_id: &str) -> Result<Vec<VirtualDesktop>> {
        Ok(self.desktops_where(|d| d.project_id == project_id && !d.deleted))
    }

    async fn reserve_port(&self, port: u16) -> Result<bool> {
        Ok(self.lock().ports.insert(port))
    }

    async fn release_port(&self, port: u16) -> Result<()> {
        self.lock().ports.remove(&port);
        Ok(())
    }

    async fn save_deployment(&self, deployment: &AppDeployment) -> Result<()> {
        let mut tables = self.lock();
        let list = tables
            .deployments
            .entry(deployment.vd_id.clone())
            .or_default();
        match list.iter_mut().find(|d| d.id == deployment.id) {
            Some(existing) => *existing = deployment.clone(),
            None => list.push(deployment.clone()),
        }
        Ok(())
    }

    async fn deployments_for_desktop(&self, vd_id: &str) -> Result<Vec<AppDeployment>> {
        Ok(self
            .lock()
            .deployments
            .get(vd_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ProjectDirectory for MemoryStore {
    async fn remove_memberships(&self, project_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .members
            .remove(project_id)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default())
    }

    async fn reset_credentials(&self, user_ids: &[String]) -> Result<()> {
        self.lock()
            .credential_resets
            .extend(user_ids.iter().cloned());
        Ok(())
    }

    async fn mark_project_deleted(&self, project_id: &str) -> Result<()> {
        self.lock().deleted_projects.insert(project_id.to_string());
        Ok(())
    }
}
