//! Valkey-backed `ProvisioningStore` and `ProjectDirectory`.
//!
//! Records are JSON strings under the `vdi:*` keys of `vdi_common::store_keys`;
//! lookups by job and project go through set indexes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use vdi_common::store_keys::{
    desktop_apps_key, desktop_key, infra_task_key, job_desktops_key, job_key, job_steps_key,
    project_deleted_key, project_desktops_key, project_members_key,
};
use vdi_common::{AppDeployment, InfraTask, JobStep, ProvisioningJob, VirtualDesktop, keys};

use crate::application::ports::{ProjectDirectory, ProvisioningStore};

#[derive(Clone)]
pub struct ValkeyStore {
    conn: MultiplexedConnection,
}

impl ValkeyStore {
    /// Connect and verify the server answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("failed to create Valkey client")?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to Valkey")?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Valkey startup PING failed")?;
        tracing::info!(url, "Valkey store ready");
        Ok(Self { conn })
    }

    async fn put<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let () = conn
            .set(key, json)
            .await
            .with_context(|| format!("SET {key}"))?;
        Ok(())
    }

    async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.with_context(|| format!("GET {key}"))?;
        raw.map(|json| {
            serde_json::from_str(&json).with_context(|| format!("malformed value at {key}"))
        })
        .transpose()
    }

    /// Desktops named by a set index, oldest first.
    async fn desktops_in(&self, index_key: &str) -> Result<Vec<VirtualDesktop>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(index_key)
            .await
            .with_context(|| format!("SMEMBERS {index_key}"))?;
        let mut desktops = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch::<VirtualDesktop>(&desktop_key(&id)).await {
                Ok(Some(desktop)) => desktops.push(desktop),
                Ok(None) => tracing::warn!(vd_id = %id, index_key, "indexed desktop missing"),
                Err(e) => tracing::warn!(vd_id = %id, error = %e, "skipping malformed desktop"),
            }
        }
        desktops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(desktops)
    }
}

#[async_trait]
impl ProvisioningStore for ValkeyStore {
    async fn insert_job(&self, job: &ProvisioningJob) -> Result<()> {
        let key = job_key(&job.id);
        let json = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let created: bool = conn
            .set_nx(&key, json)
            .await
            .with_context(|| format!("SETNX {key}"))?;
        if !created {
            anyhow::bail!("job {} already exists", job.id);
        }
        Ok(())
    }

    async fn update_job(&self, job: &ProvisioningJob) -> Result<()> {
        self.put(&job_key(&job.id), job).await
    }

    async fn job(&self, job_id: &str) -> Result<Option<ProvisioningJob>> {
        self.fetch(&job_key(job_id)).await
    }

    async fn append_step(&self, step: &JobStep) -> Result<()> {
        let key = job_steps_key(&step.job_id);
        let json = serde_json::to_string(step)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .rpush(&key, json)
            .await
            .with_context(|| format!("RPUSH {key}"))?;
        Ok(())
    }

    async fn steps(&self, job_id: &str) -> Result<Vec<JobStep>> {
        let key = job_steps_key(job_id);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(&key, 0, -1)
            .await
            .with_context(|| format!("LRANGE {key}"))?;
        raw.iter()
            .map(|json| {
                serde_json::from_str(json).with_context(|| format!("malformed step in {key}"))
            })
            .collect()
    }

    async fn save_task(&self, task: &InfraTask) -> Result<()> {
        self.put(&infra_task_key(&task.task_id), task).await
    }

    async fn task(&self, task_id: &str) -> Result<Option<InfraTask>> {
        self.fetch(&infra_task_key(task_id)).await
    }

    async fn save_desktop(&self, desktop: &VirtualDesktop) -> Result<()> {
        let json = serde_json::to_string(desktop)?;
        let mut conn = self.conn.clone();
        let () = redis::pipe()
            .atomic()
            .set(desktop_key(&desktop.id), json)
            .ignore()
            .sadd(job_desktops_key(&desktop.job_id), &desktop.id)
            .ignore()
            .sadd(project_desktops_key(&desktop.project_id), &desktop.id)
            .ignore()
            .query_async(&mut conn)
            .await
            .with_context(|| format!("saving desktop {}", desktop.id))?;
        Ok(())
    }

    async fn desktop(&self, vd_id: &str) -> Result<Option<VirtualDesktop>> {
        self.fetch(&desktop_key(vd_id)).await
    }

    async fn desktops_for_job(&self, job_id: &str) -> Result<Vec<VirtualDesktop>> {
        self.desktops_in(&job_desktops_key(job_id)).await
    }

    async fn desktops_for_project(&self, project_id: &str) -> Result<Vec<VirtualDesktop>> {
        let mut desktops = self.desktops_in(&project_desktops_key(project_id)).await?;
        desktops.retain(|d| !d.deleted);
        Ok(desktops)
    }

    async fn reserve_port(&self, port: u16) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .sadd(keys::PORTS, port)
            .await
            .context("SADD ports")?;
        Ok(added == 1)
    }

    async fn release_port(&self, port: u16) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .srem(keys::PORTS, port)
            .await
            .context("SREM ports")?;
        Ok(())
    }

    async fn save_deployment(&self, deployment: &AppDeployment) -> Result<()> {
        let key = desktop_apps_key(&deployment.vd_id);
        let json = serde_json::to_string(deployment)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hset(&key, &deployment.id, json)
            .await
            .with_context(|| format!("HSET {key}"))?;
        Ok(())
    }

    async fn deployments_for_desktop(&self, vd_id: &str) -> Result<Vec<AppDeployment>> {
        let key = desktop_apps_key(vd_id);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .hvals(&key)
            .await
            .with_context(|| format!("HVALS {key}"))?;
        let mut deployments = raw
            .iter()
            .map(|json| {
                serde_json::from_str::<AppDeployment>(json)
                    .with_context(|| format!("malformed deployment in {key}"))
            })
            .collect::<Result<Vec<_>>>()?;
        deployments.sort_by(|a, b| a.app_code.cmp(&b.app_code));
        Ok(deployments)
    }
}

#[async_trait]
impl ProjectDirectory for ValkeyStore {
    async fn remove_memberships(&self, project_id: &str) -> Result<Vec<String>> {
        let key = project_members_key(project_id);
        let mut conn = self.conn.clone();
        let (members, _removed): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .smembers(&key)
            .del(&key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("removing members of {project_id}"))?;
        Ok(members)
    }

    async fn reset_credentials(&self, user_ids: &[String]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .sadd(keys::CREDENTIAL_RESETS, user_ids)
            .await
            .context("SADD credential resets")?;
        Ok(())
    }

    async fn mark_project_deleted(&self, project_id: &str) -> Result<()> {
        let key = project_deleted_key(project_id);
        let mut conn = self.conn.clone();
        let () = conn
            .set(&key, Utc::now().to_rfc3339())
            .await
            .with_context(|| format!("SET {key}"))?;
        Ok(())
    }
}
