//! Application service: desktop deletion and project destruction.
//!
//! Both flows only record a DELETING task and call the provider. Teardown of
//! NAT rules, records and memberships happens when the delete result arrives
//! (see [`InfraTaskStore::handle_delete_result`]).

use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;
use vdi_common::{InfraConfig, InfraTaskStatus};

use crate::application::ports::{InfraProvider, ProvisioningStore};
use crate::application::services::infra_tasks::{InfraTaskStore, WaitOutcome};
use crate::application::services::signal_bus::SignalFuture;
use crate::domain::error::ProvisionError;
use crate::domain::status::DeletionReport;

/// A submitted deletion, awaitable through [`Decommission::await_result`].
pub struct DeletionTicket {
    pub task_id: String,
    waiter: SignalFuture,
}

pub struct Decommission {
    store: Arc<dyn ProvisioningStore>,
    infra: Arc<dyn InfraProvider>,
    tasks: Arc<InfraTaskStore>,
    policy: InfraConfig,
}

impl Decommission {
    #[must_use]
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        infra: Arc<dyn InfraProvider>,
        tasks: Arc<InfraTaskStore>,
        policy: InfraConfig,
    ) -> Self {
        Self {
            store,
            infra,
            tasks,
            policy,
        }
    }

    /// Ask the provider to delete one desktop's instance.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::DesktopNotFound` for an unknown or already
    /// deleted desktop, `ProvisionError::InfraCall` if the provider rejects
    /// the request, or a store error.
    pub async fn delete_desktop(
        &self,
        vd_id: &str,
        region: Option<&str>,
    ) -> Result<DeletionTicket> {
        let desktop = self
            .store
            .desktop(vd_id)
            .await?
            .filter(|d| !d.deleted)
            .ok_or_else(|| ProvisionError::DesktopNotFound(vd_id.to_string()))?;

        let task_id = Uuid::new_v4().to_string();
        let waiter = self.tasks.create_deleting(&task_id, &desktop).await?;
        if let Err(e) = self
            .infra
            .delete_instance(&desktop.instance_id, &task_id, region)
            .await
        {
            return Err(self.rejected(&task_id, &e).await);
        }
        tracing::info!(vd_id, task_id = %task_id, "desktop deletion requested");
        Ok(DeletionTicket { task_id, waiter })
    }

    /// Ask the provider to destroy a whole project.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::InfraCall` if the provider rejects the
    /// request, or a store error.
    pub async fn destroy_project(
        &self,
        project_id: &str,
        region: Option<&str>,
    ) -> Result<DeletionTicket> {
        let task_id = Uuid::new_v4().to_string();
        let waiter = self
            .tasks
            .create_destroying_project(&task_id, project_id)
            .await?;
        if let Err(e) = self
            .infra
            .destroy_project(project_id, &task_id, region)
            .await
        {
            return Err(self.rejected(&task_id, &e).await);
        }
        tracing::info!(project_id, task_id = %task_id, "project destruction requested");
        Ok(DeletionTicket { task_id, waiter })
    }

    /// Wait for the delete result with the provisioning wait policy.
    pub async fn await_result(&self, ticket: DeletionTicket) -> WaitOutcome {
        let DeletionTicket { task_id, waiter } = ticket;
        self.tasks
            .await_terminal(
                &task_id,
                waiter,
                self.policy.result_timeout(),
                self.policy.grace(),
            )
            .await
    }

    /// Wait for the result and describe it for the caller.
    pub async fn await_report(&self, ticket: DeletionTicket) -> DeletionReport {
        let task_id = ticket.task_id.clone();
        match self.await_result(ticket).await {
            WaitOutcome::Done(task) => DeletionReport {
                task_id,
                status: Some(task.status),
                error: task.error,
            },
            WaitOutcome::Failed(reason) => DeletionReport {
                task_id,
                status: Some(InfraTaskStatus::DeleteFailed),
                error: Some(reason),
            },
            WaitOutcome::TimedOut => DeletionReport {
                task_id,
                status: None,
                error: None,
            },
        }
    }

    async fn rejected(&self, task_id: &str, cause: &anyhow::Error) -> anyhow::Error {
        let error = ProvisionError::InfraCall(format!("{cause:#}"));
        if let Err(e) = self.tasks.abandon(task_id, &error.to_string()).await {
            tracing::warn!(task_id, error = %e, "failed to abandon delete task");
        }
        error.into()
    }
}
