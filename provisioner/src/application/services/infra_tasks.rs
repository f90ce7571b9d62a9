//! Application service: durable infra task records and their correlation
//! with provider events.
//!
//! A task is created before the provider is called, so a result that arrives
//! immediately still finds its waiter. Every terminal transition persists the
//! task, cancels its deadline and completes its bus slot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use vdi_common::{DeleteTarget, InfraTask, InfraTaskStatus, VirtualDesktop};

use crate::application::ports::{Clock, ProjectDirectory, ProvisioningStore};
use crate::application::services::automation::AutomationExecutor;
use crate::application::services::signal_bus::{SignalBus, SignalFuture};
use crate::application::services::timeout_tracker::{Expired, TimeoutTracker};
use crate::domain::event::SuccessPayload;
use crate::domain::text::{MAX_INFRA_ERROR, sanitize};

/// How a wait on an infra task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The task reached a terminal state; inspect its status.
    Done(InfraTask),
    /// The task was failed without a result (deadline sweep).
    Failed(String),
    /// Nothing arrived within the primary and grace windows and the store
    /// still holds no terminal state.
    TimedOut,
}

pub struct InfraTaskStore {
    store: Arc<dyn ProvisioningStore>,
    directory: Arc<dyn ProjectDirectory>,
    automation: Arc<AutomationExecutor>,
    bus: Arc<SignalBus>,
    tracker: Arc<TimeoutTracker>,
    clock: Arc<dyn Clock>,
}

impl InfraTaskStore {
    #[must_use]
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        directory: Arc<dyn ProjectDirectory>,
        automation: Arc<AutomationExecutor>,
        bus: Arc<SignalBus>,
        tracker: Arc<TimeoutTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            automation,
            bus,
            tracker,
            clock,
        }
    }

    // ── Creation ──────────────────────────────────────────────────────────────

    /// Record a PROVISIONING task and start its deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be persisted.
    pub async fn create_provisioning(
        &self,
        task_id: &str,
        expected_count: u32,
    ) -> Result<SignalFuture> {
        let now = self.clock.now();
        let waiter = self.bus.future(task_id);
        let mut task = InfraTask::new(task_id, InfraTaskStatus::Provisioning, now);
        task.expected_count = expected_count;
        self.store.save_task(&task).await?;
        self.tracker.register(task_id, expected_count, now);
        Ok(waiter)
    }

    /// Record a DELETING task for one desktop.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be persisted.
    pub async fn create_deleting(
        &self,
        task_id: &str,
        desktop: &VirtualDesktop,
    ) -> Result<SignalFuture> {
        self.create_delete_task(
            task_id,
            DeleteTarget::Desktop {
                vd_id: desktop.id.clone(),
                instance_id: desktop.instance_id.clone(),
            },
        )
        .await
    }

    /// Record a DELETING task for a whole project.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be persisted.
    pub async fn create_destroying_project(
        &self,
        task_id: &str,
        project_id: &str,
    ) -> Result<SignalFuture> {
        self.create_delete_task(
            task_id,
            DeleteTarget::Project {
                project_id: project_id.to_string(),
            },
        )
        .await
    }

    async fn create_delete_task(
        &self,
        task_id: &str,
        target: DeleteTarget,
    ) -> Result<SignalFuture> {
        let now = self.clock.now();
        let waiter = self.bus.future(task_id);
        let mut task = InfraTask::new(task_id, InfraTaskStatus::Deleting, now);
        task.expected_count = 1;
        task.delete_target = Some(target);
        self.store.save_task(&task).await?;
        self.tracker.register(task_id, 1, now);
        Ok(waiter)
    }

    // ── Event handling ────────────────────────────────────────────────────────

    /// Mark a provisioning task SUCCESS with its normalized instance list.
    ///
    /// A duplicate success is ignored. A success arriving after the deadline
    /// sweep failed the task overwrites that failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn handle_success(&self, task_id: &str, payload: &SuccessPayload) -> Result<()> {
        let now = self.clock.now();
        let mut task = match self.store.task(task_id).await? {
            Some(task) => task,
            None => {
                tracing::warn!(task_id, "success for unknown infra task; recording it");
                InfraTask::new(task_id, InfraTaskStatus::Provisioning, now)
            }
        };
        match task.status {
            InfraTaskStatus::Success => {
                tracing::debug!(task_id, "duplicate infra success ignored");
                return Ok(());
            }
            InfraTaskStatus::Deleting
            | InfraTaskStatus::Deleted
            | InfraTaskStatus::DeleteFailed => {
                tracing::warn!(
                    task_id,
                    status = ?task.status,
                    "success event for a delete task ignored"
                );
                return Ok(());
            }
            InfraTaskStatus::Provisioning | InfraTaskStatus::Failed => {}
        }

        task.status = InfraTaskStatus::Success;
        task.instances = payload.instances();
        task.error = None;
        task.updated_at = now;
        self.store.save_task(&task).await?;
        self.tracker.cancel(task_id);
        tracing::info!(task_id, instances = task.instances.len(), "infra task succeeded");
        self.bus.complete(task_id, task);
        Ok(())
    }

    /// Mark a task FAILED (or DELETE_FAILED for deletions) with a cleaned,
    /// clamped message. Terminal tasks are left unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn handle_error(&self, task_id: &str, message: &str) -> Result<()> {
        let now = self.clock.now();
        let mut task = match self.store.task(task_id).await? {
            Some(task) => task,
            None => {
                tracing::warn!(task_id, "error for unknown infra task; recording it");
                InfraTask::new(task_id, InfraTaskStatus::Provisioning, now)
            }
        };
        if task.status.is_terminal() {
            tracing::debug!(
                task_id,
                status = ?task.status,
                "error for terminal infra task ignored"
            );
            return Ok(());
        }

        task.status = if task.status == InfraTaskStatus::Deleting {
            InfraTaskStatus::DeleteFailed
        } else {
            InfraTaskStatus::Failed
        };
        task.error = Some(sanitize(message, MAX_INFRA_ERROR));
        task.updated_at = now;
        self.store.save_task(&task).await?;
        self.tracker.cancel(task_id);
        tracing::warn!(task_id, status = ?task.status, "infra task failed");
        self.bus.complete(task_id, task);
        Ok(())
    }

    /// Apply a provider delete result. On success the affected desktops are
    /// torn down (NAT rules best effort, soft delete, ports released) and a
    /// project cascade also removes memberships and marks the project.
    /// Results for tasks already DELETED or DELETE_FAILED are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or directory cannot be updated.
    pub async fn handle_delete_result(&self, task_id: &str, ok: bool, raw: &str) -> Result<()> {
        let Some(mut task) = self.store.task(task_id).await? else {
            tracing::warn!(task_id, "delete result for unknown infra task dropped");
            return Ok(());
        };
        if task.status != InfraTaskStatus::Deleting {
            tracing::debug!(task_id, status = ?task.status, "delete result ignored");
            return Ok(());
        }

        if ok {
            match task.delete_target.clone() {
                Some(DeleteTarget::Desktop { vd_id, .. }) => {
                    self.teardown_desktop(task_id, &vd_id).await?;
                }
                Some(DeleteTarget::Project { project_id }) => {
                    self.teardown_project(task_id, &project_id).await?;
                }
                None => tracing::warn!(task_id, "delete task has no target; nothing to tear down"),
            }
        }

        task.status = if ok {
            InfraTaskStatus::Deleted
        } else {
            InfraTaskStatus::DeleteFailed
        };
        if !ok {
            task.error = Some("provider reported delete failure".to_string());
        }
        task.raw_result = Some(raw.to_string());
        task.updated_at = self.clock.now();
        self.store.save_task(&task).await?;
        self.tracker.cancel(task_id);
        tracing::info!(task_id, ok, "infra delete result applied");
        self.bus.complete(task_id, task);
        Ok(())
    }

    async fn teardown_desktop(&self, task_id: &str, vd_id: &str) -> Result<()> {
        let Some(mut desktop) = self.store.desktop(vd_id).await? else {
            tracing::warn!(task_id, vd_id, "desktop to delete not found");
            return Ok(());
        };
        if desktop.deleted {
            return Ok(());
        }

        if let Some(wan_ip) = desktop.ip_public.clone().filter(|ip| !ip.trim().is_empty()) {
            for (kind, port) in [
                ("rdp", desktop.rdp_port_public),
                ("winrm", desktop.winrm_port_public),
            ] {
                let sub_id = format!("{task_id}_{vd_id}_{kind}");
                let outcome = self.automation.nat_delete(&sub_id, &wan_ip, port).await;
                if !outcome.ok {
                    tracing::warn!(
                        vd_id,
                        port,
                        log = %outcome.log_path,
                        "NAT removal failed during delete"
                    );
                }
            }
        }

        desktop.deleted = true;
        desktop.updated_at = self.clock.now();
        self.store.save_desktop(&desktop).await?;
        self.store.release_port(desktop.rdp_port_public).await?;
        self.store.release_port(desktop.winrm_port_public).await?;
        tracing::info!(vd_id, "desktop soft-deleted");
        Ok(())
    }

    async fn teardown_project(&self, task_id: &str, project_id: &str) -> Result<()> {
        for desktop in self.store.desktops_for_project(project_id).await? {
            self.teardown_desktop(task_id, &desktop.id).await?;
        }
        let users = self.directory.remove_memberships(project_id).await?;
        self.directory.reset_credentials(&users).await?;
        self.directory.mark_project_deleted(project_id).await?;
        tracing::info!(project_id, users = users.len(), "project destroyed");
        Ok(())
    }

    // ── Deadlines ─────────────────────────────────────────────────────────────

    /// Fail every tracked task past its deadline. Each task is claimed
    /// through `untrack`, so a concurrent sweep never fails it twice.
    /// Returns the number of tasks failed.
    ///
    /// # Errors
    ///
    /// Never fails as a whole; per-task store errors are logged.
    pub async fn sweep_timeouts(&self) -> Result<usize> {
        let mut swept = 0;
        for expired in self.tracker.expired(self.clock.now()) {
            if !self.tracker.untrack(&expired.task_id) {
                continue;
            }
            match self.expire(&expired).await {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        task_id = %expired.task_id,
                        error = %e,
                        "failed to expire infra task"
                    );
                }
            }
        }
        Ok(swept)
    }

    async fn expire(&self, expired: &Expired) -> Result<bool> {
        let task_id = expired.task_id.as_str();
        let budget = self
            .tracker
            .allowance()
            .saturating_mul(expired.expected_count);
        let message = format!(
            "Timeout after {} minutes (expected count: {})",
            budget.as_secs() / 60,
            expired.expected_count
        );

        let Some(mut task) = self.store.task(task_id).await? else {
            self.bus.complete_exceptionally(task_id, message);
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = if task.status == InfraTaskStatus::Deleting {
            InfraTaskStatus::DeleteFailed
        } else {
            InfraTaskStatus::Failed
        };
        task.error = Some(message.clone());
        task.updated_at = self.clock.now();
        self.store.save_task(&task).await?;
        tracing::warn!(task_id, %message, "infra task timed out");
        self.bus.complete_exceptionally(task_id, message);
        Ok(true)
    }

    /// Run [`InfraTaskStore::sweep_timeouts`] every `interval` until the
    /// returned handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.clock.sleep(interval).await;
                match this.sweep_timeouts().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(swept = n, "infra timeout sweep"),
                    Err(e) => tracing::warn!(error = %e, "infra timeout sweep failed"),
                }
            }
        })
    }

    // ── Waiting ───────────────────────────────────────────────────────────────

    /// Wait for a task's signal for `primary`, then for `grace`, then fall
    /// back to a direct store read.
    pub async fn await_terminal(
        &self,
        task_id: &str,
        mut waiter: SignalFuture,
        primary: Duration,
        grace: Duration,
    ) -> WaitOutcome {
        let mut windows = [primary, grace].into_iter();
        let signal = loop {
            let Some(window) = windows.next() else {
                break None;
            };
            tokio::select! {
                biased;
                signal = waiter.wait() => break signal,
                () = self.clock.sleep(window) => {
                    tracing::debug!(task_id, ?window, "infra wait window elapsed");
                }
            }
        };
        self.bus.forget(task_id);

        match signal {
            Some(Ok(task)) => WaitOutcome::Done(task),
            Some(Err(reason)) => WaitOutcome::Failed(reason),
            None => match self.store.task(task_id).await {
                Ok(Some(task)) if task.status.is_terminal() => WaitOutcome::Done(task),
                Ok(_) => WaitOutcome::TimedOut,
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "fallback read of infra task failed");
                    WaitOutcome::TimedOut
                }
            },
        }
    }

    /// Fail a task whose submission never reached the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be persisted.
    pub async fn abandon(&self, task_id: &str, reason: &str) -> Result<()> {
        self.tracker.cancel(task_id);
        self.bus.forget(task_id);
        let Some(mut task) = self.store.task(task_id).await? else {
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }
        task.status = if task.status == InfraTaskStatus::Deleting {
            InfraTaskStatus::DeleteFailed
        } else {
            InfraTaskStatus::Failed
        };
        task.error = Some(sanitize(reason, MAX_INFRA_ERROR));
        task.updated_at = self.clock.now();
        self.store.save_task(&task).await
    }

    /// Direct read, used as the fallback path and by status queries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn find(&self, task_id: &str) -> Result<Option<InfraTask>> {
        self.store.task(task_id).await
    }
}
