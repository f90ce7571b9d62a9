//! Application service: in-process completion signals keyed by task id.
//!
//! Each task gets a write-once slot. The event consumer or the timeout sweeper
//! completes it; any number of waiters observe the same value. Only the first
//! completion is kept.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use vdi_common::InfraTask;

/// Terminal outcome of an infra task: the stored task or a failure reason.
pub type Signal = Result<InfraTask, String>;

#[derive(Default)]
pub struct SignalBus {
    slots: Mutex<HashMap<String, watch::Sender<Option<Signal>>>>,
}

/// Waiter for one task's signal.
pub struct SignalFuture {
    rx: watch::Receiver<Option<Signal>>,
}

impl SignalFuture {
    /// Wait until the slot is completed. Returns `None` if the slot was
    /// forgotten before completion.
    pub async fn wait(&mut self) -> Option<Signal> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        }
    }

    /// Current value without waiting.
    #[must_use]
    pub fn try_get(&self) -> Option<Signal> {
        self.rx.borrow().clone()
    }
}

impl SignalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waiter for `task_id`, creating the slot if needed. A second waiter
    /// obtained after completion resolves immediately.
    pub fn future(&self, task_id: &str) -> SignalFuture {
        let mut slots = self.lock();
        let tx = slots
            .entry(task_id.to_string())
            .or_insert_with(|| watch::channel(None).0);
        SignalFuture { rx: tx.subscribe() }
    }

    /// Complete with a task. Returns `false` if already completed or if
    /// nobody ever asked for this task.
    pub fn complete(&self, task_id: &str, task: InfraTask) -> bool {
        self.settle(task_id, Ok(task))
    }

    /// Complete with a failure. Same return value as [`Self::complete`].
    pub fn complete_exceptionally(&self, task_id: &str, reason: impl Into<String>) -> bool {
        self.settle(task_id, Err(reason.into()))
    }

    /// Drop the slot. Pending waiters resolve to `None`.
    pub fn forget(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    /// Only slots created by [`Self::future`] are completed; late or
    /// duplicate results for a forgotten task never create one. A slot whose
    /// waiters are all gone is dropped once completed.
    fn settle(&self, task_id: &str, signal: Signal) -> bool {
        let mut slots = self.lock();
        let Some(tx) = slots.get(task_id) else {
            return false;
        };
        let settled = tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(signal);
            true
        });
        if tx.receiver_count() == 0 {
            slots.remove(task_id);
        }
        settled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<Option<Signal>>>> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
