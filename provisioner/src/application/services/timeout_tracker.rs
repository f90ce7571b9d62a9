//! Application service: deadlines for in-flight infra tasks.
//!
//! The deadline of a task is `registered_at + expected_count * allowance`.
//! The sweeper asks for expired entries and untracks each one before acting
//! on it, so a task is timed out at most once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A tracked task whose deadline has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub task_id: String,
    pub expected_count: u32,
}

struct Entry {
    deadline: DateTime<Utc>,
    expected_count: u32,
}

pub struct TimeoutTracker {
    allowance: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl TimeoutTracker {
    #[must_use]
    pub fn new(per_instance_allowance: Duration) -> Self {
        Self {
            allowance: per_instance_allowance,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the deadline for `task_id`.
    pub fn register(&self, task_id: &str, expected_count: u32, now: DateTime<Utc>) {
        let count = expected_count.max(1);
        let budget = self.allowance.saturating_mul(count);
        let deadline = chrono::Duration::from_std(budget)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.lock().insert(
            task_id.to_string(),
            Entry {
                deadline,
                expected_count: count,
            },
        );
    }

    pub fn cancel(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    /// Snapshot of entries past their deadline. Entries stay tracked until
    /// [`TimeoutTracker::untrack`] claims them.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Expired> {
        let mut out: Vec<Expired> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, e)| Expired {
                task_id: id.clone(),
                expected_count: e.expected_count,
            })
            .collect();
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }

    /// Remove `task_id`. Returns `true` only for the caller that removed it.
    pub fn untrack(&self, task_id: &str) -> bool {
        self.lock().remove(task_id).is_some()
    }

    #[must_use]
    pub fn is_tracked(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    #[must_use]
    pub fn allowance(&self) -> Duration {
        self.allowance
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
