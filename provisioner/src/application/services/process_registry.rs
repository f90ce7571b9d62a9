//! Kill switches of running automation processes, keyed by job id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::application::ports::KillSwitch;

#[derive(Default)]
pub struct ProcessRegistry {
    running: Mutex<HashMap<String, KillSwitch>>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: &str, switch: KillSwitch) {
        self.lock().insert(job_id.to_string(), switch);
    }

    #[must_use]
    pub fn lookup(&self, job_id: &str) -> Option<KillSwitch> {
        self.lock().get(job_id).cloned()
    }

    pub fn remove(&self, job_id: &str) -> Option<KillSwitch> {
        self.lock().remove(job_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, KillSwitch>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
