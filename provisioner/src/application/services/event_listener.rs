//! Application service: dispatch of raw provider messages.
//!
//! The listener never fails a delivery: undecodable messages and handler
//! errors are logged, and the caller acknowledges every message so the
//! channel does not redeliver it forever.

use std::sync::Arc;

use crate::application::services::infra_tasks::InfraTaskStore;
use crate::domain::event::{InfraEvent, decode};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Dropped,
    Failed,
}

pub struct InfraEventListener {
    tasks: Arc<InfraTaskStore>,
}

impl InfraEventListener {
    #[must_use]
    pub fn new(tasks: Arc<InfraTaskStore>) -> Self {
        Self { tasks }
    }

    /// Decode and apply one message.
    pub async fn on_message(&self, body: &str) -> Disposition {
        let event = match decode(body) {
            Ok(event) => event,
            Err(e) => {
                let preview: String = body.chars().take(200).collect();
                tracing::warn!(reason = e.reason, %preview, "infra message dropped");
                return Disposition::Dropped;
            }
        };

        let task_id = event.task_id().to_string();
        let applied = match &event {
            InfraEvent::Success { task_id, payload } => {
                self.tasks.handle_success(task_id, payload).await
            }
            InfraEvent::Error { task_id, message } => {
                self.tasks.handle_error(task_id, message).await
            }
            InfraEvent::DeleteResult { task_id, ok, raw } => {
                self.tasks.handle_delete_result(task_id, *ok, raw).await
            }
        };

        match applied {
            Ok(()) => Disposition::Applied,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "failed to apply infra event");
                Disposition::Failed
            }
        }
    }
}
