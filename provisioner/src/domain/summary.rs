//! Job summary synthesis from the step timeline.

use std::collections::HashMap;

use vdi_common::{JobStep, StepStatus};

const JOB_LABEL: &str = "JOB";

/// One line per timeline owner (job first, then desktops in first-seen order):
/// the last failed step with its detail, or `OK`.
#[must_use]
pub fn build_summary(steps: &[JobStep], names: &HashMap<String, String>) -> String {
    let mut order: Vec<Option<&str>> = Vec::new();
    let mut last_failure: HashMap<Option<&str>, &JobStep> = HashMap::new();

    for step in steps {
        let owner = step.vd_id.as_deref();
        if !order.contains(&owner) {
            order.push(owner);
        }
        if step.status == StepStatus::Failed {
            last_failure.insert(owner, step);
        }
    }

    order
        .into_iter()
        .map(|owner| {
            let label = match owner {
                None => JOB_LABEL,
                Some(vd_id) => names.get(vd_id).map_or(vd_id, String::as_str),
            };
            match last_failure.get(&owner) {
                Some(failed) => format!(
                    "[{label}] failed at step {} -> {}",
                    failed.step, failed.detail
                ),
                None => format!("[{label}] OK"),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
