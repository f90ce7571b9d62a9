//! Tracked automation jobs: retries with backoff, exhaustion and cancellation.

#![allow(clippy::expect_used)]

use std::collections::BTreeMap;

use vdi_common::AutomationStatus;
use vdi_provisioner::application::ports::Clock;
use vdi_provisioner::application::services::automation::TrackedJobSpec;
use vdi_provisioner::domain::error::AutomationError;

use crate::fakes::{Attempt, Reply, harness};

fn spec(id: &str) -> TrackedJobSpec {
    TrackedJobSpec {
        id: id.to_string(),
        targets: vec!["10.0.0.11".to_string(), "10.0.0.12".to_string()],
        port: 5985,
        user: "Administrator".to_string(),
        password: "pw".to_string(),
        roles: vec!["chrome".to_string(), "winrm_disable".to_string()],
        win_version: Some("2019".to_string()),
        extra_vars: BTreeMap::from([("channel".to_string(), "stable".to_string())]),
    }
}

#[tokio::test]
async fn failed_attempt_is_retried_after_backoff() {
    let h = harness(Reply::Silent);
    h.remote
        .script_attempts(&[Attempt::Exit(2), Attempt::Exit(0)]);
    let started = h.clock.now();

    let job = h.engine.automation.run(&spec("job-1")).await.expect("run");

    assert_eq!(job.status, AutomationStatus::Success);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.next_backoff_ms, None);
    assert_eq!(job.log_path, "/ansible-host/logs/job-1.log");
    assert_eq!(h.remote.count("START ansible-playbook"), 2);
    assert_eq!(h.remote.count("RETRY in 1000 ms"), 1);
    assert_eq!(h.remote.count("ATTEMPT #2 RESULT: SUCCESS"), 1);
    assert_eq!(h.clock.now() - started, chrono::Duration::seconds(1));

    let scripts = h.remote.scripts();
    let position = |marker: &str| {
        scripts
            .iter()
            .position(|s| s.contains(marker))
            .unwrap_or_else(|| panic!("no script contains {marker}"))
    };
    let markers = [
        "ATTEMPT #1 START",
        "ATTEMPT #1 RESULT: FAILED -> RETRY in 1000 ms",
        "ATTEMPT #2 START",
        "ATTEMPT #2 RESULT: SUCCESS",
    ];
    let positions: Vec<usize> = markers.iter().map(|m| position(m)).collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "attempt markers out of order: {positions:?}"
    );
}

#[tokio::test]
async fn retries_are_bounded_with_growing_backoff() {
    let h = harness(Reply::Silent);
    h.remote.script_attempts(&[
        Attempt::Exit(1),
        Attempt::Exit(1),
        Attempt::Exit(1),
        Attempt::Exit(0),
    ]);

    let job = h.engine.automation.run(&spec("job-2")).await.expect("run");

    assert_eq!(job.status, AutomationStatus::Failed);
    assert_eq!(job.attempt, 3);
    assert_eq!(job.message.as_deref(), Some("failed after 3 attempt(s)"));
    assert_eq!(h.remote.count("START ansible-playbook"), 3);
    assert_eq!(h.remote.count("RETRY in 1000 ms"), 1);
    assert_eq!(h.remote.count("RETRY in 2000 ms"), 1);
    assert_eq!(h.remote.count("NO MORE RETRIES"), 1);
}

#[tokio::test]
async fn job_files_carry_targets_roles_and_vars() {
    let h = harness(Reply::Silent);
    h.engine.automation.run(&spec("job-3")).await.expect("run");

    let uploads = h.remote.uploads();
    let inventory = uploads
        .iter()
        .find(|(p, _)| p == "/ansible-host/jobs/inventory_job-3.ini")
        .map(|(_, body)| body.as_str())
        .expect("inventory uploaded");
    assert!(inventory.contains("10.0.0.11\n10.0.0.12\n"));
    assert!(inventory.contains("ansible_port=5985\n"));

    let playbook = uploads
        .iter()
        .find(|(p, _)| p == "/ansible-host/jobs/playbook_job-3.yml")
        .map(|(_, body)| body.as_str())
        .expect("playbook uploaded");
    assert!(playbook.contains("  - role: chrome\n"));
    assert!(playbook.contains("  - role: winrm_disable\n"));
    assert!(playbook.contains("    win_version: '2019'\n"));
    assert!(playbook.contains("    channel: 'stable'\n"));
}

#[tokio::test]
async fn running_job_can_be_cancelled_once() {
    let h = harness(Reply::Silent);
    h.remote.script_attempts(&[Attempt::Hang]);
    let executor = &h.engine.automation;

    let id = executor.submit(spec("job-4")).await.expect("submit");
    for _ in 0..100 {
        if executor.status(&id).expect("known job").status == AutomationStatus::Running {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(executor.status(&id).unwrap().status, AutomationStatus::Running);

    let job = executor.cancel(&id).await.expect("cancel");
    assert_eq!(job.status, AutomationStatus::Cancelled);
    assert_eq!(h.remote.count("pkill -f playbook_job-4.yml"), 1);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(executor.status(&id).unwrap().status, AutomationStatus::Cancelled);
    assert_eq!(
        executor.cancel(&id).await.unwrap_err(),
        AutomationError::AlreadyFinished(id)
    );
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = harness(Reply::Silent);
    let executor = &h.engine.automation;
    assert_eq!(
        executor.status("nope").unwrap_err(),
        AutomationError::JobNotFound("nope".into())
    );
    assert_eq!(
        executor.cancel("nope").await.unwrap_err().to_string(),
        "Automation job 'nope' not found."
    );
}

#[tokio::test]
async fn duplicate_or_incomplete_jobs_are_rejected() {
    let h = harness(Reply::Silent);
    let executor = &h.engine.automation;
    executor.run(&spec("job-5")).await.expect("first run");
    let err = executor.run(&spec("job-5")).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));

    let mut no_targets = spec("job-6");
    no_targets.targets.clear();
    assert!(executor.run(&no_targets).await.is_err());
    assert!(executor.status("job-6").is_err());
}

#[tokio::test]
async fn logs_are_read_from_the_automation_host() {
    let h = harness(Reply::Silent);
    let executor = &h.engine.automation;
    let path = executor.log_path("job-7");
    assert_eq!(
        executor.read_log(&path).await.unwrap(),
        "contents of /ansible-host/logs/job-7.log\n"
    );
    assert!(executor.read_log("  ").await.is_err());
}
