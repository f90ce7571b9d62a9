//! Provider result handling: dispatch, idempotence and deadline sweeps.

use std::time::Duration;

use vdi_common::InfraTaskStatus;
use vdi_provisioner::application::services::event_listener::Disposition;
use vdi_provisioner::application::services::infra_tasks::WaitOutcome;

use crate::fakes::{Reply, created_resources, harness};

fn success_for(task_id: &str, instances: usize) -> String {
    created_resources(instances).replace("{task}", task_id)
}

#[tokio::test]
async fn message_without_identifier_is_dropped() {
    let h = harness(Reply::Silent);
    assert_eq!(
        h.engine.listener.on_message("terraform crashed").await,
        Disposition::Dropped
    );
    assert_eq!(
        h.engine.listener.on_message(r#"{"result":true}"#).await,
        Disposition::Dropped
    );
}

#[tokio::test]
async fn success_resolves_waiter_with_instances() {
    let h = harness(Reply::Silent);
    let waiter = h.engine.tasks.create_provisioning("t-1", 2).await.unwrap();

    assert_eq!(
        h.engine.listener.on_message(&success_for("t-1", 2)).await,
        Disposition::Applied
    );
    let outcome = h
        .engine
        .tasks
        .await_terminal("t-1", waiter, Duration::from_secs(1), Duration::from_secs(1))
        .await;
    let WaitOutcome::Done(task) = outcome else {
        panic!("expected a terminal task, got {outcome:?}");
    };
    assert_eq!(task.status, InfraTaskStatus::Success);
    let ids: Vec<&str> = task.instances.iter().map(|i| i.instance_id.as_str()).collect();
    assert_eq!(ids, ["i-1", "i-2"]);
    // A finished task is no longer swept.
    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.engine.tasks.sweep_timeouts().await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_success_and_late_error_are_ignored() {
    let h = harness(Reply::Silent);
    let _waiter = h.engine.tasks.create_provisioning("t-2", 1).await.unwrap();
    h.engine.listener.on_message(&success_for("t-2", 1)).await;
    h.engine.listener.on_message(&success_for("t-2", 3)).await;
    h.engine
        .listener
        .on_message("Error: late failure {'identifier': 't-2'}")
        .await;

    let task = h.engine.tasks.find("t-2").await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Success);
    assert_eq!(task.instances.len(), 1);
    assert_eq!(task.error, None);
}

#[tokio::test]
async fn error_text_is_cleaned_before_storing() {
    let h = harness(Reply::Silent);
    let _waiter = h.engine.tasks.create_provisioning("t-3", 1).await.unwrap();
    h.engine
        .listener
        .on_message("\u{1b}[31mError:\u{1b}[0m no capacity \\x1b {'identifier': 't-3'}")
        .await;

    let task = h.engine.tasks.find("t-3").await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Failed);
    let error = task.error.expect("error text");
    assert!(error.starts_with("Error: no capacity"));
    assert!(!error.contains('\u{1b}'));
    assert!(!error.contains("\\x1b"));
}

#[tokio::test]
async fn result_for_unknown_task_is_recorded() {
    let h = harness(Reply::Silent);
    assert_eq!(
        h.engine.listener.on_message(&success_for("orphan", 1)).await,
        Disposition::Applied
    );
    let task = h.engine.tasks.find("orphan").await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Success);
}

#[tokio::test]
async fn delete_result_for_provisioning_task_is_ignored() {
    let h = harness(Reply::Silent);
    let _waiter = h.engine.tasks.create_provisioning("t-4", 1).await.unwrap();
    h.engine
        .listener
        .on_message(r#"{"identifier":"t-4","result":true}"#)
        .await;
    let task = h.engine.tasks.find("t-4").await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Provisioning);
}

#[tokio::test]
async fn error_on_delete_task_is_delete_failed() {
    let h = harness(Reply::Silent);
    let _waiter = h
        .engine
        .tasks
        .create_destroying_project("t-5", "p-x")
        .await
        .unwrap();
    h.engine
        .listener
        .on_message("Error: locked {'identifier': 't-5'}")
        .await;
    let task = h.engine.tasks.find("t-5").await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::DeleteFailed);
}

#[tokio::test]
async fn sweep_fails_overdue_task_once_and_late_success_wins() {
    let h = harness(Reply::Silent);
    let waiter = h.engine.tasks.create_provisioning("t-6", 2).await.unwrap();

    h.clock.advance(Duration::from_secs(239));
    assert_eq!(h.engine.tasks.sweep_timeouts().await.unwrap(), 0);

    h.clock.advance(Duration::from_secs(2));
    assert_eq!(h.engine.tasks.sweep_timeouts().await.unwrap(), 1);
    assert_eq!(h.engine.tasks.sweep_timeouts().await.unwrap(), 0);

    let expected = "Timeout after 4 minutes (expected count: 2)";
    let task = h.engine.tasks.find("t-6").await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some(expected));

    let outcome = h
        .engine
        .tasks
        .await_terminal("t-6", waiter, Duration::from_secs(1), Duration::from_secs(1))
        .await;
    assert_eq!(outcome, WaitOutcome::Failed(expected.to_string()));

    h.engine.listener.on_message(&success_for("t-6", 2)).await;
    let task = h.engine.tasks.find("t-6").await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Success);
    assert_eq!(task.error, None);
    assert_eq!(task.instances.len(), 2);
}

#[tokio::test]
async fn wait_falls_back_to_store_when_signal_is_missed() {
    let h = harness(Reply::Silent);
    let waiter = h.engine.tasks.create_provisioning("t-7", 1).await.unwrap();
    let outcome = h
        .engine
        .tasks
        .await_terminal("t-7", waiter, Duration::from_secs(5), Duration::from_secs(5))
        .await;
    assert_eq!(outcome, WaitOutcome::TimedOut);

    // The slot is gone; a result after the wait is only visible in the store.
    h.engine.listener.on_message(&success_for("t-7", 1)).await;
    let task = h.engine.tasks.find("t-7").await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Success);
}
