//! End-to-end provisioning jobs over fakes: submit, result correlation,
//! per-desktop pipelines and the job summary.

#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::time::Duration;

use vdi_common::{
    AppRequest, AppStatus, DesktopStatus, DomainPlan, InfraTaskStatus, JobStatus, ProvisionMode,
    ProvisionRequest, StepStatus,
};
use vdi_provisioner::domain::error::ProvisionError;
use vdi_provisioner::domain::status::JobSnapshot;

use crate::fakes::{
    Harness, Reply, SHARED_IP, added_resources, created_resources, flaky_harness, harness,
    harness_with, organization_resources, request, test_config,
};

async fn provision(h: &Harness, mode: ProvisionMode, req: ProvisionRequest) -> JobSnapshot {
    let ticket = h
        .engine
        .orchestrator
        .submit(mode, req, None)
        .await
        .expect("submit");
    ticket.handle.await.expect("job task");
    h.engine
        .orchestrator
        .get_status(&ticket.job_id)
        .await
        .expect("status")
}

fn task_id_of(snapshot: &JobSnapshot) -> String {
    snapshot
        .timeline
        .iter()
        .find_map(|s| s.detail.strip_prefix("taskId="))
        .expect("create_instance step")
        .to_string()
}

fn sorted_names(snapshot: &JobSnapshot) -> Vec<String> {
    let mut names: Vec<String> = snapshot
        .desktops
        .iter()
        .map(|d| d.desktop.name.clone())
        .collect();
    names.sort();
    names
}

fn app(code: &str) -> AppRequest {
    AppRequest {
        code: code.to_string(),
        ..AppRequest::default()
    }
}

// ── Happy paths ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn personal_batch_with_app_becomes_ready() {
    let h = harness(Reply::Deliver(created_resources(2)));
    let mut req = request(2);
    req.apps = vec![app("chrome")];

    let snapshot = provision(&h, ProvisionMode::Personal, req).await;

    let job = &snapshot.job;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!((job.total_vms, job.success_vms, job.failed_vms), (2, 2, 0));
    assert_eq!(sorted_names(&snapshot), ["lab-1", "lab-2"]);

    let mut ports = Vec::new();
    for d in &snapshot.desktops {
        let vd = &d.desktop;
        assert_eq!(vd.status, DesktopStatus::Ready);
        assert!(vd.winrm_disabled);
        assert_eq!(vd.ip_public.as_deref(), Some(SHARED_IP));
        assert_eq!(vd.admin_username, "alice");
        assert_eq!(vd.password, "********", "credentials are masked in reads");
        assert_eq!(d.apps.len(), 1);
        assert_eq!(d.apps[0].status, AppStatus::Success);
        assert!(d.apps[0].log_path.is_some());
        ports.extend([vd.rdp_port_public, vd.winrm_port_public]);
    }
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 4, "every public port is distinct");
    assert!(ports.iter().all(|p| (20_000..=20_099).contains(p)));
    assert_eq!(h.store.reserved_ports(), ports);

    // Two forwards per desktop; the WinRM one is always removed again.
    assert_eq!(h.remote.count("===== NAT START"), 4);
    assert_eq!(h.remote.count("===== NAT DELETE START"), 2);
    assert_eq!(h.remote.count("===== WINRM_DISABLE START"), 2);
    assert_eq!(h.infra.calls(), ["submit:personal:2"]);

    let message = job.message.as_deref().expect("summary");
    assert!(message.starts_with("[JOB] OK"));
    assert!(message.contains("[lab-1] OK"));
    assert!(message.contains("[lab-2] OK"));
}

#[tokio::test]
async fn single_desktop_keeps_plain_name() {
    let h = harness(Reply::Deliver(created_resources(1)));
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;
    assert_eq!(sorted_names(&snapshot), ["lab"]);
    let steps: Vec<&str> = snapshot.desktops[0]
        .timeline
        .iter()
        .map(|s| s.step.as_str())
        .collect();
    assert_eq!(
        steps,
        [
            "save_db",
            "create_nat",
            "create_nat_winrm",
            "winrm_probe",
            "apps",
            "winrm_disable",
            "delete_nat_winrm"
        ]
    );
}

#[tokio::test]
async fn instance_count_follows_the_provider_result() {
    let h = harness(Reply::Deliver(created_resources(3)));
    let snapshot = provision(&h, ProvisionMode::Personal, request(2)).await;
    assert_eq!(snapshot.job.total_vms, 3);
    assert_eq!(snapshot.job.success_vms, 3);
}

#[tokio::test]
async fn winrm_disable_failure_leaves_desktop_ready_with_warning() {
    let h = harness(Reply::Deliver(created_resources(1)));
    h.remote.fail_on("===== WINRM_DISABLE START");
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;
    assert_eq!(snapshot.job.status, JobStatus::Success);
    let vd = &snapshot.desktops[0].desktop;
    assert_eq!(vd.status, DesktopStatus::ReadyWithWarn);
    assert!(!vd.winrm_disabled);
}

// ── Job-level failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_app_fails_validation_before_any_infra_call() {
    let h = harness(Reply::Deliver(created_resources(1)));
    let mut req = request(1);
    req.apps = vec![app("vlc")];
    let snapshot = provision(&h, ProvisionMode::Personal, req).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    assert_eq!(
        snapshot.job.message.as_deref(),
        Some("Validation failed: unknown app 'vlc'")
    );
    assert!(h.infra.calls().is_empty());
    assert!(snapshot.desktops.is_empty());
}

#[tokio::test]
async fn missing_required_app_var_fails_validation() {
    let h = harness(Reply::Deliver(created_resources(1)));
    let mut req = request(1);
    req.apps = vec![app("office")];
    let snapshot = provision(&h, ProvisionMode::Personal, req).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    assert!(
        snapshot
            .job
            .message
            .as_deref()
            .is_some_and(|m| m.contains("missing required vars: license"))
    );
}

#[tokio::test]
async fn provider_error_message_fails_the_job() {
    let h = harness(Reply::Deliver(
        "\u{1b}[31mError:\u{1b}[0m quota exceeded {'identifier': '{task}'}".to_string(),
    ));
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    let message = snapshot.job.message.as_deref().expect("message");
    assert!(message.starts_with("Provision infra FAILED: Error: quota exceeded"));
    assert!(!message.contains('\u{1b}'));
    assert!(snapshot.desktops.is_empty());

    let task = h
        .engine
        .tasks
        .find(&task_id_of(&snapshot))
        .await
        .expect("read")
        .expect("task");
    assert_eq!(task.status, InfraTaskStatus::Failed);
}

#[tokio::test]
async fn empty_instance_list_fails_the_job() {
    let h = harness(Reply::Deliver(
        r#"{"identifier":"{task}","created_resources":[]}"#.to_string(),
    ));
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    assert_eq!(
        snapshot.job.message.as_deref(),
        Some("Provision infra FAILED: no instances returned")
    );
}

#[tokio::test]
async fn rejected_submission_is_retried_once() {
    let h = harness(Reply::Deliver(created_resources(1)));
    h.infra.reject_next(1);
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;
    assert_eq!(snapshot.job.status, JobStatus::Success);
    assert_eq!(h.infra.calls().len(), 2);
}

#[tokio::test]
async fn twice_rejected_submission_fails_the_job() {
    let h = harness(Reply::Deliver(created_resources(1)));
    h.infra.reject_next(2);
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    let message = snapshot.job.message.as_deref().expect("message");
    assert!(message.starts_with("Infra request rejected:"));
    assert!(message.contains("HTTP 503"));

    let task = h
        .engine
        .tasks
        .find(&task_id_of(&snapshot))
        .await
        .expect("read")
        .expect("task");
    assert_eq!(task.status, InfraTaskStatus::Failed);
}

#[tokio::test]
async fn silent_provider_times_out_and_late_success_is_kept() {
    let h = harness(Reply::Silent);
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    let task_id = task_id_of(&snapshot);
    assert_eq!(
        snapshot.job.message.as_deref(),
        Some(format!("Timeout waiting infra result (task {task_id})").as_str())
    );
    assert!(snapshot.desktops.is_empty());
    assert!(h.store.reserved_ports().is_empty());

    // The waits advanced virtual time past the one-instance deadline.
    assert_eq!(h.engine.tasks.sweep_timeouts().await.expect("sweep"), 1);
    let task = h.engine.tasks.find(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Failed);
    assert_eq!(
        task.error.as_deref(),
        Some("Timeout after 2 minutes (expected count: 1)")
    );

    let late = created_resources(1).replace("{task}", &task_id);
    h.engine.listener.on_message(&late).await;
    let task = h.engine.tasks.find(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, InfraTaskStatus::Success);
    assert_eq!(task.instances.len(), 1);
}

#[tokio::test]
async fn pipelines_start_staggered_by_index() {
    let mut config = test_config();
    config.network.stagger_secs = 7;
    let h = harness_with(config, Reply::Deliver(created_resources(3)), true);
    let snapshot = provision(&h, ProvisionMode::Personal, request(3)).await;
    assert_eq!(snapshot.job.status, JobStatus::Success);

    let sleeps = h.clock.sleeps();
    for delay in [0, 7, 14] {
        assert!(
            sleeps.contains(&Duration::from_secs(delay)),
            "missing {delay}s start delay in {sleeps:?}"
        );
    }
    assert!(!sleeps.contains(&Duration::from_secs(21)));
}

#[tokio::test]
async fn unknown_job_status_is_not_found() {
    let h = harness(Reply::Silent);
    let err = h
        .engine
        .orchestrator
        .get_status("nope")
        .await
        .expect_err("unknown job");
    assert_eq!(
        err.downcast_ref::<ProvisionError>(),
        Some(&ProvisionError::JobNotFound("nope".into()))
    );
}

// ── Per-desktop failures ──────────────────────────────────────────────────────

#[tokio::test]
async fn nat_failure_on_one_desktop_is_partial() {
    let h = harness(Reply::Deliver(created_resources(2)));
    h.remote.fail_on("_2_nat.log");
    let snapshot = provision(&h, ProvisionMode::Personal, request(2)).await;

    assert_eq!(snapshot.job.status, JobStatus::PartialFailed);
    assert_eq!((snapshot.job.success_vms, snapshot.job.failed_vms), (1, 1));
    let failed = snapshot
        .desktops
        .iter()
        .find(|d| d.desktop.name == "lab-2")
        .expect("second desktop");
    assert_eq!(failed.desktop.status, DesktopStatus::NatError);
    let last = failed.timeline.last().expect("steps");
    assert_eq!((last.step.as_str(), last.status), ("create_nat", StepStatus::Failed));

    let message = snapshot.job.message.as_deref().expect("summary");
    assert!(message.contains("[lab-1] OK"));
    assert!(message.contains("[lab-2] failed at step create_nat -> "));
    assert!(message.contains("_2_nat.log"));
}

#[tokio::test]
async fn unreachable_winrm_marks_nat_error_and_removes_forward() {
    let h = harness_with(test_config(), Reply::Deliver(created_resources(1)), false);
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;

    assert_eq!(snapshot.job.status, JobStatus::Failed);
    let d = &snapshot.desktops[0];
    assert_eq!(d.desktop.status, DesktopStatus::NatError);
    assert!(
        d.timeline
            .iter()
            .any(|s| s.step == "winrm_probe" && s.status == StepStatus::Failed)
    );
    assert!(d.timeline.iter().any(|s| s.step == "delete_nat_winrm"));
    assert_eq!(h.probe.calls(), 3);
    assert_eq!(h.remote.count("===== NAT DELETE START"), 1);
    assert_eq!(h.remote.count("===== WINRM_DISABLE START"), 0);
}

#[tokio::test]
async fn failed_app_marks_app_error_but_other_apps_finish() {
    let h = harness(Reply::Deliver(created_resources(1)));
    h.remote.fail_on("===== CHROME START");
    let mut req = request(1);
    let mut office = app("office");
    office.vars = BTreeMap::from([("license".to_string(), "KEY-1".to_string())]);
    req.apps = vec![app("chrome"), office];

    let snapshot = provision(&h, ProvisionMode::Personal, req).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    let d = &snapshot.desktops[0];
    assert_eq!(d.desktop.status, DesktopStatus::AppError);
    let status_of = |code: &str| {
        d.apps
            .iter()
            .find(|a| a.app_code == code)
            .map(|a| a.status)
    };
    assert_eq!(status_of("chrome"), Some(AppStatus::Failed));
    assert_eq!(status_of("office"), Some(AppStatus::Success));
    // Catalog role override is used for the playbook.
    assert!(
        h.remote
            .uploads()
            .iter()
            .any(|(path, body)| {
                path.ends_with("_office.yml") && body.contains("role: office_suite")
            })
    );
    assert_eq!(h.remote.count("===== NAT DELETE START"), 1);
}

// ── Organization and domain ───────────────────────────────────────────────────

fn bootstrap_plan() -> DomainPlan {
    DomainPlan {
        bootstrap_controller: true,
        domain_name: "corp.local".to_string(),
        ou_name: "Lab".to_string(),
        group_name: "LabAdmins".to_string(),
        admin_user_name: "corpadmin".to_string(),
        admin_user_pass: "Dom#Pass1".to_string(),
        user_pass: String::new(),
    }
}

#[tokio::test]
async fn organization_bootstraps_controller_on_first_desktop() {
    let h = harness(Reply::Deliver(organization_resources(2, "203.0.113.7")));
    let mut req = request(2);
    req.domain = Some(bootstrap_plan());

    let snapshot = provision(&h, ProvisionMode::Organization, req).await;
    assert_eq!(snapshot.job.status, JobStatus::Success);
    assert_eq!(h.remote.count("===== ASSIGN START"), 2);
    assert_eq!(h.remote.count("===== DC_POST_BOOTSTRAP START"), 1);
    assert_eq!(h.remote.count("===== WINRM_DISABLE START"), 1);

    let dc = snapshot
        .desktops
        .iter()
        .find(|d| d.desktop.is_domain_controller)
        .expect("controller");
    assert_eq!(dc.desktop.name, "lab-1");
    assert_eq!(dc.desktop.status, DesktopStatus::Ready);
    assert!(!dc.desktop.winrm_disabled);
    let domain = dc.desktop.domain.as_ref().expect("domain info");
    assert_eq!(domain.domain_name, "corp.local");
    assert_eq!(domain.admin_password, "********");
    assert!(
        snapshot
            .desktops
            .iter()
            .all(|d| d.desktop.ip_public.as_deref() == Some("203.0.113.7"))
    );
    assert!(
        dc.timeline
            .iter()
            .any(|s| {
                s.step == "assign_interface"
                    && s.detail == "assign_name=u_1, assign_ip=10.1.0.1/24"
            })
    );
}

#[tokio::test]
async fn incremental_desktop_joins_existing_domain() {
    let h = harness(Reply::Deliver(organization_resources(1, "203.0.113.7")));
    let mut org = request(1);
    org.domain = Some(bootstrap_plan());
    let first = provision(&h, ProvisionMode::Organization, org).await;
    assert_eq!(first.job.status, JobStatus::Success);

    h.infra.set_provision(Reply::Deliver(added_resources(1)));
    let mut add = request(1);
    add.name = "extra".to_string();
    add.domain = Some(DomainPlan {
        ou_name: "Lab".to_string(),
        group_name: "LabUsers".to_string(),
        user_pass: "User#Pass1".to_string(),
        ..DomainPlan::default()
    });
    let snapshot = provision(&h, ProvisionMode::AddResourcePersonal, add).await;

    assert_eq!(snapshot.job.status, JobStatus::Success);
    let vd = &snapshot.desktops[0].desktop;
    assert_eq!(vd.ip_public.as_deref(), Some("203.0.113.7"));
    assert_eq!(vd.status, DesktopStatus::Ready);
    let domain = vd.domain.as_ref().expect("joined");
    assert_eq!(domain.domain_name, "corp.local");
    assert_eq!(domain.admin_user, "alice");

    assert_eq!(h.remote.count("===== AD_ACCOUNT_BOOTSTRAP START"), 1);
    assert_eq!(h.remote.count("===== JOIN_DOMAIN START"), 1);
    let uploads = h.remote.uploads();
    let join = uploads
        .iter()
        .find(|(path, _)| path.ends_with("_join_domain.yml"))
        .map(|(_, body)| body.as_str())
        .expect("join playbook");
    assert!(join.contains("domain_user: 'corpadmin'"));
    assert!(join.contains("rdp_grant_user: 'alice'"));
    assert!(join.contains("domain_controller_ip: '10.1.0.11'"));
    // Temporary controller forward is opened and closed again.
    assert_eq!(h.remote.count("_dc_nat.log"), 1);
    assert_eq!(h.remote.count("_dc_del_nat_delete.log"), 1);
}

#[tokio::test]
async fn incremental_without_controller_fails_desktop() {
    let h = harness(Reply::Deliver(created_resources(1)));
    let first = provision(&h, ProvisionMode::Personal, request(1)).await;
    assert_eq!(first.job.status, JobStatus::Success);

    h.infra.set_provision(Reply::Deliver(added_resources(1)));
    let mut add = request(1);
    add.domain = Some(DomainPlan {
        ou_name: "Lab".to_string(),
        group_name: "LabUsers".to_string(),
        user_pass: "User#Pass1".to_string(),
        ..DomainPlan::default()
    });
    let snapshot = provision(&h, ProvisionMode::AddResourcePersonal, add).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    let d = &snapshot.desktops[0];
    assert_eq!(d.desktop.status, DesktopStatus::Error);
    assert!(
        d.timeline
            .iter()
            .any(|s| s.step == "ad_account" && s.status == StepStatus::Failed)
    );
}

#[tokio::test]
async fn incremental_without_public_address_is_nat_error() {
    let h = harness(Reply::Deliver(added_resources(1)));
    let snapshot = provision(&h, ProvisionMode::AddResourcePersonal, request(1)).await;
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    let d = &snapshot.desktops[0];
    assert_eq!(d.desktop.status, DesktopStatus::NatError);
    assert_eq!(h.remote.count("===== NAT START"), 0);
}

// ── Store failures ────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_counter_write_does_not_stop_other_desktops() {
    let (h, flaky) = flaky_harness(Reply::Deliver(created_resources(3)));
    // Writes: RUNNING, total, then one per finished desktop.
    flaky.fail_job_update(3);
    let snapshot = provision(&h, ProvisionMode::Personal, request(3)).await;

    let job = &snapshot.job;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!((job.total_vms, job.success_vms, job.failed_vms), (3, 3, 0));
    assert_eq!(snapshot.desktops.len(), 3);
    assert!(
        snapshot
            .desktops
            .iter()
            .all(|d| d.desktop.status == DesktopStatus::Ready)
    );
}

#[tokio::test]
async fn crashed_job_records_exception_step() {
    let (h, flaky) = flaky_harness(Reply::Deliver(created_resources(1)));
    flaky.fail_job_update(2);
    let snapshot = provision(&h, ProvisionMode::Personal, request(1)).await;

    assert_eq!(snapshot.job.status, JobStatus::Failed);
    let message = snapshot.job.message.as_deref().expect("message");
    assert!(message.starts_with("Exception:"), "{message}");
    assert!(message.contains("transient store error"));
    let step = snapshot
        .timeline
        .iter()
        .find(|s| s.step == "exception")
        .expect("exception step");
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.detail.contains("transient store error"));
}

#[tokio::test]
async fn unexpected_pipeline_error_marks_desktop_error_and_drops_winrm_forward() {
    let (h, flaky) = flaky_harness(Reply::Deliver(created_resources(1)));
    flaky.fail_deployment_saves();
    let mut req = request(1);
    req.apps = vec![app("chrome")];
    let snapshot = provision(&h, ProvisionMode::Personal, req).await;

    assert_eq!(snapshot.job.status, JobStatus::Failed);
    assert_eq!((snapshot.job.success_vms, snapshot.job.failed_vms), (0, 1));
    let d = &snapshot.desktops[0];
    assert_eq!(d.desktop.status, DesktopStatus::Error);
    let exception = d
        .timeline
        .iter()
        .find(|s| s.step == "exception")
        .expect("desktop exception step");
    assert_eq!(exception.vd_id.as_deref(), Some(d.desktop.id.as_str()));
    assert_eq!(exception.status, StepStatus::Failed);
    assert!(exception.detail.contains("transient store error"));
    assert!(
        d.timeline
            .iter()
            .any(|s| s.step == "delete_nat_winrm_on_error" && s.status == StepStatus::Success)
    );
    assert_eq!(h.remote.count("===== NAT DELETE START"), 1);
    assert_eq!(h.remote.count("===== WINRM_DISABLE START"), 0);
}

#[tokio::test]
async fn failed_first_desktop_save_releases_its_ports() {
    let (h, flaky) = flaky_harness(Reply::Deliver(created_resources(2)));
    flaky.fail_desktop_saves();
    let snapshot = provision(&h, ProvisionMode::Personal, request(2)).await;

    assert_eq!(snapshot.job.status, JobStatus::Failed);
    assert_eq!(snapshot.job.failed_vms, 2);
    assert!(snapshot.desktops.is_empty());
    assert!(h.store.reserved_ports().is_empty());
    let exceptions = snapshot
        .timeline
        .iter()
        .filter(|s| s.step == "exception")
        .count();
    assert_eq!(exceptions, 2);
}
