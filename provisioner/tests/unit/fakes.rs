//! Hand-written fakes for the application ports and an engine harness.

#![allow(dead_code, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use vdi_common::{
    AppDefinition, AppDeployment, InfraTask, JobStep, ProvisionMode, ProvisionRequest,
    ProvisionerConfig, ProvisioningJob, VirtualDesktop,
};
use vdi_provisioner::app::{Engine, EnginePorts};
use vdi_provisioner::application::ports::{
    Clock, ExecOutcome, InfraProvider, InfraSpec, KillSwitch, NetworkProbe, ProvisioningStore,
    RemoteHost,
};
use vdi_provisioner::application::services::event_listener::InfraEventListener;
use vdi_provisioner::infra::memory_store::MemoryStore;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Virtual time: `sleep` advances `now` and yields instead of waiting.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Every requested sleep, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += chrono::Duration::from_std(by).expect("duration in range");
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }

    async fn sleep(&self, duration: Duration) {
        lock(&self.sleeps).push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Delegates to a `MemoryStore` but fails chosen writes.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    job_updates: AtomicU32,
    fail_update_at: AtomicU32,
    fail_desktops: AtomicBool,
    fail_deployments: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            job_updates: AtomicU32::new(0),
            fail_update_at: AtomicU32::new(0),
            fail_desktops: AtomicBool::new(false),
            fail_deployments: AtomicBool::new(false),
        }
    }

    /// Fail only the `n`-th `update_job` call (1-based).
    pub fn fail_job_update(&self, n: u32) {
        self.fail_update_at.store(n, Ordering::SeqCst);
    }

    pub fn fail_desktop_saves(&self) {
        self.fail_desktops.store(true, Ordering::SeqCst);
    }

    pub fn fail_deployment_saves(&self) {
        self.fail_deployments.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProvisioningStore for FlakyStore {
    async fn insert_job(&self, job: &ProvisioningJob) -> Result<()> {
        self.inner.insert_job(job).await
    }

    async fn update_job(&self, job: &ProvisioningJob) -> Result<()> {
        let n = self.job_updates.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_update_at.load(Ordering::SeqCst) {
            bail!("transient store error");
        }
        self.inner.update_job(job).await
    }

    async fn job(&self, job_id: &str) -> Result<Option<ProvisioningJob>> {
        self.inner.job(job_id).await
    }

    async fn append_step(&self, step: &JobStep) -> Result<()> {
        self.inner.append_step(step).await
    }

    async fn steps(&self, job_id: &str) -> Result<Vec<JobStep>> {
        self.inner.steps(job_id).await
    }

    async fn save_task(&self, task: &InfraTask) -> Result<()> {
        self.inner.save_task(task).await
    }

    async fn task(&self, task_id: &str) -> Result<Option<InfraTask>> {
        self.inner.task(task_id).await
    }

    async fn save_desktop(&self, desktop: &VirtualDesktop) -> Result<()> {
        if self.fail_desktops.load(Ordering::SeqCst) {
            bail!("transient store error");
        }
        self.inner.save_desktop(desktop).await
    }

    async fn desktop(&self, vd_id: &str) -> Result<Option<VirtualDesktop>> {
        self.inner.desktop(vd_id).await
    }

    async fn desktops_for_job(&self, job_id: &str) -> Result<Vec<VirtualDesktop>> {
        self.inner.desktops_for_job(job_id).await
    }

    async fn desktops_for_project(&self, project_id: &str) -> Result<Vec<VirtualDesktop>> {
        self.inner.desktops_for_project(project_id).await
    }

    async fn reserve_port(&self, port: u16) -> Result<bool> {
        self.inner.reserve_port(port).await
    }

    async fn release_port(&self, port: u16) -> Result<()> {
        self.inner.release_port(port).await
    }

    async fn save_deployment(&self, deployment: &AppDeployment) -> Result<()> {
        if self.fail_deployments.load(Ordering::SeqCst) {
            bail!("transient store error");
        }
        self.inner.save_deployment(deployment).await
    }

    async fn deployments_for_desktop(&self, vd_id: &str) -> Result<Vec<AppDeployment>> {
        self.inner.deployments_for_desktop(vd_id).await
    }
}

// ── Infra provider ────────────────────────────────────────────────────────────

/// What the provider does after accepting a request. `{task}` in a body is
/// replaced by the request's task id before delivery.
#[derive(Clone)]
pub enum Reply {
    Deliver(String),
    Silent,
}

/// Accepts or rejects requests and, once attached to a listener, delivers
/// the scripted result message as the result channel would.
pub struct ScriptedInfra {
    listener: OnceLock<Arc<InfraEventListener>>,
    provision: Mutex<Reply>,
    delete: Mutex<Reply>,
    rejections: AtomicU32,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInfra {
    pub fn new(provision: Reply) -> Self {
        Self {
            listener: OnceLock::new(),
            provision: Mutex::new(provision),
            delete: Mutex::new(Reply::Deliver(
                r#"{"identifier":"{task}","result":true}"#.to_string(),
            )),
            rejections: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, listener: Arc<InfraEventListener>) {
        let _ = self.listener.set(listener);
    }

    /// Reject the next `n` requests with an HTTP-like error.
    pub fn reject_next(&self, n: u32) {
        self.rejections.store(n, Ordering::SeqCst);
    }

    pub fn set_provision(&self, reply: Reply) {
        *lock(&self.provision) = reply;
    }

    pub fn set_delete(&self, reply: Reply) {
        *lock(&self.delete) = reply;
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn take_rejection(&self) -> bool {
        self.rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn answer(&self, reply: Reply, task_id: &str) {
        if let (Reply::Deliver(body), Some(listener)) = (reply, self.listener.get()) {
            listener.on_message(&body.replace("{task}", task_id)).await;
        }
    }
}

#[async_trait]
impl InfraProvider for ScriptedInfra {
    async fn submit(
        &self,
        mode: ProvisionMode,
        spec: &InfraSpec,
        task_id: &str,
        _region: Option<&str>,
    ) -> Result<()> {
        lock(&self.calls).push(format!("submit:{mode}:{}", spec.count));
        if self.take_rejection() {
            bail!("HTTP 503: provider unavailable");
        }
        let reply = lock(&self.provision).clone();
        self.answer(reply, task_id).await;
        Ok(())
    }

    async fn delete_instance(
        &self,
        instance_id: &str,
        task_id: &str,
        _region: Option<&str>,
    ) -> Result<()> {
        lock(&self.calls).push(format!("delete:{instance_id}"));
        if self.take_rejection() {
            bail!("HTTP 503: provider unavailable");
        }
        let reply = lock(&self.delete).clone();
        self.answer(reply, task_id).await;
        Ok(())
    }

    async fn destroy_project(
        &self,
        project_id: &str,
        task_id: &str,
        _region: Option<&str>,
    ) -> Result<()> {
        lock(&self.calls).push(format!("destroy:{project_id}"));
        if self.take_rejection() {
            bail!("HTTP 503: provider unavailable");
        }
        let reply = lock(&self.delete).clone();
        self.answer(reply, task_id).await;
        Ok(())
    }
}

// ── Remote host ───────────────────────────────────────────────────────────────

/// Scripted result for one tracked-job attempt.
#[derive(Debug, Clone, Copy)]
pub enum Attempt {
    Exit(i32),
    /// Block until the kill switch flips.
    Hang,
}

/// Records every upload and script. Ad-hoc steps succeed unless the script
/// contains one of the failure markers; tracked attempts follow `attempts`.
#[derive(Default)]
pub struct RecordingRemoteHost {
    scripts: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, String)>>,
    fail_markers: Mutex<Vec<String>>,
    attempts: Mutex<VecDeque<Attempt>>,
}

impl RecordingRemoteHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every step whose script contains `marker`, e.g. `"===== NAT START"`.
    pub fn fail_on(&self, marker: &str) {
        lock(&self.fail_markers).push(marker.to_string());
    }

    pub fn script_attempts(&self, attempts: &[Attempt]) {
        lock(&self.attempts).extend(attempts.iter().copied());
    }

    pub fn scripts(&self) -> Vec<String> {
        lock(&self.scripts).clone()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        lock(&self.uploads).clone()
    }

    /// Scripts containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        lock(&self.scripts)
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }
}

#[async_trait]
impl RemoteHost for RecordingRemoteHost {
    async fn upload(&self, remote_path: &str, content: &str) -> Result<()> {
        lock(&self.uploads).push((remote_path.to_string(), content.to_string()));
        Ok(())
    }

    async fn run(
        &self,
        script: &str,
        _timeout: Duration,
        kill: &KillSwitch,
    ) -> Result<ExecOutcome> {
        lock(&self.scripts).push(script.to_string());
        if script.contains("START ansible-playbook") {
            let next = lock(&self.attempts).pop_front().unwrap_or(Attempt::Exit(0));
            return Ok(match next {
                Attempt::Exit(code) => ExecOutcome::Exited(code),
                Attempt::Hang => {
                    kill.killed().await;
                    ExecOutcome::Killed
                }
            });
        }
        let failed = lock(&self.fail_markers).iter().any(|m| script.contains(m));
        Ok(ExecOutcome::Exited(i32::from(failed)))
    }

    async fn read_file(&self, remote_path: &str) -> Result<String> {
        Ok(format!("contents of {remote_path}\n"))
    }
}

// ── Network probe ─────────────────────────────────────────────────────────────

pub struct FakeProbe {
    reachable: bool,
    calls: AtomicU32,
}

impl FakeProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkProbe for FakeProbe {
    async fn check_tcp_connectivity(&self, _host: &str, _port: u16) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reachable)
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SHARED_IP: &str = "198.51.100.10";

pub fn test_config() -> ProvisionerConfig {
    let mut config = ProvisionerConfig::default();
    config.network.shared_public_ip = SHARED_IP.to_string();
    config.network.port_min = 20_000;
    config.network.port_max = 20_099;
    config.network.winrm_probe_attempts = 3;
    config.desktop.admin_password = "Local#Pass1".to_string();
    config.automation.max_retries = 2;
    config.automation.retry_backoff_ms = 1_000;
    config.apps = vec![
        AppDefinition {
            code: "chrome".to_string(),
            name: "Google Chrome".to_string(),
            action_type: vdi_common::AppActionType::Install,
            role: None,
            required_vars: Vec::new(),
        },
        AppDefinition {
            code: "office".to_string(),
            name: "Office".to_string(),
            action_type: vdi_common::AppActionType::Install,
            role: Some("office_suite".to_string()),
            required_vars: vec!["license".to_string()],
        },
    ];
    config
}

pub fn request(count: u32) -> ProvisionRequest {
    ProvisionRequest {
        name: "lab".to_string(),
        username_of_vdi: "alice".to_string(),
        user_id: "u-1".to_string(),
        project_id: "p-1".to_string(),
        count,
        base_vol_id: "vol-win".to_string(),
        vol_size: 60,
        flavor_id: "m1.large".to_string(),
        vol_type: "ssd".to_string(),
        ..ProvisionRequest::default()
    }
}

/// Success message carrying `n` compute instances `i-1..i-n` at `10.0.0.{10+k}`.
pub fn created_resources(n: usize) -> String {
    let instances: Vec<String> = (1..=n)
        .map(|k| format!(r#"{{"attributes":{{"id":"i-{k}","access_ip_v4":"10.0.0.{}"}}}}"#, 10 + k))
        .collect();
    format!(
        r#"{{"identifier":"{{task}}","created_resources":[{{"type":"openstack_compute_instance_v2","instances":[{}]}}]}}"#,
        instances.join(",")
    )
}

/// Organization success: instances on `10.1.0.x` behind `wan_ip`.
pub fn organization_resources(n: usize, wan_ip: &str) -> String {
    let instances: Vec<String> = (1..=n)
        .map(|k| format!(r#"{{"attributes":{{"id":"o-{k}","access_ip_v4":"10.1.0.{}"}}}}"#, 10 + k))
        .collect();
    format!(
        r#"{{"identifier":"{{task}}","created_resources":[{{"type":"openstack_compute_instance_v2","instances":[{}]}}],"pfsense_config":{{"network":[{{"name":"wan","fixed_ip_v4":"{wan_ip}"}}]}}}}"#,
        instances.join(",")
    )
}

/// Incremental success: instances `a-1..a-n` on `10.1.0.{50+k}`.
pub fn added_resources(n: usize) -> String {
    let added: Vec<String> = (1..=n)
        .map(|k| format!(r#"{{"id":"a-{k}","access_ip_v4":"10.1.0.{}"}}"#, 50 + k))
        .collect();
    format!(
        r#"{{"identifier":"{{task}}","added_resources":[{}]}}"#,
        added.join(",")
    )
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub infra: Arc<ScriptedInfra>,
    pub remote: Arc<RecordingRemoteHost>,
    pub probe: Arc<FakeProbe>,
    pub clock: Arc<FakeClock>,
}

pub fn harness_with(config: ProvisionerConfig, reply: Reply, reachable: bool) -> Harness {
    let store = Arc::new(MemoryStore::new());
    harness_over(config, reply, reachable, Arc::clone(&store) as _, store)
}

/// Engine whose provisioning store is `port`; `store` stays the backing
/// memory store for assertions and the project directory.
pub fn harness_over(
    config: ProvisionerConfig,
    reply: Reply,
    reachable: bool,
    port: Arc<dyn ProvisioningStore>,
    store: Arc<MemoryStore>,
) -> Harness {
    let infra = Arc::new(ScriptedInfra::new(reply));
    let remote = Arc::new(RecordingRemoteHost::new());
    let probe = Arc::new(FakeProbe::new(reachable));
    let clock = Arc::new(FakeClock::new());
    let engine = Engine::assemble(
        config,
        EnginePorts {
            store: port,
            directory: Arc::clone(&store) as _,
            infra: Arc::clone(&infra) as _,
            remote: Arc::clone(&remote) as _,
            probe: Arc::clone(&probe) as _,
            clock: Arc::clone(&clock) as _,
        },
    );
    infra.attach(Arc::clone(&engine.listener));
    Harness {
        engine,
        store,
        infra,
        remote,
        probe,
        clock,
    }
}

pub fn harness(reply: Reply) -> Harness {
    harness_with(test_config(), reply, true)
}

/// Harness over a `FlakyStore` wrapping the harness memory store.
pub fn flaky_harness(reply: Reply) -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(Arc::clone(&store)));
    let h = harness_over(test_config(), reply, true, Arc::clone(&flaky) as _, store);
    (h, flaky)
}
