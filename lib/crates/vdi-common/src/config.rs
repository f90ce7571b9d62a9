use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AppActionType;

/// Top-level provisioner configuration, loaded from YAML.
///
/// Every field has a default so an empty file (or no file) yields a usable config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    #[serde(default)]
    pub infra: InfraConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub desktop: DesktopConfig,
    #[serde(default)]
    pub valkey: ValkeyConfig,
    /// Catalog of installable applications.
    #[serde(default)]
    pub apps: Vec<AppDefinition>,
}

impl ProvisionerConfig {
    #[must_use]
    pub fn app(&self, code: &str) -> Option<&AppDefinition> {
        self.apps.iter().find(|a| a.code == code)
    }
}

/// Infrastructure provider endpoint and result-wait policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default = "default_infra_base_url")]
    pub base_url: String,
    /// Synchronous HTTP submission timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Primary wait for the asynchronous result.
    #[serde(default = "default_result_timeout_secs")]
    pub result_timeout_secs: u64,
    /// Secondary wait absorbing event-delivery lag.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Tracker deadline per expected instance.
    #[serde(default = "default_per_instance_allowance_secs")]
    pub per_instance_allowance_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Remote automation host layout and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_automation_host")]
    pub host: String,
    #[serde(default = "default_automation_user")]
    pub user: String,
    #[serde(default = "default_automation_port")]
    pub port: u16,
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: String,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
    #[serde(default = "default_pids_dir")]
    pub pids_dir: String,
    #[serde(default = "default_roles_dir")]
    pub roles_dir: String,
    /// Inventory addressing the network appliance.
    #[serde(default = "default_appliance_inventory")]
    pub appliance_inventory: String,
    /// Directory holding the appliance NAT and interface playbooks.
    #[serde(default = "default_appliance_playbooks_dir")]
    pub appliance_playbooks_dir: String,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base; attempt `n` waits `n * retry_backoff_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// NAT and reachability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Public address shared by personal-mode desktops.
    #[serde(default)]
    pub shared_public_ip: String,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_random_port_attempts")]
    pub random_port_attempts: u32,
    #[serde(default = "default_rdp_local_port")]
    pub rdp_local_port: u16,
    #[serde(default = "default_winrm_local_port")]
    pub winrm_local_port: u16,
    /// Delay between consecutive desktop pipelines of one job.
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
    #[serde(default = "default_winrm_probe_attempts")]
    pub winrm_probe_attempts: u32,
    #[serde(default = "default_winrm_probe_delay_secs")]
    pub winrm_probe_delay_secs: u64,
}

/// Desktop image defaults. The local account is named after the requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesktopConfig {
    #[serde(default)]
    pub admin_password: String,
    #[serde(default = "default_win_version")]
    pub default_win_version: String,
}

/// Valkey connection and infra event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValkeyConfig {
    #[serde(default = "default_valkey_url")]
    pub url: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
}

/// Catalog entry describing how an app is deployed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppDefinition {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action_type: AppActionType,
    /// Automation role applied for this app; defaults to the app code.
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub required_vars: Vec<String>,
}

impl AppDefinition {
    #[must_use]
    pub fn role_name(&self) -> &str {
        self.role.as_deref().unwrap_or(&self.code)
    }
}

fn default_infra_base_url() -> String {
    "http://infra:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_result_timeout_secs() -> u64 {
    6 * 60
}

fn default_grace_secs() -> u64 {
    90
}

fn default_per_instance_allowance_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_automation_host() -> String {
    "ansible-host".to_string()
}

fn default_automation_user() -> String {
    "root".to_string()
}

fn default_automation_port() -> u16 {
    2223
}

fn default_jobs_dir() -> String {
    "/ansible-host/jobs".to_string()
}

fn default_logs_dir() -> String {
    "/ansible-host/logs".to_string()
}

fn default_pids_dir() -> String {
    "/ansible-host/pids".to_string()
}

fn default_roles_dir() -> String {
    "/ansible-host/window/roles".to_string()
}

fn default_appliance_inventory() -> String {
    "/ansible-host/pfsense2.8/pfsense.ini".to_string()
}

fn default_appliance_playbooks_dir() -> String {
    "/ansible-host/pfsense2.8".to_string()
}

fn default_exec_timeout_secs() -> u64 {
    30 * 60
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    10_000
}

fn default_port_min() -> u16 {
    10_000
}

fn default_port_max() -> u16 {
    50_000
}

fn default_random_port_attempts() -> u32 {
    50
}

fn default_rdp_local_port() -> u16 {
    3389
}

fn default_winrm_local_port() -> u16 {
    5985
}

fn default_stagger_secs() -> u64 {
    10
}

fn default_winrm_probe_attempts() -> u32 {
    30
}

fn default_winrm_probe_delay_secs() -> u64 {
    10
}

fn default_win_version() -> String {
    "2022".to_string()
}

fn default_valkey_url() -> String {
    "redis://valkey:6379".to_string()
}

fn default_consumer_group() -> String {
    "vdi-provisioner".to_string()
}

fn default_consumer_name() -> String {
    "provisioner-1".to_string()
}

impl InfraConfig {
    #[must_use]
    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    #[must_use]
    pub fn per_instance_allowance(&self) -> Duration {
        Duration::from_secs(self.per_instance_allowance_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl AutomationConfig {
    #[must_use]
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

impl NetworkConfig {
    #[must_use]
    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    #[must_use]
    pub fn winrm_probe_delay(&self) -> Duration {
        Duration::from_secs(self.winrm_probe_delay_secs)
    }
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            base_url: default_infra_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            result_timeout_secs: default_result_timeout_secs(),
            grace_secs: default_grace_secs(),
            per_instance_allowance_secs: default_per_instance_allowance_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            host: default_automation_host(),
            user: default_automation_user(),
            port: default_automation_port(),
            jobs_dir: default_jobs_dir(),
            logs_dir: default_logs_dir(),
            pids_dir: default_pids_dir(),
            roles_dir: default_roles_dir(),
            appliance_inventory: default_appliance_inventory(),
            appliance_playbooks_dir: default_appliance_playbooks_dir(),
            exec_timeout_secs: default_exec_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            shared_public_ip: String::new(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            random_port_attempts: default_random_port_attempts(),
            rdp_local_port: default_rdp_local_port(),
            winrm_local_port: default_winrm_local_port(),
            stagger_secs: default_stagger_secs(),
            winrm_probe_attempts: default_winrm_probe_attempts(),
            winrm_probe_delay_secs: default_winrm_probe_delay_secs(),
        }
    }
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            admin_password: String::new(),
            default_win_version: default_win_version(),
        }
    }
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: default_valkey_url(),
            consumer_group: default_consumer_group(),
            consumer_name: default_consumer_name(),
        }
    }
}
