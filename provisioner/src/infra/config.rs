//! Provisioner configuration: a YAML file on disk plus `VDI_*` overrides.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use vdi_common::ProvisionerConfig;

const ENV_PREFIX: &str = "VDI_";

/// Endpoints and secrets that deployments inject through the environment.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    valkey_url: Option<String>,
    infra_base_url: Option<String>,
    automation_host: Option<String>,
    local_admin_password: Option<String>,
    shared_public_ip: Option<String>,
}

impl EnvOverrides {
    fn apply(self, config: &mut ProvisionerConfig) {
        if let Some(url) = self.valkey_url {
            config.valkey.url = url;
        }
        if let Some(url) = self.infra_base_url {
            config.infra.base_url = url;
        }
        if let Some(host) = self.automation_host {
            config.automation.host = host;
        }
        if let Some(password) = self.local_admin_password {
            config.desktop.admin_password = password;
        }
        if let Some(ip) = self.shared_public_ip {
            config.network.shared_public_ip = ip;
        }
    }
}

/// Loads `ProvisionerConfig` from `--config`, `$VDI_CONFIG` or
/// `~/.vdi/config.yaml`. A missing file yields the defaults.
pub struct YamlConfigStore {
    explicit: Option<PathBuf>,
}

impl YamlConfigStore {
    #[must_use]
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }

    /// # Errors
    ///
    /// Returns an error if no path can be determined.
    pub fn path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.explicit {
            return Ok(path.clone());
        }
        if let Ok(val) = std::env::var("VDI_CONFIG") {
            return Ok(PathBuf::from(val));
        }
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(home.join(".vdi").join("config.yaml"))
    }

    /// Read the file only, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_file(&self) -> Result<ProvisionerConfig> {
        let path = self.path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(ProvisionerConfig::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("cannot parse {}", path.display()))
    }

    /// File config with `VDI_*` process environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is invalid or an override cannot be parsed.
    pub fn load(&self) -> Result<ProvisionerConfig> {
        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX)
            .from_env()
            .context("failed to read VDI_* environment overrides")?;
        let mut config = self.load_file()?;
        overrides.apply(&mut config);
        Ok(config)
    }

    /// Same as [`YamlConfigStore::load`] with an explicit environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is invalid or an override cannot be parsed.
    pub fn load_with_env<I>(&self, env: I) -> Result<ProvisionerConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX)
            .from_iter(env)
            .context("failed to read VDI_* overrides")?;
        let mut config = self.load_file()?;
        overrides.apply(&mut config);
        Ok(config)
    }
}
