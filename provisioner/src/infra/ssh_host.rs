//! `RemoteHost` over the system `ssh` client.
//!
//! Scripts run as `bash -c '<script>'` on the automation host; uploads stream
//! the content through stdin into `cat`. Key-based auth only (`BatchMode`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use vdi_common::AutomationConfig;

use crate::application::ports::{CommandRunner, ExecOutcome, KillSwitch, RemoteHost};
use crate::domain::playbook::shell_quote;
use crate::infra::command_runner::DEFAULT_CMD_TIMEOUT;

pub struct SshRemoteHost {
    runner: Arc<dyn CommandRunner>,
    destination: String,
    port: String,
}

impl SshRemoteHost {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &AutomationConfig) -> Self {
        Self {
            runner,
            destination: format!("{}@{}", settings.user, settings.host),
            port: settings.port.to_string(),
        }
    }

    fn args<'a>(&'a self, remote_command: &'a str) -> Vec<&'a str> {
        vec![
            "-p",
            self.port.as_str(),
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "BatchMode=yes",
            "-o",
            "ServerAliveInterval=30",
            self.destination.as_str(),
            remote_command,
        ]
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
}

#[async_trait]
impl RemoteHost for SshRemoteHost {
    async fn upload(&self, remote_path: &str, content: &str) -> Result<()> {
        let target = shell_quote(remote_path);
        let command = match parent_dir(remote_path) {
            Some(dir) => format!("mkdir -p {} && cat > {target}", shell_quote(dir)),
            None => format!("cat > {target}"),
        };
        let output = self
            .runner
            .run_with_stdin("ssh", &self.args(&command), content.as_bytes(), DEFAULT_CMD_TIMEOUT)
            .await
            .with_context(|| format!("upload of {remote_path} failed"))?;
        if !output.status.success() {
            anyhow::bail!(
                "upload of {remote_path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn run(&self, script: &str, timeout: Duration, kill: &KillSwitch) -> Result<ExecOutcome> {
        let command = format!("bash -c {}", shell_quote(script));
        self.runner
            .run_killable("ssh", &self.args(&command), timeout, kill)
            .await
    }

    async fn read_file(&self, remote_path: &str) -> Result<String> {
        let command = format!("cat {}", shell_quote(remote_path));
        let output = self
            .runner
            .run_with_timeout("ssh", &self.args(&command), DEFAULT_CMD_TIMEOUT)
            .await
            .with_context(|| format!("read of {remote_path} failed"))?;
        if !output.status.success() {
            anyhow::bail!(
                "cannot read {remote_path}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
