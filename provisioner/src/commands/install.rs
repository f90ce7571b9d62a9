//! `vdi-provisioner install`: tracked automation run with retries.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use uuid::Uuid;
use vdi_common::AutomationStatus;

use crate::app::{AppContext, standalone_automation};
use crate::application::services::automation::TrackedJobSpec;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Arguments for the install command.
#[derive(Args)]
pub struct InstallArgs {
    /// Target host (repeatable)
    #[arg(long = "target", required = true)]
    pub targets: Vec<String>,

    /// Automation role to apply (repeatable, applied in order)
    #[arg(long = "role", required = true)]
    pub roles: Vec<String>,

    /// WinRM port on the targets
    #[arg(long, default_value_t = 5985)]
    pub port: u16,

    /// WinRM user
    #[arg(long, default_value = "Administrator")]
    pub user: String,

    /// WinRM password
    #[arg(long, env = "VDI_WINRM_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Windows version passed to the roles
    #[arg(long)]
    pub win_version: Option<String>,

    /// Extra variable as KEY=VALUE (repeatable)
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Job id (default: random)
    #[arg(long)]
    pub id: Option<String>,
}

/// Run `vdi-provisioner install`. Ctrl-C cancels the job.
///
/// # Errors
///
/// Returns an error if the job cannot be started, or it ends FAILED or
/// CANCELLED.
pub async fn run(app: &AppContext, args: InstallArgs) -> Result<()> {
    let executor = standalone_automation(&app.config);
    let spec = TrackedJobSpec {
        id: args.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        targets: args.targets,
        port: args.port,
        user: args.user,
        password: args.password,
        roles: args.roles,
        win_version: args.win_version,
        extra_vars: args.vars.into_iter().collect::<BTreeMap<_, _>>(),
    };
    let job_id = executor.submit(spec).await?;
    if !app.is_json() {
        app.output.info(&format!("Automation job {job_id} started"));
    }

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let job = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let job = executor.status(&job_id)?;
                if job.status.is_terminal() {
                    break job;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                app.output.warn("Cancelling automation job");
                break executor.cancel(&job_id).await?;
            }
        }
    };

    app.renderer().automation(&job)?;
    match job.status {
        AutomationStatus::Success => Ok(()),
        status => bail!(
            "automation job {job_id} ended {status:?}: {}",
            job.message.as_deref().unwrap_or("no detail")
        ),
    }
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
