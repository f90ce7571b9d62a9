//! `vdi-provisioner status <job-id>`

use anyhow::Result;
use clap::Args;

use crate::app::{AppContext, Engine};

/// Arguments for the status command.
#[derive(Args)]
pub struct StatusArgs {
    /// Provisioning job id
    pub job_id: String,
}

/// Run `vdi-provisioner status`.
///
/// # Errors
///
/// Returns an error if the store is unreachable or the job does not exist.
pub async fn run(app: &AppContext, args: &StatusArgs) -> Result<()> {
    let engine = Engine::connect(app.config.clone(), false).await?;
    let snapshot = engine.orchestrator.get_status(&args.job_id).await?;
    app.renderer().job(&snapshot)
}
