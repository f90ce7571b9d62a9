//! `vdi-provisioner logs`: print a remote automation log.

use anyhow::{Result, bail};
use clap::Args;

use crate::app::{AppContext, standalone_automation};

/// Arguments for the logs command.
#[derive(Args)]
pub struct LogsArgs {
    /// Log path on the automation host
    #[arg(conflicts_with = "job")]
    pub path: Option<String>,

    /// Tracked automation job id
    #[arg(long)]
    pub job: Option<String>,
}

/// Run `vdi-provisioner logs`.
///
/// # Errors
///
/// Returns an error if neither a path nor a job is given, or the log cannot
/// be read.
pub async fn run(app: &AppContext, args: &LogsArgs) -> Result<()> {
    let executor = standalone_automation(&app.config);
    let path = match (&args.path, &args.job) {
        (Some(path), _) => path.clone(),
        (None, Some(job)) => executor.log_path(job),
        (None, None) => bail!("give a log path or --job <id>"),
    };
    let body = executor.read_log(&path).await?;
    app.renderer().log(&path, &body)
}
