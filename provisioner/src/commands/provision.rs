//! `vdi-provisioner provision`: submit a batch and wait for it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use vdi_common::{JobStatus, ProvisionMode, ProvisionRequest};

use crate::app::{AppContext, Engine};

/// Arguments for the provision command.
#[derive(Args)]
pub struct ProvisionArgs {
    /// Provisioning mode
    #[arg(long, value_enum)]
    pub mode: ProvisionMode,

    /// Request document (JSON, or YAML with a .yaml/.yml extension)
    #[arg(long, value_name = "FILE")]
    pub request: PathBuf,

    /// Provider region
    #[arg(long)]
    pub region: Option<String>,

    /// Keep job state in memory instead of Valkey
    #[arg(long)]
    pub ephemeral: bool,
}

/// Run `vdi-provisioner provision`.
///
/// # Errors
///
/// Returns an error if the request cannot be read, the engine cannot start,
/// or the job ends FAILED.
pub async fn run(app: &AppContext, args: ProvisionArgs) -> Result<()> {
    let request = load_request(&args.request)?;
    let engine = Engine::connect(app.config.clone(), args.ephemeral).await?;
    let _background = engine.start_background().await?;

    let ticket = engine
        .orchestrator
        .submit(args.mode, request, args.region)
        .await?;
    let job_id = ticket.job_id.clone();
    if !app.is_json() {
        app.output.info(&format!("Job {job_id} submitted"));
    }

    tokio::select! {
        joined = ticket.handle => {
            if let Err(e) = joined {
                tracing::error!(job_id = %job_id, error = %e, "job task ended abnormally");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            app.output.warn("Interrupted; reporting the job as it stands");
        }
    }

    let snapshot = engine.orchestrator.get_status(&job_id).await?;
    app.renderer().job(&snapshot)?;
    if snapshot.job.status == JobStatus::Failed {
        bail!(
            "job {job_id} failed: {}",
            snapshot.job.message.as_deref().unwrap_or("no detail")
        );
    }
    Ok(())
}

/// Parse a request document, choosing the format by extension.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_request(path: &Path) -> Result<ProvisionRequest> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    if yaml {
        serde_yaml::from_str(&content).with_context(|| format!("cannot parse {}", path.display()))
    } else {
        serde_json::from_str(&content).with_context(|| format!("cannot parse {}", path.display()))
    }
}
