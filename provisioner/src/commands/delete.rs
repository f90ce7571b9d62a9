//! `vdi-provisioner delete-desktop` and `destroy-project`.

use anyhow::{Result, bail};
use clap::Args;
use vdi_common::InfraTaskStatus;

use crate::app::{AppContext, Engine};
use crate::application::services::decommission::DeletionTicket;
use crate::domain::status::DeletionReport;

/// Arguments for the delete-desktop command.
#[derive(Args)]
pub struct DeleteDesktopArgs {
    /// Desktop id
    pub vd_id: String,

    /// Provider region
    #[arg(long)]
    pub region: Option<String>,

    /// Return once the provider accepted the request
    #[arg(long)]
    pub no_wait: bool,
}

/// Arguments for the destroy-project command.
#[derive(Args)]
pub struct DestroyProjectArgs {
    /// Project id
    pub project_id: String,

    /// Provider region
    #[arg(long)]
    pub region: Option<String>,

    /// Return once the provider accepted the request
    #[arg(long)]
    pub no_wait: bool,
}

/// Run `vdi-provisioner delete-desktop`.
///
/// # Errors
///
/// Returns an error if the desktop is unknown, the provider rejects the
/// request, or the deletion fails.
pub async fn delete_desktop(app: &AppContext, args: &DeleteDesktopArgs) -> Result<()> {
    let engine = Engine::connect(app.config.clone(), false).await?;
    let _background = engine.start_background().await?;
    let ticket = engine
        .decommission
        .delete_desktop(&args.vd_id, args.region.as_deref())
        .await?;
    finish(app, &engine, ticket, args.no_wait).await
}

/// Run `vdi-provisioner destroy-project`.
///
/// # Errors
///
/// Returns an error if the provider rejects the request or the destruction
/// fails.
pub async fn destroy_project(app: &AppContext, args: &DestroyProjectArgs) -> Result<()> {
    let engine = Engine::connect(app.config.clone(), false).await?;
    let _background = engine.start_background().await?;
    let ticket = engine
        .decommission
        .destroy_project(&args.project_id, args.region.as_deref())
        .await?;
    finish(app, &engine, ticket, args.no_wait).await
}

async fn finish(
    app: &AppContext,
    engine: &Engine,
    ticket: DeletionTicket,
    no_wait: bool,
) -> Result<()> {
    let report = if no_wait {
        DeletionReport {
            task_id: ticket.task_id.clone(),
            status: Some(InfraTaskStatus::Deleting),
            error: None,
        }
    } else {
        if !app.is_json() {
            app.output
                .info(&format!("Waiting for deletion result (task {})", ticket.task_id));
        }
        engine.decommission.await_report(ticket).await
    };
    app.renderer().deletion(&report)?;
    if report.status == Some(InfraTaskStatus::DeleteFailed) {
        bail!(
            "deletion failed: {}",
            report.error.as_deref().unwrap_or("no detail")
        );
    }
    Ok(())
}
