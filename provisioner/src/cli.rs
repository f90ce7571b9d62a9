//! CLI argument parsing with clap derive

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::app::{AppContext, AppFlags};
use crate::commands;

/// Provision and configure Windows virtual desktops
#[derive(Parser)]
#[command(
    name = "vdi-provisioner",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(
        long,
        global = true,
        env = "NO_COLOR",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub no_color: bool,

    /// Configuration file (default: $VDI_CONFIG or ~/.vdi/config.yaml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Provision a batch of desktops and wait for the job to finish
    Provision(commands::provision::ProvisionArgs),

    /// Show a provisioning job with its desktops
    Status(commands::status::StatusArgs),

    /// Delete one desktop
    DeleteDesktop(commands::delete::DeleteDesktopArgs),

    /// Destroy a project and all of its desktops
    DestroyProject(commands::delete::DestroyProjectArgs),

    /// Run automation roles against hosts with retries
    Install(commands::install::InstallArgs),

    /// Print a remote automation log
    Logs(commands::logs::LogsArgs),

    /// Show version
    Version,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or the command fails.
    pub async fn run(self) -> Result<()> {
        let Cli {
            json,
            quiet,
            no_color,
            config,
            command,
        } = self;

        if let Command::Version = command {
            let ctx = crate::output::OutputContext::new(no_color, quiet);
            return commands::version::run(&ctx, json);
        }

        let app = AppContext::new(AppFlags {
            no_color,
            quiet,
            json,
            config,
        })?;
        match command {
            Command::Provision(args) => commands::provision::run(&app, args).await,
            Command::Status(args) => commands::status::run(&app, &args).await,
            Command::DeleteDesktop(args) => commands::delete::delete_desktop(&app, &args).await,
            Command::DestroyProject(args) => commands::delete::destroy_project(&app, &args).await,
            Command::Install(args) => commands::install::run(&app, args).await,
            Command::Logs(args) => commands::logs::run(&app, &args).await,
            Command::Version => Ok(()),
        }
    }
}
