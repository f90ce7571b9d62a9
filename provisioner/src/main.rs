//! VDI provisioner - Windows virtual desktop provisioning and configuration

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vdi_provisioner::cli::Cli;
use vdi_provisioner::output::json::{error_code, format_error};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    if let Err(e) = cli.run().await {
        match format_error(&format!("{e:#}"), error_code(&e)) {
            Ok(doc) if json => println!("{doc}"),
            _ => eprintln!("Error: {e:#}"),
        }
        std::process::exit(1);
    }
}
