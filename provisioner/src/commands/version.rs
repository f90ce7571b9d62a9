//! Version command

use anyhow::Result;

use crate::output::{HumanRenderer, JsonRenderer, OutputContext, Renderer};

/// Run the version command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn run(ctx: &OutputContext, json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let renderer = if json {
        Renderer::Json(JsonRenderer)
    } else {
        Renderer::Human(HumanRenderer::new(ctx))
    };
    renderer.version(version)
}
