//! Start, stop and converge commands

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use super::Context;
use crate::config::load_spec;
use crate::Result;

#[derive(Args, Debug)]
pub struct SpecArgs {
    /// Instance spec file (YAML or JSON)
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,
}

pub async fn start(args: SpecArgs, ctx: &Context) -> Result<()> {
    let spec = load_spec(&args.file)?;
    ctx.orchestrator().await?.start(&spec).await?;
    info!(instance = %spec.name, namespace = %spec.namespace, "instance started");
    Ok(())
}

pub async fn stop(args: SpecArgs, ctx: &Context) -> Result<()> {
    let spec = load_spec(&args.file)?;
    ctx.orchestrator().await?.stop(&spec).await?;
    Ok(())
}

pub async fn converge(args: SpecArgs, ctx: &Context) -> Result<()> {
    let spec = load_spec(&args.file)?;
    ctx.orchestrator().await?.converge(&spec).await?;
    info!(instance = %spec.name, desired = ?spec.desired_state, "instance converged");
    Ok(())
}
