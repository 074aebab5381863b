//! Delete command
//!
//! Usage: stratum delete --namespace ns1
//!
//! Deletes the namespace, waits for it to disappear, then removes the
//! persistent volumes and cluster role binding left behind. Cleanup failures
//! are logged and do not fail the command.

use clap::Args;

use super::Context;
use crate::Result;

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Namespace of the instance to delete
    #[arg(short = 'n', long)]
    pub namespace: String,
}

pub async fn run(args: DeleteArgs, ctx: &Context) -> Result<()> {
    ctx.orchestrator().await?.delete(&args.namespace).await?;
    Ok(())
}
