//! Stratum CLI
//!
//! Creates, starts, stops and deletes stratum instances.

use clap::Parser;

use stratum_cli::{Cli, Error, Result};
use stratum_common::telemetry::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_format, "info").map_err(|e| Error::Logging(e.to_string()))?;

    cli.run().await
}
