//! Create command
//!
//! Usage: stratum create -f bd1.yaml
//!
//! Prints the resolved endpoint and volume bindings as JSON. When the
//! instance is deployed but its endpoint or volumes could not be resolved,
//! the partial result is still printed and the command exits with an error.

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use stratum_instance::{CreateOutcome, EndpointRecord, PvcBindings};

use super::Context;
use crate::config::load_spec;
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Instance spec file (YAML or JSON)
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,
}

/// What `create` prints on stdout
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateReport<'a> {
    instance: &'a str,
    namespace: &'a str,
    endpoint: Option<&'a EndpointRecord>,
    pvc_bindings: &'a PvcBindings,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

pub async fn run(args: CreateArgs, ctx: &Context) -> Result<()> {
    let spec = load_spec(&args.file)?;
    let orchestrator = ctx.orchestrator().await?;

    match orchestrator.create(&spec).await {
        Ok(CreateOutcome {
            endpoint,
            pvc_bindings,
        }) => {
            info!(instance = %spec.name, "create finished");
            print_report(&CreateReport {
                instance: &spec.name,
                namespace: &spec.namespace,
                endpoint: endpoint.as_ref(),
                pvc_bindings: &pvc_bindings,
                warning: None,
            })
        }
        Err(failure) if failure.is_partial_success() => {
            warn!(instance = %spec.name, error = %failure.error, "create finished with warnings");
            print_report(&CreateReport {
                instance: &spec.name,
                namespace: &spec.namespace,
                endpoint: None,
                pvc_bindings: &failure.pvc_bindings,
                warning: Some(failure.error.to_string()),
            })?;
            Err(Error::partial_success(failure.error.to_string()))
        }
        Err(failure) => Err(failure.error.into()),
    }
}

fn print_report(report: &CreateReport<'_>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
