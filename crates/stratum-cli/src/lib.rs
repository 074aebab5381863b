//! Stratum CLI library

pub mod commands;
pub mod config;
pub mod error;

use std::path::PathBuf;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use stratum_common::telemetry::LogFormat;

/// Stratum - instance lifecycle orchestration on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "stratum")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to kubeconfig (defaults to in-cluster or KUBECONFIG)
    #[arg(short = 'k', long, global = true, env = "STRATUM_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Orchestrator configuration file (YAML or JSON)
    #[arg(short = 'c', long, global = true, env = "STRATUM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision, start and expose a new instance
    Create(commands::create::CreateArgs),
    /// Deploy config, database and application tiers
    Start(commands::lifecycle::SpecArgs),
    /// Remove application, database and config (volumes are kept)
    Stop(commands::lifecycle::SpecArgs),
    /// Start or stop depending on the instance's desiredState
    Converge(commands::lifecycle::SpecArgs),
    /// Delete an instance namespace and its volumes
    Delete(commands::delete::DeleteArgs),
    /// Print the resources create would apply, without contacting a cluster
    Render(commands::render::RenderArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let ctx = commands::Context {
            kubeconfig: self.kubeconfig,
            config: self.config,
        };
        match self.command {
            Commands::Create(args) => commands::create::run(args, &ctx).await,
            Commands::Start(args) => commands::lifecycle::start(args, &ctx).await,
            Commands::Stop(args) => commands::lifecycle::stop(args, &ctx).await,
            Commands::Converge(args) => commands::lifecycle::converge(args, &ctx).await,
            Commands::Delete(args) => commands::delete::run(args, &ctx).await,
            Commands::Render(args) => commands::render::run(args, &ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stratum",
            "delete",
            "--namespace",
            "ns1",
            "--log-format",
            "json",
            "-k",
            "/tmp/kubeconfig",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
        match cli.command {
            Commands::Delete(args) => assert_eq!(args.namespace, "ns1"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_render() {
        let cli = Cli::try_parse_from(["stratum", "render", "-f", "bd1.yaml"]).unwrap();
        match cli.command {
            Commands::Render(args) => assert_eq!(args.file, PathBuf::from("bd1.yaml")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_log_format() {
        let result = Cli::try_parse_from(["stratum", "--log-format", "xml", "start", "-f", "bd1.yaml"]);
        assert!(result.is_err());
    }
}
