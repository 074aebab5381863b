//! CLI commands

use std::path::PathBuf;

use tracing::debug;

use stratum_common::flavor::FlavorCatalog;
use stratum_common::kube_utils;
use stratum_instance::LifecycleOrchestrator;

use crate::config::load_orchestrator_config;
use crate::Result;

pub mod create;
pub mod delete;
pub mod lifecycle;
pub mod render;

/// Global options shared by every command
#[derive(Debug, Clone)]
pub struct Context {
    /// Explicit kubeconfig path
    pub kubeconfig: Option<PathBuf>,
    /// Orchestrator configuration file
    pub config: Option<PathBuf>,
}

impl Context {
    /// Connect to the cluster and build a kube-backed orchestrator
    pub async fn orchestrator(&self) -> Result<LifecycleOrchestrator> {
        let config = load_orchestrator_config(self.config.as_deref())?;
        debug!(operator_namespace = %config.operator_namespace, "loaded orchestrator config");

        let client = kube_utils::create_client(self.kubeconfig.as_deref()).await?;
        Ok(LifecycleOrchestrator::connect(client, FlavorCatalog::builtin(), config).await?)
    }
}
