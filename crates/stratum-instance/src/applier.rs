//! Batch applier: submits deployment batches to the cluster
//!
//! A batch is treated as one unit by the orchestrator even though the API
//! server applies each object independently. Applying is idempotent
//! (server-side apply of identical manifests is a no-op) and removing an
//! object that is already gone counts as success, which gives the
//! orchestrator at-least-once semantics for both directions.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use stratum_common::kube_utils::{build_api_resource, is_not_found};
use stratum_common::retry::{retry_with_backoff_if, RetryConfig};
use stratum_common::{Error, MANAGED_BY_LABEL};

use crate::batch::{DeploymentBatch, Manifest};

/// Trait abstracting batch submission
///
/// This trait allows mocking cluster writes in tests while using
/// server-side apply in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BatchApplier: Send + Sync {
    /// Create or update every manifest in the batch
    async fn apply(&self, batch: &DeploymentBatch) -> Result<(), Error>;

    /// Delete every manifest in the batch; already-absent objects are skipped
    async fn remove(&self, batch: &DeploymentBatch) -> Result<(), Error>;
}

/// Server-side-apply implementation of [`BatchApplier`]
pub struct KubeBatchApplier {
    client: Client,
    field_manager: String,
    retry: RetryConfig,
}

impl KubeBatchApplier {
    /// Create an applier that writes as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            retry: RetryConfig::default(),
        }
    }

    fn api_for(&self, manifest: &Manifest, namespace: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(&manifest.api_version, &manifest.kind);
        if manifest.cluster_scoped {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }

    /// Ensure the batch namespace exists (idempotent).
    ///
    /// Uses server-side apply so it never fails on "already exists".
    async fn ensure_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let (label_key, label_value) = MANAGED_BY_LABEL;
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": name,
                "labels": { label_key: label_value }
            }
        });
        api.patch(name, &PatchParams::apply(&self.field_manager), &Patch::Apply(&ns))
            .await?;
        Ok(())
    }

    async fn apply_manifest(&self, manifest: &Manifest, namespace: &str) -> Result<(), Error> {
        let api = &self.api_for(manifest, namespace);
        let params = &PatchParams::apply(&self.field_manager).force();
        let (name, body) = (manifest.name.as_str(), &manifest.body);
        let operation = format!("apply {}/{}", manifest.kind, manifest.name);

        // 4xx rejections (invalid manifest, forbidden) fail on the first attempt
        retry_with_backoff_if(&self.retry, &operation, Error::is_retryable, || async move {
            api.patch(name, params, &Patch::Apply(body))
                .await
                .map(|_| ())
                .map_err(Error::from)
        })
        .await?;

        debug!(kind = %manifest.kind, name = %manifest.name, namespace, "applied manifest");
        Ok(())
    }

    async fn remove_manifest(&self, manifest: &Manifest, namespace: &str) -> Result<(), Error> {
        let api = self.api_for(manifest, namespace);
        match api.delete(&manifest.name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(kind = %manifest.kind, name = %manifest.name, namespace, "removed manifest");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(kind = %manifest.kind, name = %manifest.name, "already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BatchApplier for KubeBatchApplier {
    async fn apply(&self, batch: &DeploymentBatch) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }

        self.ensure_namespace(&batch.namespace).await?;
        for manifest in batch.apply_order() {
            self.apply_manifest(manifest, &batch.namespace).await?;
        }

        info!(batch = %batch.kind, namespace = %batch.namespace, count = batch.len(), "batch applied");
        Ok(())
    }

    async fn remove(&self, batch: &DeploymentBatch) -> Result<(), Error> {
        for manifest in batch.remove_order() {
            self.remove_manifest(manifest, &batch.namespace).await?;
        }

        info!(batch = %batch.kind, namespace = %batch.namespace, count = batch.len(), "batch removed");
        Ok(())
    }
}
