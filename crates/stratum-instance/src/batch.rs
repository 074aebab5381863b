//! Deployment batches: named sets of manifests applied or removed together

use std::fmt;

use serde::Serialize;

use stratum_common::kube_utils::kind_priority;
use stratum_common::Error;

/// The orchestration step a batch belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// Persistent volume claims, created once and never removed by stop
    Storage,
    /// Secrets and config maps
    Config,
    /// Bundled database deployment and service
    Database,
    /// Web tier, scan tier and sidecars
    Application,
    /// Services that make the web tier reachable
    Exposure,
}

impl BatchKind {
    /// Short name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Database => "database",
            Self::Application => "application",
            Self::Exposure => "exposure",
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Kubernetes object ready for server-side apply
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    /// apiVersion, e.g. "apps/v1"
    pub api_version: String,
    /// Kind, e.g. "Deployment"
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// Cluster-scoped objects ignore the batch namespace
    pub cluster_scoped: bool,
    /// Full object including apiVersion, kind and metadata
    pub body: serde_json::Value,
}

impl Manifest {
    /// Serialize a typed `k8s-openapi` resource into a namespaced manifest
    pub fn from_resource<K>(name: &str, resource: &K) -> Result<Self, Error>
    where
        K: k8s_openapi::Resource + Serialize,
    {
        let mut body = serde_json::to_value(resource)
            .map_err(|e| Error::serialization_for_kind(K::KIND, e.to_string()))?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("apiVersion".to_string(), K::API_VERSION.into());
            obj.insert("kind".to_string(), K::KIND.into());
        }
        Ok(Self {
            api_version: K::API_VERSION.to_string(),
            kind: K::KIND.to_string(),
            name: name.to_string(),
            cluster_scoped: false,
            body,
        })
    }

    /// Mark this manifest as cluster-scoped
    pub fn cluster_scoped(mut self) -> Self {
        self.cluster_scoped = true;
        self
    }
}

/// An ordered set of manifests submitted together.
///
/// Created fresh for each orchestration step; carries no state beyond its
/// contents.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentBatch {
    /// Which step produced the batch
    pub kind: BatchKind,
    /// Target namespace for namespaced manifests
    pub namespace: String,
    /// Manifests in insertion order
    pub manifests: Vec<Manifest>,
}

impl DeploymentBatch {
    /// Empty batch for `namespace`
    pub fn new(kind: BatchKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            manifests: Vec::new(),
        }
    }

    /// Append a manifest
    pub fn push(&mut self, manifest: Manifest) {
        self.manifests.push(manifest);
    }

    /// Serialize and append a typed resource
    pub fn push_resource<K>(&mut self, name: &str, resource: &K) -> Result<(), Error>
    where
        K: k8s_openapi::Resource + Serialize,
    {
        self.push(Manifest::from_resource(name, resource)?);
        Ok(())
    }

    /// True when there is nothing to apply
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Number of manifests
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    /// Manifests in apply order (stable within a kind)
    pub fn apply_order(&self) -> Vec<&Manifest> {
        let mut ordered: Vec<&Manifest> = self.manifests.iter().collect();
        ordered.sort_by_key(|m| kind_priority(&m.kind));
        ordered
    }

    /// Manifests in removal order, the reverse of apply order
    pub fn remove_order(&self) -> Vec<&Manifest> {
        let mut ordered = self.apply_order();
        ordered.reverse();
        ordered
    }

    /// Names of manifests of the given kind, in insertion order
    pub fn names_of_kind(&self, kind: &str) -> Vec<&str> {
        self.manifests
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{ConfigMap, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn from_resource_stamps_type_meta() {
        let cm = ConfigMap {
            metadata: meta("instance-config"),
            ..Default::default()
        };
        let manifest = Manifest::from_resource("instance-config", &cm).unwrap();
        assert_eq!(manifest.api_version, "v1");
        assert_eq!(manifest.kind, "ConfigMap");
        assert_eq!(manifest.body["kind"], "ConfigMap");
        assert_eq!(manifest.body["metadata"]["name"], "instance-config");
        assert!(!manifest.cluster_scoped);
    }

    #[test]
    fn apply_and_remove_orders_are_mirrored() {
        let mut batch = DeploymentBatch::new(BatchKind::Database, "ns1");
        batch
            .push_resource("postgres", &Deployment { metadata: meta("postgres"), ..Default::default() })
            .unwrap();
        batch
            .push_resource("postgres", &Service { metadata: meta("postgres"), ..Default::default() })
            .unwrap();
        batch
            .push_resource("db-config", &ConfigMap { metadata: meta("db-config"), ..Default::default() })
            .unwrap();

        let apply: Vec<&str> = batch.apply_order().iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(apply, vec!["ConfigMap", "Service", "Deployment"]);

        let remove: Vec<&str> = batch.remove_order().iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(remove, vec!["Deployment", "Service", "ConfigMap"]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.names_of_kind("Service"), vec!["postgres"]);
    }
}
