//! Cluster read/delete operations used by the orchestrator
//!
//! Provides trait-based abstractions over the Kubernetes API so tests can mock
//! every interaction while production code uses real API calls.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Endpoints, Namespace, PersistentVolume, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use stratum_common::kube_utils::{build_api_resource, is_not_found};
use stratum_common::{Error, MANAGED_BY_LABEL};

/// API group served only by OpenShift clusters
pub const ROUTE_API_GROUP: &str = "route.openshift.io";

/// apiVersion of OpenShift routes
pub const ROUTE_API_VERSION: &str = "route.openshift.io/v1";

/// API group serving OpenShift security context constraints
pub const SCC_API_GROUP: &str = "security.openshift.io";

/// apiVersion of OpenShift security context constraints
pub const SCC_API_VERSION: &str = "security.openshift.io/v1";

/// Constraint allowing pods to run as any UID
pub const ANYUID_SCC: &str = "anyuid";

/// Name and phase of one pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodPhase {
    /// Pod name
    pub name: String,
    /// status.phase (Pending, Running, Succeeded, Failed, Unknown)
    pub phase: String,
    /// Owned by a Job (database init/clone)
    pub job_owned: bool,
}

impl PodPhase {
    /// Create a pod phase record for a workload pod
    pub fn new(name: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: phase.into(),
            job_owned: false,
        }
    }

    /// Create a pod phase record for a pod created by a Job
    pub fn for_job(name: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            job_owned: true,
            ..Self::new(name, phase)
        }
    }

    /// Running and succeeded pods count as settled.
    ///
    /// Job pods are always settled: the bootstrapper already waited on the
    /// job itself, and pods from retried attempts stay behind as `Failed`.
    pub fn is_settled(&self) -> bool {
        self.job_owned || matches!(self.phase.as_str(), "Running" | "Succeeded")
    }
}

/// Trait abstracting the cluster API reads and deletes the orchestrator needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Check whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;

    /// Request namespace deletion (already-absent is success)
    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;

    /// Read a secret's data, decoded as UTF-8. `None` when the secret is missing.
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// List every pod in the namespace with its phase
    async fn list_pod_phases(&self, namespace: &str) -> Result<Vec<PodPhase>, Error>;

    /// Volume bound to a claim; `None` until the platform completes binding
    async fn pvc_volume_name(&self, namespace: &str, claim: &str)
        -> Result<Option<String>, Error>;

    /// First load balancer ingress IP (or hostname) of a service
    async fn load_balancer_address(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<String>, Error>;

    /// Cluster IP of a service, if assigned
    async fn cluster_ip(&self, namespace: &str, service: &str) -> Result<Option<String>, Error>;

    /// True once the service has at least one ready endpoint address
    async fn service_has_ready_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<bool, Error>;

    /// Delete persistent volumes whose claims lived in the namespace.
    ///
    /// Best effort per volume: a failed delete is logged and the remaining
    /// volumes are still attempted. Returns the number of volumes deleted;
    /// only a failure to list volumes is an error.
    async fn delete_namespace_volumes(&self, namespace: &str) -> Result<usize, Error>;

    /// Delete a cluster role binding (already-absent is success)
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error>;
}

/// Real cluster client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(namespace = %name, "namespace deletion requested");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };

        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
            .collect();
        Ok(Some(data))
    }

    async fn list_pod_phases(&self, namespace: &str) -> Result<Vec<PodPhase>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                let job_owned = pod
                    .metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.kind == "Job"));
                let phase = pod
                    .status
                    .and_then(|s| s.phase)
                    .unwrap_or_else(|| "Unknown".to_string());
                PodPhase {
                    name: pod.metadata.name.unwrap_or_default(),
                    phase,
                    job_owned,
                }
            })
            .collect())
    }

    async fn pvc_volume_name(
        &self,
        namespace: &str,
        claim: &str,
    ) -> Result<Option<String>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = api.get(claim).await?;
        Ok(pvc
            .spec
            .and_then(|s| s.volume_name)
            .filter(|v| !v.is_empty()))
    }

    async fn load_balancer_address(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<String>, Error> {
        let svc = self.get_service(namespace, service).await?;
        let ingress = svc
            .status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .unwrap_or_default();

        Ok(ingress
            .into_iter()
            .find_map(|i| i.ip.or(i.hostname))
            .filter(|addr| !addr.is_empty()))
    }

    async fn cluster_ip(&self, namespace: &str, service: &str) -> Result<Option<String>, Error> {
        let svc = self.get_service(namespace, service).await?;
        Ok(svc
            .spec
            .and_then(|s| s.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None"))
    }

    async fn service_has_ready_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<bool, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let Some(endpoints) = api.get_opt(service).await? else {
            return Ok(false);
        };

        Ok(endpoints
            .subsets
            .unwrap_or_default()
            .iter()
            .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty())))
    }

    async fn delete_namespace_volumes(&self, namespace: &str) -> Result<usize, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let volumes = api.list(&ListParams::default()).await?;

        let mut deleted = 0;
        for name in volumes_claimed_in(&volumes.items, namespace) {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => {
                    debug!(volume = %name, namespace, "deleted persistent volume");
                    deleted += 1;
                }
                Err(e) if is_not_found(&e) => {}
                Err(e) => warn!(volume = %name, namespace, error = %e, "failed to delete persistent volume"),
            }
        }
        Ok(deleted)
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Names of volumes whose claim lived in `namespace`
fn volumes_claimed_in<'a>(volumes: &'a [PersistentVolume], namespace: &str) -> Vec<&'a str> {
    volumes
        .iter()
        .filter(|pv| {
            pv.spec
                .as_ref()
                .and_then(|s| s.claim_ref.as_ref())
                .and_then(|c| c.namespace.as_deref())
                == Some(namespace)
        })
        .filter_map(|pv| pv.metadata.name.as_deref())
        .collect()
}

/// Trait abstracting platform-native routes (OpenShift)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouteClient: Send + Sync {
    /// Create or update a route to `service` and return the host it serves
    async fn ensure_route(&self, namespace: &str, service: &str) -> Result<String, Error>;
}

/// OpenShift route client backed by `DynamicObject`
pub struct KubeRouteClient {
    client: Client,
    field_manager: String,
}

impl KubeRouteClient {
    /// Create a route client that writes as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Return a route client only when the cluster serves the route API
    pub async fn detect(client: Client, field_manager: &str) -> Result<Option<Self>, Error> {
        let groups = client.list_api_groups().await?;
        let has_routes = groups.groups.iter().any(|g| g.name == ROUTE_API_GROUP);
        debug!(has_routes, "checked for route API");
        Ok(has_routes.then(|| Self::new(client, field_manager)))
    }
}

#[async_trait]
impl RouteClient for KubeRouteClient {
    async fn ensure_route(&self, namespace: &str, service: &str) -> Result<String, Error> {
        let ar = build_api_resource(ROUTE_API_VERSION, "Route");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let (label_key, label_value) = MANAGED_BY_LABEL;

        let route = serde_json::json!({
            "apiVersion": ROUTE_API_VERSION,
            "kind": "Route",
            "metadata": {
                "name": namespace,
                "namespace": namespace,
                "labels": { label_key: label_value }
            },
            "spec": {
                "to": { "kind": "Service", "name": service },
                "port": { "targetPort": format!("port-{}", crate::WEBSERVER_HTTPS_PORT) },
                "tls": { "termination": "passthrough", "insecureEdgeTerminationPolicy": "Redirect" }
            }
        });

        let applied = api
            .patch(namespace, &PatchParams::apply(&self.field_manager), &Patch::Apply(&route))
            .await?;

        applied
            .data
            .pointer("/spec/host")
            .and_then(|h| h.as_str())
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::platform(
                    "ensure_route",
                    format!("route {namespace}/{namespace} has no host assigned"),
                )
            })
    }
}

/// Trait abstracting OpenShift security context constraint grants
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SccClient: Send + Sync {
    /// Let the service account run pods under the anyuid constraint
    async fn grant_anyuid(&self, namespace: &str, service_account: &str) -> Result<(), Error>;

    /// Withdraw a grant made by [`SccClient::grant_anyuid`] (absent is success)
    async fn revoke_anyuid(&self, namespace: &str, service_account: &str) -> Result<(), Error>;
}

/// User name OpenShift uses for a service account in SCC user lists
pub fn service_account_user(namespace: &str, service_account: &str) -> String {
    format!("system:serviceaccount:{namespace}:{service_account}")
}

/// `users` with `user` added; `None` when already present
fn with_user(users: &[String], user: &str) -> Option<Vec<String>> {
    if users.iter().any(|u| u == user) {
        return None;
    }
    let mut updated = users.to_vec();
    updated.push(user.to_string());
    Some(updated)
}

/// `users` with `user` removed; `None` when it was not present
fn without_user(users: &[String], user: &str) -> Option<Vec<String>> {
    if !users.iter().any(|u| u == user) {
        return None;
    }
    Some(users.iter().filter(|u| *u != user).cloned().collect())
}

/// SCC client editing the anyuid constraint's user list
pub struct KubeSccClient {
    client: Client,
}

impl KubeSccClient {
    /// Create an SCC client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Return an SCC client only when the cluster serves the SCC API
    pub async fn detect(client: Client) -> Result<Option<Self>, Error> {
        let groups = client.list_api_groups().await?;
        let has_scc = groups.groups.iter().any(|g| g.name == SCC_API_GROUP);
        debug!(has_scc, "checked for security context constraints API");
        Ok(has_scc.then(|| Self::new(client)))
    }

    /// Read the anyuid user list, edit it, and write it back.
    ///
    /// The write carries the read's resourceVersion, so a concurrent edit
    /// fails with a conflict instead of being overwritten.
    async fn edit_users<F>(&self, edit: F) -> Result<(), Error>
    where
        F: FnOnce(&[String]) -> Option<Vec<String>> + Send,
    {
        let ar = build_api_resource(SCC_API_VERSION, "SecurityContextConstraints");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let scc = api.get(ANYUID_SCC).await?;

        let users: Vec<String> = scc
            .data
            .get("users")
            .and_then(|u| u.as_array())
            .map(|u| u.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let Some(updated) = edit(&users) else {
            return Ok(());
        };

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": scc.metadata.resource_version },
            "users": updated,
        });
        api.patch(ANYUID_SCC, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SccClient for KubeSccClient {
    async fn grant_anyuid(&self, namespace: &str, service_account: &str) -> Result<(), Error> {
        let user = service_account_user(namespace, service_account);
        self.edit_users(|users| with_user(users, &user)).await?;
        info!(%user, scc = ANYUID_SCC, "granted security context constraint");
        Ok(())
    }

    async fn revoke_anyuid(&self, namespace: &str, service_account: &str) -> Result<(), Error> {
        let user = service_account_user(namespace, service_account);
        match self.edit_users(|users| without_user(users, &user)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_and_succeeded_pods_are_settled() {
        assert!(PodPhase::new("webserver-0", "Running").is_settled());
        assert!(PodPhase::new("db-init-x", "Succeeded").is_settled());
        assert!(!PodPhase::new("scan-0", "Pending").is_settled());
        assert!(!PodPhase::new("scan-1", "Failed").is_settled());
    }

    #[test]
    fn job_pods_never_block_readiness() {
        assert!(PodPhase::for_job("db-init-abcde-1", "Failed").is_settled());
        assert!(PodPhase::for_job("db-init-abcde-2", "Succeeded").is_settled());
    }

    fn volume(name: &str, claim_namespace: Option<&str>) -> PersistentVolume {
        use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeSpec};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref: claim_namespace.map(|ns| ObjectReference {
                    namespace: Some(ns.to_string()),
                    name: Some("postgres".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_volumes_claimed_in_the_namespace_are_selected() {
        let volumes = vec![
            volume("pv-1", Some("ns1")),
            volume("pv-2", Some("ns2")),
            volume("pv-3", None),
            volume("pv-4", Some("ns1")),
        ];
        assert_eq!(volumes_claimed_in(&volumes, "ns1"), vec!["pv-1", "pv-4"]);
        assert!(volumes_claimed_in(&volumes, "ns3").is_empty());
    }

    #[test]
    fn service_account_users_follow_openshift_naming() {
        assert_eq!(
            service_account_user("ns1", "stratum-instance"),
            "system:serviceaccount:ns1:stratum-instance"
        );
    }

    #[test]
    fn granting_is_idempotent() {
        let user = service_account_user("ns1", "stratum-instance");
        let users = vec!["system:admin".to_string()];

        let granted = with_user(&users, &user).unwrap();
        assert_eq!(granted, vec!["system:admin".to_string(), user.clone()]);
        assert_eq!(with_user(&granted, &user), None);
    }

    #[test]
    fn revoking_leaves_other_users() {
        let user = service_account_user("ns1", "stratum-instance");
        let users = vec!["system:admin".to_string(), user.clone()];

        assert_eq!(
            without_user(&users, &user),
            Some(vec!["system:admin".to_string()])
        );
        assert_eq!(without_user(&["system:admin".to_string()], &user), None);
    }
}
