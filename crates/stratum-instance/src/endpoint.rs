//! Endpoint resolution
//!
//! After exposure the web tier can be reachable through an OpenShift route,
//! a cloud load balancer or a node port. The candidates form a closed, ordered
//! set and the first mechanism that yields an address wins.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stratum_common::crd::{ExposeMode, InstanceSpec};
use stratum_common::retry::{poll_until, PollPolicy};
use stratum_common::{Error, OrchestratorConfig};

use crate::client::{ClusterClient, RouteClient};
use crate::{WEBSERVER_LB_SERVICE, WEBSERVER_NP_SERVICE, WEBSERVER_SERVICE};

/// How the endpoint was obtained
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExposureMechanism {
    /// OpenShift route host
    Route,
    /// Cloud load balancer ingress IP or hostname
    LoadBalancer,
    /// Cluster IP of the node port service
    NodePort,
}

impl ExposureMechanism {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::LoadBalancer => "loadBalancer",
            Self::NodePort => "nodePort",
        }
    }
}

impl std::fmt::Display for ExposureMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally reachable address of an instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Hostname or IP
    pub address: String,
    /// Mechanism that produced the address
    pub mechanism: ExposureMechanism,
}

/// Mechanisms to try, in precedence order.
///
/// Route is always first when the platform serves routes; load balancer is
/// only tried when the instance asked for one; node port is the fallback for
/// every exposed mode.
pub fn candidate_mechanisms(mode: ExposeMode, routes_available: bool) -> Vec<ExposureMechanism> {
    let mut candidates = Vec::with_capacity(3);
    if routes_available {
        candidates.push(ExposureMechanism::Route);
    }
    if mode == ExposeMode::LoadBalancer {
        candidates.push(ExposureMechanism::LoadBalancer);
    }
    if mode.is_exposed() {
        candidates.push(ExposureMechanism::NodePort);
    }
    candidates
}

/// Resolves the endpoint of an exposed instance
pub struct EndpointResolver {
    cluster: Arc<dyn ClusterClient>,
    routes: Option<Arc<dyn RouteClient>>,
    load_balancer: PollPolicy,
    node_port: PollPolicy,
    settle_delay: Duration,
}

impl EndpointResolver {
    /// Create a resolver; `routes` is `None` on clusters without the route API
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        routes: Option<Arc<dyn RouteClient>>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            cluster,
            routes,
            load_balancer: config.polling.load_balancer,
            node_port: config.polling.node_port,
            settle_delay: config.endpoint_settle_delay,
        }
    }

    /// Try each candidate mechanism in order and return the first address.
    ///
    /// Failures of individual mechanisms are logged and the next one is tried.
    /// When every candidate fails the result is a timeout.
    pub async fn resolve(&self, spec: &InstanceSpec) -> Result<EndpointRecord, Error> {
        let candidates = candidate_mechanisms(spec.expose_service, self.routes.is_some());
        if candidates.is_empty() {
            return Err(Error::configuration_for(
                &spec.name,
                "instance is not exposed, no endpoint to resolve",
            ));
        }

        if !self.settle_delay.is_zero() {
            debug!(delay = ?self.settle_delay, "waiting for exposure to settle");
            tokio::time::sleep(self.settle_delay).await;
        }

        for mechanism in &candidates {
            match self.try_mechanism(*mechanism, &spec.namespace).await {
                Ok(address) => {
                    info!(%mechanism, %address, namespace = %spec.namespace, "endpoint resolved");
                    return Ok(EndpointRecord {
                        address,
                        mechanism: *mechanism,
                    });
                }
                Err(e) => {
                    warn!(%mechanism, error = %e, namespace = %spec.namespace, "endpoint mechanism failed, trying next");
                }
            }
        }

        Err(Error::timeout(
            format!("endpoint for {}", spec.namespace),
            candidates.len() as u32,
        ))
    }

    async fn try_mechanism(
        &self,
        mechanism: ExposureMechanism,
        namespace: &str,
    ) -> Result<String, Error> {
        match mechanism {
            ExposureMechanism::Route => {
                let routes = self.routes.as_ref().ok_or_else(|| {
                    Error::internal_with_context("endpoint", "route candidate without route client")
                })?;
                routes.ensure_route(namespace, WEBSERVER_SERVICE).await
            }
            ExposureMechanism::LoadBalancer => {
                let operation = format!("load balancer address of {namespace}/{WEBSERVER_LB_SERVICE}");
                let cluster = &self.cluster;
                poll_until(&self.load_balancer, &operation, || async move {
                    Ok(cluster
                        .load_balancer_address(namespace, WEBSERVER_LB_SERVICE)
                        .await
                        .unwrap_or_else(|e| {
                            debug!(error = %e, "load balancer lookup failed");
                            None
                        }))
                })
                .await
            }
            ExposureMechanism::NodePort => {
                let operation = format!("cluster IP of {namespace}/{WEBSERVER_NP_SERVICE}");
                let cluster = &self.cluster;
                poll_until(&self.node_port, &operation, || async move {
                    Ok(cluster
                        .cluster_ip(namespace, WEBSERVER_NP_SERVICE)
                        .await
                        .unwrap_or_else(|e| {
                            debug!(error = %e, "node port lookup failed");
                            None
                        }))
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClusterClient, MockRouteClient};
    use crate::testing::sample_spec;

    fn resolver(cluster: MockClusterClient, routes: Option<MockRouteClient>) -> EndpointResolver {
        EndpointResolver::new(
            Arc::new(cluster),
            routes.map(|r| Arc::new(r) as Arc<dyn RouteClient>),
            &OrchestratorConfig::immediate(3),
        )
    }

    #[test]
    fn candidates_follow_fixed_precedence() {
        use ExposureMechanism::*;
        assert_eq!(
            candidate_mechanisms(ExposeMode::LoadBalancer, true),
            vec![Route, LoadBalancer, NodePort]
        );
        assert_eq!(candidate_mechanisms(ExposeMode::NodePort, false), vec![NodePort]);
        assert_eq!(candidate_mechanisms(ExposeMode::Route, true), vec![Route, NodePort]);
        assert!(candidate_mechanisms(ExposeMode::None, false).is_empty());
    }

    #[tokio::test]
    async fn route_wins_without_touching_services() {
        // No expectations: any load balancer or node port lookup panics
        let cluster = MockClusterClient::new();
        let mut routes = MockRouteClient::new();
        routes
            .expect_ensure_route()
            .withf(|ns, svc| ns == "ns1" && svc == WEBSERVER_SERVICE)
            .times(1)
            .returning(|_, _| Ok("bd1.apps.example.com".to_string()));

        let mut spec = sample_spec("bd1", "ns1");
        spec.expose_service = ExposeMode::LoadBalancer;

        let record = resolver(cluster, Some(routes)).resolve(&spec).await.unwrap();
        assert_eq!(record.mechanism, ExposureMechanism::Route);
        assert_eq!(record.address, "bd1.apps.example.com");
    }

    #[tokio::test]
    async fn falls_back_to_node_port_when_load_balancer_never_assigns() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_load_balancer_address()
            .times(3)
            .returning(|_, _| Ok(None));
        cluster
            .expect_cluster_ip()
            .withf(|_, svc| svc == WEBSERVER_NP_SERVICE)
            .returning(|_, _| Ok(Some("10.0.0.7".to_string())));

        let mut spec = sample_spec("bd1", "ns1");
        spec.expose_service = ExposeMode::LoadBalancer;

        let record = resolver(cluster, None).resolve(&spec).await.unwrap();
        assert_eq!(record.mechanism, ExposureMechanism::NodePort);
        assert_eq!(record.address, "10.0.0.7");
    }

    #[tokio::test]
    async fn failed_route_falls_through() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_cluster_ip()
            .returning(|_, _| Ok(Some("10.0.0.9".to_string())));
        let mut routes = MockRouteClient::new();
        routes
            .expect_ensure_route()
            .returning(|_, _| Err(Error::platform("ensure_route", "forbidden")));

        let record = resolver(cluster, Some(routes))
            .resolve(&sample_spec("bd1", "ns1"))
            .await
            .unwrap();
        assert_eq!(record.mechanism, ExposureMechanism::NodePort);
    }

    #[tokio::test]
    async fn lookup_errors_are_retried_then_time_out() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_cluster_ip()
            .times(3)
            .returning(|_, _| Err(Error::platform("get_service", "not found")));

        let err = resolver(cluster, None)
            .resolve(&sample_spec("bd1", "ns1"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn unexposed_instance_has_no_candidates() {
        let mut spec = sample_spec("bd1", "ns1");
        spec.expose_service = ExposeMode::None;
        let err = resolver(MockClusterClient::new(), None)
            .resolve(&spec)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
