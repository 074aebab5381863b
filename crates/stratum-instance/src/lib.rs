//! Instance lifecycle orchestration for stratum
//!
//! Turns an [`InstanceSpec`](stratum_common::crd::InstanceSpec) into a running
//! multi-tier deployment and back:
//!
//! - [`builder`] renders config, database, application and exposure batches
//! - [`applier`] submits batches with server-side apply
//! - [`database`] initializes or clones the bundled database
//! - [`endpoint`] finds the externally reachable address
//! - [`orchestrator`] sequences the above for create, start, stop and delete
//!
//! [`render_instance`] renders every batch without touching a cluster.

#![deny(missing_docs)]

pub mod applier;
pub mod batch;
pub mod builder;
pub mod client;
pub mod credentials;
pub mod database;
pub mod endpoint;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

pub use applier::{BatchApplier, KubeBatchApplier};
pub use batch::{BatchKind, DeploymentBatch, Manifest};
pub use builder::{render_instance, ManifestBuilder, ResourceBuilder};
pub use client::{
    ClusterClient, KubeClusterClient, KubeRouteClient, KubeSccClient, RouteClient, SccClient,
};
pub use database::{DatabaseBootstrapper, DatabaseJobs, DbBootstrapPlan, KubeDatabaseJobs};
pub use endpoint::{EndpointRecord, EndpointResolver, ExposureMechanism};
pub use orchestrator::{
    Collaborators, CreateFailure, CreateOutcome, LifecycleOrchestrator, LifecyclePhase, PvcBindings,
};

/// Web tier service (route target)
pub const WEBSERVER_SERVICE: &str = "webserver";

/// LoadBalancer service exposing the web tier
pub const WEBSERVER_LB_SERVICE: &str = "webserver-lb";

/// NodePort service exposing the web tier
pub const WEBSERVER_NP_SERVICE: &str = "webserver-np";

/// Bundled database service
pub const POSTGRES_SERVICE: &str = "postgres";

/// HTTPS port exposed by the webserver services
pub const WEBSERVER_HTTPS_PORT: i32 = 443;

/// HTTPS port the webserver container listens on
pub const WEBSERVER_CONTAINER_PORT: i32 = 8443;

/// Config map with instance-wide settings and passthrough environs
pub const INSTANCE_CONFIG_MAP: &str = "instance-config";

/// Config map with database connection settings
pub const DB_CONFIG_MAP: &str = "db-config";

/// Config map with per-field database connection settings
pub const DB_CONFIG_GRANULAR_MAP: &str = "db-config-granular";
