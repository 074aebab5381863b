//! Lifecycle orchestrator: create, start, stop and delete instances
//!
//! Each operation awaits its steps strictly in order. A failed durable step
//! aborts in place without rolling back what was already applied; callers
//! re-run the operation (every step is idempotent) or delete the instance.
//!
//! During create, PVC binding and endpoint resolution are informational:
//! their failure is reported as a non-fatal [`CreateFailure`] carrying
//! whatever was gathered, since the instance itself is up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kube::Client;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use stratum_common::crd::{DesiredState, ExposeMode, InstanceSpec, DATABASE_CLAIM};
use stratum_common::flavor::{FlavorCatalog, FlavorProfile};
use stratum_common::retry::poll_until;
use stratum_common::{Error, OrchestratorConfig};

use crate::applier::{BatchApplier, KubeBatchApplier};
use crate::builder::{ManifestBuilder, ResourceBuilder};
use crate::builder::INSTANCE_SERVICE_ACCOUNT;
use crate::client::{
    ClusterClient, KubeClusterClient, KubeRouteClient, KubeSccClient, RouteClient, SccClient,
};
use crate::credentials::{fetch_bootstrap_passwords, DbPasswords};
use crate::database::{DatabaseBootstrapper, DatabaseJobs, KubeDatabaseJobs};
use crate::endpoint::{EndpointRecord, EndpointResolver};

/// Claim name to bound volume name
pub type PvcBindings = BTreeMap<String, String>;

/// Result of a fully successful create
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateOutcome {
    /// Externally reachable address; `None` when the instance is not exposed
    pub endpoint: Option<EndpointRecord>,
    /// Bound volumes, populated only with persistent storage
    pub pvc_bindings: PvcBindings,
}

/// A create that did not fully succeed.
///
/// `fatal == true` means a durable step failed and the instance is not
/// usable. `fatal == false` means the instance is deployed but the PVC
/// bindings or the endpoint could not be determined.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CreateFailure {
    /// What went wrong
    #[source]
    pub error: Error,
    /// Whether the instance is unusable
    pub fatal: bool,
    /// Bindings gathered before the failure
    pub pvc_bindings: PvcBindings,
}

impl CreateFailure {
    fn fatal(error: Error) -> Self {
        Self {
            error,
            fatal: true,
            pvc_bindings: PvcBindings::new(),
        }
    }

    fn partial(error: Error, pvc_bindings: PvcBindings) -> Self {
        Self {
            error,
            fatal: false,
            pvc_bindings,
        }
    }

    /// The instance is deployed even though create reported an error
    pub fn is_partial_success(&self) -> bool {
        !self.fatal
    }
}

/// Lifecycle phase, used in log fields
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Validating the instance and applying config
    Initializing,
    /// Config could not be applied
    ConfigFailed,
    /// Database deployed, bootstrap running
    DbInitializing,
    /// Database bootstrap failed
    DbFailed,
    /// Application tiers being applied
    AppDeploying,
    /// Exposure services applied, waiting for pods and endpoint
    Exposing,
    /// Create finished
    Ready,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::ConfigFailed => "configFailed",
            Self::DbInitializing => "dbInitializing",
            Self::DbFailed => "dbFailed",
            Self::AppDeploying => "appDeploying",
            Self::Exposing => "exposing",
            Self::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Collaborators the orchestrator drives
pub struct Collaborators {
    /// Renders batches
    pub builder: Arc<dyn ResourceBuilder>,
    /// Applies and removes batches
    pub applier: Arc<dyn BatchApplier>,
    /// Cluster reads and deletes
    pub cluster: Arc<dyn ClusterClient>,
    /// Database init/clone jobs
    pub jobs: Arc<dyn DatabaseJobs>,
    /// Route API, when the cluster serves it
    pub routes: Option<Arc<dyn RouteClient>>,
    /// Security context constraints API, when the cluster serves it
    pub scc: Option<Arc<dyn SccClient>>,
}

/// Orchestrates the lifecycle of instances.
///
/// Holds only shared collaborators and immutable configuration, so one
/// orchestrator can drive different namespaces from concurrent tasks.
/// Concurrent operations on the same instance are not guarded.
pub struct LifecycleOrchestrator {
    builder: Arc<dyn ResourceBuilder>,
    applier: Arc<dyn BatchApplier>,
    cluster: Arc<dyn ClusterClient>,
    scc: Option<Arc<dyn SccClient>>,
    bootstrapper: DatabaseBootstrapper,
    endpoints: EndpointResolver,
    flavors: FlavorCatalog,
    config: OrchestratorConfig,
}

impl LifecycleOrchestrator {
    /// Create an orchestrator from explicit collaborators
    pub fn new(
        collaborators: Collaborators,
        flavors: FlavorCatalog,
        config: OrchestratorConfig,
    ) -> Self {
        let Collaborators {
            builder,
            applier,
            cluster,
            jobs,
            routes,
            scc,
        } = collaborators;

        Self {
            bootstrapper: DatabaseBootstrapper::new(cluster.clone(), jobs, &config),
            endpoints: EndpointResolver::new(cluster.clone(), routes, &config),
            builder,
            applier,
            cluster,
            scc,
            flavors,
            config,
        }
    }

    /// Create an orchestrator backed by the Kubernetes API.
    ///
    /// Checks which of the route and security context constraint APIs the cluster serves;
    /// route exposure and anyuid grants only happen where they are served.
    pub async fn connect(
        client: Client,
        flavors: FlavorCatalog,
        config: OrchestratorConfig,
    ) -> Result<Self, Error> {
        config.validate()?;

        let routes = KubeRouteClient::detect(client.clone(), &config.field_manager)
            .await?
            .map(|r| Arc::new(r) as Arc<dyn RouteClient>);
        let scc = KubeSccClient::detect(client.clone())
            .await?
            .map(|s| Arc::new(s) as Arc<dyn SccClient>);

        let collaborators = Collaborators {
            builder: Arc::new(ManifestBuilder::new(&config)),
            applier: Arc::new(KubeBatchApplier::new(client.clone(), &config.field_manager)),
            cluster: Arc::new(KubeClusterClient::new(client.clone())),
            jobs: Arc::new(KubeDatabaseJobs::new(client, &config)),
            routes,
            scc,
        };
        Ok(Self::new(collaborators, flavors, config))
    }

    /// Provision a new instance, start it, expose it and report its endpoint.
    #[instrument(skip(self, spec), fields(instance = %spec.name, namespace = %spec.namespace))]
    pub async fn create(&self, spec: &InstanceSpec) -> Result<CreateOutcome, CreateFailure> {
        let flavor = self.prepare(spec).map_err(CreateFailure::fatal)?;
        info!(phase = %LifecyclePhase::Initializing, size = %flavor.size, "creating instance");

        let passwords = self.fetch_passwords().await.map_err(CreateFailure::fatal)?;
        self.provision(spec, &flavor, &passwords)
            .await
            .inspect_err(|e| warn!(phase = %LifecyclePhase::ConfigFailed, error = %e, "provisioning failed"))
            .map_err(CreateFailure::fatal)?;

        self.start_resolved(spec, &flavor, &passwords)
            .await
            .map_err(CreateFailure::fatal)?;

        info!(phase = %LifecyclePhase::Exposing, mode = ?spec.expose_service, "exposing instance");
        let exposure = self.builder.exposure_batch(spec).map_err(CreateFailure::fatal)?;
        self.applier
            .apply(&exposure)
            .await
            .map_err(CreateFailure::fatal)?;

        self.wait_for_pods(&spec.namespace)
            .await
            .map_err(CreateFailure::fatal)?;

        let pvc_bindings = self.resolve_pvc_bindings(spec).await?;

        let endpoint = if spec.expose_service == ExposeMode::None {
            None
        } else {
            match self.endpoints.resolve(spec).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "instance deployed but endpoint unresolved");
                    return Err(CreateFailure::partial(e, pvc_bindings));
                }
            }
        };

        info!(
            phase = %LifecyclePhase::Ready,
            endpoint = ?endpoint.as_ref().map(|e| e.address.as_str()),
            "instance created"
        );
        Ok(CreateOutcome {
            endpoint,
            pvc_bindings,
        })
    }

    /// Deploy config, database and application tiers.
    ///
    /// The database is bootstrapped when storage is ephemeral, or on the first
    /// start of an instance with persistent storage.
    #[instrument(skip(self, spec), fields(instance = %spec.name, namespace = %spec.namespace))]
    pub async fn start(&self, spec: &InstanceSpec) -> Result<(), Error> {
        let flavor = self.prepare(spec)?;
        let passwords = self.fetch_passwords().await?;
        self.start_resolved(spec, &flavor, &passwords).await
    }

    /// Remove application tiers, the bundled database and config, in that order.
    ///
    /// Persistent volume claims are kept.
    #[instrument(skip(self, spec), fields(instance = %spec.name, namespace = %spec.namespace))]
    pub async fn stop(&self, spec: &InstanceSpec) -> Result<(), Error> {
        let flavor = self.prepare(spec)?;

        let application = self.builder.application_batch(spec, &flavor)?;
        self.applier.remove(&application).await?;

        if spec.uses_bundled_database() {
            let database = self.builder.database_batch(spec, &flavor)?;
            self.applier.remove(&database).await?;
        }

        let config = self.builder.config_batch(spec, &flavor, None)?;
        self.applier.remove(&config).await?;

        info!("instance stopped");
        Ok(())
    }

    /// Tear down everything belonging to `namespace`.
    ///
    /// Best effort: after the name check, each step's failure is logged and
    /// the next step still runs.
    #[instrument(skip(self))]
    pub async fn delete(&self, namespace: &str) -> Result<(), Error> {
        if namespace.trim().is_empty() {
            return Err(Error::configuration_for_field(
                namespace,
                "namespace",
                "namespace name must not be empty",
            ));
        }

        match self.cluster.namespace_exists(namespace).await {
            Ok(true) => {
                if let Err(e) = self.delete_namespace(namespace).await {
                    warn!(error = %e, "namespace deletion did not complete");
                }
            }
            Ok(false) => debug!("namespace already absent"),
            Err(e) => warn!(error = %e, "failed to look up namespace"),
        }

        match self.cluster.delete_namespace_volumes(namespace).await {
            Ok(count) => info!(count, "deleted persistent volumes"),
            Err(e) => warn!(error = %e, "failed to delete persistent volumes"),
        }

        if let Err(e) = self.cluster.delete_cluster_role_binding(namespace).await {
            warn!(error = %e, "failed to delete cluster role binding");
        }

        if let Some(scc) = &self.scc {
            if let Err(e) = scc.revoke_anyuid(namespace, INSTANCE_SERVICE_ACCOUNT).await {
                warn!(error = %e, "failed to revoke anyuid from the instance service account");
            }
        }

        info!("instance deleted");
        Ok(())
    }

    /// Drive the instance towards its desired state
    pub async fn converge(&self, spec: &InstanceSpec) -> Result<(), Error> {
        match spec.desired_state {
            DesiredState::Running => self.start(spec).await,
            DesiredState::Stopped => self.stop(spec).await,
        }
    }

    /// Whether `start` runs the database bootstrapper for this spec.
    ///
    /// A database without a persistent claim starts empty every time, so it
    /// is bootstrapped on every start; a persistent one only on first start.
    pub fn needs_bootstrap(spec: &InstanceSpec) -> bool {
        !spec.database_is_persistent() || spec.state.is_pending()
    }

    fn prepare(&self, spec: &InstanceSpec) -> Result<FlavorProfile, Error> {
        spec.validate()?;
        self.flavors.resolve(&spec.size).map_err(|e| match e {
            Error::Configuration { message, .. } => {
                Error::configuration_for_field(&spec.name, "spec.size", message)
            }
            other => other,
        })
    }

    async fn fetch_passwords(&self) -> Result<DbPasswords, Error> {
        fetch_bootstrap_passwords(
            self.cluster.as_ref(),
            &self.config.operator_namespace,
            &self.config.credentials_secret,
            &self.config.polling.credentials,
        )
        .await
    }

    async fn provision(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
        passwords: &DbPasswords,
    ) -> Result<(), Error> {
        let storage = self.builder.storage_batch(spec)?;
        self.applier.apply(&storage).await?;

        let config = self.builder.config_batch(spec, flavor, Some(passwords))?;
        self.applier.apply(&config).await
    }

    async fn start_resolved(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
        passwords: &DbPasswords,
    ) -> Result<(), Error> {
        let config = self.builder.config_batch(spec, flavor, Some(passwords))?;
        self.applier.apply(&config).await?;

        if spec.uses_bundled_database() {
            if spec.persistent_storage && !spec.database_is_persistent() {
                warn!(
                    claim = DATABASE_CLAIM,
                    "persistent storage requested without a database claim, database data is ephemeral"
                );
            }
            let database = self.builder.database_batch(spec, flavor)?;
            self.applier.apply(&database).await?;

            if Self::needs_bootstrap(spec) {
                info!(phase = %LifecyclePhase::DbInitializing, "bootstrapping database");
                let plan = self
                    .bootstrapper
                    .init_or_clone(spec, passwords)
                    .await
                    .inspect_err(|e| warn!(phase = %LifecyclePhase::DbFailed, error = %e, "database bootstrap failed"))?;
                debug!(?plan, "database bootstrapped");
            } else {
                debug!(state = ?spec.state, "database already bootstrapped, skipping");
            }
        }

        if let Some(scc) = &self.scc {
            if let Err(e) = scc.grant_anyuid(&spec.namespace, INSTANCE_SERVICE_ACCOUNT).await {
                warn!(error = %e, "failed to grant anyuid to the instance service account");
            }
        }

        info!(phase = %LifecyclePhase::AppDeploying, "deploying application");
        let application = self.builder.application_batch(spec, flavor)?;
        self.applier.apply(&application).await
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), Error> {
        self.cluster.delete_namespace(namespace).await?;

        let operation = format!("namespace {namespace} to be deleted");
        let cluster = &self.cluster;
        poll_until(&self.config.polling.namespace_deletion, &operation, || async move {
            let exists = cluster.namespace_exists(namespace).await?;
            Ok((!exists).then_some(()))
        })
        .await?;

        info!("namespace deleted");
        Ok(())
    }

    async fn wait_for_pods(&self, namespace: &str) -> Result<(), Error> {
        let operation = format!("pods in {namespace} to run");
        let cluster = &self.cluster;
        poll_until(&self.config.polling.pods_running, &operation, || async move {
            let pods = cluster.list_pod_phases(namespace).await?;
            let pending: Vec<&str> = pods
                .iter()
                .filter(|p| !p.is_settled())
                .map(|p| p.name.as_str())
                .collect();

            if pods.is_empty() || !pending.is_empty() {
                debug!(total = pods.len(), ?pending, "waiting for pods");
                return Ok(None);
            }
            Ok(Some(()))
        })
        .await
    }

    async fn resolve_pvc_bindings(&self, spec: &InstanceSpec) -> Result<PvcBindings, CreateFailure> {
        let mut bindings = PvcBindings::new();
        if !spec.persistent_storage {
            return Ok(bindings);
        }

        let cluster = &self.cluster;
        let namespace = spec.namespace.as_str();
        for claim in &spec.pvc {
            let claim_name = claim.name.as_str();
            let operation = format!("volume binding of {namespace}/{claim_name}");
            let result = poll_until(&self.config.polling.pvc_binding, &operation, || async move {
                Ok(cluster
                    .pvc_volume_name(namespace, claim_name)
                    .await
                    .unwrap_or_else(|e| {
                        debug!(claim = claim_name, error = %e, "claim lookup failed");
                        None
                    }))
            })
            .await;

            match result {
                Ok(volume) => {
                    debug!(claim = claim_name, %volume, "claim bound");
                    bindings.insert(claim.name.clone(), volume);
                }
                Err(e) => {
                    warn!(claim = claim_name, error = %e, "instance deployed but claim binding unresolved");
                    return Err(CreateFailure::partial(e, bindings));
                }
            }
        }
        Ok(bindings)
    }
}
