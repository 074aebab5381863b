//! Resource builder: renders an instance into deployment batches
//!
//! Every batch is a pure function of the instance spec, its flavor and the
//! orchestrator configuration, so rendering the same inputs twice yields the
//! same manifests and re-applying them is a no-op.
//!
//! Batches:
//! - storage: declared persistent volume claims (create only)
//! - config: `db-creds` secret and the three config maps
//! - database: bundled postgres deployment and service
//! - application: web, scan, job runner and registration tiers
//! - exposure: node port / load balancer services

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource, EnvFromSource,
    EnvVar, EnvVarSource, LocalObjectReference, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, Secret, SecretKeySelector, Service, ServiceAccount, ServicePort,
    ServiceSpec, TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use stratum_common::crd::{ExposeMode, InstanceSpec, DEFAULT_DATABASE_PORT};
use stratum_common::flavor::{FlavorProfile, TierResources};
use stratum_common::{
    Error, OrchestratorConfig, COMPONENT_LABEL_KEY, INSTANCE_LABEL_KEY, MANAGED_BY_LABEL,
};

use crate::batch::{BatchKind, DeploymentBatch, Manifest};
use crate::credentials::{
    DbPasswords, DB_CREDS_ADMIN_KEY, DB_CREDS_POSTGRES_KEY, DB_CREDS_SECRET, DB_CREDS_USER_KEY,
};
use crate::database::{ADMIN_ROLE, USER_ROLE};
use crate::{
    DB_CONFIG_GRANULAR_MAP, DB_CONFIG_MAP, INSTANCE_CONFIG_MAP, POSTGRES_SERVICE,
    WEBSERVER_CONTAINER_PORT, WEBSERVER_HTTPS_PORT, WEBSERVER_LB_SERVICE, WEBSERVER_NP_SERVICE,
    WEBSERVER_SERVICE,
};

/// Service account every application pod runs as
pub const INSTANCE_SERVICE_ACCOUNT: &str = "stratum-instance";

/// Cluster role granted to the instance service account
pub const INSTANCE_CLUSTER_ROLE: &str = "stratum-instance";

const POSTGRES_DATA_PATH: &str = "/var/lib/postgresql/data";
const APP_DATA_PATH: &str = "/opt/blackduck/hub/data";

/// Trait abstracting manifest rendering
///
/// Implementations must be pure: identical inputs produce identical batches.
pub trait ResourceBuilder: Send + Sync {
    /// Persistent volume claims declared by the instance
    fn storage_batch(&self, spec: &InstanceSpec) -> Result<DeploymentBatch, Error>;

    /// Secrets and config maps.
    ///
    /// With `passwords == None` the secret is rendered without data, which is
    /// only suitable for removal.
    fn config_batch(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
        passwords: Option<&DbPasswords>,
    ) -> Result<DeploymentBatch, Error>;

    /// Bundled database deployment and service
    fn database_batch(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
    ) -> Result<DeploymentBatch, Error>;

    /// Application tiers, their services and the service account
    fn application_batch(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
    ) -> Result<DeploymentBatch, Error>;

    /// Services exposing the web tier, according to the exposure mode
    fn exposure_batch(&self, spec: &InstanceSpec) -> Result<DeploymentBatch, Error>;
}

/// Flavor tier an application component is sized from
#[derive(Clone, Copy)]
enum Tier {
    Webserver,
    Scan,
    Jobrunner,
    Sidecar,
}

impl Tier {
    fn resources(self, flavor: &FlavorProfile) -> &TierResources {
        match self {
            Self::Webserver => &flavor.webserver,
            Self::Scan => &flavor.scan,
            Self::Jobrunner => &flavor.jobrunner,
            Self::Sidecar => &flavor.sidecar,
        }
    }
}

/// One application component
struct Component {
    name: &'static str,
    image: &'static str,
    port: Option<i32>,
    tier: Tier,
}

const COMPONENTS: [Component; 4] = [
    Component {
        name: WEBSERVER_SERVICE,
        image: "blackduck-nginx",
        port: Some(WEBSERVER_CONTAINER_PORT),
        tier: Tier::Webserver,
    },
    Component {
        name: "scan",
        image: "blackduck-scan",
        port: Some(8443),
        tier: Tier::Scan,
    },
    Component {
        name: "jobrunner",
        image: "blackduck-jobrunner",
        port: None,
        tier: Tier::Jobrunner,
    },
    Component {
        name: "registration",
        image: "blackduck-registration",
        port: Some(8443),
        tier: Tier::Sidecar,
    },
];

/// Default [`ResourceBuilder`] producing typed `k8s-openapi` objects
#[derive(Clone, Debug)]
pub struct ManifestBuilder {
    image_registry: String,
    image_tag: String,
    database_image: String,
}

impl ManifestBuilder {
    /// Builder using the image settings from `config`
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            image_registry: config.image_registry.clone(),
            image_tag: config.image_tag.clone(),
            database_image: config.database_image.clone(),
        }
    }

    fn image(&self, spec: &InstanceSpec, image: &str) -> String {
        spec.registry
            .image(&self.image_registry, image, &self.image_tag)
    }

    fn pod_spec(&self, spec: &InstanceSpec, containers: Vec<Container>, volumes: Vec<Volume>) -> PodSpec {
        let pull_secrets: Vec<LocalObjectReference> = spec
            .registry
            .pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect();

        PodSpec {
            containers,
            volumes: (!volumes.is_empty()).then_some(volumes),
            image_pull_secrets: (!pull_secrets.is_empty()).then_some(pull_secrets),
            service_account_name: Some(INSTANCE_SERVICE_ACCOUNT.to_string()),
            ..Default::default()
        }
    }

    fn component_deployment(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
        component: &Component,
    ) -> Deployment {
        let tier = component.tier.resources(flavor);
        let container = Container {
            name: component.name.to_string(),
            image: Some(self.image(spec, component.image)),
            env_from: Some(
                [INSTANCE_CONFIG_MAP, DB_CONFIG_MAP, DB_CONFIG_GRANULAR_MAP]
                    .into_iter()
                    .map(|name| EnvFromSource {
                        config_map_ref: Some(ConfigMapEnvSource {
                            name: name.to_string(),
                            optional: None,
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            env: Some(vec![
                secret_env("HUB_POSTGRES_ADMIN_PASSWORD", DB_CREDS_ADMIN_KEY),
                secret_env("HUB_POSTGRES_USER_PASSWORD", DB_CREDS_USER_KEY),
            ]),
            ports: component.port.map(|port| {
                vec![ContainerPort {
                    container_port: port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]
            }),
            resources: Some(resources(tier)),
            liveness_probe: component
                .port
                .filter(|_| spec.liveness_probes)
                .map(tcp_socket_check),
            volume_mounts: Some(vec![VolumeMount {
                name: "data".to_string(),
                mount_path: APP_DATA_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let volume = data_volume(spec, component.name);
        deployment(
            spec,
            component.name,
            tier.replicas,
            self.pod_spec(spec, vec![container], vec![volume]),
        )
    }
}

impl ResourceBuilder for ManifestBuilder {
    fn storage_batch(&self, spec: &InstanceSpec) -> Result<DeploymentBatch, Error> {
        let mut batch = DeploymentBatch::new(BatchKind::Storage, &spec.namespace);
        if !spec.persistent_storage {
            return Ok(batch);
        }

        for claim in &spec.pvc {
            let pvc = PersistentVolumeClaim {
                metadata: metadata(spec, &claim.name, &claim.name),
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: claim.storage_class.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(claim.size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            };
            batch.push_resource(&claim.name, &pvc)?;
        }
        Ok(batch)
    }

    fn config_batch(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
        passwords: Option<&DbPasswords>,
    ) -> Result<DeploymentBatch, Error> {
        let mut batch = DeploymentBatch::new(BatchKind::Config, &spec.namespace);

        let secret = Secret {
            metadata: metadata(spec, DB_CREDS_SECRET, "config"),
            string_data: passwords.map(|p| {
                BTreeMap::from([
                    (DB_CREDS_ADMIN_KEY.to_string(), p.admin.clone()),
                    (DB_CREDS_USER_KEY.to_string(), p.user.clone()),
                    (DB_CREDS_POSTGRES_KEY.to_string(), p.postgres.clone()),
                ])
            }),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        batch.push_resource(DB_CREDS_SECRET, &secret)?;

        let mut instance_config = BTreeMap::from([
            ("HUB_VERSION".to_string(), spec.registry.image_tag.clone().unwrap_or_else(|| self.image_tag.clone())),
            ("HUB_SIZE".to_string(), flavor.size.to_string()),
            ("PUBLIC_HUB_WEBSERVER_HOST".to_string(), format!("{WEBSERVER_SERVICE}.{}.svc", spec.namespace)),
        ]);
        instance_config.extend(spec.environs.clone());
        batch.push_resource(
            INSTANCE_CONFIG_MAP,
            &config_map(spec, INSTANCE_CONFIG_MAP, instance_config),
        )?;

        let (host, port, admin, user, ssl) = match &spec.external_database {
            Some(db) => (db.host.clone(), db.port, db.admin_user.clone(), db.user.clone(), db.ssl),
            None => (
                POSTGRES_SERVICE.to_string(),
                DEFAULT_DATABASE_PORT,
                ADMIN_ROLE.to_string(),
                USER_ROLE.to_string(),
                false,
            ),
        };
        let db_config = BTreeMap::from([
            ("HUB_POSTGRES_HOST".to_string(), host),
            ("HUB_POSTGRES_PORT".to_string(), port.to_string()),
        ]);
        batch.push_resource(DB_CONFIG_MAP, &config_map(spec, DB_CONFIG_MAP, db_config))?;

        let granular = BTreeMap::from([
            ("HUB_POSTGRES_ADMIN".to_string(), admin),
            ("HUB_POSTGRES_USER".to_string(), user),
            ("HUB_POSTGRES_ENABLE_SSL".to_string(), ssl.to_string()),
            ("HUB_POSTGRES_ENABLE_SSL_CERT_AUTH".to_string(), "false".to_string()),
        ]);
        batch.push_resource(
            DB_CONFIG_GRANULAR_MAP,
            &config_map(spec, DB_CONFIG_GRANULAR_MAP, granular),
        )?;

        Ok(batch)
    }

    fn database_batch(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
    ) -> Result<DeploymentBatch, Error> {
        let mut batch = DeploymentBatch::new(BatchKind::Database, &spec.namespace);
        if !spec.uses_bundled_database() {
            return Ok(batch);
        }

        let port = i32::from(DEFAULT_DATABASE_PORT);
        let container = Container {
            name: POSTGRES_SERVICE.to_string(),
            image: Some(self.database_image.clone()),
            env: Some(vec![
                secret_env("POSTGRES_PASSWORD", DB_CREDS_POSTGRES_KEY),
                EnvVar {
                    name: "PGDATA".to_string(),
                    value: Some(format!("{POSTGRES_DATA_PATH}/pgdata")),
                    ..Default::default()
                },
            ]),
            ports: Some(vec![ContainerPort {
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: Some(resources(&flavor.postgres)),
            liveness_probe: spec.liveness_probes.then(|| tcp_socket_check(port)),
            volume_mounts: Some(vec![VolumeMount {
                name: "data".to_string(),
                mount_path: POSTGRES_DATA_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let mut postgres = deployment(
            spec,
            POSTGRES_SERVICE,
            flavor.postgres.replicas,
            self.pod_spec(spec, vec![container], vec![data_volume(spec, POSTGRES_SERVICE)]),
        );
        if let Some(deployment_spec) = postgres.spec.as_mut() {
            deployment_spec.strategy = Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            });
        }

        batch.push_resource(POSTGRES_SERVICE, &postgres)?;
        batch.push_resource(
            POSTGRES_SERVICE,
            &service(spec, POSTGRES_SERVICE, POSTGRES_SERVICE, None, port, port),
        )?;
        Ok(batch)
    }

    fn application_batch(
        &self,
        spec: &InstanceSpec,
        flavor: &FlavorProfile,
    ) -> Result<DeploymentBatch, Error> {
        let mut batch = DeploymentBatch::new(BatchKind::Application, &spec.namespace);

        let account = ServiceAccount {
            metadata: metadata(spec, INSTANCE_SERVICE_ACCOUNT, "application"),
            ..Default::default()
        };
        batch.push_resource(INSTANCE_SERVICE_ACCOUNT, &account)?;

        // Cluster-scoped, named after the namespace so delete can find it
        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(spec.namespace.clone()),
                labels: Some(labels(spec, "application")),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: INSTANCE_CLUSTER_ROLE.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: INSTANCE_SERVICE_ACCOUNT.to_string(),
                namespace: Some(spec.namespace.clone()),
                ..Default::default()
            }]),
        };
        batch.push(Manifest::from_resource(&spec.namespace, &binding)?.cluster_scoped());

        for component in &COMPONENTS {
            batch.push_resource(component.name, &self.component_deployment(spec, flavor, component))?;
            if let Some(port) = component.port {
                let service_port = if component.name == WEBSERVER_SERVICE {
                    WEBSERVER_HTTPS_PORT
                } else {
                    port
                };
                batch.push_resource(
                    component.name,
                    &service(spec, component.name, component.name, None, service_port, port),
                )?;
            }
        }
        Ok(batch)
    }

    fn exposure_batch(&self, spec: &InstanceSpec) -> Result<DeploymentBatch, Error> {
        let mut batch = DeploymentBatch::new(BatchKind::Exposure, &spec.namespace);

        if spec.expose_service == ExposeMode::LoadBalancer {
            batch.push_resource(
                WEBSERVER_LB_SERVICE,
                &service(
                    spec,
                    WEBSERVER_LB_SERVICE,
                    WEBSERVER_SERVICE,
                    Some("LoadBalancer"),
                    WEBSERVER_HTTPS_PORT,
                    WEBSERVER_CONTAINER_PORT,
                ),
            )?;
        }
        // Node port is the fallback for every exposed mode
        if spec.expose_service.is_exposed() {
            batch.push_resource(
                WEBSERVER_NP_SERVICE,
                &service(
                    spec,
                    WEBSERVER_NP_SERVICE,
                    WEBSERVER_SERVICE,
                    Some("NodePort"),
                    WEBSERVER_HTTPS_PORT,
                    WEBSERVER_CONTAINER_PORT,
                ),
            )?;
        }
        Ok(batch)
    }
}

// =============================================================================
// Object helpers
// =============================================================================

fn labels(spec: &InstanceSpec, component: &str) -> BTreeMap<String, String> {
    let (managed_key, managed_value) = MANAGED_BY_LABEL;
    BTreeMap::from([
        (managed_key.to_string(), managed_value.to_string()),
        (INSTANCE_LABEL_KEY.to_string(), spec.name.clone()),
        (COMPONENT_LABEL_KEY.to_string(), component.to_string()),
    ])
}

fn selector_labels(spec: &InstanceSpec, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (INSTANCE_LABEL_KEY.to_string(), spec.name.clone()),
        (COMPONENT_LABEL_KEY.to_string(), component.to_string()),
    ])
}

fn metadata(spec: &InstanceSpec, name: &str, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(spec.namespace.clone()),
        labels: Some(labels(spec, component)),
        ..Default::default()
    }
}

fn config_map(spec: &InstanceSpec, name: &str, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: metadata(spec, name, "config"),
        data: Some(data),
        ..Default::default()
    }
}

fn secret_env(name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: DB_CREDS_SECRET.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resources(tier: &TierResources) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(tier.cpu.clone())),
            ("memory".to_string(), Quantity(tier.memory.clone())),
        ])),
        limits: Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(tier.memory.clone()),
        )])),
        ..Default::default()
    }
}

/// Render every batch `create` would apply, in apply order, without touching
/// a cluster.
///
/// The `db-creds` secret carries no data: bootstrap passwords are only ever
/// read from the cluster. Empty batches are left out.
pub fn render_instance(
    builder: &dyn ResourceBuilder,
    spec: &InstanceSpec,
    flavor: &FlavorProfile,
) -> Result<Vec<DeploymentBatch>, Error> {
    spec.validate()?;

    let mut batches = vec![
        builder.storage_batch(spec)?,
        builder.config_batch(spec, flavor, None)?,
    ];
    if spec.uses_bundled_database() {
        batches.push(builder.database_batch(spec, flavor)?);
    }
    batches.push(builder.application_batch(spec, flavor)?);
    batches.push(builder.exposure_batch(spec)?);

    batches.retain(|b| !b.is_empty());
    Ok(batches)
}

fn tcp_socket_check(port: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            host: None,
        }),
        initial_delay_seconds: Some(240),
        period_seconds: Some(30),
        timeout_seconds: Some(10),
        failure_threshold: Some(10),
        ..Default::default()
    }
}

/// A declared claim named after the component backs its data volume when
/// storage is persistent; anything else gets an emptyDir.
fn data_volume(spec: &InstanceSpec, component: &str) -> Volume {
    match spec.persistent_claim(component) {
        Some(claim) => Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.name.clone(),
                read_only: Some(false),
            }),
            ..Default::default()
        },
        None => Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    }
}

fn deployment(spec: &InstanceSpec, name: &str, replicas: i32, pod: PodSpec) -> Deployment {
    Deployment {
        metadata: metadata(spec, name, name),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(spec, name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(spec, name)),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(
    spec: &InstanceSpec,
    name: &str,
    component: &str,
    type_: Option<&str>,
    port: i32,
    target_port: i32,
) -> Service {
    Service {
        metadata: metadata(spec, name, component),
        spec: Some(ServiceSpec {
            type_: type_.map(str::to_string),
            selector: Some(selector_labels(spec, component)),
            ports: Some(vec![ServicePort {
                name: Some(format!("port-{port}")),
                port,
                target_port: Some(IntOrString::Int(target_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
