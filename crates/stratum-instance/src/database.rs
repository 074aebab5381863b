//! Database bootstrap: initialize a fresh database or clone an existing one
//!
//! Both paths run as Kubernetes Jobs inside the instance namespace. The job
//! reads its passwords from a short-lived secret created next to it, which is
//! removed once the job has finished.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, Secret, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use stratum_common::crd::InstanceSpec;
use stratum_common::kube_utils::is_not_found;
use stratum_common::retry::{poll_until, PollPolicy};
use stratum_common::{Error, OrchestratorConfig, COMPONENT_LABEL_KEY, MANAGED_BY_LABEL};

use crate::client::ClusterClient;
use crate::credentials::{source_db_password, DbPasswords};
use crate::POSTGRES_SERVICE;

/// Databases created for every instance
pub const DATABASES: [&str; 3] = ["bds_hub", "bds_hub_report", "bdio"];

/// Role owning the application databases
pub const ADMIN_ROLE: &str = "blackduck";

/// Unprivileged application role
pub const USER_ROLE: &str = "blackduck_user";

/// Which bootstrap path an instance takes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DbBootstrapPlan {
    /// Create roles and empty databases
    Initialize,
    /// Copy every database from the instance in `source`
    Clone {
        /// Namespace of the source instance
        source: String,
    },
}

impl DbBootstrapPlan {
    /// Choose the plan once, from the instance's clone source
    pub fn for_spec(spec: &InstanceSpec) -> Self {
        match spec.clone_source() {
            Some(source) => Self::Clone {
                source: source.to_string(),
            },
            None => Self::Initialize,
        }
    }
}

/// Trait abstracting the database jobs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabaseJobs: Send + Sync {
    /// Create roles and databases and wait for completion
    async fn run_init(&self, namespace: &str, passwords: &DbPasswords) -> Result<(), Error>;

    /// Initialize, then restore a dump of `source_namespace` and wait for completion
    async fn run_clone(
        &self,
        namespace: &str,
        source_namespace: &str,
        source_password: &str,
        passwords: &DbPasswords,
    ) -> Result<(), Error>;
}

/// Runs the bootstrap as Kubernetes Jobs
pub struct KubeDatabaseJobs {
    client: Client,
    image: String,
    completion: PollPolicy,
}

impl KubeDatabaseJobs {
    /// Create a job runner using the database image and job wait bound from `config`
    pub fn new(client: Client, config: &OrchestratorConfig) -> Self {
        Self {
            client,
            image: config.database_image.clone(),
            completion: config.polling.database_job,
        }
    }

    async fn run(
        &self,
        namespace: &str,
        prefix: &str,
        script: String,
        secret_data: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let name = job_name(prefix);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);

        secrets
            .create(&PostParams::default(), &job_secret(&name, namespace, secret_data))
            .await?;

        let outcome = async {
            jobs.create(
                &PostParams::default(),
                &build_job(&name, namespace, &self.image, script),
            )
            .await?;
            info!(job = %name, namespace, "database job started");
            self.wait_for_job(&jobs, &name).await
        }
        .await;

        match secrets.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(error = %e, secret = %name, "failed to remove job secret"),
        }

        outcome
    }

    async fn wait_for_job(&self, jobs: &Api<Job>, name: &str) -> Result<(), Error> {
        let operation = format!("database job {name}");
        poll_until(&self.completion, &operation, || async move {
            let job = jobs.get(name).await?;
            if is_job_failed(&job) {
                let message = job_failure_message(&job).unwrap_or_else(|| "job failed".to_string());
                return Err(Error::platform(format!("database job {name}"), message));
            }
            Ok(is_job_complete(&job).then_some(()))
        })
        .await?;

        info!(job = %name, "database job completed");
        Ok(())
    }
}

#[async_trait]
impl DatabaseJobs for KubeDatabaseJobs {
    async fn run_init(&self, namespace: &str, passwords: &DbPasswords) -> Result<(), Error> {
        self.run(namespace, "db-init", init_script(), password_env(passwords))
            .await
    }

    async fn run_clone(
        &self,
        namespace: &str,
        source_namespace: &str,
        source_password: &str,
        passwords: &DbPasswords,
    ) -> Result<(), Error> {
        let mut data = password_env(passwords);
        data.insert("SOURCE_PASSWORD".to_string(), source_password.to_string());
        data.insert(
            "SOURCE_HOST".to_string(),
            format!("{POSTGRES_SERVICE}.{source_namespace}.svc"),
        );
        self.run(namespace, "db-clone", clone_script(), data).await
    }
}

/// Initializes or clones the bundled database of an instance
pub struct DatabaseBootstrapper {
    cluster: Arc<dyn ClusterClient>,
    jobs: Arc<dyn DatabaseJobs>,
    endpoint_wait: PollPolicy,
}

impl DatabaseBootstrapper {
    /// Create a bootstrapper
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        jobs: Arc<dyn DatabaseJobs>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            cluster,
            jobs,
            endpoint_wait: config.polling.database_endpoint,
        }
    }

    /// Wait for the database to accept connections, then run exactly one of
    /// init or clone.
    pub async fn init_or_clone(
        &self,
        spec: &InstanceSpec,
        passwords: &DbPasswords,
    ) -> Result<DbBootstrapPlan, Error> {
        let plan = DbBootstrapPlan::for_spec(spec);
        self.wait_for_database(&spec.namespace).await?;

        match &plan {
            DbBootstrapPlan::Initialize => {
                info!(namespace = %spec.namespace, "initializing database");
                self.jobs.run_init(&spec.namespace, passwords).await?;
            }
            DbBootstrapPlan::Clone { source } => {
                info!(namespace = %spec.namespace, %source, "cloning database");
                let source_password = source_db_password(self.cluster.as_ref(), source).await?;
                self.jobs
                    .run_clone(&spec.namespace, source, &source_password, passwords)
                    .await?;
            }
        }
        Ok(plan)
    }

    async fn wait_for_database(&self, namespace: &str) -> Result<(), Error> {
        let operation = format!("endpoint of {namespace}/{POSTGRES_SERVICE}");
        let cluster = &self.cluster;
        poll_until(&self.endpoint_wait, &operation, || async move {
            let ready = cluster
                .service_has_ready_endpoints(namespace, POSTGRES_SERVICE)
                .await
                .unwrap_or_else(|e| {
                    debug!(error = %e, "database endpoint lookup failed");
                    false
                });
            Ok(ready.then_some(()))
        })
        .await
    }
}

fn job_name(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{prefix}-{suffix}")
}

fn labels() -> BTreeMap<String, String> {
    let (managed_key, managed_value) = MANAGED_BY_LABEL;
    BTreeMap::from([
        (managed_key.to_string(), managed_value.to_string()),
        (COMPONENT_LABEL_KEY.to_string(), "database-job".to_string()),
    ])
}

fn password_env(passwords: &DbPasswords) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("ADMIN_PASSWORD".to_string(), passwords.admin.clone()),
        ("USER_PASSWORD".to_string(), passwords.user.clone()),
        ("PGPASSWORD".to_string(), passwords.postgres.clone()),
    ])
}

fn job_secret(name: &str, namespace: &str, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        string_data: Some(data),
        ..Default::default()
    }
}

fn init_script() -> String {
    let mut script = format!(
        "set -e\n\
         psql -v ON_ERROR_STOP=1 -c \"CREATE ROLE {ADMIN_ROLE} LOGIN PASSWORD '$ADMIN_PASSWORD'\"\n\
         psql -v ON_ERROR_STOP=1 -c \"CREATE ROLE {USER_ROLE} LOGIN PASSWORD '$USER_PASSWORD'\"\n"
    );
    for db in DATABASES {
        script.push_str(&format!(
            "psql -v ON_ERROR_STOP=1 -c \"CREATE DATABASE {db} OWNER {ADMIN_ROLE}\"\n\
             psql -v ON_ERROR_STOP=1 -c \"GRANT CONNECT, TEMPORARY ON DATABASE {db} TO {USER_ROLE}\"\n"
        ));
    }
    script
}

fn clone_script() -> String {
    let mut script = init_script();
    script.push_str("set -o pipefail\n");
    for db in DATABASES {
        script.push_str(&format!(
            "PGPASSWORD=\"$SOURCE_PASSWORD\" pg_dump -h \"$SOURCE_HOST\" -U {ADMIN_ROLE} -Fc {db} \
             | PGPASSWORD=\"$ADMIN_PASSWORD\" pg_restore -h {POSTGRES_SERVICE} -U {ADMIN_ROLE} --no-owner -d {db}\n"
        ));
    }
    script
}

fn secret_env(secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: key.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the bootstrap Job.
///
/// The job connects to the in-namespace `postgres` service as the superuser,
/// with `backoffLimit: 2` and `ttlSecondsAfterFinished: 600`.
fn build_job(name: &str, namespace: &str, image: &str, script: String) -> Job {
    let mut env = vec![
        EnvVar {
            name: "PGHOST".to_string(),
            value: Some(POSTGRES_SERVICE.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "PGUSER".to_string(),
            value: Some("postgres".to_string()),
            ..Default::default()
        },
    ];
    env.extend(
        ["PGPASSWORD", "ADMIN_PASSWORD", "USER_PASSWORD", "SOURCE_PASSWORD", "SOURCE_HOST"]
            .into_iter()
            .map(|key| secret_env(name, key)),
    );

    let container = Container {
        name: "bootstrap".to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
        args: Some(vec![script]),
        env: Some(env),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            ttl_seconds_after_finished: Some(600),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn is_job_complete(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Complete" && c.status == "True")
        })
}

fn is_job_failed(job: &Job) -> bool {
    job_failure_condition(job).is_some()
}

fn job_failure_message(job: &Job) -> Option<String> {
    job_failure_condition(job).and_then(|c| c.message.clone())
}

fn job_failure_condition(job: &Job) -> Option<&k8s_openapi::api::batch::v1::JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
        })
}
