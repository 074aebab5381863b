//! Orchestrator configuration
//!
//! Everything the orchestrator used to look up from process-wide state
//! (operator namespace, credential secret, image locations, wait bounds) is a
//! named field here and is handed to the orchestrator at construction. Every
//! field has a default so an empty document is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::PollPolicy;
use crate::{Error, DEFAULT_FIELD_MANAGER, STRATUM_SYSTEM_NAMESPACE};

/// Name of the operator-scope secret holding bootstrap database passwords
pub const DEFAULT_CREDENTIALS_SECRET: &str = "stratum-db-passwords";

/// Registry the application images are pulled from by default
pub const DEFAULT_IMAGE_REGISTRY: &str = "docker.io/blackducksoftware";

/// Application image tag used when the instance spec does not pin one
pub const DEFAULT_IMAGE_TAG: &str = "2023.10.0";

/// Image used for the bundled database and the init/clone jobs
pub const DEFAULT_DATABASE_IMAGE: &str = "docker.io/library/postgres:13";

/// Serde helpers encoding a `Duration` as (fractional) seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as seconds
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    /// Deserialize from non-negative seconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Wait bounds for every poll the orchestrator performs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingConfig {
    /// Fetching bootstrap passwords from the operator namespace
    pub credentials: PollPolicy,
    /// Database service reporting a ready endpoint
    pub database_endpoint: PollPolicy,
    /// Database init/clone job completion
    pub database_job: PollPolicy,
    /// All pods in the namespace running after create
    pub pods_running: PollPolicy,
    /// Each persistent volume claim being bound
    pub pvc_binding: PollPolicy,
    /// Load balancer ingress address
    pub load_balancer: PollPolicy,
    /// Node port service cluster IP
    pub node_port: PollPolicy,
    /// Namespace disappearing after delete
    pub namespace_deletion: PollPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            credentials: PollPolicy::new(60, Duration::from_secs(5)),
            database_endpoint: PollPolicy::new(60, Duration::from_secs(5)),
            database_job: PollPolicy::new(120, Duration::from_secs(5)),
            pods_running: PollPolicy::new(90, Duration::from_secs(10)),
            pvc_binding: PollPolicy::new(60, Duration::from_secs(10)),
            load_balancer: PollPolicy::new(10, Duration::from_secs(10)),
            node_port: PollPolicy::new(10, Duration::from_secs(10)),
            namespace_deletion: PollPolicy::new(60, Duration::from_secs(10)),
        }
    }
}

impl PollingConfig {
    /// Every wait checks `max_attempts` times without sleeping
    pub fn immediate(max_attempts: u32) -> Self {
        let p = PollPolicy::immediate(max_attempts);
        Self {
            credentials: p,
            database_endpoint: p,
            database_job: p,
            pods_running: p,
            pvc_binding: p,
            load_balancer: p,
            node_port: p,
            namespace_deletion: p,
        }
    }
}

/// Typed configuration threaded through the orchestrator's constructor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Namespace the operator runs in (holds the credentials secret)
    pub operator_namespace: String,
    /// Secret in the operator namespace with ADMIN/USER/POSTGRES passwords
    pub credentials_secret: String,
    /// Field manager used for server-side apply
    pub field_manager: String,
    /// Default registry for application images
    pub image_registry: String,
    /// Default tag for application images
    pub image_tag: String,
    /// Image for the bundled database and database jobs
    pub database_image: String,
    /// Wait bounds
    pub polling: PollingConfig,
    /// Delay after exposure before the first endpoint lookup
    #[serde(with = "duration_secs")]
    pub endpoint_settle_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            operator_namespace: STRATUM_SYSTEM_NAMESPACE.to_string(),
            credentials_secret: DEFAULT_CREDENTIALS_SECRET.to_string(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            image_registry: DEFAULT_IMAGE_REGISTRY.to_string(),
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
            database_image: DEFAULT_DATABASE_IMAGE.to_string(),
            polling: PollingConfig::default(),
            endpoint_settle_delay: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    /// Configuration with no waiting, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            polling: PollingConfig::immediate(max_attempts),
            endpoint_settle_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Reject configurations that would fail on the first cluster call
    pub fn validate(&self) -> Result<(), Error> {
        let required = [
            ("operatorNamespace", &self.operator_namespace),
            ("credentialsSecret", &self.credentials_secret),
            ("fieldManager", &self.field_manager),
            ("imageRegistry", &self.image_registry),
            ("imageTag", &self.image_tag),
            ("databaseImage", &self.database_image),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::configuration_for_field(
                    "orchestrator",
                    field,
                    format!("{field} must not be empty"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: OrchestratorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn partial_polling_overrides_keep_other_defaults() {
        let yaml = r#"
operatorNamespace: bd-operator
endpointSettleDelay: 0.5
polling:
  loadBalancer:
    maxAttempts: 3
    interval: 2
"#;
        let config: OrchestratorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.operator_namespace, "bd-operator");
        assert_eq!(config.endpoint_settle_delay, Duration::from_millis(500));
        assert_eq!(
            config.polling.load_balancer,
            PollPolicy::new(3, Duration::from_secs(2))
        );
        assert_eq!(config.polling.node_port, PollingConfig::default().node_port);
    }

    #[test]
    fn negative_durations_are_rejected() {
        let result: Result<OrchestratorConfig, _> =
            serde_yaml::from_str("endpointSettleDelay: -1");
        assert!(result.is_err());
    }

    #[test]
    fn blank_names_fail_validation() {
        let config = OrchestratorConfig {
            credentials_secret: " ".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("credentialsSecret"));
    }

    #[test]
    fn reference_wait_bounds() {
        let polling = PollingConfig::default();
        assert_eq!(polling.load_balancer, PollPolicy::new(10, Duration::from_secs(10)));
        assert_eq!(polling.node_port, PollPolicy::new(10, Duration::from_secs(10)));
        assert_eq!(polling.pvc_binding, PollPolicy::new(60, Duration::from_secs(10)));
        assert_eq!(polling.credentials.interval, Duration::from_secs(5));
    }
}
