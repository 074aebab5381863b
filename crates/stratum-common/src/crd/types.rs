//! Supporting types for InstanceSpec

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default port for an external PostgreSQL server
pub const DEFAULT_DATABASE_PORT: u16 = 5432;

/// Lifecycle state the caller wants the instance in
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    /// Database and application deployed
    #[default]
    Running,
    /// Application and database removed
    Stopped,
}

/// Lifecycle state tag last recorded for the instance.
///
/// `Pending` marks an instance that has never been started; the database
/// bootstrapper keys first-start initialization off it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Never started
    #[default]
    #[serde(alias = "Pending")]
    Pending,
    /// Create in progress
    #[serde(alias = "Creating")]
    Creating,
    /// Started at least once and currently running
    #[serde(alias = "Running")]
    Running,
    /// Started at least once and currently stopped
    #[serde(alias = "Stopped")]
    Stopped,
    /// Last operation failed
    #[serde(alias = "Error")]
    Error,
}

impl InstanceState {
    /// True when the instance has never been started
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// How the web tier is made reachable from outside the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExposeMode {
    /// NodePort service `webserver-np`
    #[default]
    NodePort,
    /// LoadBalancer service `webserver-lb` (node port kept as fallback)
    LoadBalancer,
    /// OpenShift route in front of `webserver`, node port as fallback
    Route,
    /// Not exposed; no endpoint is resolved
    None,
}

impl ExposeMode {
    /// True when some exposure mechanism should be set up
    pub fn is_exposed(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Persistent volume claim requested for the instance
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    /// Claim name
    pub name: String,
    /// Requested capacity (Kubernetes quantity, e.g. "150Gi")
    pub size: String,
    /// Storage class; cluster default when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl PvcSpec {
    /// Claim on the default storage class
    pub fn new(name: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: size.into(),
            storage_class: None,
        }
    }
}

/// Connection details for an existing PostgreSQL server
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDatabase {
    /// Server hostname
    pub host: String,
    /// Server port
    #[serde(default = "default_database_port")]
    pub port: u16,
    /// Administrative user
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    /// Application user
    #[serde(default = "default_user")]
    pub user: String,
    /// Require TLS to the server
    #[serde(default)]
    pub ssl: bool,
}

fn default_database_port() -> u16 {
    DEFAULT_DATABASE_PORT
}

fn default_admin_user() -> String {
    "blackduck".to_string()
}

fn default_user() -> String {
    "blackduck_user".to_string()
}

impl ExternalDatabase {
    /// External database on the default port with stock users
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_DATABASE_PORT,
            admin_user: default_admin_user(),
            user: default_user(),
            ssl: false,
        }
    }
}

/// Image registry overrides and pull secrets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Registry prefix replacing the default image registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Image tag for application images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    /// Names of docker-registry secrets attached to every pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pull_secrets: Vec<String>,
}

impl RegistryConfig {
    /// Resolve an image reference against the registry override and tag
    ///
    /// `image` is a bare repository name such as `blackduck-webapp`.
    pub fn image(&self, default_registry: &str, image: &str, default_tag: &str) -> String {
        let registry = self
            .registry
            .as_deref()
            .unwrap_or(default_registry)
            .trim_end_matches('/');
        let tag = self.image_tag.as_deref().unwrap_or(default_tag);
        format!("{registry}/{image}:{tag}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_mode_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&ExposeMode::LoadBalancer).unwrap(),
            "\"loadBalancer\""
        );
        assert_eq!(
            serde_json::from_str::<ExposeMode>("\"none\"").unwrap(),
            ExposeMode::None
        );
        assert!(!ExposeMode::None.is_exposed());
        assert!(ExposeMode::Route.is_exposed());
    }

    #[test]
    fn state_tag_accepts_capitalized_values() {
        let state: InstanceState = serde_json::from_str("\"Pending\"").unwrap();
        assert!(state.is_pending());
        let state: InstanceState = serde_json::from_str("\"stopped\"").unwrap();
        assert!(!state.is_pending());
    }

    #[test]
    fn image_uses_overrides() {
        let registry = RegistryConfig {
            registry: Some("mirror.local/bd/".to_string()),
            image_tag: Some("2024.1.0".to_string()),
            pull_secrets: vec![],
        };
        assert_eq!(
            registry.image("docker.io/blackducksoftware", "blackduck-webapp", "latest"),
            "mirror.local/bd/blackduck-webapp:2024.1.0"
        );
        assert_eq!(
            RegistryConfig::default().image("docker.io/blackducksoftware", "blackduck-nginx", "1.0"),
            "docker.io/blackducksoftware/blackduck-nginx:1.0"
        );
    }

    #[test]
    fn external_database_defaults() {
        let db: ExternalDatabase = serde_json::from_str(r#"{"host":"pg.example.com"}"#).unwrap();
        assert_eq!(db, ExternalDatabase::new("pg.example.com"));
    }
}
