//! InstanceSpec: the declarative description of one deployed instance

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DesiredState, ExposeMode, ExternalDatabase, InstanceState, PvcSpec, RegistryConfig};
use crate::Error;

/// Default size tag when none is given
pub const DEFAULT_SIZE: &str = "small";

/// Claim that backs the bundled database's data directory
pub const DATABASE_CLAIM: &str = "postgres";

/// Maximum length of a DNS-1123 label
const MAX_DNS_LABEL_LEN: usize = 63;

/// Specification of one multi-tier instance.
///
/// Owned by the caller; the orchestrator only reads it.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Instance name, used as the application label
    pub name: String,

    /// Namespace the instance lives in (one instance per namespace)
    pub namespace: String,

    /// Size tag resolved into a flavor profile (small, medium, large, x-large)
    #[serde(default = "default_size")]
    pub size: String,

    /// Keep database and uploads on persistent volume claims
    #[serde(default = "default_true")]
    pub persistent_storage: bool,

    /// Volume claims to create when persistent storage is enabled
    #[serde(default)]
    pub pvc: Vec<PvcSpec>,

    /// Use an existing database instead of the bundled one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_database: Option<ExternalDatabase>,

    /// Whether the caller wants the instance running or stopped
    #[serde(default)]
    pub desired_state: DesiredState,

    /// Lifecycle state last recorded by the caller
    #[serde(default)]
    pub state: InstanceState,

    /// Image registry and pull secret settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Namespace of an existing instance whose database is cloned on first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_prototype: Option<String>,

    /// How the web tier is exposed outside the cluster
    #[serde(default)]
    pub expose_service: ExposeMode,

    /// Extra environment passed through to the instance config map verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environs: BTreeMap<String, String>,

    /// Add liveness probes to application containers
    #[serde(default)]
    pub liveness_probes: bool,
}

fn default_size() -> String {
    DEFAULT_SIZE.to_string()
}

fn default_true() -> bool {
    true
}

impl InstanceSpec {
    /// Create a spec with defaults for everything but name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            size: default_size(),
            persistent_storage: true,
            pvc: Vec::new(),
            external_database: None,
            desired_state: DesiredState::default(),
            state: InstanceState::default(),
            registry: RegistryConfig::default(),
            db_prototype: None,
            expose_service: ExposeMode::default(),
            environs: BTreeMap::new(),
            liveness_probes: false,
        }
    }

    /// True when the bundled database is deployed alongside the application
    pub fn uses_bundled_database(&self) -> bool {
        self.external_database.is_none()
    }

    /// Declared claim backing `component`'s data volume.
    ///
    /// `None` when persistent storage is off, even if claims are declared.
    pub fn persistent_claim(&self, component: &str) -> Option<&PvcSpec> {
        if !self.persistent_storage {
            return None;
        }
        self.pvc.iter().find(|c| c.name == component)
    }

    /// True when the bundled database keeps its data across restarts
    pub fn database_is_persistent(&self) -> bool {
        self.uses_bundled_database() && self.persistent_claim(DATABASE_CLAIM).is_some()
    }

    /// Clone source namespace, if any (empty strings count as absent)
    pub fn clone_source(&self) -> Option<&str> {
        self.db_prototype.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Check the instance for problems that must be fixed before touching the cluster
    pub fn validate(&self) -> Result<(), Error> {
        if !is_dns_label(&self.name) {
            return Err(Error::configuration_for_field(
                &self.name,
                "spec.name",
                format!("'{}' is not a valid DNS-1123 label", self.name),
            ));
        }
        if !is_dns_label(&self.namespace) {
            return Err(Error::configuration_for_field(
                &self.name,
                "spec.namespace",
                format!("'{}' is not a valid DNS-1123 label", self.namespace),
            ));
        }

        let mut seen = BTreeSet::new();
        for (i, claim) in self.pvc.iter().enumerate() {
            if !is_dns_label(&claim.name) {
                return Err(Error::configuration_for_field(
                    &self.name,
                    format!("spec.pvc[{i}].name"),
                    format!("'{}' is not a valid claim name", claim.name),
                ));
            }
            if !seen.insert(claim.name.as_str()) {
                return Err(Error::configuration_for_field(
                    &self.name,
                    format!("spec.pvc[{i}].name"),
                    format!("duplicate claim '{}'", claim.name),
                ));
            }
        }

        if self.persistent_storage
            && self.uses_bundled_database()
            && !self.pvc.is_empty()
            && self.persistent_claim(DATABASE_CLAIM).is_none()
        {
            return Err(Error::configuration_for_field(
                &self.name,
                "spec.pvc",
                format!(
                    "persistent storage declares claims but none named '{DATABASE_CLAIM}' for the bundled database"
                ),
            ));
        }

        if let Some(source) = self.clone_source() {
            if self.external_database.is_some() {
                return Err(Error::configuration_for_field(
                    &self.name,
                    "spec.dbPrototype",
                    "cloning is only supported for the bundled database",
                ));
            }
            if source == self.namespace {
                return Err(Error::configuration_for_field(
                    &self.name,
                    "spec.dbPrototype",
                    "an instance cannot clone its own database",
                ));
            }
        }

        if let Some(db) = &self.external_database {
            if db.host.trim().is_empty() {
                return Err(Error::configuration_for_field(
                    &self.name,
                    "spec.externalDatabase.host",
                    "external database host must not be empty",
                ));
            }
        }

        Ok(())
    }
}

/// Check a string against the DNS-1123 label rules used for names and namespaces
pub fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_DNS_LABEL_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> InstanceSpec {
        let mut spec = InstanceSpec::new("bd1", "ns1");
        spec.pvc = vec![
            PvcSpec::new("postgres", "150Gi"),
            PvcSpec::new("uploadcache-data", "100Gi"),
        ];
        spec
    }

    #[test]
    fn defaults_applied_when_deserializing_minimal_spec() {
        let spec: InstanceSpec =
            serde_json::from_str(r#"{"name":"bd1","namespace":"ns1"}"#).unwrap();

        assert_eq!(spec.size, "small");
        assert!(spec.persistent_storage);
        assert!(spec.pvc.is_empty());
        assert_eq!(spec.state, InstanceState::Pending);
        assert_eq!(spec.desired_state, DesiredState::Running);
        assert_eq!(spec.expose_service, ExposeMode::NodePort);
        assert!(spec.uses_bundled_database());
    }

    #[test]
    fn camel_case_fields_round_trip_from_yaml() {
        let yaml = r#"
name: bd1
namespace: ns1
size: medium
persistentStorage: false
dbPrototype: bd-source
exposeService: loadBalancer
state: running
registry:
  registry: registry.example.com/mirror
  pullSecrets: [regcred]
environs:
  HUB_WEBSERVER_PORT: "8443"
"#;
        let spec: InstanceSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.size, "medium");
        assert!(!spec.persistent_storage);
        assert_eq!(spec.clone_source(), Some("bd-source"));
        assert_eq!(spec.expose_service, ExposeMode::LoadBalancer);
        assert_eq!(spec.state, InstanceState::Running);
        assert_eq!(spec.registry.pull_secrets, vec!["regcred".to_string()]);
        assert_eq!(spec.environs["HUB_WEBSERVER_PORT"], "8443");
    }

    #[test]
    fn valid_spec_passes() {
        sample_spec().validate().unwrap();
    }

    #[test]
    fn rejects_bad_names() {
        for (name, namespace) in [("", "ns1"), ("Bd1", "ns1"), ("bd1", "ns_1"), ("bd1", "-ns")] {
            let spec = InstanceSpec::new(name, namespace);
            assert!(spec.validate().unwrap_err().is_configuration());
        }
    }

    #[test]
    fn rejects_duplicate_claims() {
        let mut spec = sample_spec();
        spec.pvc.push(PvcSpec::new("postgres", "10Gi"));
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate claim"));
    }

    #[test]
    fn rejects_clone_into_external_database() {
        let mut spec = sample_spec();
        spec.db_prototype = Some("other".to_string());
        spec.external_database = Some(ExternalDatabase::new("db.example.com"));
        assert!(spec.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn rejects_self_clone() {
        let mut spec = sample_spec();
        spec.db_prototype = Some("ns1".to_string());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn blank_prototype_means_no_clone() {
        let mut spec = sample_spec();
        spec.db_prototype = Some("  ".to_string());
        assert_eq!(spec.clone_source(), None);
        spec.validate().unwrap();
    }

    #[test]
    fn rejects_claims_without_database_claim() {
        let mut spec = InstanceSpec::new("bd1", "ns1");
        spec.pvc = vec![PvcSpec::new("blackduck-postgres", "150Gi")];

        let err = spec.validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("'postgres'"));

        spec.persistent_storage = false;
        spec.validate().unwrap();

        spec.persistent_storage = true;
        spec.external_database = Some(ExternalDatabase::new("db.example.com"));
        spec.validate().unwrap();
    }

    #[test]
    fn database_persistence_needs_storage_and_claim() {
        let mut spec = sample_spec();
        assert!(spec.database_is_persistent());
        assert_eq!(
            spec.persistent_claim("postgres").map(|c| c.size.as_str()),
            Some("150Gi")
        );

        spec.persistent_storage = false;
        assert!(!spec.database_is_persistent());
        assert!(spec.persistent_claim("postgres").is_none());

        let no_claims = InstanceSpec::new("bd1", "ns1");
        assert!(no_claims.persistent_storage);
        assert!(!no_claims.database_is_persistent());
    }

    #[test]
    fn dns_label_limits() {
        assert!(is_dns_label("a"));
        assert!(is_dns_label(&"a".repeat(63)));
        assert!(!is_dns_label(&"a".repeat(64)));
        assert!(!is_dns_label("ends-"));
    }
}
