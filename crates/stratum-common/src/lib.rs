//! Common types for stratum: instance specs, flavors, errors, polling and kube helpers

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod flavor;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use config::OrchestratorConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the operator runs in by default
pub const STRATUM_SYSTEM_NAMESPACE: &str = "stratum-system";

/// Field manager name for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "stratum";

/// Label key carrying the owning instance name
pub const INSTANCE_LABEL_KEY: &str = "stratum.io/instance";

/// Label key carrying the component (webserver, scan, postgres, ...)
pub const COMPONENT_LABEL_KEY: &str = "stratum.io/component";

/// Label marking resources managed by stratum
pub const MANAGED_BY_LABEL: (&str, &str) = ("app.kubernetes.io/managed-by", "stratum");
