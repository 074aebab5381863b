//! Flavor resolution: size tag to resource profile
//!
//! A flavor fixes replica counts and CPU/memory for every tier of an
//! instance. Resolution is pure and happens on every operation, so editing an
//! instance's size and re-running `start` picks up the new profile.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Supported instance sizes
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Size {
    /// Evaluation and small teams
    Small,
    /// Default production size
    Medium,
    /// Heavy scan throughput
    Large,
    /// Largest supported deployment
    XLarge,
}

impl Size {
    /// Every size, smallest first
    pub const ALL: [Size; 4] = [Size::Small, Size::Medium, Size::Large, Size::XLarge];

    /// Canonical tag for this size
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::XLarge => "x-large",
        }
    }
}

impl FromStr for Size {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "x-large" => Ok(Self::XLarge),
            _ => Err(Error::configuration(format!(
                "invalid size '{s}', expected one of: small, medium, large, x-large"
            ))),
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replicas and resources for one tier
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TierResources {
    /// Number of pod replicas
    pub replicas: i32,
    /// CPU request (Kubernetes quantity, e.g. "1" or "500m")
    pub cpu: String,
    /// Memory request and limit (Kubernetes quantity, e.g. "2560Mi")
    pub memory: String,
}

impl TierResources {
    fn new(replicas: i32, cpu: &str, memory: &str) -> Self {
        Self {
            replicas,
            cpu: cpu.to_string(),
            memory: memory.to_string(),
        }
    }
}

/// Resolved resource sizing for one instance
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlavorProfile {
    /// Size this profile was resolved from
    pub size: Size,
    /// Web tier (webapp + webserver)
    pub webserver: TierResources,
    /// Scan/processing tier
    pub scan: TierResources,
    /// Background job runners
    pub jobrunner: TierResources,
    /// Sidecars (registration, cache)
    pub sidecar: TierResources,
    /// Bundled database
    pub postgres: TierResources,
}

/// Table of flavor profiles, passed to the orchestrator at construction
#[derive(Clone, Debug, PartialEq)]
pub struct FlavorCatalog {
    profiles: BTreeMap<Size, FlavorProfile>,
}

impl Default for FlavorCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FlavorCatalog {
    /// The stock profiles for small through x-large
    pub fn builtin() -> Self {
        let profiles = Size::ALL
            .into_iter()
            .map(|size| (size, builtin_profile(size)))
            .collect();
        Self { profiles }
    }

    /// Replace the profile for one size
    pub fn with_profile(mut self, profile: FlavorProfile) -> Self {
        self.profiles.insert(profile.size, profile);
        self
    }

    /// Resolve a size tag into its profile.
    ///
    /// Fails with a configuration error for unknown tags.
    pub fn resolve(&self, tag: &str) -> Result<FlavorProfile, Error> {
        let size: Size = tag.parse()?;
        self.profiles
            .get(&size)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("no flavor profile registered for {size}")))
    }
}

/// Resolve a size tag against the builtin catalog
pub fn resolve_flavor(tag: &str) -> Result<FlavorProfile, Error> {
    FlavorCatalog::builtin().resolve(tag)
}

fn builtin_profile(size: Size) -> FlavorProfile {
    match size {
        Size::Small => FlavorProfile {
            size,
            webserver: TierResources::new(1, "1", "2560Mi"),
            scan: TierResources::new(1, "1", "2560Mi"),
            jobrunner: TierResources::new(1, "1", "4608Mi"),
            sidecar: TierResources::new(1, "250m", "640Mi"),
            postgres: TierResources::new(1, "1", "3072Mi"),
        },
        Size::Medium => FlavorProfile {
            size,
            webserver: TierResources::new(1, "2", "5120Mi"),
            scan: TierResources::new(2, "1", "5120Mi"),
            jobrunner: TierResources::new(4, "1", "7168Mi"),
            sidecar: TierResources::new(1, "500m", "1024Mi"),
            postgres: TierResources::new(1, "2", "8192Mi"),
        },
        Size::Large => FlavorProfile {
            size,
            webserver: TierResources::new(1, "2", "10240Mi"),
            scan: TierResources::new(3, "1", "9728Mi"),
            jobrunner: TierResources::new(6, "1", "13824Mi"),
            sidecar: TierResources::new(1, "500m", "1024Mi"),
            postgres: TierResources::new(1, "2", "12288Mi"),
        },
        Size::XLarge => FlavorProfile {
            size,
            webserver: TierResources::new(1, "4", "20480Mi"),
            scan: TierResources::new(5, "1", "9728Mi"),
            jobrunner: TierResources::new(10, "1", "13824Mi"),
            sidecar: TierResources::new(1, "1", "2048Mi"),
            postgres: TierResources::new(1, "4", "16384Mi"),
        },
    }
}
