//! Instance specification types

mod instance;
mod types;

pub use instance::{is_dns_label, InstanceSpec, DATABASE_CLAIM, DEFAULT_SIZE};
pub use types::{
    DesiredState, ExposeMode, ExternalDatabase, InstanceState, PvcSpec, RegistryConfig,
    DEFAULT_DATABASE_PORT,
};
