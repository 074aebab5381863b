//! Shared test fixtures

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use stratum_common::crd::InstanceSpec;
use stratum_common::Error;

use crate::applier::BatchApplier;
use crate::batch::{BatchKind, DeploymentBatch};
use crate::credentials::{
    DbPasswords, ADMIN_PASSWORD_KEY, POSTGRES_PASSWORD_KEY, USER_PASSWORD_KEY,
};

/// Minimal valid spec with defaults (small, persistent storage, pending, node port)
pub fn sample_spec(name: &str, namespace: &str) -> InstanceSpec {
    InstanceSpec::new(name, namespace)
}

/// Operator credentials secret contents
pub fn password_data() -> BTreeMap<String, String> {
    BTreeMap::from([
        (ADMIN_PASSWORD_KEY.to_string(), "admin-pw".to_string()),
        (USER_PASSWORD_KEY.to_string(), "user-pw".to_string()),
        (POSTGRES_PASSWORD_KEY.to_string(), "postgres-pw".to_string()),
    ])
}

pub fn sample_passwords() -> DbPasswords {
    DbPasswords {
        admin: "admin-pw".to_string(),
        user: "user-pw".to_string(),
        postgres: "postgres-pw".to_string(),
    }
}

/// Direction of a recorded applier call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Apply,
    Remove,
}

/// Applier double that records every call in order.
///
/// Lets tests assert on the sequence of batches without coupling to
/// mock call parameters.
#[derive(Clone, Default)]
pub struct RecordingApplier {
    calls: Arc<Mutex<Vec<(Action, BatchKind)>>>,
    fail_on: Option<(Action, BatchKind)>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail (after recording) when `action` is performed on `kind`
    pub fn failing_on(action: Action, kind: BatchKind) -> Self {
        Self {
            fail_on: Some((action, kind)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(Action, BatchKind)> {
        self.calls
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }

    fn record(&self, action: Action, batch: &DeploymentBatch) -> Result<(), Error> {
        self.calls
            .lock()
            .expect("mutex should not be poisoned")
            .push((action, batch.kind));
        if self.fail_on == Some((action, batch.kind)) {
            return Err(Error::platform(
                format!("{action:?} {}", batch.kind),
                "injected failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchApplier for RecordingApplier {
    async fn apply(&self, batch: &DeploymentBatch) -> Result<(), Error> {
        self.record(Action::Apply, batch)
    }

    async fn remove(&self, batch: &DeploymentBatch) -> Result<(), Error> {
        self.record(Action::Remove, batch)
    }
}
