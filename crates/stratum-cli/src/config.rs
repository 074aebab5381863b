//! Loading instance specs and orchestrator configuration from disk.
//!
//! Files ending in `.json` are parsed as JSON; everything else as YAML.

use std::path::Path;

use serde::de::DeserializeOwned;

use stratum_common::crd::InstanceSpec;
use stratum_common::OrchestratorConfig;

use crate::{Error, Result};

/// Parse a YAML or JSON document
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::invalid_file(path, e.to_string()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(serde_json::from_str(&contents)?)
    } else {
        Ok(serde_yaml::from_str(&contents)?)
    }
}

/// Load and validate an instance spec
pub fn load_spec(path: &Path) -> Result<InstanceSpec> {
    let spec: InstanceSpec = load_document(path)?;
    spec.validate()?;
    Ok(spec)
}

/// Load the orchestrator configuration, or defaults when no file is given
pub fn load_orchestrator_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => load_document(path)?,
        None => OrchestratorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use stratum_common::crd::ExposeMode;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_yaml_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "bd1.yaml",
            "name: bd1\nnamespace: ns1\nsize: Medium\nexposeService: loadBalancer\n",
        );

        let spec = load_spec(&path).unwrap();
        assert_eq!(spec.name, "bd1");
        assert_eq!(spec.size, "Medium");
        assert_eq!(spec.expose_service, ExposeMode::LoadBalancer);
        assert!(spec.persistent_storage);
    }

    #[test]
    fn loads_json_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "bd1.json",
            r#"{"name": "bd1", "namespace": "ns1", "persistentStorage": false}"#,
        );

        let spec = load_spec(&path).unwrap();
        assert!(!spec.persistent_storage);
    }

    #[test]
    fn invalid_spec_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bad.yaml", "name: bd1\nnamespace: Bad_Namespace\n");

        let err = load_spec(&path).unwrap_err();
        assert!(matches!(err, Error::Stratum(e) if e.is_configuration()));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_spec(Path::new("/nonexistent/bd1.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/bd1.yaml"));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "config.yaml",
            "operatorNamespace: ops\npolling:\n  podsRunning:\n    maxAttempts: 5\n    interval: 2\n",
        );

        let config = load_orchestrator_config(Some(&path)).unwrap();
        assert_eq!(config.operator_namespace, "ops");
        assert_eq!(config.polling.pods_running.max_attempts, 5);
        assert_eq!(config.polling.pods_running.interval, Duration::from_secs(2));
        assert_eq!(config.credentials_secret, OrchestratorConfig::default().credentials_secret);
    }

    #[test]
    fn no_config_file_means_defaults() {
        assert_eq!(load_orchestrator_config(None).unwrap(), OrchestratorConfig::default());
    }
}
