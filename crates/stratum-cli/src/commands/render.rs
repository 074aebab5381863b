//! Render command
//!
//! Usage: stratum render -f bd1.yaml
//!
//! Prints every resource `create` would apply as a multi-document YAML
//! stream, without contacting a cluster. Pipe it to `kubectl apply -f -` to
//! deploy by hand; the `db-creds` secret must then be filled in separately.

use std::path::PathBuf;

use clap::Args;

use stratum_common::flavor::FlavorCatalog;
use stratum_instance::{render_instance, DeploymentBatch, ManifestBuilder};

use super::Context;
use crate::config::{load_orchestrator_config, load_spec};
use crate::Result;

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Instance spec file (YAML or JSON)
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,
}

pub fn run(args: RenderArgs, ctx: &Context) -> Result<()> {
    let spec = load_spec(&args.file)?;
    let config = load_orchestrator_config(ctx.config.as_deref())?;
    let flavor = FlavorCatalog::builtin().resolve(&spec.size)?;

    let batches = render_instance(&ManifestBuilder::new(&config), &spec, &flavor)?;
    print!("{}", to_yaml_documents(&batches)?);
    Ok(())
}

/// One YAML document per manifest, in apply order within each batch
fn to_yaml_documents(batches: &[DeploymentBatch]) -> Result<String> {
    let mut out = String::new();
    for batch in batches {
        for manifest in batch.apply_order() {
            let mut body = manifest.body.clone();
            if !manifest.cluster_scoped {
                if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.insert("namespace".to_string(), batch.namespace.clone().into());
                }
            }
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&body)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_common::crd::InstanceSpec;
    use stratum_common::OrchestratorConfig;

    fn rendered(spec: &InstanceSpec) -> String {
        let config = OrchestratorConfig::default();
        let flavor = FlavorCatalog::builtin().resolve(&spec.size).unwrap();
        let batches = render_instance(&ManifestBuilder::new(&config), spec, &flavor).unwrap();
        to_yaml_documents(&batches).unwrap()
    }

    #[test]
    fn every_manifest_is_its_own_document() {
        let out = rendered(&InstanceSpec::new("bd1", "ns1"));

        let docs: Vec<serde_yaml::Value> = out
            .split("---\n")
            .filter(|d| !d.trim().is_empty())
            .map(|d| serde_yaml::from_str(d).unwrap())
            .collect();
        assert!(docs.iter().all(|d| d["apiVersion"].is_string() && d["kind"].is_string()));
        assert!(docs
            .iter()
            .any(|d| d["kind"] == "Deployment" && d["metadata"]["name"] == "webserver"));
    }

    #[test]
    fn namespaced_manifests_carry_the_namespace() {
        let out = rendered(&InstanceSpec::new("bd1", "ns1"));

        for doc in out.split("---\n").filter(|d| !d.trim().is_empty()) {
            let value: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
            if value["kind"] == "ClusterRoleBinding" {
                assert!(value["metadata"].get("namespace").is_none());
            } else {
                assert_eq!(value["metadata"]["namespace"], "ns1");
            }
        }
    }
}
