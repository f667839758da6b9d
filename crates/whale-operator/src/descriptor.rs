//! Loads a [`WorkloadSpec`] from a multi-document YAML file holding a
//! Deployment and, optionally, a Service.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde::Deserialize;
use tracing::warn;
use whale_core::{LABEL_MANAGED_BY, Result, ServiceType, WhaleError, WorkloadSpec};

use crate::manifest::LABEL_APP;

pub fn load(path: &Path) -> Result<WorkloadSpec> {
    let text = fs::read_to_string(path).map_err(|e| {
        WhaleError::descriptor(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse(&text)
}

/// Only the first Deployment and first Service are used; other documents
/// are skipped with a warning.
pub fn parse(text: &str) -> Result<WorkloadSpec> {
    let mut deployment: Option<Deployment> = None;
    let mut service: Option<Service> = None;

    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| WhaleError::descriptor(format!("invalid YAML: {}", e)))?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "Deployment" if deployment.is_none() => {
                deployment = Some(serde_yaml::from_value(value).map_err(|e| {
                    WhaleError::descriptor(format!("invalid Deployment: {}", e))
                })?);
            }
            "Service" if service.is_none() => {
                service = Some(serde_yaml::from_value(value).map_err(|e| {
                    WhaleError::descriptor(format!("invalid Service: {}", e))
                })?);
            }
            other => warn!(kind = other, "skipping descriptor document"),
        }
    }

    let deployment =
        deployment.ok_or_else(|| WhaleError::descriptor("no Deployment document found"))?;
    to_spec(&deployment, service.as_ref())
}

fn to_spec(deployment: &Deployment, service: Option<&Service>) -> Result<WorkloadSpec> {
    let name = deployment
        .metadata
        .name
        .clone()
        .ok_or_else(|| WhaleError::descriptor("Deployment has no metadata.name"))?;
    let dspec = deployment
        .spec
        .as_ref()
        .ok_or_else(|| WhaleError::descriptor("Deployment has no spec"))?;
    let container = dspec
        .template
        .spec
        .as_ref()
        .and_then(|p| p.containers.first())
        .ok_or_else(|| WhaleError::descriptor("Deployment has no containers"))?;
    let image = container
        .image
        .clone()
        .ok_or_else(|| WhaleError::descriptor(format!("container '{}' has no image", container.name)))?;

    let service_spec = service.and_then(|s| s.spec.as_ref());
    let service_port = service_spec
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first());

    let container_port = container
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .map(|p| p.container_port)
        .or_else(|| {
            service_port.and_then(|p| match &p.target_port {
                Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(port)) => {
                    Some(*port)
                }
                _ => None,
            })
        })
        .unwrap_or(80);

    let service_type = match service_spec.and_then(|s| s.type_.as_deref()) {
        Some(raw) => raw.parse::<ServiceType>()?,
        None => ServiceType::ClusterIP,
    };

    // run-specific labels are applied by whale itself
    let labels: BTreeMap<String, String> = deployment
        .metadata
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|(k, _)| k != LABEL_APP && k != LABEL_MANAGED_BY && !k.starts_with("whale.dev/"))
        .collect();

    Ok(WorkloadSpec {
        name,
        image,
        replicas: dspec.replicas.unwrap_or(1),
        container_port,
        service_port: service_port.map(|p| p.port),
        service_type,
        labels,
    })
}
