//! Deployment and Service objects for a run.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use whale_core::{LABEL_MANAGED_BY, LABEL_RUN_ID, MANAGER_NAME, ResourceNames, WorkloadSpec};

pub const LABEL_APP: &str = "app";

/// Records which workload spec name a run was started from.
pub const ANNOTATION_WORKLOAD: &str = "whale.dev/workload";

/// Labels identifying the pods of one run. Used both as the Deployment
/// selector and as the Service selector.
pub fn selector_labels(names: &ResourceNames) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), names.deployment.clone()),
        (LABEL_RUN_ID.to_string(), names.run_id.to_string()),
    ])
}

fn object_labels(names: &ResourceNames, spec: &WorkloadSpec) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();
    labels.extend(selector_labels(names));
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels
}

fn metadata(name: &str, names: &ResourceNames, spec: &WorkloadSpec) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(names.namespace.clone()),
        labels: Some(object_labels(names, spec)),
        annotations: Some(BTreeMap::from([(
            ANNOTATION_WORKLOAD.to_string(),
            spec.name.clone(),
        )])),
        ..Default::default()
    }
}

pub fn deployment(names: &ResourceNames, spec: &WorkloadSpec) -> Deployment {
    Deployment {
        metadata: metadata(&names.deployment, names, spec),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(names)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(object_labels(names, spec)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: spec.name.clone(),
                        image: Some(spec.image.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: spec.container_port,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service(names: &ResourceNames, spec: &WorkloadSpec) -> Service {
    Service {
        metadata: metadata(&names.service, names, spec),
        spec: Some(ServiceSpec {
            type_: Some(spec.service_type.as_str().to_string()),
            selector: Some(selector_labels(names)),
            ports: Some(vec![ServicePort {
                port: spec.service_port(),
                target_port: Some(IntOrString::Int(spec.container_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
