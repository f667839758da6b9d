use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use tracing::{debug, instrument};
use whale_core::rbac::{Role, Verb};
use whale_core::{
    ClusterApi, DeploymentHealth, DeploymentSummary, LABEL_RUN_ID, ResourceKind, ResourceNames,
    Result, WhaleError, WorkloadSpec,
};

use crate::error::classify;
use crate::manifest;

/// Seconds the API server gives pods to terminate on delete.
pub const DELETE_GRACE_SECONDS: u32 = 5;

const FIELD_MANAGER: &str = "whale";

/// [`ClusterApi`] over a kube client. Every call is checked against the
/// job's Role first so an ungranted verb fails without a round trip.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    role: Role,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        KubeCluster {
            client,
            role: Role::job_role(),
        }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn delete_params() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        grace_period_seconds: Some(DELETE_GRACE_SECONDS),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    #[instrument(skip(self, spec), fields(name = %names.deployment))]
    async fn create_deployment(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<()> {
        self.role.check(Verb::Create, ResourceKind::Deployment)?;
        let object = manifest::deployment(names, spec);
        self.deployments(&names.namespace)
            .create(&post_params(), &object)
            .await
            .map_err(|e| classify(e, ResourceKind::Deployment, &names.deployment))?;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %names.service))]
    async fn create_service(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<()> {
        self.role.check(Verb::Create, ResourceKind::Service)?;
        let object = manifest::service(names, spec);
        self.services(&names.namespace)
            .create(&post_params(), &object)
            .await
            .map_err(|e| classify(e, ResourceKind::Service, &names.service))?;
        Ok(())
    }

    async fn service_name_free(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<bool> {
        self.role.check(Verb::Create, ResourceKind::Service)?;
        let params = PostParams {
            dry_run: true,
            ..post_params()
        };
        let object = manifest::service(names, spec);
        match self.services(&names.namespace).create(&params, &object).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, ResourceKind::Service, &names.service) {
                WhaleError::ResourceConflict { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<DeploymentHealth> {
        self.role.check(Verb::Get, ResourceKind::Deployment)?;
        let deployment = self
            .deployments(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, ResourceKind::Deployment, name))?;
        Ok(deployment_health(&deployment))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DeploymentSummary>> {
        self.role.check(Verb::List, ResourceKind::Deployment)?;
        let list = self
            .deployments(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| classify(e, ResourceKind::Deployment, selector))?;
        Ok(list.items.iter().map(deployment_summary).collect())
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        self.role.check(Verb::Delete, kind)?;
        let params = delete_params();
        match kind {
            ResourceKind::Deployment => self
                .deployments(namespace)
                .delete(name, &params)
                .await
                .map(|_| ())
                .map_err(|e| classify(e, kind, name))?,
            ResourceKind::Service => self
                .services(namespace)
                .delete(name, &params)
                .await
                .map(|_| ())
                .map_err(|e| classify(e, kind, name))?,
        }
        debug!(kind = %kind, name, "delete accepted");
        Ok(())
    }
}

/// Readiness of `deployment`. A `Progressing=False` condition with reason
/// `ProgressDeadlineExceeded` or any `ReplicaFailure=True` condition is
/// treated as terminal.
pub fn deployment_health(deployment: &Deployment) -> DeploymentHealth {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.as_ref();

    let failure = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions.iter().find_map(|c| {
                let reason = c.reason.as_deref().unwrap_or_default();
                let terminal = (c.type_ == "Progressing"
                    && c.status == "False"
                    && reason == "ProgressDeadlineExceeded")
                    || (c.type_ == "ReplicaFailure" && c.status == "True");
                terminal.then(|| match c.message.as_deref() {
                    Some(message) => format!("{}: {}", reason, message),
                    None => reason.to_string(),
                })
            })
        });

    DeploymentHealth {
        desired_replicas: desired,
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        generation: deployment.metadata.generation,
        observed_generation: status.and_then(|s| s.observed_generation),
        failure,
    }
}

pub fn deployment_summary(deployment: &Deployment) -> DeploymentSummary {
    let meta = &deployment.metadata;
    DeploymentSummary {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        run_id: meta
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_RUN_ID))
            .cloned(),
        health: deployment_health(deployment),
        created_at: meta.creation_timestamp.as_ref().and_then(to_chrono),
    }
}

fn to_chrono(time: &Time) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(time.0.subsec_nanosecond()).ok()?;
    DateTime::from_timestamp(time.0.as_second(), nanos)
}
