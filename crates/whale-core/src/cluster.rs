use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::run::{ResourceKind, ResourceNames};
use crate::spec::WorkloadSpec;

/// Readiness view of a Deployment, decoupled from the API object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentHealth {
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub generation: Option<i64>,
    pub observed_generation: Option<i64>,
    /// Set when the Deployment reports a condition it will not recover from.
    pub failure: Option<String>,
}

impl DeploymentHealth {
    /// Ready once every wanted replica is ready and the controller has
    /// observed the latest generation of the object.
    pub fn is_ready(&self, wanted: i32) -> bool {
        let observed = match (self.generation, self.observed_generation) {
            (Some(generation), Some(observed)) => observed >= generation,
            (None, _) => true,
            (Some(_), None) => false,
        };
        self.ready_replicas == wanted && observed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSummary {
    pub name: String,
    pub namespace: String,
    pub run_id: Option<String>,
    pub health: DeploymentHealth,
    pub created_at: Option<DateTime<Utc>>,
}

/// The cluster operations a run may perform. Implementations must stay within
/// the verbs of [`crate::rbac::Role::job_role`] and map API failures onto
/// [`crate::WhaleError`]: 404 to `NotFound`, 409 to `ResourceConflict`,
/// 401/403 to `PermissionDenied`, 429/5xx and transport errors to
/// `ApiUnavailable`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_deployment(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<()>;

    async fn create_service(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<()>;

    /// Whether `names.service` is still unclaimed, answered without reading
    /// Services (a dry-run create against the API server).
    async fn service_name_free(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<bool>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<DeploymentHealth>;

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DeploymentSummary>>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(ready: i32, generation: Option<i64>, observed: Option<i64>) -> DeploymentHealth {
        DeploymentHealth {
            desired_replicas: 3,
            ready_replicas: ready,
            generation,
            observed_generation: observed,
            failure: None,
        }
    }

    #[test]
    fn ready_needs_all_replicas() {
        assert!(health(3, Some(1), Some(1)).is_ready(3));
        assert!(!health(2, Some(1), Some(1)).is_ready(3));
    }

    #[test]
    fn ready_needs_observed_generation() {
        assert!(!health(3, Some(2), Some(1)).is_ready(3));
        assert!(!health(3, Some(2), None).is_ready(3));
        assert!(health(3, None, None).is_ready(3));
    }
}
