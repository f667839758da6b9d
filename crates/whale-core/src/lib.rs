pub mod cluster;
pub mod controller;
pub mod error;
pub mod fake;
pub mod rbac;
pub mod retry;
pub mod run;
pub mod spec;
pub mod wait;

pub use cluster::{ClusterApi, DeploymentHealth, DeploymentSummary};
pub use controller::{ControllerSettings, LifecycleController, RunReport};
pub use error::{Result, WhaleError};
pub use run::{ManagedResource, Phase, ResourceKind, ResourceNames, RunId, RunState};
pub use spec::{ServiceType, WorkloadSpec};

/// Namespace granted by the job's Role.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Label carrying the run identifier on every object a run creates.
pub const LABEL_RUN_ID: &str = "whale.dev/run-id";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const MANAGER_NAME: &str = "whale";

/// Label selector matching everything created by `run_id`.
pub fn run_selector(run_id: &RunId) -> String {
    format!("{}={},{}={}", LABEL_MANAGED_BY, MANAGER_NAME, LABEL_RUN_ID, run_id)
}

/// Label selector matching everything whale manages.
pub fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, MANAGER_NAME)
}
