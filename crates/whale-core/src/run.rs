use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WhaleError};

/// Number of run id characters appended to resource names.
pub const NAME_SUFFIX_LEN: usize = 8;

const SERVICE_SUFFIX: &str = "-svc";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        RunId(Uuid::new_v4().simple().to_string())
    }

    /// Parse a run id given on the command line. Must be usable as a label value.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() < NAME_SUFFIX_LEN || raw.len() > 63 {
            return Err(WhaleError::validation(format!(
                "run id '{}' must be between {} and 63 characters",
                raw, NAME_SUFFIX_LEN
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(WhaleError::validation(format!(
                "run id '{}' may only contain lowercase letters and digits",
                raw
            )));
        }
        Ok(RunId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..NAME_SUFFIX_LEN.min(self.0.len())]
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Deployment,
    Service,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Deployment => f.write_str("Deployment"),
            ResourceKind::Service => f.write_str("Service"),
        }
    }
}

/// Names of the objects a single run owns, qualified by the run id so
/// concurrent runs in one namespace never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub namespace: String,
    pub deployment: String,
    pub service: String,
    pub run_id: RunId,
}

impl ResourceNames {
    pub fn for_run(base: &str, run_id: &RunId, namespace: &str) -> Self {
        let deployment = format!("{}-{}", base, run_id.short());
        ResourceNames {
            namespace: namespace.to_string(),
            service: service_name_for(&deployment),
            deployment,
            run_id: run_id.clone(),
        }
    }

    pub fn name_of(&self, kind: ResourceKind) -> &str {
        match kind {
            ResourceKind::Deployment => &self.deployment,
            ResourceKind::Service => &self.service,
        }
    }
}

/// The Service paired with a Deployment. Services cannot be listed under the
/// job's Role, so sweeping derives them from the Deployment name.
pub fn service_name_for(deployment: &str) -> String {
    format!("{}{}", deployment, SERVICE_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub run_id: RunId,
}

impl fmt::Display for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}/{}'", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Creating,
    WaitingReady,
    Ready,
    Failed,
    Cleaning,
    Done,
}

impl Phase {
    /// Every path ends in `Cleaning -> Done`; `Done` is only reachable from `Cleaning`.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Creating, WaitingReady)
                | (Creating, Failed)
                | (Creating, Cleaning)
                | (WaitingReady, Ready)
                | (WaitingReady, Failed)
                | (WaitingReady, Cleaning)
                | (Ready, Failed)
                | (Ready, Cleaning)
                | (Failed, Cleaning)
                | (Cleaning, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Done
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Creating => "Creating",
            Phase::WaitingReady => "WaitingReady",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
            Phase::Cleaning => "Cleaning",
            Phase::Done => "Done",
        };
        f.write_str(s)
    }
}

/// In-memory state of one run. Not persisted; the run id label is what
/// survives a crash.
#[derive(Debug, Clone)]
pub struct RunState {
    run_id: RunId,
    phase: Phase,
    created: Vec<ManagedResource>,
}

impl RunState {
    pub fn new(run_id: RunId) -> Self {
        RunState {
            run_id,
            phase: Phase::Creating,
            created: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(WhaleError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    pub fn record(&mut self, resource: ManagedResource) {
        let already = self
            .created
            .iter()
            .any(|r| r.kind == resource.kind && r.name == resource.name);
        if !already {
            self.created.push(resource);
        }
    }

    pub fn forget(&mut self, kind: ResourceKind, name: &str) {
        self.created.retain(|r| !(r.kind == kind && r.name == name));
    }

    /// Resources still owned by this run, in creation order.
    pub fn created(&self) -> &[ManagedResource] {
        &self.created
    }
}
