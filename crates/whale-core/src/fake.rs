//! In-memory [`ClusterApi`] used by tests and `whale run --dry-run`.
//!
//! Deployments converge on a tokio clock, so tests running with paused time
//! see readiness at exactly the configured delay. Failures are injected per
//! verb and resource kind, either before the call takes effect or after it
//! (a lost response).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::cluster::{ClusterApi, DeploymentHealth, DeploymentSummary};
use crate::error::{Result, WhaleError};
use crate::rbac::{Role, Verb};
use crate::run::{ResourceKind, ResourceNames};
use crate::spec::WorkloadSpec;
use crate::{LABEL_MANAGED_BY, LABEL_RUN_ID, MANAGER_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Ready replicas reach the desired count after this long
    After(Duration),
    Never,
    /// Reports a terminal failure condition after this long
    FailAfter(Duration),
}

#[derive(Debug, Clone)]
struct FakeObject {
    labels: BTreeMap<String, String>,
    replicas: i32,
    created: Instant,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    deployments: BTreeMap<(String, String), FakeObject>,
    services: BTreeMap<(String, String), FakeObject>,
    calls: HashMap<(Verb, ResourceKind), usize>,
    injected: HashMap<(Verb, ResourceKind), VecDeque<WhaleError>>,
    lost_responses: HashMap<(Verb, ResourceKind), usize>,
}

pub struct FakeCluster {
    role: Role,
    readiness: Readiness,
    inner: Mutex<Inner>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        FakeCluster::new(Readiness::After(Duration::ZERO))
    }
}

impl FakeCluster {
    pub fn new(readiness: Readiness) -> Self {
        FakeCluster {
            role: Role::job_role(),
            readiness,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Queue an error to be returned by the next call of `verb` on `kind`.
    pub fn inject(&self, verb: Verb, kind: ResourceKind, err: WhaleError) {
        self.lock()
            .injected
            .entry((verb, kind))
            .or_default()
            .push_back(err);
    }

    /// Let the next call of `verb` on `kind` take effect but answer with
    /// `ApiUnavailable`, as if the response never arrived.
    pub fn lose_response(&self, verb: Verb, kind: ResourceKind) {
        *self.lock().lost_responses.entry((verb, kind)).or_default() += 1;
    }

    /// Create an object outside of any run, e.g. to provoke a conflict.
    pub fn insert_foreign(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let object = FakeObject {
            labels: BTreeMap::new(),
            replicas: 1,
            created: Instant::now(),
            created_at: Utc::now(),
        };
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.lock();
        match kind {
            ResourceKind::Deployment => inner.deployments.insert(key, object),
            ResourceKind::Service => inner.services.insert(key, object),
        };
    }

    pub fn calls(&self, verb: Verb, kind: ResourceKind) -> usize {
        self.lock().calls.get(&(verb, kind)).copied().unwrap_or(0)
    }

    pub fn exists(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        let key = (namespace.to_string(), name.to_string());
        let inner = self.lock();
        match kind {
            ResourceKind::Deployment => inner.deployments.contains_key(&key),
            ResourceKind::Service => inner.services.contains_key(&key),
        }
    }

    /// Every object labelled with `run_id`, as `(kind, name)`.
    pub fn tagged_with(&self, run_id: &str) -> Vec<(ResourceKind, String)> {
        let inner = self.lock();
        let tagged = |objects: &BTreeMap<(String, String), FakeObject>, kind| {
            objects
                .iter()
                .filter(|(_, o)| o.labels.get(LABEL_RUN_ID).map(String::as_str) == Some(run_id))
                .map(|((_, name), _)| (kind, name.clone()))
                .collect::<Vec<_>>()
        };
        let mut out = tagged(&inner.deployments, ResourceKind::Deployment);
        out.extend(tagged(&inner.services, ResourceKind::Service));
        out
    }

    pub fn object_count(&self) -> usize {
        let inner = self.lock();
        inner.deployments.len() + inner.services.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Call accounting, role check, then injected failures.
    fn enter(&self, verb: Verb, kind: ResourceKind) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        *inner.calls.entry((verb, kind)).or_default() += 1;
        self.role.check(verb, kind)?;
        if let Some(err) = inner.injected.get_mut(&(verb, kind)).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(inner)
    }

    fn answer(inner: &mut Inner, verb: Verb, kind: ResourceKind) -> Result<()> {
        match inner.lost_responses.get_mut(&(verb, kind)) {
            Some(pending) if *pending > 0 => {
                *pending -= 1;
                Err(WhaleError::ApiUnavailable(format!(
                    "{} {}: response lost",
                    verb, kind
                )))
            }
            _ => Ok(()),
        }
    }

    fn labels_for(names: &ResourceNames, spec: &WorkloadSpec) -> BTreeMap<String, String> {
        let mut labels = spec.labels.clone();
        labels.insert(LABEL_RUN_ID.to_string(), names.run_id.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
        labels
    }

    fn health_of(&self, object: &FakeObject) -> DeploymentHealth {
        let elapsed = object.created.elapsed();
        let (ready, failure) = match self.readiness {
            Readiness::After(delay) if elapsed >= delay => (object.replicas, None),
            Readiness::FailAfter(delay) if elapsed >= delay => (
                0,
                Some("ProgressDeadlineExceeded: ReplicaSet has timed out progressing".to_string()),
            ),
            _ => (0, None),
        };
        DeploymentHealth {
            desired_replicas: object.replicas,
            ready_replicas: ready,
            generation: Some(1),
            observed_generation: Some(1),
            failure,
        }
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term.trim()),
        })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_deployment(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<()> {
        let mut inner = self.enter(Verb::Create, ResourceKind::Deployment)?;
        let key = (names.namespace.clone(), names.deployment.clone());
        if inner.deployments.contains_key(&key) {
            return Err(WhaleError::ResourceConflict {
                kind: ResourceKind::Deployment,
                name: names.deployment.clone(),
            });
        }
        let object = FakeObject {
            labels: Self::labels_for(names, spec),
            replicas: spec.replicas,
            created: Instant::now(),
            created_at: Utc::now(),
        };
        inner.deployments.insert(key, object);
        Self::answer(&mut inner, Verb::Create, ResourceKind::Deployment)
    }

    async fn create_service(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<()> {
        let mut inner = self.enter(Verb::Create, ResourceKind::Service)?;
        let key = (names.namespace.clone(), names.service.clone());
        if inner.services.contains_key(&key) {
            return Err(WhaleError::ResourceConflict {
                kind: ResourceKind::Service,
                name: names.service.clone(),
            });
        }
        let object = FakeObject {
            labels: Self::labels_for(names, spec),
            replicas: 0,
            created: Instant::now(),
            created_at: Utc::now(),
        };
        inner.services.insert(key, object);
        Self::answer(&mut inner, Verb::Create, ResourceKind::Service)
    }

    // A dry run counts as a create call but never consumes injected failures.
    async fn service_name_free(&self, names: &ResourceNames, _spec: &WorkloadSpec) -> Result<bool> {
        let mut inner = self.lock();
        *inner.calls.entry((Verb::Create, ResourceKind::Service)).or_default() += 1;
        self.role.check(Verb::Create, ResourceKind::Service)?;
        let key = (names.namespace.clone(), names.service.clone());
        Ok(!inner.services.contains_key(&key))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<DeploymentHealth> {
        let inner = self.enter(Verb::Get, ResourceKind::Deployment)?;
        let key = (namespace.to_string(), name.to_string());
        match inner.deployments.get(&key) {
            Some(object) => Ok(self.health_of(object)),
            None => Err(WhaleError::NotFound {
                kind: ResourceKind::Deployment,
                name: name.to_string(),
            }),
        }
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DeploymentSummary>> {
        let inner = self.enter(Verb::List, ResourceKind::Deployment)?;
        Ok(inner
            .deployments
            .iter()
            .filter(|((ns, _), o)| ns == namespace && matches_selector(&o.labels, selector))
            .map(|((ns, name), o)| DeploymentSummary {
                name: name.clone(),
                namespace: ns.clone(),
                run_id: o.labels.get(LABEL_RUN_ID).cloned(),
                health: self.health_of(o),
                created_at: Some(o.created_at),
            })
            .collect())
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.enter(Verb::Delete, kind)?;
        let key = (namespace.to_string(), name.to_string());
        let removed = match kind {
            ResourceKind::Deployment => inner.deployments.remove(&key),
            ResourceKind::Service => inner.services.remove(&key),
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(WhaleError::NotFound {
                kind,
                name: name.to_string(),
            }),
        }
    }
}
