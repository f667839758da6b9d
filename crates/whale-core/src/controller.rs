//! The lifecycle controller: create a Deployment and its Service, wait for
//! readiness, and always tear both down again.
//!
//! ```text
//! Creating -> WaitingReady -> Ready -> Cleaning -> Done
//!     \            \            \          ^
//!      `------------`------------`-> Failed'
//! ```
//!
//! Every path that created anything goes through `Cleaning`. [`LifecycleController::run`]
//! drives the whole sequence and funnels every exit (error, timeout,
//! cancellation) into [`LifecycleController::cleanup`]. If the controller is
//! dropped with resources still recorded, deletion is handed to a background
//! task on the current runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, DeploymentSummary};
use crate::error::{Result, WhaleError};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::run::{
    ManagedResource, Phase, ResourceKind, ResourceNames, RunId, RunState, service_name_for,
};
use crate::spec::WorkloadSpec;
use crate::wait::{PollOutcome, poll_until, sleep_or_cancel};
use crate::{DEFAULT_NAMESPACE, managed_selector, run_selector};

/// Upper bound on the label lookup that decides whether an interrupted or
/// conflicting create belongs to this run.
const OWNERSHIP_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub namespace: String,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
    /// How long the workload stays up once ready
    pub hold: Duration,
    pub retry: RetryConfig,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            namespace: DEFAULT_NAMESPACE.to_string(),
            poll_interval: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(300),
            hold: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

/// Result of a full run. The primary outcome and cleanup are reported
/// separately so a cleanup failure never hides why the run failed.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Option<RunId>,
    pub phase: Option<Phase>,
    pub outcome: Result<()>,
    pub cleanup: Result<()>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok() && self.cleanup.is_ok()
    }

    /// The primary error if there was one, otherwise the cleanup error.
    pub fn into_result(self) -> Result<Option<RunId>> {
        self.outcome?;
        self.cleanup?;
        Ok(self.run_id)
    }
}

struct ActiveRun {
    spec: WorkloadSpec,
    names: ResourceNames,
    state: RunState,
}

pub struct LifecycleController {
    cluster: Arc<dyn ClusterApi>,
    settings: ControllerSettings,
    cancel: CancellationToken,
    run: Option<ActiveRun>,
    phase_tx: watch::Sender<Option<Phase>>,
}

impl LifecycleController {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        settings: ControllerSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (phase_tx, _) = watch::channel(None);
        LifecycleController {
            cluster,
            settings,
            cancel,
            run: None,
            phase_tx,
        }
    }

    /// Phase updates for progress reporting. `None` until a spec is submitted.
    pub fn subscribe(&self) -> watch::Receiver<Option<Phase>> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.run.as_ref().map(|r| r.state.phase())
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.run.as_ref().map(|r| r.state.run_id())
    }

    pub fn names(&self) -> Option<&ResourceNames> {
        self.run.as_ref().map(|r| &r.names)
    }

    /// Resources this run created and has not deleted yet.
    pub fn created_resources(&self) -> &[ManagedResource] {
        self.run.as_ref().map(|r| r.state.created()).unwrap_or(&[])
    }

    /// Validate `spec` and start a run. No cluster call is made here.
    pub fn submit(&mut self, spec: WorkloadSpec) -> Result<RunId> {
        if let Some(run) = &self.run {
            if !run.state.phase().is_terminal() {
                return Err(WhaleError::validation(format!(
                    "run {} is still in progress",
                    run.state.run_id()
                )));
            }
        }
        spec.validate()?;

        let run_id = RunId::generate();
        let names = ResourceNames::for_run(&spec.name, &run_id, &self.settings.namespace);
        info!(
            run_id = %run_id,
            deployment = %names.deployment,
            service = %names.service,
            namespace = %names.namespace,
            "run submitted"
        );
        self.run = Some(ActiveRun {
            spec,
            names,
            state: RunState::new(run_id.clone()),
        });
        self.phase_tx.send_replace(Some(Phase::Creating));
        Ok(run_id)
    }

    /// Create the Deployment, then the Service. Each one is recorded as soon
    /// as the API accepts it.
    pub async fn create(&mut self) -> Result<()> {
        self.expect_phase(Phase::Creating)?;
        self.create_one(ResourceKind::Deployment).await?;
        self.create_one(ResourceKind::Service).await?;
        Ok(())
    }

    async fn create_one(&mut self, kind: ResourceKind) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(WhaleError::Cancelled);
        }
        let cluster = self.cluster.clone();
        let run = self.active()?;
        let names = run.names.clone();
        let spec = run.spec.clone();
        let name = names.name_of(kind).to_string();

        // Services cannot be read back. Once the name is known to be free, a
        // later conflict can only come from one of our own attempts.
        if kind == ResourceKind::Service {
            let op = format!("check service name {}", name);
            let free = retry_with_backoff(&self.settings.retry, &op, &self.cancel, || {
                let cluster = cluster.clone();
                let names = names.clone();
                let spec = spec.clone();
                async move { cluster.service_name_free(&names, &spec).await }
            })
            .await?;
            if !free {
                return Err(WhaleError::ResourceConflict { kind, name });
            }
        }

        let op = format!("create {} {}", kind, name);
        let mut attempts = 0u32;
        let created = retry_with_backoff(&self.settings.retry, &op, &self.cancel, || {
            attempts += 1;
            let cluster = cluster.clone();
            let names = names.clone();
            let spec = spec.clone();
            async move {
                match kind {
                    ResourceKind::Deployment => cluster.create_deployment(&names, &spec).await,
                    ResourceKind::Service => cluster.create_service(&names, &spec).await,
                }
            }
        })
        .await;

        match created {
            Ok(()) => {}
            // A retried create may have landed even though its response was lost.
            Err(WhaleError::ResourceConflict { .. })
                if attempts > 1 && self.owned_by_run(kind, &name).await =>
            {
                warn!(kind = %kind, name = %name, "adopting object created by an earlier attempt");
            }
            Err(WhaleError::Cancelled) if attempts > 0 => {
                // an abandoned request may still have been applied
                if self.owned_by_run(kind, &name).await {
                    warn!(kind = %kind, name = %name, "create was interrupted but landed");
                    self.record(kind, name)?;
                }
                return Err(WhaleError::Cancelled);
            }
            Err(e) => return Err(e),
        }

        self.record(kind, name)
    }

    fn record(&mut self, kind: ResourceKind, name: String) -> Result<()> {
        let run = self.active_mut()?;
        info!(run_id = %run.state.run_id(), kind = %kind, name = %name, "created");
        run.state.record(ManagedResource {
            kind,
            name,
            namespace: run.names.namespace.clone(),
            created_at: Utc::now(),
            run_id: run.state.run_id().clone(),
        });
        Ok(())
    }

    // Only called after this run has attempted the create. Deployments are
    // listed by run label. A Service name was checked free before the first
    // attempt, so whatever holds it now came from this run.
    async fn owned_by_run(&self, kind: ResourceKind, name: &str) -> bool {
        let Some(run) = self.run.as_ref() else {
            return false;
        };
        match kind {
            ResourceKind::Service => true,
            ResourceKind::Deployment => {
                let selector = run_selector(run.state.run_id());
                let listed = tokio::time::timeout(
                    OWNERSHIP_CHECK_TIMEOUT,
                    self.cluster.list_deployments(&run.names.namespace, &selector),
                )
                .await;
                match listed {
                    Ok(Ok(found)) => found.iter().any(|d| d.name == name),
                    Ok(Err(e)) => {
                        warn!(name, error = %e, "could not check deployment ownership");
                        false
                    }
                    Err(_) => false,
                }
            }
        }
    }

    /// Poll the Deployment until `readyReplicas` matches the requested replicas.
    pub async fn await_ready(&mut self, timeout: Duration) -> Result<()> {
        if self.phase() == Some(Phase::Creating) {
            self.transition(Phase::WaitingReady)?;
        }
        self.expect_phase(Phase::WaitingReady)?;

        let run = self.active()?;
        let wanted = run.spec.replicas;
        let namespace = run.names.namespace.clone();
        let name = run.names.deployment.clone();
        let cluster = self.cluster.clone();

        let outcome = poll_until(timeout, self.settings.poll_interval, &self.cancel, || {
            let cluster = cluster.clone();
            let namespace = namespace.clone();
            let name = name.clone();
            async move {
                match cluster.get_deployment(&namespace, &name).await {
                    Ok(health) => {
                        if let Some(reason) = &health.failure {
                            return Err(WhaleError::DeploymentFailed {
                                name,
                                reason: reason.clone(),
                            });
                        }
                        let ready = health.is_ready(wanted);
                        if !ready {
                            debug!(
                                deployment = %name,
                                ready = health.ready_replicas,
                                wanted,
                                "deployment not ready yet"
                            );
                        }
                        Ok(ready)
                    }
                    Err(e) if e.is_transient() => {
                        warn!(deployment = %name, error = %e, "status check failed, will poll again");
                        Ok(false)
                    }
                    Err(e) if e.is_not_found() => Err(WhaleError::DeploymentFailed {
                        name,
                        reason: "deployment disappeared while waiting".to_string(),
                    }),
                    Err(e) => Err(e),
                }
            }
        })
        .await?;

        match outcome {
            PollOutcome::Converged => {
                info!(deployment = %name, replicas = wanted, "deployment ready");
                self.transition(Phase::Ready)
            }
            PollOutcome::TimedOut { waited } => Err(WhaleError::Timeout { name, waited }),
        }
    }

    /// Keep the workload up for `duration`, or until cancelled.
    pub async fn hold(&mut self, duration: Duration) -> Result<()> {
        self.expect_phase(Phase::Ready)?;
        if duration.is_zero() {
            return Ok(());
        }
        info!(hold = ?duration, "holding workload");
        sleep_or_cancel(duration, &self.cancel).await
    }

    /// Delete everything this run created, Service first. Objects that are
    /// already gone count as deleted, and one failure does not stop the
    /// attempt on the rest. Calling it again after success is a no-op.
    ///
    /// Cleanup ignores the cancellation token.
    pub async fn cleanup(&mut self) -> Result<()> {
        let Some(phase) = self.phase() else {
            return Ok(());
        };
        if phase == Phase::Done {
            return Ok(());
        }
        if phase != Phase::Cleaning {
            self.transition(Phase::Cleaning)?;
        }

        let uncancellable = CancellationToken::new();
        let pending: Vec<ManagedResource> =
            self.created_resources().iter().rev().cloned().collect();
        let mut failures = Vec::new();

        for resource in pending {
            match delete_resource(
                self.cluster.as_ref(),
                &self.settings.retry,
                &uncancellable,
                resource.kind,
                &resource.namespace,
                &resource.name,
            )
            .await
            {
                Ok(()) => {
                    self.active_mut()?.state.forget(resource.kind, &resource.name);
                }
                Err(e) => {
                    error!(kind = %resource.kind, name = %resource.name, error = %e, "cleanup failed");
                    failures.push(format!("{}: {}", resource, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(WhaleError::CleanupIncomplete(failures));
        }
        self.transition(Phase::Done)?;
        info!(run_id = ?self.run_id().map(RunId::as_str), "cleanup complete");
        Ok(())
    }

    /// Submit, create, wait, hold, and clean up.
    pub async fn run(&mut self, spec: WorkloadSpec) -> RunReport {
        let run_id = match self.submit(spec) {
            Ok(id) => id,
            Err(e) => {
                return RunReport {
                    run_id: None,
                    phase: None,
                    outcome: Err(e),
                    cleanup: Ok(()),
                };
            }
        };

        let outcome = self.drive().await;
        if let Err(e) = &outcome {
            error!(run_id = %run_id, error = %e, "run failed");
            if let Err(transition) = self.transition(Phase::Failed) {
                debug!(error = %transition, "not marking run failed");
            }
        }

        let cleanup = self.cleanup().await;
        RunReport {
            run_id: Some(run_id),
            phase: self.phase(),
            outcome,
            cleanup,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.create().await?;
        self.await_ready(self.settings.ready_timeout).await?;
        self.hold(self.settings.hold).await
    }

    /// Remove whatever a crashed run left behind, found by its run label.
    /// Returns the number of Deployments removed.
    pub async fn sweep(&self, run_id: &RunId) -> Result<usize> {
        let namespace = &self.settings.namespace;
        let selector = run_selector(run_id);
        let found = retry_with_backoff(&self.settings.retry, "list deployments", &self.cancel, || {
            self.cluster.list_deployments(namespace, &selector)
        })
        .await?;

        let uncancellable = CancellationToken::new();
        let mut failures = Vec::new();
        for deployment in &found {
            let service = service_name_for(&deployment.name);
            for (kind, name) in [
                (ResourceKind::Service, service.as_str()),
                (ResourceKind::Deployment, deployment.name.as_str()),
            ] {
                if let Err(e) = delete_resource(
                    self.cluster.as_ref(),
                    &self.settings.retry,
                    &uncancellable,
                    kind,
                    namespace,
                    name,
                )
                .await
                {
                    failures.push(format!("{} '{}/{}': {}", kind, namespace, name, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(WhaleError::CleanupIncomplete(failures));
        }
        info!(run_id = %run_id, deployments = found.len(), "sweep complete");
        Ok(found.len())
    }

    /// Deployments managed by whale in the configured namespace.
    pub async fn list(&self) -> Result<Vec<DeploymentSummary>> {
        let selector = managed_selector();
        retry_with_backoff(&self.settings.retry, "list deployments", &self.cancel, || {
            self.cluster.list_deployments(&self.settings.namespace, &selector)
        })
        .await
    }

    fn transition(&mut self, next: Phase) -> Result<()> {
        let run = self.active_mut()?;
        let from = run.state.phase();
        run.state.advance(next)?;
        debug!(run_id = %run.state.run_id(), from = %from, to = %next, "phase change");
        self.phase_tx.send_replace(Some(next));
        Ok(())
    }

    fn expect_phase(&self, expected: Phase) -> Result<()> {
        match self.phase() {
            Some(phase) if phase == expected => Ok(()),
            Some(phase) => Err(WhaleError::InvalidTransition {
                from: phase,
                to: expected,
            }),
            None => Err(WhaleError::validation("no workload submitted")),
        }
    }

    fn active(&self) -> Result<&ActiveRun> {
        self.run
            .as_ref()
            .ok_or_else(|| WhaleError::validation("no workload submitted"))
    }

    fn active_mut(&mut self) -> Result<&mut ActiveRun> {
        self.run
            .as_mut()
            .ok_or_else(|| WhaleError::validation("no workload submitted"))
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        let leftovers: Vec<ManagedResource> = self.created_resources().to_vec();
        if leftovers.is_empty() {
            return;
        }
        let run_id = self.run_id().map(|id| id.to_string()).unwrap_or_default();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(run_id = %run_id, count = leftovers.len(), "controller dropped mid-run, deleting in background");
                let cluster = self.cluster.clone();
                let retry = self.settings.retry.clone();
                handle.spawn(async move {
                    let never = CancellationToken::new();
                    for r in leftovers.iter().rev() {
                        if let Err(e) =
                            delete_resource(cluster.as_ref(), &retry, &never, r.kind, &r.namespace, &r.name).await
                        {
                            error!(resource = %r, error = %e, "background cleanup failed");
                        }
                    }
                });
            }
            Err(_) => {
                for r in &leftovers {
                    error!(resource = %r, "leaked, remove with `whale sweep {}`", run_id);
                }
            }
        }
    }
}

async fn delete_resource(
    cluster: &dyn ClusterApi,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let op = format!("delete {} {}", kind, name);
    match retry_with_backoff(retry, &op, cancel, || cluster.delete(kind, namespace, name)).await {
        Ok(()) => {
            info!(kind = %kind, name = %name, "deleted");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(kind = %kind, name = %name, "already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeCluster, Readiness};
    use crate::rbac::Verb;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            poll_interval: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(30),
            hold: Duration::ZERO,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                backoff_multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    fn controller(cluster: &Arc<FakeCluster>) -> LifecycleController {
        LifecycleController::new(cluster.clone(), settings(), CancellationToken::new())
    }

    fn spec() -> WorkloadSpec {
        WorkloadSpec::new("hello-whale", "docker/whalesay").with_replicas(2)
    }

    #[tokio::test]
    async fn submit_rejects_invalid_spec_without_cluster_calls() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = controller(&cluster);
        let err = ctl.submit(spec().with_replicas(0)).unwrap_err();
        assert!(matches!(err, WhaleError::Validation(_)));
        assert_eq!(ctl.phase(), None);
        assert_eq!(cluster.calls(Verb::Create, ResourceKind::Deployment), 0);
    }

    #[tokio::test]
    async fn submit_refuses_a_second_run_in_flight() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        assert!(ctl.submit(spec()).is_err());
    }

    #[tokio::test]
    async fn create_records_deployment_then_service() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        ctl.create().await.unwrap();

        let kinds: Vec<_> = ctl.created_resources().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ResourceKind::Deployment, ResourceKind::Service]);
        assert_eq!(cluster.object_count(), 2);

        ctl.cleanup().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_does_not_record_foreign_object() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        let service = ctl.names().unwrap().service.clone();
        cluster.insert_foreign(ResourceKind::Service, "default", &service);

        let report_err = ctl.create().await.unwrap_err();
        assert!(matches!(report_err, WhaleError::ResourceConflict { kind: ResourceKind::Service, .. }));
        assert_eq!(ctl.created_resources().len(), 1);

        ctl.cleanup().await.unwrap();
        // the foreign Service survives, our Deployment is gone
        assert!(cluster.exists(ResourceKind::Service, "default", &service));
        assert_eq!(cluster.object_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_create_failures_are_retried() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.inject(
            Verb::Create,
            ResourceKind::Deployment,
            WhaleError::ApiUnavailable("503 Service Unavailable".into()),
        );
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        ctl.create().await.unwrap();
        assert_eq!(cluster.calls(Verb::Create, ResourceKind::Deployment), 2);
        ctl.cleanup().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn api_unavailable_escalates_after_max_attempts() {
        let cluster = Arc::new(FakeCluster::default());
        for _ in 0..3 {
            cluster.inject(
                Verb::Create,
                ResourceKind::Deployment,
                WhaleError::ApiUnavailable("connection refused".into()),
            );
        }
        let mut ctl = controller(&cluster);
        let report = ctl.run(spec()).await;
        assert!(matches!(report.outcome, Err(WhaleError::ApiUnavailable(_))));
        assert!(report.cleanup.is_ok());
        assert_eq!(report.phase, Some(Phase::Done));
        assert_eq!(cluster.calls(Verb::Create, ResourceKind::Deployment), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deployment_failure_is_surfaced_and_cleaned_up() {
        let cluster = Arc::new(FakeCluster::new(Readiness::FailAfter(Duration::from_secs(4))));
        let mut ctl = controller(&cluster);
        let report = ctl.run(spec()).await;
        assert!(matches!(report.outcome, Err(WhaleError::DeploymentFailed { .. })));
        assert!(report.cleanup.is_ok());
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_errors_do_not_end_the_wait() {
        let cluster = Arc::new(FakeCluster::new(Readiness::After(Duration::from_secs(6))));
        for _ in 0..2 {
            cluster.inject(
                Verb::Get,
                ResourceKind::Deployment,
                WhaleError::ApiUnavailable("timeout".into()),
            );
        }
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        ctl.create().await.unwrap();
        ctl.await_ready(Duration::from_secs(30)).await.unwrap();
        assert_eq!(ctl.phase(), Some(Phase::Ready));
        ctl.cleanup().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_hold_still_cleans_up() {
        let cluster = Arc::new(FakeCluster::default());
        let cancel = CancellationToken::new();
        let mut ctl = LifecycleController::new(
            cluster.clone(),
            ControllerSettings {
                hold: Duration::from_secs(600),
                ..settings()
            },
            cancel.clone(),
        );
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let report = ctl.run(spec()).await;
        assert!(matches!(report.outcome, Err(WhaleError::Cancelled)));
        assert!(report.cleanup.is_ok());
        assert_eq!(report.phase, Some(Phase::Done));
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_failure_does_not_mask_primary_error() {
        let cluster = Arc::new(FakeCluster::new(Readiness::Never));
        cluster.inject(
            Verb::Delete,
            ResourceKind::Service,
            WhaleError::PermissionDenied("delete services".into()),
        );
        let mut ctl = controller(&cluster);
        let report = ctl.run(spec()).await;

        assert!(matches!(report.outcome, Err(WhaleError::Timeout { .. })));
        assert!(matches!(report.cleanup, Err(WhaleError::CleanupIncomplete(ref left)) if left.len() == 1));
        // the Deployment was still removed
        assert_eq!(cluster.object_count(), 1);
        assert_eq!(report.phase, Some(Phase::Cleaning));

        // a second attempt finishes the job
        ctl.cleanup().await.unwrap();
        assert_eq!(ctl.phase(), Some(Phase::Done));
        assert_eq!(cluster.object_count(), 0);
        assert!(matches!(
            RunReport { cleanup: Ok(()), ..report }.into_result(),
            Err(WhaleError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn phase_updates_are_published() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = controller(&cluster);
        let rx = ctl.subscribe();
        assert_eq!(*rx.borrow(), None);
        let report = ctl.run(spec()).await;
        assert!(report.is_success());
        assert_eq!(*rx.borrow(), Some(Phase::Done));
    }

    #[tokio::test]
    async fn sweep_removes_resources_left_by_a_crashed_run() {
        let cluster = Arc::new(FakeCluster::default());
        let run_id = {
            let mut crashed = controller(&cluster);
            let run_id = crashed.submit(spec()).unwrap();
            crashed.create().await.unwrap();
            // simulate a crash: forget the run without cleanup or drop guard
            std::mem::forget(crashed);
            run_id
        };
        assert_eq!(cluster.tagged_with(run_id.as_str()).len(), 2);

        let other = controller(&cluster);
        let swept = other.sweep(&run_id).await.unwrap();
        assert_eq!(swept, 1);
        assert!(cluster.tagged_with(run_id.as_str()).is_empty());
        assert_eq!(cluster.calls(Verb::List, ResourceKind::Deployment), 1);

        // nothing left, sweeping again is harmless
        assert_eq!(other.sweep(&run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_reports_managed_deployments_only() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.insert_foreign(ResourceKind::Deployment, "default", "unrelated");
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        ctl.create().await.unwrap();

        let listed = ctl.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_id.as_deref(), ctl.run_id().map(RunId::as_str));
        ctl.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_mid_run_cleans_up_in_background() {
        let cluster = Arc::new(FakeCluster::default());
        {
            let mut ctl = controller(&cluster);
            ctl.submit(spec()).unwrap();
            ctl.create().await.unwrap();
        }
        for _ in 0..10 {
            if cluster.object_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cluster.object_count(), 0);
    }

    /// Delegates to a [`FakeCluster`], stalling status checks and creates
    /// the way an overloaded API server would.
    struct Stalling {
        inner: Arc<FakeCluster>,
        get_delay: Duration,
        create_delay: Duration,
    }

    #[async_trait::async_trait]
    impl ClusterApi for Stalling {
        async fn create_deployment(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<()> {
            self.inner.create_deployment(names, spec).await?;
            tokio::time::sleep(self.create_delay).await;
            Ok(())
        }

        async fn create_service(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<()> {
            self.inner.create_service(names, spec).await
        }

        async fn service_name_free(&self, names: &ResourceNames, spec: &WorkloadSpec) -> Result<bool> {
            self.inner.service_name_free(names, spec).await
        }

        async fn get_deployment(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<crate::cluster::DeploymentHealth> {
            tokio::time::sleep(self.get_delay).await;
            self.inner.get_deployment(namespace, name).await
        }

        async fn list_deployments(
            &self,
            namespace: &str,
            selector: &str,
        ) -> Result<Vec<DeploymentSummary>> {
            self.inner.list_deployments(namespace, selector).await
        }

        async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
            self.inner.delete(kind, namespace, name).await
        }
    }

    fn stalling(cluster: &Arc<FakeCluster>, get_delay: u64, create_delay: u64) -> Arc<Stalling> {
        Arc::new(Stalling {
            inner: cluster.clone(),
            get_delay: Duration::from_secs(get_delay),
            create_delay: Duration::from_secs(create_delay),
        })
    }

    fn cancel_after(secs: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_stalled_status_check() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = LifecycleController::new(stalling(&cluster, 30, 0), settings(), cancel_after(1));

        let start = tokio::time::Instant::now();
        let report = ctl.run(spec()).await;

        assert!(matches!(report.outcome, Err(WhaleError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(report.cleanup.is_ok());
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_timeout_interrupts_a_stalled_status_check() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl =
            LifecycleController::new(stalling(&cluster, 30, 0), settings(), CancellationToken::new());
        ctl.submit(spec()).unwrap();
        ctl.create().await.unwrap();

        let start = tokio::time::Instant::now();
        let err = ctl.await_ready(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, WhaleError::Timeout { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        ctl.cleanup().await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_create_that_landed_is_cleaned_up() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = LifecycleController::new(stalling(&cluster, 0, 30), settings(), cancel_after(1));

        let report = ctl.run(spec()).await;
        assert!(matches!(report.outcome, Err(WhaleError::Cancelled)));
        assert!(report.cleanup.is_ok());
        assert_eq!(cluster.object_count(), 0);
        assert_eq!(cluster.calls(Verb::Delete, ResourceKind::Deployment), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_create_responses_are_adopted() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.lose_response(Verb::Create, ResourceKind::Deployment);
        cluster.lose_response(Verb::Create, ResourceKind::Service);
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        ctl.create().await.unwrap();

        assert_eq!(ctl.created_resources().len(), 2);
        assert_eq!(cluster.calls(Verb::Create, ResourceKind::Deployment), 2);
        // the dry-run name check plus two attempts
        assert_eq!(cluster.calls(Verb::Create, ResourceKind::Service), 3);

        ctl.cleanup().await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_service_is_never_adopted() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        let service = ctl.names().unwrap().service.clone();
        cluster.insert_foreign(ResourceKind::Service, "default", &service);
        cluster.inject(
            Verb::Create,
            ResourceKind::Service,
            WhaleError::ApiUnavailable("503".into()),
        );

        let err = ctl.create().await.unwrap_err();
        assert!(matches!(err, WhaleError::ResourceConflict { kind: ResourceKind::Service, .. }));
        // only the dry-run name check reached the cluster
        assert_eq!(cluster.calls(Verb::Create, ResourceKind::Service), 1);

        ctl.cleanup().await.unwrap();
        assert!(cluster.exists(ResourceKind::Service, "default", &service));
        assert_eq!(cluster.object_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_deployment_behind_a_retry_is_not_adopted() {
        let cluster = Arc::new(FakeCluster::default());
        let mut ctl = controller(&cluster);
        ctl.submit(spec()).unwrap();
        let deployment = ctl.names().unwrap().deployment.clone();
        cluster.inject(
            Verb::Create,
            ResourceKind::Deployment,
            WhaleError::ApiUnavailable("503".into()),
        );
        cluster.insert_foreign(ResourceKind::Deployment, "default", &deployment);

        let err = ctl.create().await.unwrap_err();
        assert!(matches!(err, WhaleError::ResourceConflict { kind: ResourceKind::Deployment, .. }));
        assert!(ctl.created_resources().is_empty());

        ctl.cleanup().await.unwrap();
        assert!(cluster.exists(ResourceKind::Deployment, "default", &deployment));
    }
}
