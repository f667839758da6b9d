use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use whale_core::fake::{FakeCluster, Readiness};
use whale_core::{ClusterApi, LifecycleController, RunId, ServiceType, WhaleError, WorkloadSpec};
use whale_operator::{KubeCluster, create_client, descriptor};

use crate::config::{GlobalOptions, parse_duration_arg};
use crate::signal::cancel_on_shutdown;
use crate::spinner::follow_phases;

/// Flags of `whale run`. Flags override whatever the descriptor says.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub descriptor: Option<PathBuf>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub replicas: Option<i32>,
    pub port: Option<i32>,
    pub service_type: Option<String>,
    pub timeout: Option<String>,
    pub hold: Option<String>,
    pub no_progress: bool,
    pub dry_run: bool,
}

pub fn build_spec(options: &RunOptions) -> Result<WorkloadSpec, WhaleError> {
    let mut spec = match &options.descriptor {
        Some(path) => descriptor::load(path)?,
        None => {
            let name = options.name.clone().ok_or_else(|| {
                WhaleError::validation("either --descriptor or both --name and --image are required")
            })?;
            let image = options.image.clone().ok_or_else(|| {
                WhaleError::validation("either --descriptor or both --name and --image are required")
            })?;
            WorkloadSpec::new(name, image)
        }
    };

    if options.descriptor.is_some() {
        if let Some(name) = &options.name {
            spec.name = name.clone();
        }
        if let Some(image) = &options.image {
            spec.image = image.clone();
        }
    }
    if let Some(replicas) = options.replicas {
        spec.replicas = replicas;
    }
    if let Some(port) = options.port {
        spec.container_port = port;
    }
    if let Some(raw) = &options.service_type {
        spec.service_type = raw.parse::<ServiceType>()?;
    }

    spec.validate()?;
    Ok(spec)
}

pub async fn handle_run_command(
    global: &GlobalOptions,
    options: RunOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = global.resolve()?;
    let mut settings = resolved.settings;
    if let Some(raw) = &options.timeout {
        settings.ready_timeout = parse_duration_arg("timeout", raw)?;
    }
    if let Some(raw) = &options.hold {
        settings.hold = parse_duration_arg("hold", raw)?;
    }

    let spec = build_spec(&options)?;

    let cluster: Arc<dyn ClusterApi> = if options.dry_run {
        warn!("dry run: using an in-memory cluster, nothing is sent to Kubernetes");
        settings.hold = settings.hold.min(Duration::from_secs(1));
        Arc::new(FakeCluster::new(Readiness::After(Duration::from_millis(500))))
    } else {
        let client = create_client(resolved.kubeconfig.as_deref()).await?;
        Arc::new(KubeCluster::new(client))
    };

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    println!(
        "Running {} ({}) x{} in namespace {}",
        spec.name, spec.image, spec.replicas, settings.namespace
    );

    let mut controller = LifecycleController::new(cluster, settings, cancel);
    let progress = (!options.no_progress).then(|| follow_phases(controller.subscribe()));

    let report = controller.run(spec).await;
    drop(controller);
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    if let Some(run_id) = &report.run_id {
        println!("Run ID: {}", run_id);
    }
    if let Err(e) = &report.cleanup {
        eprintln!("Cleanup incomplete: {}", e);
        if let Some(run_id) = &report.run_id {
            eprintln!("Retry with: whale sweep {}", run_id);
        }
    }

    match report.into_result()? {
        Some(run_id) => {
            info!(run_id = %run_id, "run finished");
            println!("✓ Run completed and cleaned up");
        }
        None => println!("✓ Nothing to do"),
    }
    Ok(())
}

pub async fn handle_sweep_command(
    global: &GlobalOptions,
    run_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let run_id = RunId::parse(&run_id)?;
    let resolved = global.resolve()?;
    let client = create_client(resolved.kubeconfig.as_deref()).await?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());
    let controller =
        LifecycleController::new(Arc::new(KubeCluster::new(client)), resolved.settings, cancel);

    let removed = controller.sweep(&run_id).await?;
    if removed == 0 {
        println!("Nothing left behind by run {}", run_id);
    } else {
        println!("✓ Removed {} deployment(s) and their services for run {}", removed, run_id);
    }
    Ok(())
}

pub fn handle_validate_command(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let spec = descriptor::load(&path)?;
    spec.validate()?;

    println!("✓ {} is valid", path.display());
    println!("  Name:         {}", spec.name);
    println!("  Image:        {}", spec.image);
    println!("  Replicas:     {}", spec.replicas);
    println!("  Port:         {}", spec.container_port);
    println!("  Service:      {} port {}", spec.service_type, spec.service_port());
    Ok(())
}
