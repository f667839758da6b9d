use comfy_table::{Cell, Table};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use whale_core::{DeploymentSummary, LifecycleController};
use whale_operator::{KubeCluster, create_client};

use crate::config::GlobalOptions;

pub async fn handle_ls_command(global: &GlobalOptions) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = global.resolve()?;
    let client = create_client(resolved.kubeconfig.as_deref()).await?;
    let namespace = resolved.settings.namespace.clone();
    let controller = LifecycleController::new(
        Arc::new(KubeCluster::new(client)),
        resolved.settings,
        CancellationToken::new(),
    );

    let deployments = controller.list().await?;
    if deployments.is_empty() {
        println!("No whale deployments found in namespace {}.", namespace);
    } else {
        println!("Deployments ({})", namespace);
        println!("{}", render_table(&deployments));
    }
    Ok(())
}

pub fn render_table(deployments: &[DeploymentSummary]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Name", "Run ID", "Ready", "Status", "Created At"]);

    for d in deployments {
        let created_at = d
            .created_at
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = match &d.health.failure {
            Some(reason) => format!("Failed: {}", reason),
            None if d.health.is_ready(d.health.desired_replicas) => "Ready".to_string(),
            None => "Progressing".to_string(),
        };

        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.run_id.as_deref().unwrap_or("-")),
            Cell::new(format!("{}/{}", d.health.ready_replicas, d.health.desired_replicas)),
            Cell::new(status),
            Cell::new(created_at),
        ]);
    }
    table
}
