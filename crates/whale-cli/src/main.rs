use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod config;
mod ls;
mod run;
mod signal;
mod spinner;

use config::GlobalOptions;
use run::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "whale")]
#[command(about = "whale - run a workload on Kubernetes, wait for it, and always clean up")]
struct Args {
    /// Config file (defaults to ~/.whale/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Kubeconfig to use instead of the inferred one
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,
    /// Namespace to work in
    #[arg(short, long, global = true)]
    namespace: Option<String>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a deployment and service, wait until ready, then delete both
    Run {
        /// YAML file holding a Deployment and optionally a Service
        #[arg(short, long)]
        descriptor: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(short, long)]
        image: Option<String>,
        #[arg(short, long)]
        replicas: Option<i32>,
        /// Container port
        #[arg(short, long)]
        port: Option<i32>,
        /// ClusterIP, NodePort or LoadBalancer
        #[arg(long)]
        service_type: Option<String>,
        /// How long to wait for readiness (e.g., "30s", "5m")
        #[arg(short, long)]
        timeout: Option<String>,
        /// How long to keep the workload up once ready (e.g., "60s", "0s")
        #[arg(long)]
        hold: Option<String>,
        #[arg(long)]
        no_progress: bool,
        /// Use an in-memory cluster instead of Kubernetes
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete whatever a crashed run left behind
    Sweep {
        /// The run ID printed by `whale run`
        run_id: String,
    },
    /// List deployments managed by whale
    Ls,
    /// Check a descriptor file without touching the cluster
    Validate {
        #[arg(short, long)]
        descriptor: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let global = GlobalOptions {
        config: args.config,
        kubeconfig: args.kubeconfig,
        namespace: args.namespace,
    };

    let result = match args.command {
        Commands::Run {
            descriptor,
            name,
            image,
            replicas,
            port,
            service_type,
            timeout,
            hold,
            no_progress,
            dry_run,
        } => {
            let options = RunOptions {
                descriptor,
                name,
                image,
                replicas,
                port,
                service_type,
                timeout,
                hold,
                no_progress,
                dry_run,
            };
            run::handle_run_command(&global, options).await
        }
        Commands::Sweep { run_id } => run::handle_sweep_command(&global, run_id).await,
        Commands::Ls => ls::handle_ls_command(&global).await,
        Commands::Validate { descriptor } => run::handle_validate_command(descriptor),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
