//! JupyterLab Demo deployer CLI.
//!
//! Provisions a GKE cluster, deploys JupyterHub behind a TLS-terminating
//! nginx, and publishes the hostname in Route 53. `-u` tears it all down.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::process::ExitCode;

use clap::Parser;
use jld_deploy::commands::DeployCommand;
use jld_deploy::{ui, DeployError};
use tracing_subscriber::EnvFilter;

/// JupyterLab Demo deployer.
#[derive(Parser)]
#[command(
    name = "jld-deploy",
    version,
    about = "Deploy the JupyterLab Demo to Google Kubernetes Engine",
    long_about = "Deploy the JupyterLab Demo to Google Kubernetes Engine.\n\n\
                  Creates (or attaches to) a GKE cluster and namespace, applies\n\
                  the JupyterHub and nginx manifests, and points the hostname at\n\
                  the ingress. Re-running deploy attaches to what already exists;\n\
                  undeploy (-u) is safe to repeat."
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    command: DeployCommand,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,jld_deploy=debug,jld_cloud=debug")
    } else {
        EnvFilter::new("warn,jld_deploy=info,jld_cloud=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let deploy_error = err.downcast_ref::<DeployError>();
            let kind = deploy_error.map_or("Error", DeployError::kind);
            ui::print_error(&format!("{kind}: {err}"));
            if let Some(step) = deploy_error.and_then(DeployError::failed_step) {
                if step.may_leave_partial_state() {
                    ui::print_warning(
                        "The cluster, namespace or objects created before the failure were \
                         left in place. Re-run to resume, or run with -u to remove them.",
                    );
                }
            }
            ExitCode::FAILURE
        }
    }
}
