//! The `jld-deploy` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use jld_cloud::aws::Route53;
use jld_cloud::gcp::Gke;
use tracing::debug;

use crate::config::{DeploymentConfig, Flags, ResourcePolicy};
use crate::orchestrator::{check_executables, render_only, Collaborators, Orchestrator};
use crate::render::RenderedManifestSet;
use crate::ui;
use crate::workloads::KubeConnector;

/// Programs every cloud-touching run shells out to.
const CLOUD_EXECUTABLES: [&str; 3] = ["gcloud", "gke-gcloud-auth-plugin", "aws"];

/// Deploy, undeploy or render the JupyterLab Demo.
#[derive(Args, Debug)]
pub struct DeployCommand {
    /// Deployment configuration file
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub file: PathBuf,

    /// Undeploy instead of deploy
    #[arg(short = 'u', long, conflicts_with = "create_config")]
    pub undeploy: bool,

    /// Render manifests into the directory and stop
    #[arg(short = 'c', long = "create-config", requires = "directory")]
    pub create_config: bool,

    /// Directory for rendered manifests (reused verbatim if already rendered)
    #[arg(short = 'd', long, value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Use an existing cluster; never create or destroy it
    #[arg(long)]
    pub existing_cluster: bool,

    /// Use an existing namespace; never create or destroy it
    #[arg(long, requires = "existing_cluster")]
    pub existing_namespace: bool,

    /// Do not deploy the image prepuller
    #[arg(long)]
    pub disable_prepuller: bool,
}

impl DeployCommand {
    fn flags(&self) -> Flags {
        Flags {
            policy: ResourcePolicy {
                existing_cluster: self.existing_cluster,
                existing_namespace: self.existing_namespace,
            },
            directory: self.directory.clone(),
            disable_prepuller: self.disable_prepuller,
        }
    }

    /// Run the requested operation.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`crate::DeployError`] wrapped in `anyhow`.
    pub async fn run(&self) -> Result<()> {
        let flags = self.flags();

        if self.undeploy {
            let target = DeploymentConfig::load_target(&self.file, &flags)?;
            check_executables(&CLOUD_EXECUTABLES)?;
            let orchestrator = Orchestrator::new(
                collaborators(target.gke.project.clone(), &target.gke.zone).await?,
            );
            orchestrator.undeploy(&target).await?;
            return Ok(());
        }

        let config = DeploymentConfig::load(&self.file, &flags)?;
        let needs_openssl = config.tls.dhparam.is_none()
            && !self
                .directory
                .as_deref()
                .is_some_and(RenderedManifestSet::is_prerendered);

        if self.create_config {
            let dir = self
                .directory
                .as_deref()
                .context("--create-config requires --directory")?;
            if config.tls.dhparam.is_none() {
                check_executables(&["openssl"])?;
            }
            render_only(&config, dir).await?;
            return Ok(());
        }

        check_executables(&CLOUD_EXECUTABLES)?;
        if needs_openssl {
            check_executables(&["openssl"])?;
        }

        let orchestrator = Orchestrator::new(
            collaborators(config.target.gke.project.clone(), &config.target.gke.zone).await?,
        );
        let outcome = orchestrator.deploy(&config).await?;

        ui::print_kv(
            "Cluster",
            &format!("{} ({})", outcome.cluster.name, outcome.cluster.provenance),
        );
        ui::print_kv(
            "Namespace",
            &format!("{} ({})", outcome.namespace.name, outcome.namespace.provenance),
        );
        ui::print_kv("Address", &outcome.address);
        ui::print_kv("URL", &format!("https://{}/", config.target.hostname));
        Ok(())
    }
}

async fn collaborators(project: Option<String>, zone: &str) -> Result<Collaborators> {
    let gke = Gke::from_gcloud(project, zone)
        .await
        .map_err(crate::DeployError::from)?;
    debug!(zone, "GKE client ready");
    Ok(Collaborators {
        clusters: Arc::new(gke),
        connector: Arc::new(KubeConnector),
        dns: Arc::new(Route53::new()),
    })
}
