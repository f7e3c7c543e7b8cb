//! Deploy and undeploy sequencing.
//!
//! Deploy runs [`DeployStep`]s strictly in order. Nothing outside the local
//! filesystem changes until step 2, and everything that can be checked
//! without touching the cloud (configuration, templates, executables, the
//! DNS zone) is checked in step 1. Undeploy runs every [`UndeployStep`] even
//! when an earlier one failed and reports all failures together.

use std::path::Path;
use std::sync::Arc;

use jld_cloud::{ClusterProvider, DnsProvider};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterHandle, ClusterManager, Held};
use crate::config::{DeploymentConfig, PollSettings, Target};
use crate::dns::DnsManager;
use crate::error::{DeployError, TeardownFailure};
use crate::render::{
    KeyMaterial, ManifestRenderer, RenderedManifestSet, ResourceRef, INGRESS_SERVICE,
};
use crate::step::{DeployStep, UndeployStep};
use crate::ui;
use crate::workloads::Connector;

/// External services a deploy or undeploy talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Compute cluster provider.
    pub clusters: Arc<dyn ClusterProvider>,
    /// Builds API access to a cluster from its kubeconfig.
    pub connector: Arc<dyn Connector>,
    /// Hosted DNS provider.
    pub dns: Arc<dyn DnsProvider>,
}

/// What a successful deploy produced.
#[derive(Debug)]
pub struct DeployOutcome {
    /// The cluster, and whether this deployment owns it.
    pub cluster: Held,
    /// The namespace, and whether this deployment owns it.
    pub namespace: Held,
    /// Manifests that were applied, in order.
    pub manifests: RenderedManifestSet,
    /// External address the hostname now points at.
    pub address: String,
}

/// Drives deploy and undeploy against a set of collaborators.
pub struct Orchestrator {
    clusters: ClusterManager,
    dns: Arc<dyn DnsProvider>,
}

impl Orchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            clusters: ClusterManager::new(collaborators.clusters, collaborators.connector),
            dns: collaborators.dns,
        }
    }

    /// Deploy the demo described by `config`.
    ///
    /// # Errors
    ///
    /// Failures in step 1 are returned as-is and leave no cloud state
    /// behind. Failures from step 2 on, where a cluster or namespace may
    /// already exist, are wrapped in [`DeployError::StepFailed`].
    pub async fn deploy(&self, config: &DeploymentConfig) -> Result<DeployOutcome, DeployError> {
        let target = &config.target;
        ui::print_section(&format!("Deploying {}", target.hostname));

        progress(DeployStep::ValidatingConfig);
        let prerendered = match &target.directory {
            Some(dir) if RenderedManifestSet::is_prerendered(dir) => {
                info!(directory = %dir.display(), "Using pre-rendered manifests");
                Some(RenderedManifestSet::load(dir)?)
            }
            _ => None,
        };
        let renderer = ManifestRenderer::for_config(config)?;
        if prerendered.is_none() {
            renderer.validate()?;
        }
        let dns =
            DnsManager::resolve(Arc::clone(&self.dns), &target.hostname, target.dns_zone.as_deref())
                .await?;
        debug!(zone_id = dns.zone_id(), "Pre-flight checks passed");

        progress(DeployStep::EnsuringCluster);
        let handle = self
            .clusters
            .ensure(target)
            .await
            .map_err(|e| e.at(DeployStep::EnsuringCluster))?;

        progress(DeployStep::RenderingManifests);
        let manifests = match prerendered {
            Some(set) => set,
            None => render_and_persist(&renderer, config)
                .await
                .map_err(|e| e.at(DeployStep::RenderingManifests))?,
        };

        progress(DeployStep::ApplyingManifests);
        apply_all(&handle, &manifests)
            .await
            .map_err(|e| e.at(DeployStep::ApplyingManifests))?;

        progress(DeployStep::WaitingForAddress);
        let address = wait_for_address(&handle, config.poll)
            .await
            .map_err(|e| e.at(DeployStep::WaitingForAddress))?;

        progress(DeployStep::PublishingDns);
        dns.upsert(&target.hostname, &address)
            .await
            .map_err(|e| e.at(DeployStep::PublishingDns))?;

        ui::print_success(&format!(
            "https://{} is served from {address}",
            target.hostname
        ));
        Ok(DeployOutcome {
            cluster: handle.cluster.clone(),
            namespace: handle.namespace.clone(),
            manifests,
            address,
        })
    }

    /// Tear down the demo at `target`.
    ///
    /// Safe to repeat: resources that are already gone are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Teardown`] listing every step that failed.
    pub async fn undeploy(&self, target: &Target) -> Result<(), DeployError> {
        ui::print_section(&format!("Undeploying {}", target.hostname));
        let mut failures = Vec::new();

        undeploy_progress(UndeployStep::RemovingDns);
        if let Err(e) = self.remove_dns(target).await {
            record(&mut failures, UndeployStep::RemovingDns, e);
        }

        undeploy_progress(UndeployStep::DeletingManifests);
        let handle = match self.clusters.locate(target).await {
            Ok(handle) => handle,
            Err(e) => {
                record(&mut failures, UndeployStep::DeletingManifests, e);
                None
            }
        };
        if let Some(handle) = &handle {
            for e in delete_all(handle, &teardown_resources(target)).await {
                record(&mut failures, UndeployStep::DeletingManifests, e);
            }
        }

        undeploy_progress(UndeployStep::ReleasingCluster);
        if let Some(handle) = handle {
            if let Err(e) = self.clusters.release(handle).await {
                record(&mut failures, UndeployStep::ReleasingCluster, e);
            }
        }

        if failures.is_empty() {
            ui::print_success(&format!("{} undeployed", target.hostname));
            Ok(())
        } else {
            Err(DeployError::Teardown(failures))
        }
    }

    async fn remove_dns(&self, target: &Target) -> Result<(), DeployError> {
        let dns =
            DnsManager::resolve(Arc::clone(&self.dns), &target.hostname, target.dns_zone.as_deref())
                .await?;
        dns.remove(&target.hostname).await
    }
}

/// Render manifests into `dir` and stop. Touches no collaborator.
///
/// # Errors
///
/// Returns [`DeployError::Config`] if `dir` already holds a rendered
/// deployment, otherwise any render or filesystem failure.
pub async fn render_only(
    config: &DeploymentConfig,
    dir: &Path,
) -> Result<RenderedManifestSet, DeployError> {
    ui::print_section(&format!("Rendering {}", config.target.hostname));

    progress(DeployStep::ValidatingConfig);
    if RenderedManifestSet::is_prerendered(dir) {
        return Err(DeployError::config(
            "directory",
            format!("{} already holds rendered manifests", dir.display()),
        ));
    }
    let renderer = ManifestRenderer::for_config(config)?;
    renderer.validate()?;

    progress(DeployStep::RenderingManifests);
    let keys = KeyMaterial::generate(&config.tls).await?;
    let manifests = renderer.render(config, &keys)?;
    manifests.persist(dir, &config.source)?;

    ui::print_success(&format!(
        "Wrote {} manifests to {}",
        manifests.len(),
        dir.display()
    ));
    Ok(manifests)
}

/// Check required executables are on the search path.
///
/// # Errors
///
/// Returns [`DeployError::Config`] naming the first missing program.
pub fn check_executables(programs: &[&str]) -> Result<(), DeployError> {
    for program in programs {
        match which::which(program) {
            Ok(path) => debug!(program, path = %path.display(), "Found executable"),
            Err(_) => {
                return Err(DeployError::config(
                    "executables",
                    format!("`{program}` is not on PATH"),
                ))
            }
        }
    }
    Ok(())
}

async fn render_and_persist(
    renderer: &ManifestRenderer,
    config: &DeploymentConfig,
) -> Result<RenderedManifestSet, DeployError> {
    let keys = KeyMaterial::generate(&config.tls).await?;
    let manifests = renderer.render(config, &keys)?;

    if let Some(dir) = &config.target.directory {
        manifests.persist(dir, &config.source)?;
    } else {
        let scratch = tempfile::tempdir().map_err(|e| DeployError::io(std::env::temp_dir(), e))?;
        manifests.persist(scratch.path(), &config.source)?;
        debug!(directory = %scratch.path().display(), "Manifests written to scratch directory");
    }
    Ok(manifests)
}

async fn apply_all(
    handle: &ClusterHandle,
    manifests: &RenderedManifestSet,
) -> Result<(), DeployError> {
    let namespace = &handle.namespace.name;
    for manifest in manifests.iter() {
        info!(namespace = %namespace, manifest = %manifest.path.display(), "Applying");
        handle.workloads().apply(namespace, manifest).await?;
    }
    Ok(())
}

/// Poll the ingress service until it reports an address. The only retry
/// loop in a deploy.
async fn wait_for_address(
    handle: &ClusterHandle,
    poll: PollSettings,
) -> Result<String, DeployError> {
    let namespace = &handle.namespace.name;
    let started = Instant::now();
    let deadline = started.checked_add(poll.timeout).ok_or_else(|| {
        DeployError::config(
            "address_timeout_secs",
            format!("{}s is too long to wait", poll.timeout.as_secs()),
        )
    })?;

    loop {
        if let Some(address) = handle
            .workloads()
            .ingress_address(namespace, INGRESS_SERVICE)
            .await?
        {
            info!(service = INGRESS_SERVICE, address = %address, "Ingress address assigned");
            return Ok(address);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(DeployError::ProvisionTimeout {
                service: INGRESS_SERVICE.to_string(),
                waited_secs: now.duration_since(started).as_secs(),
            });
        }

        debug!(
            service = INGRESS_SERVICE,
            elapsed_secs = now.duration_since(started).as_secs(),
            "No ingress address yet"
        );
        tokio::time::sleep(poll.interval.min(deadline - now)).await;
    }
}

/// Objects to delete, newest first.
fn teardown_resources(target: &Target) -> Vec<ResourceRef> {
    let mut resources = target
        .directory
        .as_deref()
        .filter(|dir| RenderedManifestSet::is_prerendered(dir))
        .and_then(|dir| match RenderedManifestSet::load(dir).and_then(|s| s.resources()) {
            Ok(resources) => Some(resources),
            Err(e) => {
                warn!(error = %e, "Cannot read rendered manifests; deleting the standard set");
                None
            }
        })
        .unwrap_or_else(ManifestRenderer::inventory);
    resources.reverse();
    resources
}

async fn delete_all(handle: &ClusterHandle, resources: &[ResourceRef]) -> Vec<DeployError> {
    let namespace = &handle.namespace.name;
    let mut errors = Vec::new();
    for resource in resources {
        match handle.workloads().delete(namespace, resource).await {
            Ok(true) => info!(namespace = %namespace, %resource, "Deleted"),
            Ok(false) => debug!(namespace = %namespace, %resource, "Already absent"),
            Err(e) => errors.push(DeployError::from(e)),
        }
    }
    errors
}

fn record(failures: &mut Vec<TeardownFailure>, step: UndeployStep, error: DeployError) {
    error!(step = %step, kind = error.kind(), error = %error, "Undeploy step failed; continuing");
    ui::print_error(&format!("{step}: {error}"));
    failures.push(TeardownFailure { step, error });
}

fn progress(step: DeployStep) {
    ui::print_progress_step(step.step_number(), DeployStep::TOTAL_STEPS, step.description());
}

fn undeploy_progress(step: UndeployStep) {
    ui::print_progress_step(step.step_number(), UndeployStep::TOTAL_STEPS, step.description());
}
