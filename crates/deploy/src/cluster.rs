//! Cluster and namespace lifecycle.
//!
//! `ensure` brings a cluster and namespace to the ready state, creating what
//! is missing unless the existing-resource switches forbid it. Every
//! resource on the resulting [`ClusterHandle`] records whether this
//! deployment owns it; `release` only ever destroys what is owned.

use std::fmt;
use std::sync::Arc;

use jld_cloud::{ClusterProvider, CreateClusterRequest, KubernetesClusterStatus, ProviderError};
use tracing::{debug, info, warn};

use crate::config::Target;
use crate::error::DeployError;
use crate::workloads::{Connector, Workloads};

/// How long to wait on a cluster another run left provisioning.
const PROVISIONING_WAIT_SECS: u64 = 1800;

/// Who is responsible for tearing a resource down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Created by, or on behalf of, this deployment. Released on teardown.
    Owned,
    /// Pre-existing. Never destroyed.
    Attached,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned => write!(f, "owned"),
            Self::Attached => write!(f, "attached"),
        }
    }
}

/// A named resource and its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Held {
    /// Resource name.
    pub name: String,
    /// Whether teardown may destroy it.
    pub provenance: Provenance,
}

/// A ready cluster and namespace.
#[derive(Clone)]
pub struct ClusterHandle {
    /// The compute cluster.
    pub cluster: Held,
    /// The namespace inside it.
    pub namespace: Held,
    workloads: Arc<dyn Workloads>,
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("cluster", &self.cluster)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl ClusterHandle {
    /// API access to the cluster.
    #[must_use]
    pub fn workloads(&self) -> &dyn Workloads {
        self.workloads.as_ref()
    }
}

/// Creates, attaches to and releases clusters.
pub struct ClusterManager {
    provider: Arc<dyn ClusterProvider>,
    connector: Arc<dyn Connector>,
}

impl ClusterManager {
    /// Create a manager over a cluster provider and a way to reach clusters.
    #[must_use]
    pub fn new(provider: Arc<dyn ClusterProvider>, connector: Arc<dyn Connector>) -> Self {
        Self {
            provider,
            connector,
        }
    }

    /// Bring the target cluster and namespace to the ready state.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::ClusterNotFound`] when an existing cluster or
    /// namespace was requested but is missing or its API cannot be reached, or
    /// [`DeployError::Provider`] when provisioning fails.
    pub async fn ensure(&self, target: &Target) -> Result<ClusterHandle, DeployError> {
        let (cluster, workloads) = if target.policy.existing_cluster {
            self.attach_cluster(&target.cluster_name).await?
        } else {
            let cluster = self.create_or_attach_cluster(target).await?;
            let workloads = self.connect(&cluster.name).await?;
            (cluster, workloads)
        };

        let namespace = ensure_namespace(workloads.as_ref(), target).await?;

        info!(
            cluster = %cluster.name,
            cluster_provenance = %cluster.provenance,
            namespace = %namespace.name,
            namespace_provenance = %namespace.provenance,
            "Cluster ready"
        );
        Ok(ClusterHandle {
            cluster,
            namespace,
            workloads,
        })
    }

    /// Find the target cluster for teardown. `Ok(None)` if it is gone or
    /// its deletion is already under way.
    ///
    /// Provenance follows the existing-resource switches: whatever this
    /// configuration would have created is owned.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Provider`] if the lookup or connection fails.
    pub async fn locate(&self, target: &Target) -> Result<Option<ClusterHandle>, DeployError> {
        let Some(found) = self.provider.find_cluster(&target.cluster_name).await? else {
            info!(cluster = %target.cluster_name, "Cluster already absent");
            return Ok(None);
        };
        if found.status == KubernetesClusterStatus::Deleting {
            info!(cluster = %found.name, "Cluster deletion already in progress");
            return Ok(None);
        }
        if !found.is_reachable() {
            warn!(
                cluster = %found.name,
                status = %found.status,
                "Cluster not reachable for teardown"
            );
            return Err(ProviderError::Kubernetes(format!(
                "cluster {} is {}",
                found.name, found.status
            ))
            .into());
        }

        let workloads = self.connect(&found.name).await?;
        Ok(Some(ClusterHandle {
            cluster: Held {
                name: found.name,
                provenance: owned_unless(target.policy.existing_cluster),
            },
            namespace: Held {
                name: target.namespace.clone(),
                provenance: namespace_provenance(target),
            },
            workloads,
        }))
    }

    /// Destroy what the handle owns: namespace first, then cluster.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Provider`] if a delete call fails. Resources
    /// that are already absent are not an error.
    pub async fn release(&self, handle: ClusterHandle) -> Result<(), DeployError> {
        match handle.namespace.provenance {
            Provenance::Owned => {
                let deleted = handle
                    .workloads
                    .delete_namespace(&handle.namespace.name)
                    .await?;
                if !deleted {
                    debug!(namespace = %handle.namespace.name, "Namespace already absent");
                }
            }
            Provenance::Attached => {
                debug!(namespace = %handle.namespace.name, "Keeping attached namespace");
            }
        }

        match handle.cluster.provenance {
            Provenance::Owned => {
                info!(cluster = %handle.cluster.name, "Deleting cluster");
                self.provider.delete_cluster(&handle.cluster.name).await?;
            }
            Provenance::Attached => {
                info!(cluster = %handle.cluster.name, "Keeping attached cluster");
            }
        }
        Ok(())
    }

    async fn attach_cluster(&self, name: &str) -> Result<(Held, Arc<dyn Workloads>), DeployError> {
        let found = self
            .provider
            .find_cluster(name)
            .await?
            .ok_or_else(|| DeployError::ClusterNotFound(name.to_string()))?;

        if !found.is_reachable() {
            return Err(DeployError::ClusterNotFound(format!(
                "{name} (status {})",
                found.status
            )));
        }

        let workloads = self.connect(&found.name).await.map_err(|e| {
            warn!(cluster = name, error = %e, "Existing cluster API unreachable");
            DeployError::ClusterNotFound(format!("{name} (unreachable: {e})"))
        })?;

        debug!(cluster = name, "Attached to existing cluster");
        Ok((
            Held {
                name: found.name,
                provenance: Provenance::Attached,
            },
            workloads,
        ))
    }

    async fn create_or_attach_cluster(&self, target: &Target) -> Result<Held, DeployError> {
        let name = &target.cluster_name;
        let Some(found) = self.provider.find_cluster(name).await? else {
            info!(cluster = %name, zone = %target.gke.zone, "Creating cluster");
            let created = self
                .provider
                .create_cluster(CreateClusterRequest {
                    name: name.clone(),
                    zone: target.gke.zone.clone(),
                    node_count: target.gke.node_count,
                    machine_type: target.gke.machine_type.clone(),
                })
                .await?;
            return Ok(Held {
                name: created.name,
                provenance: Provenance::Owned,
            });
        };

        match found.status {
            KubernetesClusterStatus::Running | KubernetesClusterStatus::Updating => {
                info!(cluster = %name, "Cluster already running; attaching");
            }
            KubernetesClusterStatus::Creating | KubernetesClusterStatus::Unknown => {
                info!(
                    cluster = %name,
                    status = %found.status,
                    "Cluster still provisioning; waiting"
                );
                self.provider
                    .wait_cluster_ready(name, PROVISIONING_WAIT_SECS)
                    .await?;
            }
            KubernetesClusterStatus::Deleting | KubernetesClusterStatus::Error => {
                return Err(ProviderError::Api {
                    status: 409,
                    message: format!("cluster {name} is {}", found.status),
                }
                .into());
            }
        }

        Ok(Held {
            name: found.name,
            provenance: Provenance::Attached,
        })
    }

    async fn connect(&self, name: &str) -> Result<Arc<dyn Workloads>, DeployError> {
        let kubeconfig = self.provider.get_kubeconfig(name).await?;
        Ok(self.connector.connect(&kubeconfig).await?)
    }
}

async fn ensure_namespace(workloads: &dyn Workloads, target: &Target) -> Result<Held, DeployError> {
    let name = target.namespace.clone();

    if is_default_namespace(&name) {
        return Ok(Held {
            name,
            provenance: Provenance::Attached,
        });
    }

    if target.policy.existing_namespace {
        if !workloads.namespace_exists(&name).await? {
            return Err(DeployError::ClusterNotFound(format!(
                "{}/{name}",
                target.cluster_name
            )));
        }
        return Ok(Held {
            name,
            provenance: Provenance::Attached,
        });
    }

    let provenance = if workloads.create_namespace(&name).await? {
        Provenance::Owned
    } else {
        Provenance::Attached
    };
    Ok(Held { name, provenance })
}

fn is_default_namespace(name: &str) -> bool {
    name == "default"
}

fn owned_unless(existing: bool) -> Provenance {
    if existing {
        Provenance::Attached
    } else {
        Provenance::Owned
    }
}

fn namespace_provenance(target: &Target) -> Provenance {
    if is_default_namespace(&target.namespace) {
        Provenance::Attached
    } else {
        owned_unless(target.policy.existing_namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GkeSettings, ResourcePolicy};

    fn target(namespace: &str, policy: ResourcePolicy) -> Target {
        Target {
            cluster_name: "demo1".into(),
            namespace: namespace.into(),
            hostname: "demo.example.org".into(),
            dns_zone: None,
            gke: GkeSettings {
                zone: "us-central1-a".into(),
                project: None,
                machine_type: "n1-standard-2".into(),
                node_count: 2,
            },
            policy,
            directory: None,
        }
    }

    #[test]
    fn test_default_namespace_is_never_owned() {
        let t = target("default", ResourcePolicy::default());
        assert_eq!(namespace_provenance(&t), Provenance::Attached);
    }

    #[test]
    fn test_teardown_provenance_follows_flags() {
        let t = target("jld", ResourcePolicy::default());
        assert_eq!(namespace_provenance(&t), Provenance::Owned);

        let t = target(
            "jld",
            ResourcePolicy {
                existing_cluster: true,
                existing_namespace: true,
            },
        );
        assert_eq!(namespace_provenance(&t), Provenance::Attached);
        assert_eq!(owned_unless(t.policy.existing_cluster), Provenance::Attached);
    }
}
