//! Kubernetes operations inside the demo cluster.
//!
//! Manifests are applied with server-side apply through the dynamic API, so
//! any kind the operator adds to a pre-rendered directory works as long as
//! the cluster serves it.

use std::sync::Arc;

use async_trait::async_trait;
use jld_cloud::ProviderError;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{pinned_kind, Scope};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::render::{Manifest, ResourceRef};

/// Field manager recorded on applied objects.
const FIELD_MANAGER: &str = "jld-deploy";

/// Container-orchestration calls the orchestrator needs.
#[async_trait]
pub trait Workloads: Send + Sync {
    /// Whether the namespace exists.
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ProviderError>;

    /// Create the namespace. `Ok(false)` if it already existed.
    async fn create_namespace(&self, namespace: &str) -> Result<bool, ProviderError>;

    /// Delete the namespace. `Ok(false)` if it was already gone.
    async fn delete_namespace(&self, namespace: &str) -> Result<bool, ProviderError>;

    /// Create or update the object described by `manifest`.
    async fn apply(&self, namespace: &str, manifest: &Manifest) -> Result<(), ProviderError>;

    /// Delete an object. `Ok(false)` if it was already gone.
    async fn delete(&self, namespace: &str, resource: &ResourceRef) -> Result<bool, ProviderError>;

    /// External address of a load balancer service, once assigned.
    async fn ingress_address(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<String>, ProviderError>;
}

/// Builds a [`Workloads`] handle from cluster credentials.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect using a kubeconfig document.
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn Workloads>, ProviderError>;
}

/// Connects with a real Kubernetes client.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeConnector;

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn Workloads>, ProviderError> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| ProviderError::Config(format!("generated kubeconfig is invalid: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ProviderError::Config(format!("cannot use kubeconfig: {e}")))?;
        let client = Client::try_from(config).map_err(kube_error)?;
        Ok(Arc::new(KubeWorkloads::new(client)))
    }
}

/// [`Workloads`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    /// Wrap a client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn dynamic_api(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
    ) -> Result<Api<DynamicObject>, ProviderError> {
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, caps) = pinned_kind(&self.client, &gvk)
            .await
            .map_err(kube_error)?;

        Ok(if caps.scope == Scope::Cluster {
            Api::all_with(self.client.clone(), &resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        })
    }
}

#[async_trait]
impl Workloads for KubeWorkloads {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ProviderError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let found = api.get_opt(namespace).await.map_err(kube_error)?;
        Ok(found.is_some())
    }

    async fn create_namespace(&self, namespace: &str) -> Result<bool, ProviderError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                labels: Some(
                    [(
                        "app.kubernetes.io/managed-by".to_string(),
                        FIELD_MANAGER.to_string(),
                    )]
                    .into(),
                ),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };

        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace, "Created namespace");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace, "Namespace already exists");
                Ok(false)
            }
            Err(e) => Err(kube_error(e)),
        }
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool, ProviderError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(namespace, &DeleteParams::background()).await {
            Ok(_) => {
                info!(namespace, "Deleted namespace");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(kube_error(e)),
        }
    }

    async fn apply(&self, namespace: &str, manifest: &Manifest) -> Result<(), ProviderError> {
        let object: DynamicObject = serde_yaml::from_str(&manifest.contents).map_err(|e| {
            ProviderError::Kubernetes(format!("{}: {e}", manifest.path.display()))
        })?;
        let types = object.types.clone().ok_or_else(|| {
            ProviderError::Kubernetes(format!(
                "{}: missing apiVersion or kind",
                manifest.path.display()
            ))
        })?;
        let name = object.metadata.name.clone().ok_or_else(|| {
            ProviderError::Kubernetes(format!("{}: missing metadata.name", manifest.path.display()))
        })?;

        let api = self
            .dynamic_api(namespace, &types.api_version, &types.kind)
            .await?;
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object),
        )
        .await
        .map_err(kube_error)?;

        debug!(namespace, kind = %types.kind, name = %name, "Applied manifest");
        Ok(())
    }

    async fn delete(&self, namespace: &str, resource: &ResourceRef) -> Result<bool, ProviderError> {
        let api = self
            .dynamic_api(namespace, &resource.api_version, &resource.kind)
            .await?;
        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(namespace, %resource, "Deleted object");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(kube_error(e)),
        }
    }

    async fn ingress_address(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<String>, ProviderError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api.get_opt(service).await.map_err(kube_error)?;
        Ok(svc.as_ref().and_then(load_balancer_address))
    }
}

/// First address a load balancer service reports, IP preferred.
fn load_balancer_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress
        .ip
        .clone()
        .or_else(|| ingress.hostname.clone())
        .filter(|a| !a.is_empty())
}

/// `apps/v1` → (`apps`, `v1`); `v1` → (``, `v1`).
fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

fn kube_error(e: kube::Error) -> ProviderError {
    match e {
        kube::Error::Api(ae) => ProviderError::Api {
            status: ae.code,
            message: ae.message,
        },
        other => ProviderError::Kubernetes(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn service_with(ingress: Vec<LoadBalancerIngress>) -> Service {
        Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(ingress),
                }),
                ..ServiceStatus::default()
            }),
            ..Service::default()
        }
    }

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
    }

    #[test]
    fn test_pending_service_has_no_address() {
        assert_eq!(load_balancer_address(&Service::default()), None);
        assert_eq!(load_balancer_address(&service_with(vec![])), None);
    }

    #[test]
    fn test_ip_preferred_over_hostname() {
        let svc = service_with(vec![LoadBalancerIngress {
            ip: Some("35.1.2.3".into()),
            hostname: Some("lb.example.net".into()),
            ..LoadBalancerIngress::default()
        }]);
        assert_eq!(load_balancer_address(&svc).as_deref(), Some("35.1.2.3"));

        let svc = service_with(vec![LoadBalancerIngress {
            hostname: Some("lb.example.net".into()),
            ..LoadBalancerIngress::default()
        }]);
        assert_eq!(load_balancer_address(&svc).as_deref(), Some("lb.example.net"));
    }
}
