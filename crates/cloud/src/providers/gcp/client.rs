//! GKE API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    ClusterDefinition, CreateClusterRequest as GkeCreateRequest, GkeCluster,
    NodeConfigDefinition, NodePoolDefinition, Operation,
};
use crate::providers::command::run_captured;
use crate::providers::traits::{
    ClusterProvider, CreateClusterRequest, KubernetesCluster, KubernetesClusterStatus,
    ProviderError,
};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Polling interval when waiting for a cluster.
const POLL_INTERVAL_SECS: u64 = 15;

/// Upper bound on cluster creation.
const CREATE_TIMEOUT_SECS: u64 = 1800;

/// GKE API base URL.
const GKE_API_BASE: &str = "https://container.googleapis.com";

/// GKE cluster provider.
#[derive(Clone)]
pub struct Gke {
    /// HTTP client.
    client: Client,
    /// API base URL (overridable for tests).
    base_url: String,
    /// Project ID.
    project_id: String,
    /// `OAuth2` access token.
    access_token: String,
    /// Zone clusters are created in.
    zone: String,
    /// Poll interval used while waiting for a cluster.
    poll_interval: Duration,
}

impl Gke {
    /// Create a new GKE provider.
    ///
    /// # Arguments
    /// * `project_id` - GCP project ID
    /// * `access_token` - `OAuth2` access token
    /// * `zone` - Zone (e.g., "us-central1-a")
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        project_id: impl Into<String>,
        access_token: impl Into<String>,
        zone: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(ProviderError::Http)?;

        Ok(Self {
            client,
            base_url: GKE_API_BASE.to_string(),
            project_id: project_id.into(),
            access_token: access_token.into(),
            zone: zone.into(),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
        })
    }

    /// Create a provider authenticated as the active gcloud account.
    ///
    /// When `project_id` is `None` the active gcloud project is used.
    ///
    /// # Errors
    /// Returns error if gcloud is not logged in or has no project configured.
    pub async fn from_gcloud(
        project_id: Option<String>,
        zone: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let token = run_captured("gcloud", &["auth", "print-access-token"])
            .await
            .map_err(|e| {
                ProviderError::Auth(format!("gcloud not logged in; try 'gcloud init' ({e})"))
            })?;

        let project_id = match project_id {
            Some(p) => p,
            None => run_captured("gcloud", &["config", "get-value", "project"]).await?,
        };
        if project_id.is_empty() || project_id == "(unset)" {
            return Err(ProviderError::Config(
                "no GCP project configured; set 'gke_project'".to_string(),
            ));
        }

        Self::new(project_id, token, zone)
    }

    /// Point the client at a different API base (used by tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the cluster poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn clusters_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/clusters",
            self.base_url, self.project_id, self.zone
        )
    }

    fn cluster_url(&self, name: &str) -> String {
        format!("{}/{name}", self.clusters_url())
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request.
    async fn post<T, B>(&self, url: &str, body: &B) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated DELETE request. A 404 counts as success.
    async fn delete(&self, url: &str) -> Result<(), ProviderError> {
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Handle API response.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ProviderError::Auth(text))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Convert GKE cluster to our type.
    fn to_cluster(cluster: &GkeCluster) -> KubernetesCluster {
        let status = match cluster.status.as_str() {
            "PROVISIONING" => KubernetesClusterStatus::Creating,
            "RUNNING" => KubernetesClusterStatus::Running,
            "RECONCILING" => KubernetesClusterStatus::Updating,
            "STOPPING" => KubernetesClusterStatus::Deleting,
            "ERROR" | "DEGRADED" => KubernetesClusterStatus::Error,
            _ => KubernetesClusterStatus::Unknown,
        };

        KubernetesCluster {
            name: cluster.name.clone(),
            status,
            version: cluster.current_master_version.clone().unwrap_or_default(),
            location: cluster.location.clone(),
            endpoint: cluster.endpoint.clone(),
            ca_certificate: cluster
                .master_auth
                .as_ref()
                .and_then(|m| m.cluster_ca_certificate.clone()),
            node_count: cluster.current_node_count.unwrap_or(0),
            created_at: cluster
                .create_time
                .as_ref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
        }
    }

    /// Name of the kubeconfig context, in the form gcloud itself uses.
    fn context_name(&self, cluster: &str) -> String {
        format!("gke_{}_{}_{cluster}", self.project_id, self.zone)
    }
}

#[async_trait]
impl ClusterProvider for Gke {
    async fn find_cluster(&self, name: &str) -> Result<Option<KubernetesCluster>, ProviderError> {
        match self.get::<GkeCluster>(&self.cluster_url(name)).await {
            Ok(cluster) => Ok(Some(Self::to_cluster(&cluster))),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_cluster(
        &self,
        req: CreateClusterRequest,
    ) -> Result<KubernetesCluster, ProviderError> {
        info!(
            name = %req.name,
            zone = %req.zone,
            nodes = req.node_count,
            machine_type = %req.machine_type,
            "Creating GKE cluster"
        );

        let body = GkeCreateRequest {
            cluster: ClusterDefinition {
                name: req.name.clone(),
                node_pools: vec![NodePoolDefinition {
                    name: "default-pool".to_string(),
                    initial_node_count: req.node_count,
                    config: NodeConfigDefinition {
                        machine_type: req.machine_type,
                        disk_size_gb: Some(100),
                        image_type: Some("COS_CONTAINERD".to_string()),
                    },
                }],
                resource_labels: Some(
                    [("managed-by".to_string(), "jld-deploy".to_string())]
                        .into_iter()
                        .collect(),
                ),
            },
        };

        let operation: Operation = self.post(&self.clusters_url(), &body).await?;
        info!(operation = %operation.name, "GKE cluster creation initiated");

        self.wait_cluster_ready(&req.name, CREATE_TIMEOUT_SECS).await
    }

    async fn wait_cluster_ready(
        &self,
        name: &str,
        timeout_secs: u64,
    ) -> Result<KubernetesCluster, ProviderError> {
        info!(cluster = %name, timeout_secs, "Waiting for cluster to be ready");

        let start = std::time::Instant::now();
        let timeout = Duration::from_secs(timeout_secs);

        loop {
            let cluster = self
                .find_cluster(name)
                .await?
                .ok_or_else(|| ProviderError::NotFound(format!("cluster {name}")))?;

            debug!(
                cluster = %name,
                status = %cluster.status,
                elapsed_secs = start.elapsed().as_secs(),
                "Polling cluster status"
            );

            if cluster.status == KubernetesClusterStatus::Running {
                info!(cluster = %name, "Cluster is ready");
                return Ok(cluster);
            }

            if cluster.status == KubernetesClusterStatus::Error {
                return Err(ProviderError::Api {
                    status: 500,
                    message: format!("cluster {name} entered error state"),
                });
            }

            if start.elapsed() > timeout {
                return Err(ProviderError::Timeout(timeout_secs));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), ProviderError> {
        info!(cluster = %name, "Deleting GKE cluster");
        self.delete(&self.cluster_url(name)).await?;
        info!(cluster = %name, "GKE cluster deletion initiated");
        Ok(())
    }

    async fn get_kubeconfig(&self, name: &str) -> Result<String, ProviderError> {
        let cluster = self
            .find_cluster(name)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("cluster {name}")))?;

        let endpoint = cluster.endpoint.ok_or_else(|| {
            ProviderError::Config(format!("cluster {name} has no endpoint yet"))
        })?;
        let ca = cluster.ca_certificate.ok_or_else(|| {
            ProviderError::Config(format!("cluster {name} has no CA certificate"))
        })?;

        let context = self.context_name(name);
        let kubeconfig = format!(
            r"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: {ca}
    server: https://{endpoint}
  name: {context}
contexts:
- context:
    cluster: {context}
    user: {context}
  name: {context}
current-context: {context}
users:
- name: {context}
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: gke-gcloud-auth-plugin
      provideClusterInfo: true
      interactiveMode: Never
"
        );

        Ok(kubeconfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CLUSTER_PATH: &str = "/v1/projects/sqre/locations/us-central1-a/clusters/demo1";

    fn provider(server: &MockServer) -> Gke {
        Gke::new("sqre", "token", "us-central1-a")
            .unwrap()
            .with_base_url(server.uri())
            .with_poll_interval(Duration::from_millis(10))
    }

    fn cluster_body(status: &str) -> serde_json::Value {
        serde_json::json!({
            "name": "demo1",
            "location": "us-central1-a",
            "status": status,
            "currentMasterVersion": "1.31.1-gke.100",
            "endpoint": "34.1.2.3",
            "masterAuth": { "clusterCaCertificate": "Q0EK" },
            "currentNodeCount": 2
        })
    }

    #[test]
    fn test_status_mapping() {
        let gke: GkeCluster = serde_json::from_value(cluster_body("PROVISIONING")).unwrap();
        assert_eq!(Gke::to_cluster(&gke).status, KubernetesClusterStatus::Creating);

        let gke: GkeCluster = serde_json::from_value(cluster_body("RUNNING")).unwrap();
        let converted = Gke::to_cluster(&gke);
        assert_eq!(converted.status, KubernetesClusterStatus::Running);
        assert_eq!(converted.ca_certificate.as_deref(), Some("Q0EK"));
        assert_eq!(converted.node_count, 2);
    }

    #[tokio::test]
    async fn test_find_cluster_absent_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CLUSTER_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let found = provider(&server).find_cluster("demo1").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_find_cluster_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CLUSTER_PATH))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body("RUNNING")))
            .mount(&server)
            .await;

        let found = provider(&server).find_cluster("demo1").await.unwrap().unwrap();
        assert!(found.is_reachable());
    }

    #[tokio::test]
    async fn test_delete_absent_cluster_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(CLUSTER_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        provider(&server).delete_cluster("demo1").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_cluster_waits_until_running() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/sqre/locations/us-central1-a/clusters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "operation-1",
                "operationType": "CREATE_CLUSTER",
                "status": "RUNNING"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(CLUSTER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body("PROVISIONING")))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(CLUSTER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body("RUNNING")))
            .mount(&server)
            .await;

        let cluster = provider(&server)
            .create_cluster(CreateClusterRequest {
                name: "demo1".to_string(),
                zone: "us-central1-a".to_string(),
                node_count: 2,
                machine_type: "n1-standard-2".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(cluster.status, KubernetesClusterStatus::Running);
    }

    #[tokio::test]
    async fn test_kubeconfig_uses_auth_plugin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CLUSTER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body("RUNNING")))
            .mount(&server)
            .await;

        let kubeconfig = provider(&server).get_kubeconfig("demo1").await.unwrap();
        assert!(kubeconfig.contains("server: https://34.1.2.3"));
        assert!(kubeconfig.contains("certificate-authority-data: Q0EK"));
        assert!(kubeconfig.contains("command: gke-gcloud-auth-plugin"));
        assert!(kubeconfig.contains("current-context: gke_sqre_us-central1-a_demo1"));
    }
}
