//! Provider traits and common types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An external command could not be run or exited unsuccessfully.
    #[error("`{program}` failed: {message}")]
    Command { program: String, message: String },

    /// Kubernetes API server rejected or failed a request.
    #[error("Kubernetes error: {0}")]
    Kubernetes(String),
}

// ============================================================================
// Kubernetes cluster types
// ============================================================================

/// Kubernetes cluster status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KubernetesClusterStatus {
    /// Cluster is being created.
    Creating,
    /// Cluster is active and running.
    Running,
    /// Cluster is being updated.
    Updating,
    /// Cluster is being deleted.
    Deleting,
    /// Cluster is in an error state.
    Error,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for KubernetesClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Updating => write!(f, "updating"),
            Self::Deleting => write!(f, "deleting"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A managed Kubernetes cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesCluster {
    /// Cluster name.
    pub name: String,
    /// Current status.
    pub status: KubernetesClusterStatus,
    /// Kubernetes version.
    pub version: String,
    /// Zone or region the cluster lives in.
    pub location: String,
    /// API server endpoint (host or IP, no scheme).
    pub endpoint: Option<String>,
    /// Base64-encoded cluster CA certificate.
    pub ca_certificate: Option<String>,
    /// Number of nodes.
    pub node_count: i32,
    /// When the cluster was created.
    pub created_at: Option<DateTime<Utc>>,
}

impl KubernetesCluster {
    /// Whether the control plane can accept API calls.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        matches!(
            self.status,
            KubernetesClusterStatus::Running | KubernetesClusterStatus::Updating
        ) && self.endpoint.is_some()
    }
}

/// Request to create a new Kubernetes cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    /// Cluster name.
    pub name: String,
    /// Zone to deploy in.
    pub zone: String,
    /// Number of nodes.
    pub node_count: i32,
    /// Node machine type.
    pub machine_type: String,
}

/// Trait for managed Kubernetes providers.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Look a cluster up by name. `Ok(None)` when it does not exist.
    async fn find_cluster(&self, name: &str) -> Result<Option<KubernetesCluster>, ProviderError>;

    /// Create a cluster and return once it is running.
    async fn create_cluster(
        &self,
        req: CreateClusterRequest,
    ) -> Result<KubernetesCluster, ProviderError>;

    /// Wait for a cluster that is still provisioning to become running.
    async fn wait_cluster_ready(
        &self,
        name: &str,
        timeout_secs: u64,
    ) -> Result<KubernetesCluster, ProviderError>;

    /// Delete a cluster. Deleting an absent cluster succeeds.
    async fn delete_cluster(&self, name: &str) -> Result<(), ProviderError>;

    /// Produce a kubeconfig document granting access to the cluster.
    async fn get_kubeconfig(&self, name: &str) -> Result<String, ProviderError>;
}

// ============================================================================
// DNS types
// ============================================================================

/// Record types the deployer publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    /// IPv4 address record.
    A,
    /// IPv6 address record.
    Aaaa,
    /// Canonical name record.
    Cname,
}

impl std::fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Aaaa => write!(f, "AAAA"),
            Self::Cname => write!(f, "CNAME"),
        }
    }
}

/// Trait for hosted DNS providers.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Find the hosted zone id serving `hostname`.
    ///
    /// With `zone_override` the zone is looked up by that name instead of the
    /// hostname's parent domain.
    async fn resolve_zone(
        &self,
        hostname: &str,
        zone_override: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// Create or replace the record for `name`.
    async fn upsert_record(
        &self,
        zone_id: &str,
        name: &str,
        record_type: DnsRecordType,
        value: &str,
        ttl: u32,
    ) -> Result<(), ProviderError>;

    /// Delete every deployer-managed record for `name`.
    ///
    /// Returns `false` when there was nothing to delete.
    async fn delete_record(&self, zone_id: &str, name: &str) -> Result<bool, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(status: KubernetesClusterStatus, endpoint: Option<&str>) -> KubernetesCluster {
        KubernetesCluster {
            name: "demo1".to_string(),
            status,
            version: "1.31".to_string(),
            location: "us-central1-a".to_string(),
            endpoint: endpoint.map(ToString::to_string),
            ca_certificate: None,
            node_count: 2,
            created_at: None,
        }
    }

    #[test]
    fn test_reachable_requires_running_and_endpoint() {
        assert!(cluster(KubernetesClusterStatus::Running, Some("10.0.0.1")).is_reachable());
        assert!(!cluster(KubernetesClusterStatus::Running, None).is_reachable());
        assert!(!cluster(KubernetesClusterStatus::Creating, Some("10.0.0.1")).is_reachable());
    }

    #[test]
    fn test_record_type_display() {
        assert_eq!(DnsRecordType::A.to_string(), "A");
        assert_eq!(DnsRecordType::Cname.to_string(), "CNAME");
    }
}
