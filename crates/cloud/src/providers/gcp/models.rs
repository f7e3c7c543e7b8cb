//! GKE API request and response models.

use serde::{Deserialize, Serialize};

/// GKE cluster information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GkeCluster {
    /// Cluster name.
    pub name: String,
    /// Zone/location.
    pub location: String,
    /// Cluster status (`PROVISIONING`, `RUNNING`, ...).
    pub status: String,
    /// Kubernetes master version.
    pub current_master_version: Option<String>,
    /// API server endpoint.
    pub endpoint: Option<String>,
    /// Master authentication data.
    pub master_auth: Option<MasterAuth>,
    /// Create time.
    pub create_time: Option<String>,
    /// Current node count (total across all pools).
    pub current_node_count: Option<i32>,
}

/// Cluster master authentication.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterAuth {
    /// Base64-encoded public certificate of the cluster root of trust.
    pub cluster_ca_certificate: Option<String>,
}

/// Create cluster request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    /// Cluster definition.
    pub cluster: ClusterDefinition,
}

/// Cluster definition for creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDefinition {
    /// Cluster name.
    pub name: String,
    /// Node pools.
    pub node_pools: Vec<NodePoolDefinition>,
    /// Resource labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_labels: Option<std::collections::HashMap<String, String>>,
}

/// Node pool definition.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolDefinition {
    /// Pool name.
    pub name: String,
    /// Initial node count.
    pub initial_node_count: i32,
    /// Node configuration.
    pub config: NodeConfigDefinition,
}

/// Node configuration definition.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigDefinition {
    /// Machine type.
    pub machine_type: String,
    /// Disk size in GB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<i32>,
    /// Image type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
}

/// Long-running operation returned by create/delete.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name.
    pub name: String,
    /// Operation type (`CREATE_CLUSTER`, `DELETE_CLUSTER`).
    pub operation_type: Option<String>,
    /// Operation status.
    pub status: Option<String>,
}
