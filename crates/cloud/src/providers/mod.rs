//! Provider abstractions.
//!
//! This module defines the common traits and types for cluster and DNS providers.

pub mod aws;
pub mod command;
pub mod gcp;
mod traits;

pub use traits::{
    ClusterProvider, CreateClusterRequest, DnsProvider, DnsRecordType, KubernetesCluster,
    KubernetesClusterStatus, ProviderError,
};

// Re-export provider clients
pub use aws::Route53;
pub use gcp::Gke;
