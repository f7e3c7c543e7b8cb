//! Cloud collaborators for the JupyterLab Demo deployer.
//!
//! This crate wraps the two external provisioning services a deployment
//! depends on:
//!
//! - **GKE** - Google Kubernetes Engine, for the compute cluster
//! - **Route 53** - AWS hosted DNS, for the public hostname
//!
//! Both are exposed behind traits ([`ClusterProvider`], [`DnsProvider`]) so
//! the orchestration core can be driven against fakes in tests.

pub mod providers;

pub use providers::{
    aws, gcp, ClusterProvider, CreateClusterRequest, DnsProvider, DnsRecordType,
    KubernetesCluster, KubernetesClusterStatus, ProviderError,
};
