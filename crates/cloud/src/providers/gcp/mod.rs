//! GCP (Google Cloud Platform) provider.
//!
//! Implements [`ClusterProvider`](super::ClusterProvider) for Google
//! Kubernetes Engine zonal clusters.
//!
//! ## Authentication
//!
//! The REST client uses a bearer token from `gcloud auth print-access-token`.
//! Generated kubeconfigs authenticate through `gke-gcloud-auth-plugin`, so the
//! operator's own kubectl contexts are never modified.

mod client;
mod models;

pub use client::Gke;
pub use models::*;
