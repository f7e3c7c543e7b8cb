//! Deploy the JupyterLab Demo to Google Kubernetes Engine.
//!
//! A deployment is a GKE cluster, a namespace in it, a set of manifests
//! rendered from the operator's configuration, and a Route 53 record pointing
//! the public hostname at the ingress. [`Orchestrator`] sequences the
//! pieces; undeploy reverses them and is safe to repeat.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod dns;
pub mod error;
pub mod orchestrator;
pub mod render;
pub mod step;
pub mod ui;
pub mod workloads;

pub use cluster::{ClusterHandle, ClusterManager, Held, Provenance};
pub use config::{DeploymentConfig, Flags, LoggingSettings, ResourcePolicy, Target};
pub use dns::DnsManager;
pub use error::{DeployError, TeardownFailure};
pub use orchestrator::{render_only, Collaborators, DeployOutcome, Orchestrator};
pub use render::{Component, ManifestRenderer, RenderedManifestSet};
pub use step::{DeployStep, UndeployStep};
