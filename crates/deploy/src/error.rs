//! Error taxonomy for deploy and undeploy.

use std::path::PathBuf;

use jld_cloud::ProviderError;
use thiserror::Error;

use crate::step::{DeployStep, UndeployStep};

/// Everything that can stop a deploy, render or undeploy.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Malformed or missing input. Raised before any side effect.
    #[error("invalid `{field}`: {reason}")]
    Config { field: String, reason: String },

    /// A manifest template cannot be resolved.
    #[error("template `{template}`: {reason}")]
    Template { template: String, reason: String },

    /// Attaching to an existing cluster or namespace failed.
    #[error("cluster not reachable: {0}")]
    ClusterNotFound(String),

    /// The ingress never reported an external address.
    #[error("service {service} had no external address after {waited_secs}s")]
    ProvisionTimeout { service: String, waited_secs: u64 },

    /// A collaborator API call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Reading or writing the rendered manifest directory failed.
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A deploy step that may have changed cloud state failed.
    #[error(
        "deploy failed at step {}/{} ({step}): {source}",
        .step.step_number(),
        DeployStep::TOTAL_STEPS
    )]
    StepFailed {
        step: DeployStep,
        #[source]
        source: Box<DeployError>,
    },

    /// One or more undeploy steps failed.
    #[error("undeploy incomplete: {}", summarize(.0))]
    Teardown(Vec<TeardownFailure>),
}

/// A failed undeploy step.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Step that failed.
    pub step: UndeployStep,
    /// What went wrong.
    pub error: DeployError,
}

fn summarize(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}: {}", f.step, f.error.kind(), f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DeployError {
    /// Build a [`DeployError::Config`] for `field`.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`DeployError::Template`] for `template`.
    pub fn template(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`DeployError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach the step a failure happened in.
    #[must_use]
    pub fn at(self, step: DeployStep) -> Self {
        Self::StepFailed {
            step,
            source: Box::new(self),
        }
    }

    /// Name of the error kind, as printed to the operator.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "ConfigError",
            Self::Template { .. } => "TemplateError",
            Self::ClusterNotFound(_) => "ClusterNotFoundError",
            Self::ProvisionTimeout { .. } => "ProvisionTimeoutError",
            Self::Provider(_) => "ProviderError",
            Self::Io { .. } => "IoError",
            Self::StepFailed { source, .. } => source.kind(),
            Self::Teardown(_) => "TeardownError",
        }
    }

    /// The step a deploy failure is attributed to, if any.
    #[must_use]
    pub fn failed_step(&self) -> Option<DeployStep> {
        match self {
            Self::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }
}
