//! Deploy and undeploy step sequencing.
//!
//! Steps are reported to the operator as `[n/total]` progress and are carried
//! on errors so a failed run says exactly where it stopped.

use serde::{Deserialize, Serialize};

/// Ordered deploy steps. Each is a hard dependency on the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStep {
    /// Loading config, pre-flight checks, template validation.
    ValidatingConfig,
    /// Creating or attaching to the cluster and namespace.
    EnsuringCluster,
    /// Rendering manifests (or loading a pre-rendered directory).
    RenderingManifests,
    /// Applying manifests to the namespace.
    ApplyingManifests,
    /// Polling for the ingress external address.
    WaitingForAddress,
    /// Pointing the hostname at the ingress.
    PublishingDns,
}

impl DeployStep {
    /// All steps, in execution order.
    pub const ALL: [Self; 6] = [
        Self::ValidatingConfig,
        Self::EnsuringCluster,
        Self::RenderingManifests,
        Self::ApplyingManifests,
        Self::WaitingForAddress,
        Self::PublishingDns,
    ];

    /// Total number of steps.
    pub const TOTAL_STEPS: u8 = 6;

    /// Get a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::ValidatingConfig => "Validating configuration",
            Self::EnsuringCluster => "Ensuring cluster and namespace",
            Self::RenderingManifests => "Rendering manifests",
            Self::ApplyingManifests => "Applying manifests",
            Self::WaitingForAddress => "Waiting for ingress address",
            Self::PublishingDns => "Publishing DNS record",
        }
    }

    /// Get the step number for progress display.
    #[must_use]
    pub fn step_number(&self) -> u8 {
        match self {
            Self::ValidatingConfig => 1,
            Self::EnsuringCluster => 2,
            Self::RenderingManifests => 3,
            Self::ApplyingManifests => 4,
            Self::WaitingForAddress => 5,
            Self::PublishingDns => 6,
        }
    }

    /// Whether a failure at this step may leave cloud state behind.
    #[must_use]
    pub fn may_leave_partial_state(&self) -> bool {
        *self >= Self::EnsuringCluster
    }
}

impl std::fmt::Display for DeployStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Undeploy steps. Each is attempted regardless of earlier failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndeployStep {
    /// Removing the DNS record.
    RemovingDns,
    /// Deleting applied manifests.
    DeletingManifests,
    /// Releasing namespace and cluster.
    ReleasingCluster,
}

impl UndeployStep {
    /// Total number of steps.
    pub const TOTAL_STEPS: u8 = 3;

    /// Get a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::RemovingDns => "Removing DNS record",
            Self::DeletingManifests => "Deleting manifests",
            Self::ReleasingCluster => "Releasing namespace and cluster",
        }
    }

    /// Get the step number for progress display.
    #[must_use]
    pub fn step_number(&self) -> u8 {
        match self {
            Self::RemovingDns => 1,
            Self::DeletingManifests => 2,
            Self::ReleasingCluster => 3,
        }
    }
}

impl std::fmt::Display for UndeployStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_steps_are_numbered_in_order() {
        let numbers: Vec<u8> = DeployStep::ALL.iter().map(DeployStep::step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(
            DeployStep::ALL.len(),
            usize::from(DeployStep::TOTAL_STEPS)
        );
    }

    #[test]
    fn test_partial_state_boundary() {
        assert!(!DeployStep::ValidatingConfig.may_leave_partial_state());
        assert!(DeployStep::EnsuringCluster.may_leave_partial_state());
        assert!(DeployStep::RenderingManifests.may_leave_partial_state());
        assert!(DeployStep::PublishingDns.may_leave_partial_state());
    }

    #[test]
    fn test_display_uses_description() {
        assert_eq!(UndeployStep::RemovingDns.to_string(), "Removing DNS record");
        assert_eq!(
            DeployStep::WaitingForAddress.to_string(),
            "Waiting for ingress address"
        );
    }
}
