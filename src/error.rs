//! Error types for clusterforge operations.
//!
//! Defines comprehensive error types for all major subsystems:
//! - Environment and external-tool resolution
//! - Cluster lifecycle (create/verify/delete)
//! - Manifest application
//! - Image distribution into cluster nodes
//! - Staged rollouts
//! - Synthetic-age annotation

use thiserror::Error;

/// Errors that can occur while validating the host environment.
#[derive(Debug, Error)]
pub enum EnvError {
    /// One or more required external tools are absent from PATH.
    ///
    /// Aggregated across all probes so a single run reports every missing
    /// tool at once instead of failing on the first.
    #[error("Missing required tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("No supported container runtime found (tried podman, docker)")]
    NoRuntime,

    #[error("Unsupported container runtime '{0}': expected 'podman' or 'docker'")]
    UnsupportedRuntime(String),
}

/// Errors that can occur during cluster lifecycle operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to create cluster '{name}': {stderr}")]
    CreateFailed { name: String, stderr: String },

    /// Delete failed for a reason other than "cluster not found".
    ///
    /// Reported but must not block cleanup of other resources.
    #[error("Failed to delete cluster '{name}': {stderr}")]
    DeleteFailed { name: String, stderr: String },

    #[error("Cluster '{name}' control plane is not reachable: {stderr}")]
    ControlPlaneUnreachable { name: String, stderr: String },

    #[error("Credentials file not found at '{0}'")]
    CredentialsMissing(String),

    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("Failed to render cluster config: {0}")]
    ConfigRender(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while applying workload manifests.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Manifest path '{0}' does not exist")]
    ManifestNotFound(String),

    #[error("Manifest directory '{0}' contains no YAML files")]
    EmptyManifestDir(String),

    #[error("Failed to apply manifest '{path}': {stderr}")]
    ApplyFailed { path: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the image distribution pipeline.
#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("Failed to pull image '{image}': {stderr}")]
    PullFailed { image: String, stderr: String },

    #[error("Failed to tag image '{source_image}' as '{target}': {stderr}")]
    TagFailed {
        source_image: String,
        target: String,
        stderr: String,
    },

    #[error("Failed to save image '{image}' to archive: {stderr}")]
    SaveFailed { image: String, stderr: String },

    #[error("Failed to load archive into node '{node}': {stderr}")]
    LoadFailed { node: String, stderr: String },

    #[error("Failed to list nodes for cluster '{cluster}': {stderr}")]
    NodeListFailed { cluster: String, stderr: String },

    #[error("Cluster '{0}' has no nodes to load images into")]
    NoNodes(String),

    /// Post-load verification found a node whose local image store is
    /// missing one of the distributed images. Partial distribution must be
    /// detectable, never silently accepted.
    #[error("Image '{image}' is missing from node '{node}' after distribution")]
    MissingOnNode { node: String, image: String },

    #[error("Failed to query image inventory on node '{node}': {stderr}")]
    InventoryFailed { node: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during a staged rollout.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// A rollout step failed or timed out. Carries the full diagnostic
    /// bundle collected at failure time; remaining steps are aborted.
    #[error("Rollout step '{version}' failed: {reason}\n{diagnostics}")]
    StepFailed {
        version: String,
        reason: String,
        diagnostics: String,
    },

    #[error("Helm upgrade for release '{release}' failed: {stderr}")]
    UpgradeFailed { release: String, stderr: String },

    #[error("Failed to annotate workload '{workload}': {stderr}")]
    AnnotateFailed { workload: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while applying synthetic-age annotations.
#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("Failed to patch deployment '{namespace}/{name}': {stderr}")]
    PatchFailed {
        namespace: String,
        name: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
