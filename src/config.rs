//! Harness configuration.
//!
//! The original shell scripts shared state through exported environment
//! variables (`KUBECONFIG`, ad-hoc globals). Here every knob lives in an
//! explicit [`HarnessConfig`] value threaded through each call, so repeated
//! or interleaved invocations cannot cross-contaminate.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the workspace where per-cluster credentials files live.
pub const CLUSTER_CONFIG_DIR: &str = "cluster-configs";

/// Default host port mapped to the cluster's ingress.
pub const DEFAULT_PORT: u16 = 8080;

/// Default pause after creating a cluster before verifying it.
pub const DEFAULT_INTER_UNIT_DELAY: Duration = Duration::from_secs(5);

/// Default pause between provisioning batches.
pub const DEFAULT_INTER_BATCH_DELAY: Duration = Duration::from_secs(30);

/// Default deadline for kube-system pods to become Ready during verification.
pub const DEFAULT_SYSTEM_POD_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration threaded through every orchestrator call.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Workspace directory holding generated state (credentials files).
    pub workspace: PathBuf,
    /// Host port for the cluster's mapped ingress.
    pub port: u16,
    /// Explicit runtime selection ("podman"/"docker"), if any.
    pub runtime_override: Option<String>,
    /// Deadline for kube-system pods during cluster verification.
    pub system_pod_timeout: Duration,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            port: DEFAULT_PORT,
            runtime_override: None,
            system_pod_timeout: DEFAULT_SYSTEM_POD_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl HarnessConfig {
    /// Creates a configuration rooted at the given workspace directory.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Default::default()
        }
    }

    /// Sets the ingress port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Forces a specific container runtime instead of probing.
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime_override = Some(runtime.into());
        self
    }

    /// Sets the kube-system readiness deadline.
    pub fn with_system_pod_timeout(mut self, timeout: Duration) -> Self {
        self.system_pod_timeout = timeout;
        self
    }

    /// Directory holding per-cluster credentials files.
    pub fn credentials_dir(&self) -> PathBuf {
        self.workspace.join(CLUSTER_CONFIG_DIR)
    }

    /// Deterministic credentials path for a cluster name:
    /// `{workspace}/cluster-configs/{name}-config`.
    pub fn credentials_path(&self, name: &str) -> PathBuf {
        self.credentials_dir().join(format!("{name}-config"))
    }

    /// Generated kind cluster-config path for a cluster name:
    /// `{workspace}/cluster-configs/{name}-kind.yaml`.
    pub fn kind_config_path(&self, name: &str) -> PathBuf {
        self.credentials_dir().join(format!("{name}-kind.yaml"))
    }

    /// Repository-relative backup copy of the credentials file, consumed by
    /// task runners that do not know the workspace layout.
    pub fn backup_credentials_path(&self, name: &str) -> PathBuf {
        Path::new(".").join(format!("kubeconfig-{name}"))
    }
}
