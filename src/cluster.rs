//! Cluster lifecycle management.
//!
//! Creates and deletes named ephemeral kind clusters, owns their credentials
//! files, and verifies control-plane health before a cluster is declared
//! ready. This module is the sole writer and deleter of credentials files;
//! every other component consumes the path read-only.

use std::path::PathBuf;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::ClusterError;
use crate::kube::{all_pods_ready, Kubectl};
use crate::poll;
use crate::runtime::{CmdOutput, RuntimeKind};

/// Namespace holding the cluster's control-plane and infrastructure pods.
const SYSTEM_NAMESPACE: &str = "kube-system";

/// Container port the ingress listens on inside the control-plane node.
const INGRESS_CONTAINER_PORT: u16 = 80;

/// kind cluster-config document, serialized to YAML and passed via
/// `--config`. Typed rather than string-pasted so the port mapping can never
/// be misquoted.
#[derive(Debug, Serialize)]
struct KindClusterConfig {
    kind: &'static str,
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    nodes: Vec<KindNodeConfig>,
}

#[derive(Debug, Serialize)]
struct KindNodeConfig {
    role: &'static str,
    #[serde(rename = "extraPortMappings")]
    extra_port_mappings: Vec<KindPortMapping>,
}

#[derive(Debug, Serialize)]
struct KindPortMapping {
    #[serde(rename = "containerPort")]
    container_port: u16,
    #[serde(rename = "hostPort")]
    host_port: u16,
    protocol: &'static str,
}

/// Renders the kind cluster config mapping the requested host port to the
/// control-plane node's ingress port.
pub fn cluster_config_yaml(host_port: u16) -> Result<String, ClusterError> {
    let config = KindClusterConfig {
        kind: "Cluster",
        api_version: "kind.x-k8s.io/v1alpha4",
        nodes: vec![KindNodeConfig {
            role: "control-plane",
            extra_port_mappings: vec![KindPortMapping {
                container_port: INGRESS_CONTAINER_PORT,
                host_port,
                protocol: "TCP",
            }],
        }],
    };
    Ok(serde_yaml::to_string(&config)?)
}

/// Lifecycle states of a named ephemeral cluster.
///
/// `Absent` and `Failed` are terminal; a `Failed` cluster must not receive
/// resource application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Absent,
    Creating,
    Verifying,
    Ready,
    Failed,
    TearingDown,
}

impl ClusterState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition(self, next: ClusterState) -> bool {
        use ClusterState::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating, Verifying)
                | (Creating, Failed)
                | (Verifying, Ready)
                | (Verifying, Failed)
                | (Ready, TearingDown)
                | (TearingDown, Absent)
        )
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClusterState::Absent => "absent",
            ClusterState::Creating => "creating",
            ClusterState::Verifying => "verifying",
            ClusterState::Ready => "ready",
            ClusterState::Failed => "failed",
            ClusterState::TearingDown => "tearing-down",
        };
        f.write_str(name)
    }
}

/// Handle to one named cluster. Identity is `name`, unique per run.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    pub name: String,
    pub credentials_path: PathBuf,
    pub runtime: RuntimeKind,
    pub state: ClusterState,
}

impl ClusterHandle {
    /// Checked state advance; rejects transitions the lifecycle does not
    /// allow (e.g. `Failed` back to `Ready`).
    pub fn advance(&mut self, next: ClusterState) -> Result<(), ClusterError> {
        if !self.state.can_transition(next) {
            return Err(ClusterError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Result of verifying a freshly created cluster.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// `kubectl get nodes -o wide` output for operator display.
    pub node_summary: String,
    /// Whether every kube-system pod reached Ready within the deadline.
    /// `false` is a warning, never a failure.
    pub system_pods_ready: bool,
}

/// Wrapper over the `kind` CLI, bound to a container runtime.
///
/// Podman support in kind is gated behind an experimental provider variable;
/// it is passed explicitly to each child process, never exported globally.
#[derive(Debug, Clone)]
pub struct Kind {
    runtime: RuntimeKind,
}

impl Kind {
    pub fn new(runtime: RuntimeKind) -> Self {
        Self { runtime }
    }

    async fn invoke(&self, args: &[&str]) -> Result<CmdOutput, std::io::Error> {
        debug!(args = ?args, "Invoking kind");
        let mut cmd = Command::new("kind");
        cmd.args(args);
        if self.runtime == RuntimeKind::Podman {
            cmd.env("KIND_EXPERIMENTAL_PROVIDER", "podman");
        }
        let output = cmd.output().await?;
        Ok(CmdOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Creates a named cluster from a cluster-config file, writing
    /// credentials to `kubeconfig`.
    pub async fn create_cluster(
        &self,
        name: &str,
        kubeconfig: &str,
        config: &str,
    ) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&[
            "create",
            "cluster",
            "--name",
            name,
            "--kubeconfig",
            kubeconfig,
            "--config",
            config,
        ])
        .await
    }

    /// Deletes a named cluster.
    pub async fn delete_cluster(&self, name: &str) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["delete", "cluster", "--name", name]).await
    }

    /// Names of all live kind clusters on this host.
    pub async fn clusters(&self) -> Result<Vec<String>, std::io::Error> {
        let output = self.invoke(&["get", "clusters"]).await?;
        Ok(parse_name_lines(&output.stdout))
    }

    /// Node container names for one cluster.
    pub async fn nodes(&self, cluster: &str) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["get", "nodes", "--name", cluster]).await
    }

    /// Loads an image archive into a single node's local image store.
    pub async fn load_archive(
        &self,
        cluster: &str,
        node: &str,
        archive: &str,
    ) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&[
            "load",
            "image-archive",
            archive,
            "--name",
            cluster,
            "--nodes",
            node,
        ])
        .await
    }
}

/// Parses one-name-per-line CLI output, dropping blanks.
pub fn parse_name_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether kind's delete failure output means "nothing to delete".
fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not found") || lower.contains("could not find") || lower.contains("no clusters")
}

/// Owns create/delete/verify for named clusters under one configuration.
pub struct LifecycleManager {
    config: HarnessConfig,
    kind: Kind,
    runtime: RuntimeKind,
}

impl LifecycleManager {
    pub fn new(config: HarnessConfig, runtime: RuntimeKind) -> Self {
        Self {
            config,
            kind: Kind::new(runtime),
            runtime,
        }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Creates the named cluster, deleting any stale same-named cluster
    /// first so repeated `start` invocations are safe.
    ///
    /// On success the credentials file exists at the deterministic path for
    /// `name` and a backup copy is written for task-runner consumption.
    pub async fn create(&self, name: &str) -> Result<ClusterHandle, ClusterError> {
        // Idempotent start: a stale cluster with this name would make kind
        // fail, and its credentials would be stale anyway.
        self.delete(name).await?;

        let credentials_path = self.config.credentials_path(name);
        std::fs::create_dir_all(self.config.credentials_dir())?;

        let cluster_config_path = self.config.kind_config_path(name);
        std::fs::write(&cluster_config_path, cluster_config_yaml(self.config.port)?)?;

        let mut handle = ClusterHandle {
            name: name.to_string(),
            credentials_path: credentials_path.clone(),
            runtime: self.runtime,
            state: ClusterState::Absent,
        };
        handle.advance(ClusterState::Creating)?;

        info!(
            cluster = name,
            runtime = %self.runtime,
            port = self.config.port,
            "Creating cluster"
        );
        let output = self
            .kind
            .create_cluster(
                name,
                &credentials_path.to_string_lossy(),
                &cluster_config_path.to_string_lossy(),
            )
            .await?;

        if !output.success() {
            handle.advance(ClusterState::Failed)?;
            return Err(ClusterError::CreateFailed {
                name: name.to_string(),
                stderr: output.stderr,
            });
        }

        let backup = self.config.backup_credentials_path(name);
        if let Err(e) = std::fs::copy(&credentials_path, &backup) {
            warn!(cluster = name, error = %e, "Failed to write backup credentials copy");
        }

        handle.advance(ClusterState::Verifying)?;
        Ok(handle)
    }

    /// Deletes the named cluster and removes its credentials files.
    ///
    /// "Cluster not found" is success: teardown must be idempotent.
    pub async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        let output = self.kind.delete_cluster(name).await?;
        if !output.success() && !is_not_found(&output.stderr) {
            return Err(ClusterError::DeleteFailed {
                name: name.to_string(),
                stderr: output.stderr,
            });
        }

        for path in [
            self.config.credentials_path(name),
            self.config.backup_credentials_path(name),
            self.config.kind_config_path(name),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed credentials file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(cluster = name, "Cluster deleted");
        Ok(())
    }

    /// Verifies a freshly created cluster.
    ///
    /// `cluster-info` failing is fatal and moves the handle to `Failed`.
    /// Slow kube-system pods only produce a warning; creation is never
    /// aborted because a non-critical system pod lags.
    pub async fn verify(&self, handle: &mut ClusterHandle) -> Result<VerifyReport, ClusterError> {
        if !handle.credentials_path.exists() {
            handle.advance(ClusterState::Failed)?;
            return Err(ClusterError::CredentialsMissing(
                handle.credentials_path.display().to_string(),
            ));
        }

        let kubectl = Kubectl::new(&handle.credentials_path);

        let info = kubectl.cluster_info().await?;
        if !info.success() {
            handle.advance(ClusterState::Failed)?;
            return Err(ClusterError::ControlPlaneUnreachable {
                name: handle.name.clone(),
                stderr: info.stderr,
            });
        }

        let nodes = kubectl.get_nodes().await?;
        debug!(cluster = %handle.name, nodes = %nodes.stdout, "Cluster nodes");

        let system_pods_ready = poll::until_deadline(
            self.config.poll_interval,
            self.config.system_pod_timeout,
            || async {
                match kubectl.pods_json(Some(SYSTEM_NAMESPACE), None).await {
                    Ok(out) if out.success() => serde_json::from_str(&out.stdout)
                        .map(|pods| all_pods_ready(&pods))
                        .unwrap_or(false),
                    _ => false,
                }
            },
        )
        .await;

        if !system_pods_ready {
            warn!(
                cluster = %handle.name,
                timeout_secs = self.config.system_pod_timeout.as_secs(),
                "kube-system pods not Ready within deadline; continuing"
            );
        }

        handle.advance(ClusterState::Ready)?;
        info!(cluster = %handle.name, "Cluster ready");

        Ok(VerifyReport {
            node_summary: nodes.stdout,
            system_pods_ready,
        })
    }

    /// Live clusters as reported by the cluster tool.
    pub async fn live_clusters(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self.kind.clusters().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_allows_happy_path() {
        let mut handle = ClusterHandle {
            name: "bench-1".to_string(),
            credentials_path: PathBuf::from("/tmp/bench-1-config"),
            runtime: RuntimeKind::Docker,
            state: ClusterState::Absent,
        };
        handle.advance(ClusterState::Creating).unwrap();
        handle.advance(ClusterState::Verifying).unwrap();
        handle.advance(ClusterState::Ready).unwrap();
        handle.advance(ClusterState::TearingDown).unwrap();
        handle.advance(ClusterState::Absent).unwrap();
    }

    #[test]
    fn failed_is_terminal() {
        let mut handle = ClusterHandle {
            name: "bench-1".to_string(),
            credentials_path: PathBuf::from("/tmp/bench-1-config"),
            runtime: RuntimeKind::Docker,
            state: ClusterState::Failed,
        };
        let err = handle.advance(ClusterState::Ready).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidTransition { .. }));
    }

    #[test]
    fn ready_cannot_skip_verification() {
        assert!(!ClusterState::Creating.can_transition(ClusterState::Ready));
        assert!(!ClusterState::Absent.can_transition(ClusterState::Ready));
    }

    #[test]
    fn not_found_stderr_variants() {
        assert!(is_not_found("ERROR: could not find cluster \"bench-1\""));
        assert!(is_not_found("cluster not found"));
        assert!(!is_not_found("failed to delete nodes: permission denied"));
    }

    #[test]
    fn cluster_config_maps_requested_host_port() {
        let yaml = cluster_config_yaml(9090).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["kind"].as_str(), Some("Cluster"));
        let node = &doc["nodes"][0];
        assert_eq!(node["role"].as_str(), Some("control-plane"));
        let mapping = &node["extraPortMappings"][0];
        assert_eq!(mapping["hostPort"].as_u64(), Some(9090));
        assert_eq!(
            mapping["containerPort"].as_u64(),
            Some(u64::from(INGRESS_CONTAINER_PORT))
        );
    }

    #[test]
    fn parse_name_lines_drops_blanks() {
        let names = parse_name_lines("bench-1\n\nbench-2\n");
        assert_eq!(names, vec!["bench-1".to_string(), "bench-2".to_string()]);
    }
}
