//! Thin `kubectl` client.
//!
//! One wrapper struct per external tool, mirroring how the runtime adapter
//! wraps the container engine. Every invocation pins `--kubeconfig` to the
//! cluster's credentials file; nothing here touches ambient `KUBECONFIG`
//! state, so two clusters can be driven from the same process without
//! cross-contamination.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::runtime::CmdOutput;

/// kubectl wrapper bound to one cluster's credentials file.
#[derive(Debug, Clone)]
pub struct Kubectl {
    kubeconfig: PathBuf,
}

impl Kubectl {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    async fn invoke(&self, args: &[&str]) -> Result<CmdOutput, std::io::Error> {
        debug!(args = ?args, "Invoking kubectl");
        let output = Command::new("kubectl")
            .arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .args(args)
            .output()
            .await?;
        Ok(CmdOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// `kubectl cluster-info` — the hard reachability gate for verification.
    pub async fn cluster_info(&self) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["cluster-info"]).await
    }

    /// Lists nodes in wide format for operator-facing output.
    pub async fn get_nodes(&self) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["get", "nodes", "-o", "wide"]).await
    }

    /// Fetches pods as JSON, optionally namespace- and selector-scoped.
    pub async fn pods_json(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<CmdOutput, std::io::Error> {
        let mut args = vec!["get", "pods", "-o", "json"];
        if let Some(ns) = namespace {
            args.extend_from_slice(&["-n", ns]);
        }
        if let Some(sel) = selector {
            args.extend_from_slice(&["-l", sel]);
        }
        self.invoke(&args).await
    }

    /// Applies a manifest file to the cluster.
    pub async fn apply(&self, manifest: &Path) -> Result<CmdOutput, std::io::Error> {
        let manifest = manifest.to_string_lossy().to_string();
        self.invoke(&["apply", "-f", &manifest]).await
    }

    /// Waits on a deployment's rollout with kubectl's own timeout handling.
    pub async fn rollout_status(
        &self,
        namespace: &str,
        deployment: &str,
        timeout_secs: u64,
    ) -> Result<CmdOutput, std::io::Error> {
        let target = format!("deployment/{deployment}");
        let timeout = format!("--timeout={timeout_secs}s");
        self.invoke(&["rollout", "status", &target, "-n", namespace, &timeout])
            .await
    }

    /// Sets (or overwrites) an annotation on a deployment.
    pub async fn annotate_deployment(
        &self,
        namespace: &str,
        deployment: &str,
        key: &str,
        value: &str,
    ) -> Result<CmdOutput, std::io::Error> {
        let target = format!("deployment/{deployment}");
        let pair = format!("{key}={value}");
        self.invoke(&["annotate", &target, "-n", namespace, &pair, "--overwrite"])
            .await
    }

    /// Applies a typed merge-patch document to a deployment.
    ///
    /// The patch is serialized from a `serde_json::Value`, never hand-quoted.
    /// Merge semantics give add-if-absent behavior for annotation keys
    /// without clobbering sibling annotations.
    pub async fn patch_deployment_merge(
        &self,
        namespace: &str,
        deployment: &str,
        patch: &Value,
    ) -> Result<CmdOutput, std::io::Error> {
        let body = patch.to_string();
        self.invoke(&[
            "patch",
            "deployment",
            deployment,
            "-n",
            namespace,
            "--type=merge",
            "-p",
            &body,
        ])
        .await
    }

    /// `kubectl describe` for a single pod.
    pub async fn describe_pod(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["describe", "pod", pod, "-n", namespace]).await
    }

    /// Recent namespace events, oldest first.
    pub async fn events(&self, namespace: &str) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&[
            "get",
            "events",
            "-n",
            namespace,
            "--sort-by=.lastTimestamp",
        ])
        .await
    }

    /// Pod listing in wide format, for diagnostic bundles.
    pub async fn pods_wide(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<CmdOutput, std::io::Error> {
        let mut args = vec!["get", "pods", "-n", namespace, "-o", "wide"];
        if let Some(sel) = selector {
            args.extend_from_slice(&["-l", sel]);
        }
        self.invoke(&args).await
    }
}

/// Whether every pod in a `kubectl get pods -o json` document is Ready.
///
/// A pod counts as ready when its phase is `Running` with a `Ready=True`
/// condition, or `Succeeded` (completed one-shot pods). An empty listing is
/// ready by definition.
pub fn all_pods_ready(pods: &Value) -> bool {
    let Some(items) = pods.get("items").and_then(Value::as_array) else {
        return false;
    };
    items.iter().all(pod_is_ready)
}

/// Names of pods that are not in a healthy Ready/Running (or Succeeded)
/// state, for diagnostic collection.
pub fn unhealthy_pods(pods: &Value) -> Vec<String> {
    let Some(items) = pods.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|pod| !pod_is_ready(pod))
        .filter_map(|pod| {
            pod.pointer("/metadata/name")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

fn pod_is_ready(pod: &Value) -> bool {
    let phase = pod
        .pointer("/status/phase")
        .and_then(Value::as_str)
        .unwrap_or("");
    match phase {
        "Succeeded" => true,
        "Running" => pod
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .map(|conditions| {
                conditions.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some("Ready")
                        && c.get("status").and_then(Value::as_str) == Some("True")
                })
            })
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, phase: &str, ready: Option<bool>) -> Value {
        let mut pod = json!({
            "metadata": { "name": name },
            "status": { "phase": phase }
        });
        if let Some(ready) = ready {
            pod["status"]["conditions"] = json!([
                { "type": "Ready", "status": if ready { "True" } else { "False" } }
            ]);
        }
        pod
    }

    #[test]
    fn all_ready_when_running_with_ready_condition() {
        let pods = json!({ "items": [
            pod("coredns-abc", "Running", Some(true)),
            pod("etcd-cp", "Running", Some(true)),
        ]});
        assert!(all_pods_ready(&pods));
    }

    #[test]
    fn succeeded_pods_count_as_ready() {
        let pods = json!({ "items": [pod("seed-job", "Succeeded", None)] });
        assert!(all_pods_ready(&pods));
    }

    #[test]
    fn pending_pod_is_not_ready() {
        let pods = json!({ "items": [
            pod("web-1", "Running", Some(true)),
            pod("web-2", "Pending", None),
        ]});
        assert!(!all_pods_ready(&pods));
        assert_eq!(unhealthy_pods(&pods), vec!["web-2".to_string()]);
    }

    #[test]
    fn running_without_ready_condition_is_not_ready() {
        let pods = json!({ "items": [pod("db-0", "Running", Some(false))] });
        assert!(!all_pods_ready(&pods));
    }

    #[test]
    fn empty_listing_is_ready() {
        assert!(all_pods_ready(&json!({ "items": [] })));
        assert!(unhealthy_pods(&json!({ "items": [] })).is_empty());
    }

    #[test]
    fn malformed_document_is_not_ready() {
        assert!(!all_pods_ready(&json!({})));
    }
}
