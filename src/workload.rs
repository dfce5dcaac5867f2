//! Workload manifest application and readiness verification.
//!
//! Applying a manifest is a hard failure for the calling workflow: the
//! manifest defines the task's required workloads. Readiness waiting is the
//! opposite — a soft timeout returning `false`, because some workloads
//! (e.g. those waiting on a dependent database) legitimately take variable
//! time and the caller decides the policy.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::ApplyError;
use crate::kube::{all_pods_ready, Kubectl};
use crate::poll;

/// Applies a manifest file or directory to the cluster behind `kubectl`.
///
/// Directories are walked for `*.yaml`/`*.yml` files, applied in sorted
/// order so numbering prefixes (`00-namespace.yaml`, `10-db.yaml`) work.
pub async fn apply(kubectl: &Kubectl, manifest_path: &Path) -> Result<(), ApplyError> {
    if !manifest_path.exists() {
        return Err(ApplyError::ManifestNotFound(
            manifest_path.display().to_string(),
        ));
    }

    let files = if manifest_path.is_dir() {
        let mut files: Vec<_> = WalkDir::new(manifest_path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(ApplyError::EmptyManifestDir(
                manifest_path.display().to_string(),
            ));
        }
        files
    } else {
        vec![manifest_path.to_path_buf()]
    };

    for file in files {
        debug!(manifest = %file.display(), "Applying manifest");
        let output = kubectl.apply(&file).await?;
        if !output.success() {
            return Err(ApplyError::ApplyFailed {
                path: file.display().to_string(),
                stderr: output.stderr,
            });
        }
    }

    info!(path = %manifest_path.display(), "Manifests applied");
    Ok(())
}

/// Polls pods matching `selector` until all are Ready or `timeout` elapses.
///
/// Returns `false` on timeout without raising an error. At least one pod
/// must exist for the selector to count as ready.
pub async fn wait_ready(
    kubectl: &Kubectl,
    namespace: &str,
    selector: &str,
    interval: Duration,
    timeout: Duration,
) -> bool {
    poll::until_deadline(interval, timeout, || async {
        match kubectl.pods_json(Some(namespace), Some(selector)).await {
            Ok(out) if out.success() => serde_json::from_str::<Value>(&out.stdout)
                .map(|pods| selector_matched(&pods) && all_pods_ready(&pods))
                .unwrap_or(false),
            _ => false,
        }
    })
    .await
}

/// Whether the listing matched at least one pod. An empty match means the
/// workload has not materialized yet, not that it is ready.
fn selector_matched(pods: &Value) -> bool {
    pods.get("items")
        .and_then(Value::as_array)
        .map(|items| !items.is_empty())
        .unwrap_or(false)
}
