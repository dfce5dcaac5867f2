//! Container runtime adapter.
//!
//! Resolves which container engine is available (rootless-capable podman vs.
//! docker) and normalizes the handful of commands the orchestrator needs.
//! Both engines are treated as opaque CLIs driven through
//! `tokio::process::Command`; the adapter owns argument construction and
//! exit-code interpretation only.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::EnvError;

/// External tools required before any cluster mutation may begin.
const REQUIRED_TOOLS: &[&str] = &["kind", "kubectl", "helm"];

/// Supported container engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Podman,
    Docker,
}

impl RuntimeKind {
    /// Binary name for this engine.
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::Podman => "podman",
            RuntimeKind::Docker => "docker",
        }
    }

    /// Resolves the runtime to use.
    ///
    /// An explicit override wins; otherwise podman is preferred (rootless),
    /// falling back to docker. Fails with [`EnvError::NoRuntime`] when
    /// neither binary is present.
    pub async fn resolve(explicit: Option<&str>) -> Result<Self, EnvError> {
        if let Some(name) = explicit {
            return match name {
                "podman" => Ok(RuntimeKind::Podman),
                "docker" => Ok(RuntimeKind::Docker),
                other => Err(EnvError::UnsupportedRuntime(other.to_string())),
            };
        }

        for kind in [RuntimeKind::Podman, RuntimeKind::Docker] {
            if tool_on_path(kind.binary()).await {
                debug!(runtime = kind.binary(), "Resolved container runtime");
                return Ok(kind);
            }
        }

        Err(EnvError::NoRuntime)
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

/// Output of a normalized runtime command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Probe for a binary by invoking `<tool> --version` with discarded output.
///
/// Spawning the tool (rather than walking PATH by hand) also catches
/// present-but-broken installs.
async fn tool_on_path(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Verifies that the resolved runtime plus every other required external tool
/// is present, aggregating ALL missing tools into a single error.
///
/// Front-loads environment validation so nothing is mutated on a host that
/// cannot finish the run.
pub async fn ensure_dependencies(runtime: RuntimeKind) -> Result<(), EnvError> {
    let mut missing = Vec::new();

    if !tool_on_path(runtime.binary()).await {
        missing.push(runtime.binary().to_string());
    }
    for tool in REQUIRED_TOOLS {
        if !tool_on_path(tool).await {
            missing.push((*tool).to_string());
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(EnvError::MissingTools(missing))
    }
}

/// Normalized command surface over the resolved container engine.
#[derive(Debug, Clone)]
pub struct RuntimeAdapter {
    kind: RuntimeKind,
}

impl RuntimeAdapter {
    pub fn new(kind: RuntimeKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn invoke(&self, args: &[&str]) -> Result<CmdOutput, std::io::Error> {
        debug!(runtime = %self.kind, args = ?args, "Invoking container runtime");
        let output = Command::new(self.kind.binary()).args(args).output().await?;
        Ok(CmdOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Pulls an image from its registry.
    pub async fn pull(&self, image: &str) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["pull", image]).await
    }

    /// Tags a local image under a new name.
    pub async fn tag(&self, source: &str, target: &str) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["tag", source, target]).await
    }

    /// Serializes a local image to a portable archive file.
    ///
    /// Podman defaults to OCI layout, which kind's loader does not read, so
    /// the docker-archive format is forced there; docker already produces it.
    pub async fn save(&self, image: &str, archive: &Path) -> Result<CmdOutput, std::io::Error> {
        let archive = archive.to_string_lossy().to_string();
        match self.kind {
            RuntimeKind::Podman => {
                self.invoke(&[
                    "save",
                    "--format",
                    "docker-archive",
                    "-o",
                    &archive,
                    image,
                ])
                .await
            }
            RuntimeKind::Docker => self.invoke(&["save", "-o", &archive, image]).await,
        }
    }

    /// Executes a command inside a running container (e.g. a cluster node).
    pub async fn exec(
        &self,
        container: &str,
        cmd: &[&str],
    ) -> Result<CmdOutput, std::io::Error> {
        let mut args = vec!["exec", container];
        args.extend_from_slice(cmd);
        self.invoke(&args).await
    }

    /// Stops a running container.
    pub async fn stop(&self, container: &str) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["stop", container]).await
    }

    /// Removes a container, forcing if still running.
    pub async fn rm(&self, container: &str) -> Result<CmdOutput, std::io::Error> {
        self.invoke(&["rm", "-f", container]).await
    }

    /// Runs a detached container.
    pub async fn run_detached(
        &self,
        name: &str,
        image: &str,
        extra_args: &[&str],
    ) -> Result<CmdOutput, std::io::Error> {
        let mut args = vec!["run", "-d", "--name", name];
        args.extend_from_slice(extra_args);
        args.push(image);
        self.invoke(&args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_honors_explicit_override() {
        let kind = RuntimeKind::resolve(Some("docker")).await.unwrap();
        assert_eq!(kind, RuntimeKind::Docker);

        let kind = RuntimeKind::resolve(Some("podman")).await.unwrap();
        assert_eq!(kind, RuntimeKind::Podman);
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_runtime() {
        let err = RuntimeKind::resolve(Some("containerd")).await.unwrap_err();
        assert!(matches!(err, EnvError::UnsupportedRuntime(name) if name == "containerd"));
    }

    #[test]
    fn cmd_output_success_tracks_exit_code() {
        let ok = CmdOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        let failed = CmdOutput {
            exit_code: 125,
            stdout: String::new(),
            stderr: "no such image".to_string(),
        };
        assert!(ok.success());
        assert!(!failed.success());
    }

    #[tokio::test]
    async fn missing_tool_probe_returns_false() {
        assert!(!tool_on_path("definitely-not-a-real-binary-3141").await);
    }
}
