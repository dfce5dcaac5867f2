//! Staged rollout controller.
//!
//! Drives a Helm install/upgrade through ordered version steps, annotating
//! each with a human-readable change cause and waiting for the rollout to
//! stabilize. On a failed or timed-out step the controller collects a full
//! diagnostic bundle and aborts: these rollouts simulate version upgrades
//! that agents must detect, and silently continuing past a broken step would
//! produce misleading task state.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::RolloutError;
use crate::kube::{unhealthy_pods, Kubectl};
use crate::runtime::CmdOutput;

/// Annotation key Kubernetes surfaces in `rollout history`.
const CHANGE_CAUSE_KEY: &str = "kubernetes.io/change-cause";

/// One version step of a staged rollout.
#[derive(Debug, Clone)]
pub struct RolloutStep {
    pub version: String,
    pub change_cause: String,
    pub timeout: Duration,
}

/// An ordered rollout over one workload in one namespace.
#[derive(Debug, Clone)]
pub struct RolloutPlan {
    pub release: String,
    pub chart: String,
    pub namespace: String,
    /// Deployment the chart manages; annotated and status-waited per step.
    pub workload: String,
    /// Label selector for the workload's pods, used by diagnostics.
    pub selector: String,
    pub steps: Vec<RolloutStep>,
}

/// Typed `helm upgrade --install` request, replacing string-pasted shell.
#[derive(Debug, Clone)]
pub struct HelmUpgrade {
    pub release: String,
    pub chart: String,
    pub namespace: String,
    pub version: Option<String>,
    pub set_values: Vec<(String, String)>,
    pub kubeconfig: PathBuf,
}

impl HelmUpgrade {
    pub fn new(release: impl Into<String>, chart: impl Into<String>) -> Self {
        Self {
            release: release.into(),
            chart: chart.into(),
            namespace: "default".to_string(),
            version: None,
            set_values: Vec::new(),
            kubeconfig: PathBuf::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_values.push((key.into(), value.into()));
        self
    }

    pub fn with_kubeconfig(mut self, kubeconfig: impl Into<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig.into();
        self
    }

    /// Command-line arguments for the helm invocation.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            self.release.clone(),
            self.chart.clone(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--kubeconfig".to_string(),
            self.kubeconfig.to_string_lossy().to_string(),
        ];
        if let Some(version) = &self.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        for (key, value) in &self.set_values {
            args.push("--set".to_string());
            args.push(format!("{key}={value}"));
        }
        args
    }

    async fn invoke(&self) -> Result<CmdOutput, std::io::Error> {
        let output = tokio::process::Command::new("helm")
            .args(self.args())
            .output()
            .await?;
        Ok(CmdOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Diagnostic bundle collected when a rollout step fails.
///
/// Printed in full, never summarized: its whole purpose is post-hoc
/// debugging by a human or a grading agent.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticBundle {
    /// Wide pod listing for the workload's selector.
    pub pods: String,
    /// `kubectl describe` output for each pod not in a healthy state.
    pub descriptions: Vec<(String, String)>,
    /// Recent namespace events, oldest first.
    pub events: String,
}

impl std::fmt::Display for DiagnosticBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "--- pods ---")?;
        writeln!(f, "{}", self.pods.trim_end())?;
        for (pod, description) in &self.descriptions {
            writeln!(f, "--- describe {pod} ---")?;
            writeln!(f, "{}", description.trim_end())?;
        }
        writeln!(f, "--- events ---")?;
        write!(f, "{}", self.events.trim_end())
    }
}

/// Seam between rollout sequencing and the helm/kubectl CLIs.
#[async_trait]
pub trait WorkloadApi {
    /// Installs or upgrades the release to `version`.
    async fn upgrade(&self, plan: &RolloutPlan, version: &str) -> Result<(), RolloutError>;

    /// Records the step's change cause on the workload.
    async fn annotate_change_cause(
        &self,
        plan: &RolloutPlan,
        cause: &str,
    ) -> Result<(), RolloutError>;

    /// Waits for the rollout to stabilize. `Ok(false)` is a timeout or
    /// unhealthy rollout — the caller collects diagnostics and aborts.
    async fn wait_rollout(&self, plan: &RolloutPlan, timeout: Duration)
        -> Result<bool, RolloutError>;

    /// Collects the diagnostic bundle for a failed step.
    async fn diagnostics(&self, plan: &RolloutPlan) -> DiagnosticBundle;
}

/// Production implementation over one cluster's credentials file.
pub struct KubeWorkloadApi {
    kubectl: Kubectl,
}

impl KubeWorkloadApi {
    pub fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn upgrade(&self, plan: &RolloutPlan, version: &str) -> Result<(), RolloutError> {
        let upgrade = HelmUpgrade::new(&plan.release, &plan.chart)
            .with_namespace(&plan.namespace)
            .with_version(version)
            .with_kubeconfig(self.kubectl.kubeconfig());

        let out = upgrade.invoke().await?;
        if out.success() {
            Ok(())
        } else {
            Err(RolloutError::UpgradeFailed {
                release: plan.release.clone(),
                stderr: out.stderr,
            })
        }
    }

    async fn annotate_change_cause(
        &self,
        plan: &RolloutPlan,
        cause: &str,
    ) -> Result<(), RolloutError> {
        let out = self
            .kubectl
            .annotate_deployment(&plan.namespace, &plan.workload, CHANGE_CAUSE_KEY, cause)
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(RolloutError::AnnotateFailed {
                workload: plan.workload.clone(),
                stderr: out.stderr,
            })
        }
    }

    async fn wait_rollout(
        &self,
        plan: &RolloutPlan,
        timeout: Duration,
    ) -> Result<bool, RolloutError> {
        let out = self
            .kubectl
            .rollout_status(&plan.namespace, &plan.workload, timeout.as_secs())
            .await?;
        Ok(out.success())
    }

    async fn diagnostics(&self, plan: &RolloutPlan) -> DiagnosticBundle {
        let mut bundle = DiagnosticBundle::default();

        if let Ok(out) = self
            .kubectl
            .pods_wide(&plan.namespace, Some(&plan.selector))
            .await
        {
            bundle.pods = out.stdout;
        }

        let unhealthy = match self
            .kubectl
            .pods_json(Some(&plan.namespace), Some(&plan.selector))
            .await
        {
            Ok(out) if out.success() => serde_json::from_str(&out.stdout)
                .map(|pods| unhealthy_pods(&pods))
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        for pod in unhealthy {
            if let Ok(out) = self.kubectl.describe_pod(&plan.namespace, &pod).await {
                bundle.descriptions.push((pod, out.stdout));
            }
        }

        if let Ok(out) = self.kubectl.events(&plan.namespace).await {
            bundle.events = out.stdout;
        }

        bundle
    }
}

/// Runs the plan's steps strictly in order; a failed step aborts the rest.
pub async fn run<A: WorkloadApi>(api: &A, plan: &RolloutPlan) -> Result<(), RolloutError> {
    for (index, step) in plan.steps.iter().enumerate() {
        info!(
            release = %plan.release,
            step = index + 1,
            of = plan.steps.len(),
            version = %step.version,
            "Applying rollout step"
        );

        api.upgrade(plan, &step.version).await?;
        api.annotate_change_cause(plan, &step.change_cause).await?;

        let complete = api.wait_rollout(plan, step.timeout).await?;
        if !complete {
            warn!(
                release = %plan.release,
                version = %step.version,
                "Rollout did not stabilize; collecting diagnostics"
            );
            let bundle = api.diagnostics(plan).await;
            return Err(RolloutError::StepFailed {
                version: step.version.clone(),
                reason: format!(
                    "rollout status did not complete within {}s",
                    step.timeout.as_secs()
                ),
                diagnostics: bundle.to_string(),
            });
        }

        info!(release = %plan.release, version = %step.version, "Rollout step complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockApi {
        fail_wait_on: Option<String>,
        log: Mutex<Vec<String>>,
    }

    impl MockApi {
        fn new() -> Self {
            Self {
                fail_wait_on: None,
                log: Mutex::new(Vec::new()),
            }
        }

        fn failing_wait(version: &str) -> Self {
            Self {
                fail_wait_on: Some(version.to_string()),
                log: Mutex::new(Vec::new()),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkloadApi for MockApi {
        async fn upgrade(&self, _plan: &RolloutPlan, version: &str) -> Result<(), RolloutError> {
            self.log.lock().unwrap().push(format!("upgrade:{version}"));
            Ok(())
        }

        async fn annotate_change_cause(
            &self,
            _plan: &RolloutPlan,
            cause: &str,
        ) -> Result<(), RolloutError> {
            self.log.lock().unwrap().push(format!("annotate:{cause}"));
            Ok(())
        }

        async fn wait_rollout(
            &self,
            _plan: &RolloutPlan,
            _timeout: Duration,
        ) -> Result<bool, RolloutError> {
            let current = self
                .log
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find_map(|e| e.strip_prefix("upgrade:").map(str::to_string))
                .unwrap();
            self.log.lock().unwrap().push(format!("wait:{current}"));
            Ok(self.fail_wait_on.as_deref() != Some(current.as_str()))
        }

        async fn diagnostics(&self, _plan: &RolloutPlan) -> DiagnosticBundle {
            self.log.lock().unwrap().push("diagnostics".to_string());
            DiagnosticBundle {
                pods: "web-abc  0/1  ImagePullBackOff".to_string(),
                descriptions: vec![("web-abc".to_string(), "Back-off pulling image".to_string())],
                events: "Warning  Failed  pod/web-abc".to_string(),
            }
        }
    }

    fn plan() -> RolloutPlan {
        RolloutPlan {
            release: "web".to_string(),
            chart: "charts/web".to_string(),
            namespace: "tasks".to_string(),
            workload: "web".to_string(),
            selector: "app=web".to_string(),
            steps: vec![
                RolloutStep {
                    version: "1.0.0".to_string(),
                    change_cause: "initial install".to_string(),
                    timeout: Duration::from_secs(120),
                },
                RolloutStep {
                    version: "2.0.0".to_string(),
                    change_cause: "upgrade to 2.0.0".to_string(),
                    timeout: Duration::from_secs(120),
                },
            ],
        }
    }

    #[test]
    fn helm_upgrade_builds_typed_args() {
        let upgrade = HelmUpgrade::new("web", "charts/web")
            .with_namespace("tasks")
            .with_version("1.2.3")
            .with_set("image.tag", "1.2.3")
            .with_kubeconfig("/ws/cluster-configs/bench-config");

        let args = upgrade.args();
        assert_eq!(args[0..3], ["upgrade", "--install", "web"]);
        assert!(args.windows(2).any(|w| w == ["--version", "1.2.3"]));
        assert!(args.windows(2).any(|w| w == ["--set", "image.tag=1.2.3"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--kubeconfig", "/ws/cluster-configs/bench-config"]));
    }

    #[tokio::test]
    async fn steps_run_in_order_on_success() {
        let api = MockApi::new();
        run(&api, &plan()).await.unwrap();

        assert_eq!(
            api.log(),
            vec![
                "upgrade:1.0.0",
                "annotate:initial install",
                "wait:1.0.0",
                "upgrade:2.0.0",
                "annotate:upgrade to 2.0.0",
                "wait:2.0.0",
            ]
        );
    }

    #[tokio::test]
    async fn failed_step_aborts_remaining_steps() {
        let api = MockApi::failing_wait("1.0.0");
        let err = run(&api, &plan()).await.unwrap_err();

        // Step 2's version was never applied.
        assert!(!api.log().iter().any(|e| e == "upgrade:2.0.0"));

        match err {
            RolloutError::StepFailed {
                version,
                diagnostics,
                ..
            } => {
                assert_eq!(version, "1.0.0");
                assert!(diagnostics.contains("describe web-abc"));
                assert!(diagnostics.contains("Warning  Failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bundle_renders_all_sections() {
        let bundle = DiagnosticBundle {
            pods: "web-abc 0/1 Pending".to_string(),
            descriptions: vec![("web-abc".to_string(), "unschedulable".to_string())],
            events: "Warning FailedScheduling".to_string(),
        };
        let text = bundle.to_string();
        assert!(text.contains("--- pods ---"));
        assert!(text.contains("--- describe web-abc ---"));
        assert!(text.contains("--- events ---"));
    }
}
