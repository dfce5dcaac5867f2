//! CLI command definitions for clusterforge.
//!
//! The surface mirrors the per-task cluster scripts it replaces: `start`
//! provisions and seeds clusters, `stop` tears them down idempotently,
//! `status` reports connection info, `restart` chains the two.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use crate::age::{self, AgeAnnotation};
use crate::cluster::{ClusterHandle, Kind, LifecycleManager};
use crate::config::{HarnessConfig, DEFAULT_PORT};
use crate::images::{DistributionJob, Distributor, ImageMapping, ImageRef, KindNodeOps};
use crate::kube::Kubectl;
use crate::rollout::{self, KubeWorkloadApi, RolloutPlan, RolloutStep};
use crate::runtime::{ensure_dependencies, RuntimeAdapter, RuntimeKind};
use crate::scheduler::{BatchPlan, BatchScheduler, PlanOutcome, ProvisioningResult};
use crate::workload;

/// Default base name for provisioned clusters.
const DEFAULT_CLUSTER_NAME: &str = "bench";

/// Default per-step rollout timeout in seconds.
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 120;

/// Default workload readiness timeout in seconds.
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 180;

/// Ephemeral Kubernetes cluster provisioning orchestrator for benchmark harnesses.
#[derive(Parser)]
#[command(name = "clusterforge")]
#[command(about = "Provision, seed and tear down disposable kind clusters for evaluation runs")]
#[command(version)]
#[command(
    long_about = "clusterforge creates short-lived container-based Kubernetes clusters, applies task workloads, distributes images into cluster nodes, drives staged rollouts and tears everything down idempotently.\n\nExample usage:\n  clusterforge start 8080 ./workspace --count 4 --batch-size 2 --manifest ./manifests"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create clusters, verify them and seed task workloads.
    ///
    /// Idempotent: any existing same-named cluster is deleted first, so a
    /// repeated start always yields fresh credentials.
    Start(StartArgs),

    /// Delete clusters and their credentials files (no-op if absent).
    Stop(StopArgs),

    /// Report whether the cluster is running and basic connection info.
    Status(StatusArgs),

    /// Stop, then start.
    Restart(StartArgs),
}

/// Arguments for `clusterforge start`.
#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Host port mapped to the cluster ingress.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Workspace directory for generated state (credentials files).
    #[arg(default_value = ".")]
    pub workspace: PathBuf,

    /// Base cluster name; with --count > 1 units are named NAME-1..NAME-N.
    #[arg(long, default_value = DEFAULT_CLUSTER_NAME)]
    pub name: String,

    /// Number of clusters to provision.
    #[arg(short = 'c', long, default_value = "1")]
    pub count: usize,

    /// Clusters created per batch before pausing.
    #[arg(long, default_value = "1")]
    pub batch_size: usize,

    /// Seconds to wait between creating a cluster and verifying it.
    #[arg(long, default_value = "5")]
    pub unit_delay: u64,

    /// Seconds to pause between batches.
    #[arg(long, default_value = "30")]
    pub batch_delay: u64,

    /// Container runtime to use (podman, docker). Probed when omitted.
    #[arg(long, env = "CLUSTERFORGE_RUNTIME")]
    pub runtime: Option<String>,

    /// Manifest file or directory to apply to each ready cluster.
    #[arg(short = 'f', long)]
    pub manifest: Option<PathBuf>,

    /// Label selector to wait on after applying manifests.
    #[arg(long)]
    pub wait_selector: Option<String>,

    /// Namespace for --wait-selector.
    #[arg(long, default_value = "default")]
    pub wait_namespace: String,

    /// Seconds to wait for --wait-selector pods; timeout is a warning only.
    #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT_SECS)]
    pub wait_timeout: u64,

    /// Image to distribute into every cluster node, as SOURCE=TARGET
    /// (TARGET defaults to SOURCE). Repeatable; order is preserved.
    #[arg(long = "load-image", value_name = "SOURCE[=TARGET]")]
    pub load_images: Vec<String>,

    /// Helm release name for the staged rollout.
    #[arg(long, requires = "chart")]
    pub release: Option<String>,

    /// Helm chart (path or repo reference) for the staged rollout.
    #[arg(long, requires = "release")]
    pub chart: Option<String>,

    /// Namespace of the rolled-out workload.
    #[arg(long, default_value = "default")]
    pub rollout_namespace: String,

    /// Deployment managed by the chart (defaults to the release name).
    #[arg(long)]
    pub workload: Option<String>,

    /// Rollout step as VERSION[:TIMEOUT_SECS[:CHANGE CAUSE]].
    /// Repeatable; steps run strictly in order.
    #[arg(long = "rollout-step", value_name = "STEP")]
    pub rollout_steps: Vec<String>,

    /// Back-date a deployment's release-date annotation, as NS/NAME:DAYS.
    /// Repeatable.
    #[arg(long = "age", value_name = "NS/NAME:DAYS")]
    pub ages: Vec<String>,

    /// Output the provisioning summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `clusterforge stop`.
#[derive(Parser, Debug)]
pub struct StopArgs {
    /// Workspace directory holding the credentials files.
    #[arg(default_value = ".")]
    pub workspace: PathBuf,

    /// Base cluster name.
    #[arg(long, default_value = DEFAULT_CLUSTER_NAME)]
    pub name: String,

    /// Number of clusters the run provisioned.
    #[arg(short = 'c', long, default_value = "1")]
    pub count: usize,

    /// Container runtime to use (podman, docker). Probed when omitted.
    #[arg(long, env = "CLUSTERFORGE_RUNTIME")]
    pub runtime: Option<String>,
}

/// Arguments for `clusterforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Workspace directory holding the credentials files.
    #[arg(default_value = ".")]
    pub workspace: PathBuf,

    /// Cluster name to inspect.
    #[arg(long, default_value = DEFAULT_CLUSTER_NAME)]
    pub name: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// Unrecognized operations print usage to stderr and exit 1, matching the
/// task-script contract (clap's own error exit code is 2).
pub fn parse_cli() -> Cli {
    use clap::error::ErrorKind;

    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            e.print().ok();
            std::process::exit(code);
        }
    }
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Stop(args) => run_stop(args).await,
        Commands::Status(args) => run_status(args).await,
        Commands::Restart(args) => {
            let stop = StopArgs {
                workspace: args.workspace.clone(),
                name: args.name.clone(),
                count: args.count,
                runtime: args.runtime.clone(),
            };
            run_stop(stop).await?;
            run_start(args).await
        }
    }
}

/// Unit name for index `i` under a base name.
fn unit_name(base: &str, count: usize, index: usize) -> String {
    if count == 1 {
        base.to_string()
    } else {
        format!("{}-{}", base, index + 1)
    }
}

/// Parses `SOURCE[=TARGET]` into a mapping.
fn parse_image_mapping(spec: &str) -> ImageMapping {
    match spec.split_once('=') {
        Some((source, target)) => ImageMapping {
            source: ImageRef::parse(source),
            target: ImageRef::parse(target),
        },
        None => {
            let image = ImageRef::parse(spec);
            ImageMapping {
                source: image.clone(),
                target: image,
            }
        }
    }
}

/// Parses `VERSION[:TIMEOUT_SECS[:CHANGE CAUSE]]` into a rollout step.
fn parse_rollout_step(spec: &str) -> RolloutStep {
    let mut parts = spec.splitn(3, ':');
    let version = parts.next().unwrap_or_default().to_string();
    let timeout = parts
        .next()
        .and_then(|t| t.parse().ok())
        .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
    let change_cause = parts
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| format!("upgrade to {version}"));
    RolloutStep {
        version,
        change_cause,
        timeout: Duration::from_secs(timeout),
    }
}

async fn run_start(args: StartArgs) -> anyhow::Result<()> {
    let config = HarnessConfig::new(&args.workspace).with_port(args.port);

    // Environment validation happens before any cluster mutation so a
    // broken host fails with one aggregated report.
    let runtime = RuntimeKind::resolve(args.runtime.as_deref()).await?;
    ensure_dependencies(runtime).await?;

    let manager = LifecycleManager::new(config.clone(), runtime);
    let plan = BatchPlan::new(args.count, args.batch_size)
        .with_inter_unit_delay(Duration::from_secs(args.unit_delay))
        .with_inter_batch_delay(Duration::from_secs(args.batch_delay));

    let scheduler = BatchScheduler::new(plan, manager);
    let outcome = scheduler
        .run(|i| unit_name(&args.name, args.count, i))
        .await;

    report_outcome(&outcome, args.json);

    if outcome.stats.success_count == 0 {
        anyhow::bail!(
            "All {} cluster(s) failed to provision",
            outcome.stats.failure_count
        );
    }

    let age_annotations: Vec<AgeAnnotation> = args
        .ages
        .iter()
        .filter_map(|spec| match age::parse_spec(spec) {
            Some(entry) => Some(entry),
            None => {
                warn!(spec = %spec, "Ignoring malformed --age spec (expected NS/NAME:DAYS)");
                None
            }
        })
        .collect();

    let seed_failures =
        seed_clusters(&args, &config, runtime, &outcome.results, &age_annotations).await;
    if seed_failures > 0 {
        anyhow::bail!("{seed_failures} cluster(s) failed seeding");
    }

    Ok(())
}

/// Seeds every successfully provisioned cluster, containing failures per
/// unit the way the scheduler contains provisioning failures: a cluster
/// whose seeding fails is recorded and the remaining clusters still get
/// their workloads. Returns the number of clusters that failed seeding.
async fn seed_clusters(
    args: &StartArgs,
    config: &HarnessConfig,
    runtime: RuntimeKind,
    results: &[ProvisioningResult],
    age_annotations: &[AgeAnnotation],
) -> usize {
    let mut failures = 0usize;
    for result in results.iter().filter(|r| r.succeeded) {
        let Some(handle) = result.handle.as_ref() else {
            continue;
        };
        if let Err(e) = seed_cluster(args, config, runtime, handle, age_annotations).await {
            error!(
                cluster = %handle.name,
                error = %e,
                "Seeding failed; continuing with remaining clusters"
            );
            failures += 1;
        }
    }
    failures
}

/// Applies manifests, distributes images, runs the staged rollout and
/// back-dates annotations on one ready cluster.
async fn seed_cluster(
    args: &StartArgs,
    config: &HarnessConfig,
    runtime: RuntimeKind,
    handle: &ClusterHandle,
    age_annotations: &[AgeAnnotation],
) -> anyhow::Result<()> {
    let kubectl = Kubectl::new(&handle.credentials_path);

    if let Some(manifest) = &args.manifest {
        workload::apply(&kubectl, manifest).await?;

        if let Some(selector) = &args.wait_selector {
            let ready = workload::wait_ready(
                &kubectl,
                &args.wait_namespace,
                selector,
                config.poll_interval,
                Duration::from_secs(args.wait_timeout),
            )
            .await;
            if !ready {
                warn!(
                    cluster = %handle.name,
                    selector = %selector,
                    "Workload not ready within {}s; continuing",
                    args.wait_timeout
                );
            }
        }
    }

    if !args.load_images.is_empty() {
        let job = DistributionJob {
            cluster: handle.name.clone(),
            mappings: args.load_images.iter().map(|s| parse_image_mapping(s)).collect(),
        };
        let adapter = RuntimeAdapter::new(runtime);
        let nodes = KindNodeOps::new(Kind::new(runtime), adapter.clone());
        let report = Distributor::new(adapter, nodes).run(&job).await?;
        info!(
            cluster = %handle.name,
            images = report.images_loaded,
            nodes = report.nodes.len(),
            "Images distributed"
        );
    }

    if let (Some(release), Some(chart)) = (&args.release, &args.chart) {
        if !args.rollout_steps.is_empty() {
            let workload_name = args.workload.clone().unwrap_or_else(|| release.clone());
            let plan = RolloutPlan {
                release: release.clone(),
                chart: chart.clone(),
                namespace: args.rollout_namespace.clone(),
                selector: format!("app={workload_name}"),
                workload: workload_name,
                steps: args.rollout_steps.iter().map(|s| parse_rollout_step(s)).collect(),
            };
            let api = KubeWorkloadApi::new(kubectl.clone());
            rollout::run(&api, &plan).await?;
        }
    }

    if !age_annotations.is_empty() {
        let outcomes = age::annotate(&kubectl, &age_annotations).await;
        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
        if failed > 0 {
            error!(
                cluster = %handle.name,
                failed,
                "Some age annotations failed; applied entries are kept"
            );
        }
    }

    Ok(())
}

fn report_outcome(outcome: &PlanOutcome, json: bool) {
    for result in &outcome.results {
        if result.succeeded {
            info!(cluster = %result.name, "provisioned");
        } else {
            error!(
                cluster = %result.name,
                reason = result.failure_reason.as_deref().unwrap_or("unknown"),
                "provisioning failed"
            );
        }
    }

    if json {
        let failed: Vec<&str> = outcome
            .results
            .iter()
            .filter(|r| !r.succeeded)
            .map(|r| r.name.as_str())
            .collect();
        let summary = serde_json::json!({
            "stats": outcome.stats,
            "failed": failed,
            "live_clusters": outcome.live_clusters,
        });
        println!("{summary}");
    } else {
        println!(
            "Provisioned {}/{} cluster(s), {} failed; live: [{}]",
            outcome.stats.success_count,
            outcome.stats.total(),
            outcome.stats.failure_count,
            outcome.live_clusters.join(", ")
        );
    }
}

async fn run_stop(args: StopArgs) -> anyhow::Result<()> {
    let config = HarnessConfig::new(&args.workspace);
    let runtime = RuntimeKind::resolve(args.runtime.as_deref()).await?;
    let manager = LifecycleManager::new(config, runtime);

    let mut failures = 0usize;
    for i in 0..args.count {
        let name = unit_name(&args.name, args.count, i);
        // Teardown errors are reported but never block cleanup of the
        // remaining clusters.
        if let Err(e) = manager.delete(&name).await {
            error!(cluster = %name, error = %e, "Teardown failed");
            failures += 1;
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} cluster(s) failed to tear down");
    }
    println!("Stopped.");
    Ok(())
}

async fn run_status(args: StatusArgs) -> anyhow::Result<()> {
    let config = HarnessConfig::new(&args.workspace);
    let credentials = config.credentials_path(&args.name);

    if !credentials.exists() {
        println!("Cluster '{}' is not running (no credentials file).", args.name);
        return Ok(());
    }

    let endpoint = read_endpoint(&credentials).unwrap_or_else(|| "unknown".to_string());
    let kubectl = Kubectl::new(&credentials);
    let reachable = kubectl
        .cluster_info()
        .await
        .map(|out| out.success())
        .unwrap_or(false);

    if reachable {
        println!("Cluster '{}' is running at {}.", args.name, endpoint);
    } else {
        println!(
            "Cluster '{}' has credentials at {} but the control plane is not reachable.",
            args.name,
            credentials.display()
        );
    }
    // Informational only: exit 0 regardless of found/not-found.
    Ok(())
}

/// Extracts the API server endpoint from a kubeconfig file.
fn read_endpoint(credentials: &std::path::Path) -> Option<String> {
    let raw = std::fs::read_to_string(credentials).ok()?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&raw).ok()?;
    doc.get("clusters")?
        .as_sequence()?
        .first()?
        .get("cluster")?
        .get("server")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_names_are_stable() {
        assert_eq!(unit_name("bench", 1, 0), "bench");
        assert_eq!(unit_name("bench", 3, 0), "bench-1");
        assert_eq!(unit_name("bench", 3, 2), "bench-3");
    }

    #[test]
    fn image_mapping_defaults_target_to_source() {
        let mapping = parse_image_mapping("nginx:1.25");
        assert_eq!(mapping.source, mapping.target);

        let mapping = parse_image_mapping("upstream.io/mail:1.4=registry.local/mail:1.4");
        assert_eq!(mapping.source.repository, "upstream.io/mail");
        assert_eq!(mapping.target.repository, "registry.local/mail");
    }

    #[test]
    fn rollout_step_parsing_fills_defaults() {
        let step = parse_rollout_step("2.1.0");
        assert_eq!(step.version, "2.1.0");
        assert_eq!(step.timeout, Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS));
        assert_eq!(step.change_cause, "upgrade to 2.1.0");

        let step = parse_rollout_step("2.1.0:60:security fix rollout");
        assert_eq!(step.timeout, Duration::from_secs(60));
        assert_eq!(step.change_cause, "security fix rollout");
    }

    #[test]
    fn endpoint_is_read_from_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench-config");
        std::fs::write(
            &path,
            "clusters:\n- cluster:\n    server: https://127.0.0.1:43517\n  name: kind-bench\n",
        )
        .unwrap();
        assert_eq!(
            read_endpoint(&path).as_deref(),
            Some("https://127.0.0.1:43517")
        );
    }

    #[test]
    fn cli_parses_start_with_positional_port_and_workspace() {
        let cli = Cli::try_parse_from([
            "clusterforge",
            "start",
            "9090",
            "/tmp/ws",
            "--count",
            "4",
            "--batch-size",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Start(args) => {
                assert_eq!(args.port, 9090);
                assert_eq!(args.workspace, PathBuf::from("/tmp/ws"));
                assert_eq!(args.count, 4);
                assert_eq!(args.batch_size, 2);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn cli_rejects_unknown_operation() {
        assert!(Cli::try_parse_from(["clusterforge", "frobnicate"]).is_err());
    }

    #[tokio::test]
    async fn seeding_failure_does_not_block_remaining_clusters() {
        use crate::cluster::ClusterState;

        // A manifest path that cannot exist makes seeding fail before any
        // external tool is invoked.
        let cli = Cli::try_parse_from([
            "clusterforge",
            "start",
            "--count",
            "2",
            "--manifest",
            "/definitely/not/a/manifest.yaml",
        ])
        .unwrap();
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };

        let results: Vec<ProvisioningResult> = (1..=2)
            .map(|i| ProvisioningResult {
                name: format!("bench-{i}"),
                handle: Some(ClusterHandle {
                    name: format!("bench-{i}"),
                    credentials_path: PathBuf::from(format!("/tmp/bench-{i}-config")),
                    runtime: RuntimeKind::Docker,
                    state: ClusterState::Ready,
                }),
                succeeded: true,
                failure_reason: None,
            })
            .collect();

        let config = HarnessConfig::default();
        let failures =
            seed_clusters(&args, &config, RuntimeKind::Docker, &results, &[]).await;

        // Both clusters were attempted; the first failure did not abort.
        assert_eq!(failures, 2);
    }
}
