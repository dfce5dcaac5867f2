//! Batch provisioning scheduler.
//!
//! Creates clusters in fixed-size sequential batches with inter-unit and
//! inter-batch pacing. kind consumes host-wide inotify watch descriptors per
//! cluster, so pacing is a correctness requirement: unbounded parallel
//! creation exhausts the host limit non-deterministically. Per-unit failures
//! are captured as result records and never abort the run.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterHandle, LifecycleManager, VerifyReport};
use crate::error::ClusterError;

/// A provisioning plan: how many clusters, in what batch sizes, with what
/// pacing.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub total_units: usize,
    pub batch_size: usize,
    /// Stabilization wait between creating a unit and verifying it.
    pub inter_unit_delay: Duration,
    /// Pause between batches (not after the last).
    pub inter_batch_delay: Duration,
}

impl BatchPlan {
    /// Builds a plan. `batch_size` is normalized to at least 1.
    pub fn new(total_units: usize, batch_size: usize) -> Self {
        Self {
            total_units,
            batch_size: batch_size.max(1),
            inter_unit_delay: crate::config::DEFAULT_INTER_UNIT_DELAY,
            inter_batch_delay: crate::config::DEFAULT_INTER_BATCH_DELAY,
        }
    }

    /// Sets the per-unit stabilization delay.
    pub fn with_inter_unit_delay(mut self, delay: Duration) -> Self {
        self.inter_unit_delay = delay;
        self
    }

    /// Sets the between-batch delay.
    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    /// Number of batches: `ceil(total_units / batch_size)`.
    pub fn batch_count(&self) -> usize {
        self.total_units.div_ceil(self.batch_size)
    }

    /// Contiguous unit-index ranges, one per batch. The last batch may be
    /// smaller.
    pub fn batches(&self) -> Vec<std::ops::Range<usize>> {
        (0..self.batch_count())
            .map(|b| {
                let start = b * self.batch_size;
                start..(start + self.batch_size).min(self.total_units)
            })
            .collect()
    }
}

/// Outcome of provisioning one unit. Accumulated across the run and never
/// mutated after the plan completes.
#[derive(Debug, Clone)]
pub struct ProvisioningResult {
    pub name: String,
    pub handle: Option<ClusterHandle>,
    pub succeeded: bool,
    pub failure_reason: Option<String>,
}

/// Aggregate counts for a completed plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PlanStats {
    pub success_count: usize,
    pub failure_count: usize,
}

impl PlanStats {
    pub fn total(&self) -> usize {
        self.success_count + self.failure_count
    }
}

/// Full outcome of a provisioning run.
#[derive(Debug)]
pub struct PlanOutcome {
    pub results: Vec<ProvisioningResult>,
    pub stats: PlanStats,
    /// Clusters live on the host after the run, per the cluster tool.
    pub live_clusters: Vec<String>,
}

/// Seam between batch semantics and the cluster tool, so scheduling policy
/// is testable without kind on PATH.
#[async_trait]
pub trait Provisioner {
    async fn create(&self, name: &str) -> Result<ClusterHandle, ClusterError>;
    async fn verify(&self, handle: &mut ClusterHandle) -> Result<VerifyReport, ClusterError>;
    async fn live_clusters(&self) -> Result<Vec<String>, ClusterError>;
}

#[async_trait]
impl Provisioner for LifecycleManager {
    async fn create(&self, name: &str) -> Result<ClusterHandle, ClusterError> {
        LifecycleManager::create(self, name).await
    }

    async fn verify(&self, handle: &mut ClusterHandle) -> Result<VerifyReport, ClusterError> {
        LifecycleManager::verify(self, handle).await
    }

    async fn live_clusters(&self) -> Result<Vec<String>, ClusterError> {
        LifecycleManager::live_clusters(self).await
    }
}

/// Snapshot of host inotify pressure, surfaced between batches so operators
/// can spot descriptor exhaustion before it causes failures.
#[derive(Debug, Clone, Copy)]
pub struct WatchPressure {
    pub open_instances: usize,
    pub max_instances: usize,
}

impl std::fmt::Display for WatchPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} inotify instances",
            self.open_instances, self.max_instances
        )
    }
}

/// Best-effort read of host inotify pressure from /proc. Returns `None`
/// where /proc is unavailable (non-Linux hosts, restricted containers).
pub fn watch_pressure() -> Option<WatchPressure> {
    let max_instances = std::fs::read_to_string("/proc/sys/fs/inotify/max_user_instances")
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(WatchPressure {
        open_instances: count_inotify_fds(),
        max_instances,
    })
}

/// Counts open inotify file descriptors across all visible processes.
/// Unreadable entries (other users' processes) are skipped.
fn count_inotify_fds() -> usize {
    let Ok(procs) = std::fs::read_dir("/proc") else {
        return 0;
    };
    procs
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .chars()
                .all(|c| c.is_ascii_digit())
        })
        .filter_map(|entry| std::fs::read_dir(entry.path().join("fd")).ok())
        .flat_map(|fds| fds.filter_map(Result::ok))
        .filter(|fd| {
            std::fs::read_link(fd.path())
                .map(|target| target.to_string_lossy().contains("inotify"))
                .unwrap_or(false)
        })
        .count()
}

/// Drives a [`BatchPlan`] against a [`Provisioner`].
pub struct BatchScheduler<P> {
    plan: BatchPlan,
    provisioner: P,
}

impl<P: Provisioner> BatchScheduler<P> {
    pub fn new(plan: BatchPlan, provisioner: P) -> Self {
        Self { plan, provisioner }
    }

    /// Provisions every unit of the plan, naming units through `namer`.
    ///
    /// One bad cluster must not block the rest of the run: create/verify
    /// errors are converted to result records and the loop continues.
    pub async fn run<F>(&self, namer: F) -> PlanOutcome
    where
        F: Fn(usize) -> String,
    {
        let mut results = Vec::with_capacity(self.plan.total_units);
        let mut stats = PlanStats::default();
        let batches = self.plan.batches();
        let batch_count = batches.len();

        for (batch_idx, batch) in batches.into_iter().enumerate() {
            info!(
                batch = batch_idx + 1,
                of = batch_count,
                units = batch.len(),
                "Starting provisioning batch"
            );

            for unit in batch {
                let name = namer(unit);
                let result = self.provision_unit(&name).await;
                if result.succeeded {
                    stats.success_count += 1;
                } else {
                    stats.failure_count += 1;
                }
                results.push(result);
            }

            if batch_idx + 1 < batch_count {
                self.pause_between_batches().await;
            }
        }

        let live_clusters = match self.provisioner.live_clusters().await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "Failed to list live clusters after provisioning");
                Vec::new()
            }
        };

        info!(
            succeeded = stats.success_count,
            failed = stats.failure_count,
            live = live_clusters.len(),
            "Provisioning plan complete"
        );

        PlanOutcome {
            results,
            stats,
            live_clusters,
        }
    }

    async fn provision_unit(&self, name: &str) -> ProvisioningResult {
        let mut handle = match self.provisioner.create(name).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(cluster = name, error = %e, "Cluster creation failed");
                return ProvisioningResult {
                    name: name.to_string(),
                    handle: None,
                    succeeded: false,
                    failure_reason: Some(e.to_string()),
                };
            }
        };

        // Stabilization wait: the API server needs a moment before
        // cluster-info answers reliably.
        tokio::time::sleep(self.plan.inter_unit_delay).await;

        match self.provisioner.verify(&mut handle).await {
            Ok(report) => {
                if !report.system_pods_ready {
                    warn!(cluster = name, "Cluster ready with lagging system pods");
                }
                ProvisioningResult {
                    name: name.to_string(),
                    handle: Some(handle),
                    succeeded: true,
                    failure_reason: None,
                }
            }
            Err(e) => {
                error!(cluster = name, error = %e, "Cluster verification failed");
                ProvisioningResult {
                    name: name.to_string(),
                    handle: Some(handle),
                    succeeded: false,
                    failure_reason: Some(e.to_string()),
                }
            }
        }
    }

    /// Sleeps the inter-batch delay one second at a time, surfacing a
    /// countdown and the current inotify pressure.
    async fn pause_between_batches(&self) {
        let total_secs = self.plan.inter_batch_delay.as_secs();
        if total_secs == 0 {
            tokio::time::sleep(self.plan.inter_batch_delay).await;
            return;
        }

        for remaining in (1..=total_secs).rev() {
            if remaining % 10 == 0 || remaining == total_secs || remaining <= 3 {
                match watch_pressure() {
                    Some(pressure) => {
                        info!(remaining_secs = remaining, %pressure, "Inter-batch pause")
                    }
                    None => info!(remaining_secs = remaining, "Inter-batch pause"),
                }
            } else {
                debug!(remaining_secs = remaining, "Inter-batch pause");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
