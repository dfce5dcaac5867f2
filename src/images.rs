//! Image distribution pipeline.
//!
//! kind's `load image-archive` primitive only moves an archive from the host
//! into nodes — it does not pull from a registry or rename images — so the
//! pipeline composes pull → tag → save → per-node load → verify explicitly.
//! Each node has an independent local image cache, which is why loading and
//! verification are per-node rather than cluster-wide.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cluster::{parse_name_lines, Kind};
use crate::error::DistributionError;
use crate::runtime::RuntimeAdapter;

/// A registry/repository plus tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Parses `repo:tag`, defaulting the tag to `latest`. The split is on
    /// the last colon after the last slash, so registry ports survive
    /// (`localhost:5000/app` has no tag, `localhost:5000/app:v1` does).
    pub fn parse(s: &str) -> Self {
        let slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[slash..].rfind(':') {
            Some(i) => Self::new(&s[..slash + i], &s[slash + i + 1..]),
            None => Self::new(s, "latest"),
        }
    }

    /// The fully qualified name containerd stores: bare Docker Hub images
    /// gain `docker.io/` (and `library/` for single-segment names).
    pub fn qualified(&self) -> String {
        let first = self.repository.split('/').next().unwrap_or("");
        let has_registry = first.contains('.') || first.contains(':') || first == "localhost";
        if has_registry {
            format!("{}:{}", self.repository, self.tag)
        } else if self.repository.contains('/') {
            format!("docker.io/{}:{}", self.repository, self.tag)
        } else {
            format!("docker.io/library/{}:{}", self.repository, self.tag)
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// One source-to-target retag carried by a distribution job.
#[derive(Debug, Clone)]
pub struct ImageMapping {
    pub source: ImageRef,
    pub target: ImageRef,
}

/// An ordered list of mappings destined for every node of one cluster.
/// Built once per `start`, consumed once, discarded after verification.
#[derive(Debug, Clone)]
pub struct DistributionJob {
    pub cluster: String,
    pub mappings: Vec<ImageMapping>,
}

/// Local image operations (pull/tag/save) behind the container runtime.
#[async_trait]
pub trait ImageOps {
    async fn pull(&self, image: &ImageRef) -> Result<(), DistributionError>;
    async fn tag(&self, source: &ImageRef, target: &ImageRef) -> Result<(), DistributionError>;
    async fn save(&self, image: &ImageRef, archive: &Path) -> Result<(), DistributionError>;
}

/// Per-node operations behind the cluster tool and runtime exec.
#[async_trait]
pub trait NodeOps {
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<String>, DistributionError>;
    async fn load_archive(
        &self,
        cluster: &str,
        node: &str,
        archive: &Path,
    ) -> Result<(), DistributionError>;
    /// The node's local containerd image inventory, one name per line.
    async fn node_images(&self, node: &str) -> Result<Vec<String>, DistributionError>;
}

#[async_trait]
impl ImageOps for RuntimeAdapter {
    async fn pull(&self, image: &ImageRef) -> Result<(), DistributionError> {
        let name = image.to_string();
        let out = RuntimeAdapter::pull(self, &name).await?;
        if out.success() {
            Ok(())
        } else {
            Err(DistributionError::PullFailed {
                image: name,
                stderr: out.stderr,
            })
        }
    }

    async fn tag(&self, source: &ImageRef, target: &ImageRef) -> Result<(), DistributionError> {
        let out = RuntimeAdapter::tag(self, &source.to_string(), &target.to_string()).await?;
        if out.success() {
            Ok(())
        } else {
            Err(DistributionError::TagFailed {
                source_image: source.to_string(),
                target: target.to_string(),
                stderr: out.stderr,
            })
        }
    }

    async fn save(&self, image: &ImageRef, archive: &Path) -> Result<(), DistributionError> {
        let out = RuntimeAdapter::save(self, &image.to_string(), archive).await?;
        if out.success() {
            Ok(())
        } else {
            Err(DistributionError::SaveFailed {
                image: image.to_string(),
                stderr: out.stderr,
            })
        }
    }
}

/// Node operations over kind (node listing, archive load) and the runtime
/// (exec into the node container for its containerd inventory).
pub struct KindNodeOps {
    kind: Kind,
    runtime: RuntimeAdapter,
}

impl KindNodeOps {
    pub fn new(kind: Kind, runtime: RuntimeAdapter) -> Self {
        Self { kind, runtime }
    }
}

#[async_trait]
impl NodeOps for KindNodeOps {
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<String>, DistributionError> {
        let out = self.kind.nodes(cluster).await?;
        if !out.success() {
            return Err(DistributionError::NodeListFailed {
                cluster: cluster.to_string(),
                stderr: out.stderr,
            });
        }
        Ok(parse_name_lines(&out.stdout))
    }

    async fn load_archive(
        &self,
        cluster: &str,
        node: &str,
        archive: &Path,
    ) -> Result<(), DistributionError> {
        let out = self
            .kind
            .load_archive(cluster, node, &archive.to_string_lossy())
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(DistributionError::LoadFailed {
                node: node.to_string(),
                stderr: out.stderr,
            })
        }
    }

    async fn node_images(&self, node: &str) -> Result<Vec<String>, DistributionError> {
        let out = self
            .runtime
            .exec(node, &["ctr", "--namespace=k8s.io", "images", "list", "-q"])
            .await?;
        if !out.success() {
            return Err(DistributionError::InventoryFailed {
                node: node.to_string(),
                stderr: out.stderr,
            });
        }
        Ok(parse_name_lines(&out.stdout))
    }
}

/// Summary of a completed distribution job.
#[derive(Debug, Clone)]
pub struct DistributionReport {
    pub nodes: Vec<String>,
    pub images_loaded: usize,
}

/// Drives a [`DistributionJob`] to completion.
pub struct Distributor<I, N> {
    images: I,
    nodes: N,
}

impl<I: ImageOps, N: NodeOps> Distributor<I, N> {
    pub fn new(images: I, nodes: N) -> Self {
        Self { images, nodes }
    }

    /// Runs the job: per mapping strictly pull → tag → save → load into
    /// every node, then verifies every node's inventory holds every target.
    ///
    /// Archives land in a fresh temporary directory per run so stale
    /// archives from a prior run cannot be picked up. A pull failure aborts
    /// the whole job; mappings already loaded are not rolled back.
    pub async fn run(&self, job: &DistributionJob) -> Result<DistributionReport, DistributionError> {
        let nodes = self.nodes.list_nodes(&job.cluster).await?;
        if nodes.is_empty() {
            return Err(DistributionError::NoNodes(job.cluster.clone()));
        }

        let workdir = tempfile::tempdir()?;

        for mapping in &job.mappings {
            self.distribute_mapping(job, mapping, &nodes, workdir.path())
                .await?;
        }

        self.verify(&nodes, &job.mappings).await?;

        info!(
            cluster = %job.cluster,
            images = job.mappings.len(),
            nodes = nodes.len(),
            "Image distribution verified"
        );

        Ok(DistributionReport {
            images_loaded: job.mappings.len(),
            nodes,
        })
    }

    async fn distribute_mapping(
        &self,
        job: &DistributionJob,
        mapping: &ImageMapping,
        nodes: &[String],
        workdir: &Path,
    ) -> Result<(), DistributionError> {
        debug!(source = %mapping.source, target = %mapping.target, "Distributing image");

        self.images.pull(&mapping.source).await?;
        self.images.tag(&mapping.source, &mapping.target).await?;

        let archive: PathBuf = workdir.join(format!("{}.tar", Uuid::new_v4()));
        self.images.save(&mapping.target, &archive).await?;

        for node in nodes {
            self.nodes.load_archive(&job.cluster, node, &archive).await?;
            debug!(node = %node, image = %mapping.target, "Archive loaded");
        }

        Ok(())
    }

    /// Asserts every expected image is present in every node's local store,
    /// naming the exact node and image on a miss.
    async fn verify(
        &self,
        nodes: &[String],
        mappings: &[ImageMapping],
    ) -> Result<(), DistributionError> {
        for node in nodes {
            let inventory = self.nodes.node_images(node).await?;
            for mapping in mappings {
                let qualified = mapping.target.qualified();
                let plain = mapping.target.to_string();
                let present = inventory
                    .iter()
                    .any(|entry| entry == &qualified || entry == &plain);
                if !present {
                    return Err(DistributionError::MissingOnNode {
                        node: node.clone(),
                        image: plain,
                    });
                }
            }
        }
        Ok(())
    }
}
