//! clusterforge: ephemeral Kubernetes cluster orchestrator for benchmark harnesses.
//!
//! This library provisions disposable kind clusters, applies task workloads,
//! distributes container images into cluster nodes, drives staged rollouts,
//! and tears everything down idempotently.

// Core modules
pub mod age;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod images;
pub mod kube;
pub mod poll;
pub mod rollout;
pub mod runtime;
pub mod scheduler;
pub mod workload;

// Re-export commonly used error types
pub use error::{
    AnnotateError, ApplyError, ClusterError, DistributionError, EnvError, RolloutError,
};
