//! Container runtime adapter: a uniform trait over Docker/Kubernetes-style
//! job launch, used by the node agent to run algorithm containers without
//! caring which runtime backs a particular node.

pub mod docker;
pub mod image_ref;
pub mod k8s_status;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use v6_types::status::RunStatus;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker API error: {0}")]
    Docker(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("job not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything the runtime needs to launch one algorithm container.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub run_id: u64,
    pub task_id: u64,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub labels: BTreeMap<String, String>,
    /// Name of an isolated network the container should be attached to;
    /// `None` runs the container with the runtime default (tests only).
    pub network_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub status: RunStatus,
    pub exit_code: Option<i64>,
    pub logs: String,
    pub output: Vec<u8>,
}

/// A handle to a launched job; obtained from [`ContainerRuntime::launch`].
#[async_trait]
pub trait JobHandle: Send {
    async fn wait(&mut self) -> Result<JobResult, RuntimeError>;
    async fn kill(&mut self) -> Result<(), RuntimeError>;
}

/// Uniform contract every container backend implements. The node agent
/// depends only on this trait, never on `bollard` or a Kubernetes client
/// directly.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn launch(&self, spec: JobSpec) -> Result<Box<dyn JobHandle>, RuntimeError>;
}
