//! Container runtime trait and shared types.
//!
//! The runtime is a thin adapter over a container engine. It knows nothing
//! about sessions or languages; callers hand it fully-formed specs and shell
//! commands.

mod docker;
pub mod orphans;

pub use docker::DockerRuntime;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Label carrying the kind of container (`session_worker` for sessions).
pub const LABEL_TYPE: &str = "type";
/// Label carrying the owning application.
pub const LABEL_APP: &str = "app";
/// Label carrying the session id a worker belongs to.
pub const LABEL_SESSION: &str = "session_id";
/// `type` label value for session containers.
pub const SESSION_WORKER: &str = "session_worker";

/// Handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Engine-assigned container id.
    pub id: String,
    /// Cached IP on the sandbox network, filled on first inspection.
    #[serde(default)]
    pub network_ip: Option<String>,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_ip: None,
        }
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Memory and CPU quotas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_cores: 1.0,
        }
    }
}

/// Bind of a volume (or host path) into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub limits: ResourceLimits,
    pub mounts: Vec<Mount>,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Which output channel a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Callback invoked for every demultiplexed output chunk, as it arrives.
pub type OutputSink<'a> = &'a (dyn Fn(StreamKind, &str) + Send + Sync);

/// Collected result of a foreground command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Network attachment of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub ip_address: String,
}

/// Listing entry used by the orphan sweep.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// Contract for container engines.
///
/// "Already started" and "already stopped" responses are swallowed by
/// implementations; every other engine failure surfaces as
/// [`SandboxError::ContainerFault`](crate::error::SandboxError::ContainerFault).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container, pulling its image if absent.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Start a container. Idempotent.
    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// Stop a container, waiting at most `grace` before killing it. Idempotent.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;

    /// Run a shell command to completion, streaming output chunks to `on_output`.
    ///
    /// If `timeout` elapses the container is forcibly stopped and
    /// [`SandboxError::ExecutionTimeout`](crate::error::SandboxError::ExecutionTimeout)
    /// is returned.
    async fn exec_foreground(
        &self,
        handle: &ContainerHandle,
        command: &str,
        timeout: Duration,
        on_output: OutputSink<'_>,
    ) -> Result<ExecOutput>;

    /// Place `contents` at the absolute `path`, creating missing parent directories.
    async fn write_file(&self, handle: &ContainerHandle, path: &str, contents: &[u8]) -> Result<()>;

    /// Start a process inside the container without waiting or capturing output.
    async fn exec_detached(&self, handle: &ContainerHandle, argv: &[String]) -> Result<()>;

    /// Network name to attachment.
    async fn inspect_networks(
        &self,
        handle: &ContainerHandle,
    ) -> Result<HashMap<String, NetworkAttachment>>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Every container known to the engine, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates() {
        let handle = ContainerHandle::new("0123456789abcdef0123");
        assert_eq!(handle.short_id(), "0123456789ab");
        assert_eq!(ContainerHandle::new("abc").short_id(), "abc");
    }

    #[test]
    fn stream_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&StreamKind::Stderr).unwrap(),
            "\"stderr\""
        );
    }
}
