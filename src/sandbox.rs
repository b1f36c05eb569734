//! Sandbox abstraction consumed by the reconciler
//!
//! A sandbox is an isolated execution environment that tracks processes and
//! exposes a private network reachable only from inside it. The reconciler
//! never owns a sandbox or its processes; it only observes them and asks for
//! processes to be started or killed.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared handle to a sandbox-tracked process
pub type ProcessRef = Arc<dyn SandboxProcess>;

/// Status of a process as reported by the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Process has been spawned but is not confirmed up yet
    Starting,
    /// Process is running
    Running,
    /// Process exited on its own
    Exited,
    /// Process failed to start or was killed
    Failed,
}

impl ProcessStatus {
    /// Whether the process can still become (or already is) the gateway
    pub fn is_live(&self) -> bool {
        match self {
            ProcessStatus::Starting | ProcessStatus::Running => true,
            ProcessStatus::Exited | ProcessStatus::Failed => false,
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Exited => "exited",
            ProcessStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How `wait_for_port` decides the port is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortWaitMode {
    /// Port accepts a TCP connection
    Tcp,
    /// Port answers an HTTP request on the given path (any status)
    Http { path: String },
}

/// Captured output of a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Options passed to `Sandbox::start_process`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Environment overrides; `None` means "inherit the sandbox default"
    pub env: Option<HashMap<String, String>>,
}

/// A request sent into the sandbox's private network
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
        }
    }
}

/// Response to a `FetchRequest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
}

/// Errors reported by a sandbox implementation
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("process not found: {0}")]
    NotFound(String),

    #[error("sandbox rejected the operation: {0}")]
    Rejected(String),
}

/// One OS-level process inside the sandbox
#[async_trait]
pub trait SandboxProcess: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn command(&self) -> &str;

    fn status(&self) -> ProcessStatus;

    /// Resolve once `port` is ready, or fail with `SandboxError::Timeout`
    async fn wait_for_port(
        &self,
        port: u16,
        mode: PortWaitMode,
        timeout: Duration,
    ) -> Result<(), SandboxError>;

    async fn get_logs(&self) -> Result<ProcessLogs, SandboxError>;

    async fn kill(&self) -> Result<(), SandboxError>;
}

/// An isolated execution environment hosting the gateway
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Stable identifier, used to scope launch leases
    fn id(&self) -> &str;

    async fn list_processes(&self) -> Result<Vec<ProcessRef>, SandboxError>;

    async fn start_process(
        &self,
        command: &str,
        options: StartOptions,
    ) -> Result<ProcessRef, SandboxError>;

    /// Send a request to `port` on the sandbox's private network
    async fn container_fetch(
        &self,
        request: FetchRequest,
        port: u16,
    ) -> Result<FetchResponse, SandboxError>;
}
