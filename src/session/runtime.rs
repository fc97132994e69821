//! Container runtime abstraction.
//!
//! The session manager only talks to containers through [`ContainerRuntime`],
//! so the Docker adapter can be swapped for the in-memory double in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::util::shell_quote;

/// Observed state of a session container. Always read from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Absent,
    Stopped,
    Running,
}

/// Everything needed to create one chat container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub command: Vec<String>,
    pub user: Option<String>,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// `source:target[:mode]` entries, named volumes included
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub network_disabled: bool,
    pub security_opt: Vec<String>,
    /// Host directories that must exist before the binds are usable
    pub host_dirs: Vec<String>,
    /// Parent of `host_dirs`, made world-writable after creation
    pub host_data_root: String,
}

/// One command to run inside a container via `bash -c`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub command: String,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock limit enforced inside the container. None for detached helpers.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            user: None,
            working_dir: None,
            stdin: None,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// A container carrying the management labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedContainer {
    pub name: String,
    pub session_key: Option<String>,
    pub image: Option<String>,
    pub state: SessionState,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container already exists: {0}")]
    Conflict(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("resource limit rejected: {0}")]
    ResourceLimit(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime call timed out")]
    TimedOut,

    #[error("container runtime error: {0}")]
    Other(String),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Current state of the named container.
    async fn inspect(&self, name: &str) -> Result<SessionState, RuntimeError>;

    /// Create (but do not start) a container. `Conflict` when the name is taken.
    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    /// Start a stopped (or paused) container.
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Run a command and wait for it to finish.
    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError>;

    /// Run a command without waiting for it.
    async fn spawn_detached(&self, name: &str, request: &ExecRequest) -> Result<(), RuntimeError>;

    /// Create the host directories a spec binds into the container.
    async fn prepare_host_dirs(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    /// Containers carrying the management labels.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;

    /// Cheap liveness probe of the runtime itself.
    async fn ping(&self) -> Result<(), RuntimeError>;
}

/// Exit status `timeout(1)` reports when it had to stop the command.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Exit status when the command ignored SIGTERM and was killed.
pub const KILLED_EXIT_CODE: i64 = 137;

/// Wrap `command` so the process tree is terminated inside the container once
/// `limit` elapses, with a SIGKILL five seconds later if it ignores SIGTERM.
pub fn wrap_with_timeout(command: &str, limit: Duration) -> String {
    let secs = limit.as_secs().max(1);
    format!(
        "timeout --kill-after=5 {} bash -c {}",
        secs,
        shell_quote(command)
    )
}
