//! Per-chat container sessions.
//!
//! A session key (the chat id) maps to exactly one container and one named
//! workspace volume. Nothing is cached here: every call asks the runtime what
//! state the container is in and acts on that.
//!
//! ```text
//! Absent  --create+start--> Running
//! Absent  --failure-------> error
//! Stopped --start---------> Running
//! Running --(no-op)-------> Running
//! ```
//!
//! Containers are never removed by this module. Environment (credentials,
//! git identity) is applied only when a container is created, so a rotated
//! token takes effect in a new chat, not an existing one.

pub mod docker;
#[cfg(test)]
pub mod memory;
pub mod runtime;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::config::ContainerConfig;
use crate::util::shell_quote;

pub use docker::DockerRuntime;
#[cfg(test)]
pub use memory::InMemoryRuntime;
pub use runtime::{
    ContainerRuntime, ContainerSpec, ExecOutput, ExecRequest, ManagedContainer, RuntimeError,
    SessionState,
};

pub const CONTAINER_PREFIX: &str = "owui-chat-";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_CHAT_ID: &str = "chat-id";
pub const LABEL_TOOL: &str = "tool";
pub const MANAGED_BY: &str = "mcp-file-server";
pub const TOOL_NAME: &str = "computer-use-mcp";

pub const UPLOADS_MOUNT: &str = "/mnt/user-data/uploads";
pub const OUTPUTS_MOUNT: &str = "/mnt/user-data/outputs";
pub const SKILLS_MOUNT: &str = "/mnt/skills";

const TIMER_PID_FILE: &str = "/tmp/.shutdown-timer-pid";
const TIMER_LOCK_FILE: &str = "/tmp/.shutdown-timer.lock";

/// Slack on top of the in-container timeout before the exec call itself is abandoned.
const EXEC_GRACE: Duration = Duration::from_secs(10);

/// Replace every character outside `[A-Za-z0-9_.-]` with `-`.
///
/// Keys that differ only in disallowed characters collide (`a/b` and `a:b`
/// both become `a-b`) and therefore share a container.
pub fn sanitize_key(session_key: &str) -> String {
    session_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn container_name(session_key: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, sanitize_key(session_key))
}

pub fn volume_name(session_key: &str) -> String {
    format!("chat-{}-workspace", sanitize_key(session_key))
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Container runtime unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("Container image not found: {0}")]
    ImageNotFound(String),

    #[error("Container resource limits rejected: {0}")]
    ResourceLimitExceeded(String),

    #[error("Command timed out after {} seconds", .0.as_secs())]
    TimedOut(Duration),

    #[error("Invalid session key: {0:?}")]
    SessionKeyInvalid(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl From<RuntimeError> for SessionError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::ImageNotFound(msg) => SessionError::ImageNotFound(msg),
            RuntimeError::ResourceLimit(msg) => SessionError::ResourceLimitExceeded(msg),
            RuntimeError::Unavailable(msg) => SessionError::InfrastructureUnavailable(msg),
            RuntimeError::TimedOut => {
                SessionError::InfrastructureUnavailable("runtime call timed out".to_string())
            }
            other => SessionError::Runtime(other.to_string()),
        }
    }
}

/// A running session container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerHandle {
    pub session_key: String,
    pub container_name: String,
    pub volume_name: String,
    pub state: SessionState,
    /// True when this call created the container
    pub created: bool,
}

/// Identity commands run as inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: String,
    pub user: Option<String>,
}

impl Workspace {
    /// The computer-use image ships an unprivileged `assistant` user and an
    /// entrypoint; any other image runs as its default user from `/root`.
    pub fn for_image(image: &str) -> Self {
        if uses_entrypoint(image) {
            Self {
                root: "/home/assistant".to_string(),
                user: Some("assistant".to_string()),
            }
        } else {
            Self {
                root: "/root".to_string(),
                user: None,
            }
        }
    }
}

fn uses_entrypoint(image: &str) -> bool {
    image.contains("computer-use")
}

pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    workspace: Workspace,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig) -> Self {
        let workspace = Workspace::for_image(&config.image);
        Self {
            runtime,
            config,
            workspace,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Creation spec for a session. Pure; used by `ensure_running_with_env`.
    pub fn container_spec(&self, session_key: &str, env: &HashMap<String, String>) -> ContainerSpec {
        let sanitized = sanitize_key(session_key);
        let name = container_name(session_key);

        let data_root = chat_data_dir(&self.config.user_data_base_path, session_key);
        let uploads = data_root.join("uploads");
        let outputs = data_root.join("outputs");

        let mut binds = vec![
            format!("{}:{}:rw", volume_name(session_key), self.workspace.root),
            format!("{}:{}:ro", uploads.display(), UPLOADS_MOUNT),
            format!("{}:{}:rw", outputs.display(), OUTPUTS_MOUNT),
        ];
        if let Some(skills) = &self.config.skills_path {
            binds.push(format!("{}:{}:ro", skills.display(), SKILLS_MOUNT));
        }

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels.insert(LABEL_CHAT_ID.to_string(), session_key.to_string());
        labels.insert(LABEL_TOOL.to_string(), TOOL_NAME.to_string());

        let keep_alive = "trap \"exit 0\" SIGTERM SIGINT; tail -f /dev/null & wait $!";
        let (command, user) = if uses_entrypoint(&self.config.image) {
            (
                format!("/home/assistant/.entrypoint.sh bash -c {}", shell_quote(keep_alive)),
                Some("assistant:assistant".to_string()),
            )
        } else {
            (keep_alive.to_string(), None)
        };

        ContainerSpec {
            hostname: format!("chat-{}", sanitized.chars().take(8).collect::<String>()),
            name,
            image: self.config.image.clone(),
            command: vec!["bash".to_string(), "-c".to_string(), command],
            user,
            working_dir: self.workspace.root.clone(),
            env: env.clone(),
            labels,
            binds,
            memory_bytes: self.config.mem_limit_bytes,
            nano_cpus: (self.config.cpu_limit * 1_000_000_000.0) as i64,
            network_disabled: !self.config.enable_network,
            security_opt: vec!["no-new-privileges:true".to_string()],
            host_dirs: vec![
                uploads.display().to_string(),
                outputs.display().to_string(),
            ],
            host_data_root: data_root.display().to_string(),
        }
    }

    /// Make sure the session container exists and is running.
    pub async fn ensure_running(&self, session_key: &str) -> SessionResult<ContainerHandle> {
        self.ensure_running_with_env(session_key, &HashMap::new())
            .await
    }

    /// Like [`ensure_running`](Self::ensure_running); `env` is applied only if
    /// this call creates the container.
    pub async fn ensure_running_with_env(
        &self,
        session_key: &str,
        env: &HashMap<String, String>,
    ) -> SessionResult<ContainerHandle> {
        if session_key.trim().is_empty() {
            return Err(SessionError::SessionKeyInvalid(session_key.to_string()));
        }
        let name = container_name(session_key);

        if self.inspect(&name).await? == SessionState::Running {
            return Ok(self.handle(session_key, false));
        }

        let lock = self.lock_for(&name);
        let result = {
            let _guard = lock.lock().await;
            self.converge(session_key, &name, env).await
        };
        drop(lock);
        self.release_lock(&name);
        result
    }

    async fn converge(
        &self,
        session_key: &str,
        name: &str,
        env: &HashMap<String, String>,
    ) -> SessionResult<ContainerHandle> {
        match self.inspect(name).await? {
            SessionState::Running => Ok(self.handle(session_key, false)),
            SessionState::Stopped => {
                tracing::info!(container = %name, "Starting stopped session container");
                self.bounded(self.runtime.start(name)).await?;
                Ok(self.handle(session_key, false))
            }
            SessionState::Absent => {
                let spec = self.container_spec(session_key, env);
                if let Err(e) = self.bounded(self.runtime.prepare_host_dirs(&spec)).await {
                    tracing::warn!(container = %name, error = %e, "Failed to prepare host data directories");
                }

                tracing::info!(
                    container = %name,
                    image = %spec.image,
                    volume = %volume_name(session_key),
                    "Creating session container"
                );
                match self.bounded(self.runtime.create(&spec)).await {
                    Ok(()) => {
                        self.bounded(self.runtime.start(name)).await?;
                        Ok(self.handle(session_key, true))
                    }
                    Err(RuntimeError::Conflict(_)) => {
                        tracing::debug!(container = %name, "Container created concurrently, reusing it");
                        match self.inspect(name).await? {
                            SessionState::Running => Ok(self.handle(session_key, false)),
                            _ => {
                                self.bounded(self.runtime.start(name)).await?;
                                Ok(self.handle(session_key, false))
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(container = %name, error = %e, "Failed to create session container");
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Run `command` in the session container, creating or starting it first.
    pub async fn exec(
        &self,
        session_key: &str,
        command: &str,
        timeout: Duration,
    ) -> SessionResult<ExecOutput> {
        self.exec_with(session_key, &HashMap::new(), command, None, timeout)
            .await
    }

    /// Full form of [`exec`](Self::exec): creation env and an optional stdin payload.
    pub async fn exec_with(
        &self,
        session_key: &str,
        env: &HashMap<String, String>,
        command: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> SessionResult<ExecOutput> {
        let handle = self.ensure_running_with_env(session_key, env).await?;
        let name = handle.container_name;

        self.reset_idle_timer(&name).await;

        let request = ExecRequest {
            command: command.to_string(),
            user: self.workspace.user.clone(),
            working_dir: Some(self.workspace.root.clone()),
            stdin,
            timeout: Some(timeout),
        };

        let started = Instant::now();
        let output = match tokio::time::timeout(timeout + EXEC_GRACE, self.runtime.exec(&name, &request)).await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(container = %name, "Exec did not return after its timeout");
                return Err(SessionError::TimedOut(timeout));
            }
        };

        // `timeout(1)` passes the command's own status through, so 124 or 137
        // only mean a timeout once the limit has actually elapsed.
        let timed_out = (output.exit_code == runtime::TIMEOUT_EXIT_CODE
            || output.exit_code == runtime::KILLED_EXIT_CODE)
            && started.elapsed() >= timeout;
        if timed_out {
            tracing::info!(container = %name, timeout_secs = timeout.as_secs(), "Command timed out");
            return Err(SessionError::TimedOut(timeout));
        }

        tracing::debug!(
            container = %name,
            exit_code = output.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        Ok(output)
    }

    /// Managed containers and their observed state.
    pub async fn list_sessions(&self) -> SessionResult<Vec<ManagedContainer>> {
        Ok(self.bounded(self.runtime.list_managed()).await?)
    }

    /// Restart the in-container idle timer; the container stops itself when it fires.
    ///
    /// One detached shell replaces the previous timer and registers itself
    /// under `flock`, so concurrent resets always leave exactly one timer.
    async fn reset_idle_timer(&self, name: &str) {
        let Some(idle) = self.config.idle_timeout else {
            return;
        };

        let timer = ExecRequest {
            user: self.workspace.user.clone(),
            ..ExecRequest::new(idle_timer_script(idle))
        };
        if let Err(e) = self.bounded(self.runtime.spawn_detached(name, &timer)).await {
            tracing::debug!(container = %name, error = %e, "Failed to reset idle timer");
        }
    }

    async fn inspect(&self, name: &str) -> SessionResult<SessionState> {
        Ok(self.bounded(self.runtime.inspect(name)).await?)
    }

    /// Bound a lifecycle call by the configured runtime timeout.
    async fn bounded<T, F>(&self, call: F) -> Result<T, RuntimeError>
    where
        F: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        tokio::time::timeout(self.config.runtime_timeout, call)
            .await
            .unwrap_or(Err(RuntimeError::TimedOut))
    }

    fn handle(&self, session_key: &str, created: bool) -> ContainerHandle {
        ContainerHandle {
            session_key: session_key.to_string(),
            container_name: container_name(session_key),
            volume_name: volume_name(session_key),
            state: SessionState::Running,
            created,
        }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    fn release_lock(&self, name: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks.get(name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(name);
        }
    }
}

/// Kill the registered timer (and its `sleep`), register this shell, then
/// stop PID 1 after `idle`. Runs detached.
fn idle_timer_script(idle: Duration) -> String {
    format!(
        "exec 9>{lock}; flock 9; \
         PID=$(cat {pid} 2>/dev/null); \
         if [ -n \"$PID\" ]; then pkill -P \"$PID\" 2>/dev/null; kill \"$PID\" 2>/dev/null; fi; \
         echo $$ > {pid}; flock -u 9; exec 9>&-; \
         sleep {secs} && kill 1",
        lock = TIMER_LOCK_FILE,
        pid = TIMER_PID_FILE,
        secs = idle.as_secs()
    )
}

/// Directory under `base` holding a chat's `uploads/` and `outputs/`.
///
/// Uses the sanitized key; a key made only of dots would name `.` or `..`,
/// so its dots become dashes.
pub fn chat_data_dir(base: &Path, session_key: &str) -> PathBuf {
    let sanitized = sanitize_key(session_key);
    if sanitized.chars().all(|c| c == '.') {
        base.join("-".repeat(sanitized.len().max(1)))
    } else {
        base.join(sanitized)
    }
}
