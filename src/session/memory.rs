//! In-memory container runtime for tests.
//!
//! Containers are plain map entries; exec results come from a pluggable
//! handler. Call counters make it easy to assert which lifecycle actions ran.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::runtime::{
    ContainerRuntime, ContainerSpec, ExecOutput, ExecRequest, ManagedContainer, RuntimeError,
    SessionState, TIMEOUT_EXIT_CODE,
};

type ExecHandler = dyn Fn(&ExecRequest) -> ExecOutput + Send + Sync;

#[derive(Debug, Clone)]
struct Entry {
    spec: Option<ContainerSpec>,
    running: bool,
}

/// Counts of lifecycle calls observed by the runtime.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub inspect: AtomicUsize,
    pub create: AtomicUsize,
    pub start: AtomicUsize,
    pub exec: AtomicUsize,
    pub detached: AtomicUsize,
    pub prepare: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct InMemoryRuntime {
    containers: Mutex<HashMap<String, Entry>>,
    exec_log: Mutex<Vec<(String, ExecRequest)>>,
    pub calls: CallCounts,
    handler: Arc<ExecHandler>,
    create_delay: Duration,
    inspect_delay: Duration,
    exec_duration: Duration,
    missing_image: bool,
    unavailable: bool,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            exec_log: Mutex::new(Vec::new()),
            calls: CallCounts::default(),
            handler: Arc::new(|_| ExecOutput::default()),
            create_delay: Duration::ZERO,
            inspect_delay: Duration::ZERO,
            exec_duration: Duration::ZERO,
            missing_image: false,
            unavailable: false,
        }
    }

    /// Answer every exec with `handler`.
    pub fn with_exec_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ExecRequest) -> ExecOutput + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Make `create` slow, widening the window for concurrent callers.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Make `inspect` hang, as a wedged daemon would.
    pub fn with_inspect_delay(mut self, delay: Duration) -> Self {
        self.inspect_delay = delay;
        self
    }

    /// Simulated run time of every command. Commands whose timeout is shorter
    /// end the way `timeout(1)` ends them.
    pub fn with_exec_duration(mut self, duration: Duration) -> Self {
        self.exec_duration = duration;
        self
    }

    /// Fail every `create` as if the image did not exist.
    pub fn with_missing_image(mut self) -> Self {
        self.missing_image = true;
        self
    }

    /// Fail every call as if the daemon were down.
    pub fn with_unavailable_daemon(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Register an existing container that is not running.
    pub fn insert_stopped(&self, name: &str) {
        self.lock_containers().insert(
            name.to_string(),
            Entry {
                spec: None,
                running: false,
            },
        );
    }

    /// Stop a container, as the idle timer would.
    pub fn stop(&self, name: &str) {
        if let Some(entry) = self.lock_containers().get_mut(name) {
            entry.running = false;
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_containers().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn spec(&self, name: &str) -> Option<ContainerSpec> {
        self.lock_containers().get(name).and_then(|e| e.spec.clone())
    }

    /// Every exec (waited or detached) seen so far, in order.
    pub fn exec_log(&self) -> Vec<(String, ExecRequest)> {
        self.exec_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn lock_containers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, name: &str, request: &ExecRequest) {
        if let Ok(mut log) = self.exec_log.lock() {
            log.push((name.to_string(), request.clone()));
        }
    }

    fn check_daemon(&self) -> Result<(), RuntimeError> {
        if self.unavailable {
            return Err(RuntimeError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn require_running(&self, name: &str) -> Result<(), RuntimeError> {
        match self.lock_containers().get(name) {
            Some(entry) if entry.running => Ok(()),
            Some(_) => Err(RuntimeError::Other(format!("container {} is not running", name))),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn inspect(&self, name: &str) -> Result<SessionState, RuntimeError> {
        self.calls.inspect.fetch_add(1, Ordering::SeqCst);
        self.check_daemon()?;
        if !self.inspect_delay.is_zero() {
            tokio::time::sleep(self.inspect_delay).await;
        }
        Ok(match self.lock_containers().get(name) {
            Some(entry) if entry.running => SessionState::Running,
            Some(_) => SessionState::Stopped,
            None => SessionState::Absent,
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        self.check_daemon()?;
        if self.missing_image {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let mut containers = self.lock_containers();
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        containers.insert(
            spec.name.clone(),
            Entry {
                spec: Some(spec.clone()),
                running: false,
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        self.check_daemon()?;
        match self.lock_containers().get_mut(name) {
            Some(entry) => {
                entry.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        self.calls.exec.fetch_add(1, Ordering::SeqCst);
        self.check_daemon()?;
        self.require_running(name)?;
        self.record(name, request);

        if !self.exec_duration.is_zero() {
            match request.timeout {
                Some(limit) if limit < self.exec_duration => {
                    tokio::time::sleep(limit).await;
                    return Ok(ExecOutput {
                        exit_code: TIMEOUT_EXIT_CODE,
                        ..Default::default()
                    });
                }
                _ => tokio::time::sleep(self.exec_duration).await,
            }
        }
        Ok((self.handler)(request))
    }

    async fn spawn_detached(&self, name: &str, request: &ExecRequest) -> Result<(), RuntimeError> {
        self.calls.detached.fetch_add(1, Ordering::SeqCst);
        self.check_daemon()?;
        self.require_running(name)?;
        self.record(name, request);
        Ok(())
    }

    async fn prepare_host_dirs(&self, _spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.calls.prepare.fetch_add(1, Ordering::SeqCst);
        self.check_daemon()
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        self.check_daemon()?;
        let mut managed: Vec<ManagedContainer> = self
            .lock_containers()
            .iter()
            .map(|(name, entry)| ManagedContainer {
                name: name.clone(),
                session_key: entry
                    .spec
                    .as_ref()
                    .and_then(|s| s.labels.get(super::LABEL_CHAT_ID).cloned()),
                image: entry.spec.as_ref().map(|s| s.image.clone()),
                state: if entry.running {
                    SessionState::Running
                } else {
                    SessionState::Stopped
                },
            })
            .collect();
        managed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(managed)
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check_daemon()
    }
}
