//! Docker implementation of [`ContainerRuntime`] backed by bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::runtime::{
    wrap_with_timeout, ContainerRuntime, ContainerSpec, ExecOutput, ExecRequest, ManagedContainer,
    RuntimeError, SessionState,
};
use super::{LABEL_MANAGED_BY, MANAGED_BY};
use crate::util::shell_quote;

/// Seconds bollard waits on a single HTTP exchange with the daemon.
const CLIENT_TIMEOUT_SECS: u64 = 600;

pub struct DockerRuntime {
    docker: Docker,
    /// Image used for the short-lived directory helper container
    helper_image: String,
}

impl DockerRuntime {
    /// Connect to the daemon. `socket` may be `unix:///path`, a bare socket path,
    /// `tcp://host:port` or `http://host:port`; None uses the local defaults.
    pub fn connect(socket: Option<&str>, helper_image: &str) -> Result<Self, RuntimeError> {
        let docker = match socket {
            None => Docker::connect_with_local_defaults(),
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
                Docker::connect_with_http(addr, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(addr) => {
                let path = addr.strip_prefix("unix://").unwrap_or(addr);
                Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        }
        .map_err(map_error)?;

        Ok(Self {
            docker,
            helper_image: helper_image.to_string(),
        })
    }

    async fn collect_exec(
        &self,
        exec_id: &str,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        let started = self
            .docker
            .start_exec(exec_id, None::<StartExecOptions>)
            .await
            .map_err(map_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match started {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                if let Some(payload) = stdin {
                    input
                        .write_all(payload)
                        .await
                        .map_err(|e| RuntimeError::Other(format!("stdin write failed: {}", e)))?;
                    input
                        .shutdown()
                        .await
                        .map_err(|e| RuntimeError::Other(format!("stdin close failed: {}", e)))?;
                }
                drop(input);

                while let Some(chunk) = output.next().await {
                    match chunk.map_err(map_error)? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message)
                        }
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspected = self.docker.inspect_exec(exec_id).await.map_err(map_error)?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: inspected.exit_code.unwrap_or(-1),
        })
    }

    async fn create_exec(
        &self,
        name: &str,
        request: &ExecRequest,
        attach: bool,
    ) -> Result<String, RuntimeError> {
        let command = match request.timeout {
            Some(limit) => wrap_with_timeout(&request.command, limit),
            None => request.command.clone(),
        };

        let created = self
            .docker
            .create_exec(
                name,
                CreateExecOptions::<String> {
                    cmd: Some(vec!["bash".to_string(), "-c".to_string(), command]),
                    attach_stdout: Some(attach),
                    attach_stderr: Some(attach),
                    attach_stdin: Some(attach && request.stdin.is_some()),
                    user: request.user.clone(),
                    working_dir: request.working_dir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_error)?;
        Ok(created.id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<SessionState, RuntimeError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let status = info.state.and_then(|s| s.status);
                Ok(match status {
                    Some(ContainerStateStatusEnum::RUNNING) => SessionState::Running,
                    _ => SessionState::Stopped,
                })
            }
            Err(e) => match map_error(e) {
                RuntimeError::NotFound(_) => Ok(SessionState::Absent),
                other => Err(other),
            },
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            cmd: Some(spec.command.clone()),
            user: spec.user.clone(),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            network_disabled: spec.network_disabled.then_some(true),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                memory: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                security_opt: Some(spec.security_opt.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| match map_error(e) {
                RuntimeError::NotFound(msg) => RuntimeError::ImageNotFound(format!(
                    "{} ({})",
                    spec.image, msg
                )),
                other => other,
            })?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let paused = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|s| s.status)
            == Some(ContainerStateStatusEnum::PAUSED);

        if paused {
            tracing::info!(container = %name, "Unpausing container");
            return self.docker.unpause_container(name).await.map_err(map_error);
        }

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error)
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        let exec_id = self.create_exec(name, request, true).await?;
        self.collect_exec(&exec_id, request.stdin.as_deref()).await
    }

    async fn spawn_detached(&self, name: &str, request: &ExecRequest) -> Result<(), RuntimeError> {
        let exec_id = self.create_exec(name, request, false).await?;
        self.docker
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn prepare_host_dirs(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        if spec.host_dirs.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = spec.host_dirs.iter().map(|d| shell_quote(d)).collect();
        let script = format!(
            "mkdir -p {} && chmod -R 777 {}",
            quoted.join(" "),
            shell_quote(&spec.host_data_root)
        );

        // The daemon may run on another host, so the directories are made
        // from a throwaway container that binds the data root at the same path.
        let helper_name = format!("{}-init", spec.name);
        let parent = std::path::Path::new(&spec.host_data_root)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| spec.host_data_root.clone());

        let config = ContainerConfig {
            image: Some(self.helper_image.clone()),
            cmd: Some(vec!["bash".to_string(), "-c".to_string(), script]),
            user: Some("root".to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}:rw", parent, parent)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: helper_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(map_error)?;

        let outcome = async {
            self.docker
                .start_container(&helper_name, None::<StartContainerOptions<String>>)
                .await
                .map_err(map_error)?;
            let mut wait = self
                .docker
                .wait_container(&helper_name, None::<WaitContainerOptions<String>>);
            while let Some(status) = wait.next().await {
                status.map_err(map_error)?;
            }
            Ok::<(), RuntimeError>(())
        }
        .await;

        if let Err(e) = self
            .docker
            .remove_container(
                &helper_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::debug!(container = %helper_name, error = %e, "Failed to remove helper container");
        }

        outcome
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY)],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_error)?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let session_key = c
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(super::LABEL_CHAT_ID).cloned());
                let state = match c.state.as_deref() {
                    Some("running") => SessionState::Running,
                    _ => SessionState::Stopped,
                };
                ManagedContainer {
                    name,
                    session_key,
                    image: c.image,
                    state,
                }
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map(|_| ()).map_err(map_error)
    }
}

fn map_error(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => {
                if message.contains("No such image") || message.contains("pull access denied") {
                    RuntimeError::ImageNotFound(message)
                } else {
                    RuntimeError::NotFound(message)
                }
            }
            409 => RuntimeError::Conflict(message),
            _ if is_resource_message(&message) => RuntimeError::ResourceLimit(message),
            500..=599 => RuntimeError::Unavailable(message),
            _ => RuntimeError::Other(message),
        },
        BollardError::RequestTimeoutError => RuntimeError::TimedOut,
        BollardError::IOError { err } => RuntimeError::Unavailable(err.to_string()),
        e @ BollardError::HyperResponseError { .. } => RuntimeError::Unavailable(e.to_string()),
        e @ BollardError::SocketNotFoundError(_) => RuntimeError::Unavailable(e.to_string()),
        other => RuntimeError::Other(other.to_string()),
    }
}

fn is_resource_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("memory limit")
        || lower.contains("range of cpus")
        || lower.contains("nanocpus")
        || lower.contains("no space left")
        || lower.contains("insufficient")
}
