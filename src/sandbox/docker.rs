//! Container isolates running the Node harness under Docker.
//!
//! The container gets no network, a read-only root filesystem, dropped
//! capabilities, a pids limit and a hard memory limit. The run's working
//! directory is never mounted: file access goes through the host's scoped
//! capabilities over the attached stdio stream.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio::io::BufReader;
use tokio_util::io::StreamReader;
use tracing::debug;
use uuid::Uuid;

use super::harness::node_args;
use super::isolate::{Isolate, IsolateChannel, IsolateProvider};
use super::limits::SandboxLimits;
use crate::error::SandboxError;

/// Default image for container isolates.
pub const DEFAULT_SANDBOX_IMAGE: &str = "node:20-alpine";

/// Cap on captured stderr per run.
const MAX_DIAGNOSTIC_BYTES: usize = 8 * 1024;

/// Provides isolates backed by short-lived Docker containers.
pub struct DockerIsolateProvider {
    docker: Docker,
    image: String,
}

impl DockerIsolateProvider {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::DaemonUnavailable` if the daemon is not accessible.
    pub fn connect(image: impl Into<String>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::DaemonUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_docker(docker, image))
    }

    /// Creates a provider from an existing bollard client.
    pub fn from_docker(docker: Docker, image: impl Into<String>) -> Self {
        Self {
            docker,
            image: image.into(),
        }
    }

    fn container_config(&self, limits: &SandboxLimits) -> Config<String> {
        let host_config = HostConfig {
            memory: Some(limits.memory_bytes()),
            memory_swap: Some(limits.memory_bytes()),
            cpu_period: Some(limits.cpu_period()),
            cpu_quota: Some(limits.cpu_quota()),
            pids_limit: Some(limits.max_processes),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        let mut cmd = vec!["node".to_string()];
        // The container is the jail; its Node release is not checked.
        cmd.extend(node_args(limits.memory_mb, None));

        Config {
            image: Some(self.image.clone()),
            cmd: Some(cmd),
            user: Some("1000:1000".to_string()),
            working_dir: Some("/tmp".to_string()),
            network_disabled: Some(true),
            tty: Some(false),
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IsolateProvider for DockerIsolateProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn provision(
        &self,
        workdir: &Path,
        limits: &SandboxLimits,
    ) -> Result<Box<dyn Isolate>, SandboxError> {
        let options = CreateContainerOptions {
            name: format!("debt-forge-sandbox-{}", Uuid::new_v4()),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), self.container_config(limits))
            .await
            .map_err(|e| {
                SandboxError::ProvisionFailed(format!("Failed to create container: {e}"))
            })?;

        debug!(
            container_id = %response.id,
            workdir = %workdir.display(),
            "Sandbox container created"
        );

        Ok(Box::new(DockerIsolate {
            docker: self.docker.clone(),
            id: response.id,
            stderr: Arc::new(Mutex::new(String::new())),
        }))
    }
}

/// One sandbox container.
struct DockerIsolate {
    docker: Docker,
    id: String,
    stderr: Arc<Mutex<String>>,
}

#[async_trait]
impl Isolate for DockerIsolate {
    async fn start(&mut self) -> Result<IsolateChannel, SandboxError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(&self.id, Some(options))
            .await
            .map_err(|e| SandboxError::Docker(format!("Failed to attach container: {e}")))?;

        self.docker
            .start_container(&self.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Docker(format!("Failed to start container: {e}")))?;

        let stderr = Arc::clone(&self.stderr);
        let stdout = output.filter_map(move |item| {
            let stderr = Arc::clone(&stderr);
            async move {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(message))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        if let Ok(mut text) = stderr.lock() {
                            if text.len() < MAX_DIAGNOSTIC_BYTES {
                                text.push_str(&String::from_utf8_lossy(&message));
                            }
                        }
                        None
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(std::io::Error::other(e.to_string()))),
                }
            }
        });

        let reader = BufReader::new(StreamReader::new(Box::pin(stdout)));
        Ok(IsolateChannel::new(reader, input))
    }

    fn diagnostics(&self) -> Option<String> {
        let text = self.stderr.lock().ok()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    async fn dispose(self: Box<Self>) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(&self.id, Some(options))
            .await
            .map_err(|e| SandboxError::Docker(format!("Failed to remove container: {e}")))?;

        debug!(container_id = %self.id, "Sandbox container removed");
        Ok(())
    }
}
