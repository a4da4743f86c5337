//! Docker runtime implementation.
//!
//! Talks to the engine through bollard. Exec output arrives already
//! demultiplexed into stdout/stderr frames.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use super::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerSummary, ExecOutput,
    NetworkAttachment, OutputSink, StreamKind,
};
use crate::error::{Result, SandboxError};

/// CPU period used for quota calculation (100000 = 1 core).
const CPU_PERIOD: i64 = 100_000;

/// Seconds the engine client waits on a single API call.
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Runtime backed by a local Docker engine.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the engine and verify it answers.
    ///
    /// Uses `socket_path` when given, otherwise the platform default
    /// (`/var/run/docker.sock` on Unix).
    pub async fn connect(socket_path: Option<&str>) -> Result<Self> {
        let client = match socket_path {
            Some(path) => {
                Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(SandboxError::container)?;

        client.ping().await.map_err(|e| {
            error!(error = %e, "Failed to reach Docker daemon");
            SandboxError::container(e)
        })?;

        info!("Connected to Docker daemon");
        Ok(Self { client })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            debug!(image, "Image present locally");
            return Ok(());
        }
        info!(image, "Image not found locally, pulling");
        self.pull_image(image).await
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Tar archive holding one regular file. The engine extracts it at `/`,
/// so the entry name is the absolute path without its leading slash.
fn single_file_archive(path: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let name = path.trim_start_matches('/');
    if name.is_empty() {
        return Err(SandboxError::ContainerFault(format!(
            "Invalid upload path: {path:?}"
        )));
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default());

    let mut archive = tar::Builder::new(Vec::new());
    archive.append_data(&mut header, name, contents)?;
    Ok(archive.into_inner()?)
}

/// Decodes a byte stream that may split multi-byte characters across frames.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Text decodable so far. An incomplete trailing sequence is held back.
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            return text;
                        }
                    }
                }
            }
        }
    }

    /// Whatever is left once the stream ended.
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let host_config = HostConfig {
            memory: Some((spec.limits.memory_mb * 1024 * 1024) as i64),
            cpu_period: Some(CPU_PERIOD),
            cpu_quota: Some((spec.limits.cpu_cores * CPU_PERIOD as f64) as i64),
            network_mode: spec.network.clone(),
            binds: Some(
                spec.mounts
                    .iter()
                    .map(|m| format!("{}:{}", m.source, m.target))
                    .collect(),
            ),
            auto_remove: Some(true),
            privileged: Some(false),
            readonly_rootfs: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .client
            .create_container(options, config)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to create container");
                SandboxError::container(e)
            })?;

        for warning in &response.warnings {
            warn!(container = %response.id, warning = %warning, "Engine warning on create");
        }
        info!(container = %response.id, "Created container");
        Ok(ContainerHandle::new(response.id))
    }

    #[instrument(skip(self), fields(container = %handle.short_id()))]
    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        match self
            .client
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                debug!("Started container");
                Ok(())
            }
            Err(e) if status_code(&e) == Some(304) => {
                debug!("Container already running");
                Ok(())
            }
            Err(e) => Err(SandboxError::container(e)),
        }
    }

    #[instrument(skip(self), fields(container = %handle.short_id()))]
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.client.stop_container(&handle.id, Some(options)).await {
            Ok(()) => {
                info!("Stopped container");
                Ok(())
            }
            // 304: already stopped. 404: auto-removed after an earlier stop.
            Err(e) if matches!(status_code(&e), Some(304 | 404)) => {
                debug!("Container already stopped");
                Ok(())
            }
            Err(e) => Err(SandboxError::container(e)),
        }
    }

    #[instrument(skip(self, command, on_output), fields(container = %handle.short_id()))]
    async fn exec_foreground(
        &self,
        handle: &ContainerHandle,
        command: &str,
        timeout: Duration,
        on_output: OutputSink<'_>,
    ) -> Result<ExecOutput> {
        let exec = self
            .client
            .create_exec(
                &handle.id,
                CreateExecOptions::<String> {
                    cmd: Some(vec!["sh".into(), "-c".into(), command.into()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(SandboxError::container)?;

        let StartExecResults::Attached { mut output, .. } = self
            .client
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(SandboxError::container)?
        else {
            return Err(SandboxError::ContainerFault(
                "Exec was detached unexpectedly".into(),
            ));
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let collect = async {
            let mut stdout_bytes = Utf8Carry::default();
            let mut stderr_bytes = Utf8Carry::default();
            let mut emit = |kind: StreamKind, chunk: String| {
                if chunk.is_empty() {
                    return;
                }
                on_output(kind, &chunk);
                match kind {
                    StreamKind::Stdout => stdout.push_str(&chunk),
                    StreamKind::Stderr => stderr.push_str(&chunk),
                }
            };
            while let Some(frame) = output.next().await {
                match frame.map_err(SandboxError::container)? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        emit(StreamKind::Stdout, stdout_bytes.push(&message));
                    }
                    LogOutput::StdErr { message } => {
                        emit(StreamKind::Stderr, stderr_bytes.push(&message));
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
            emit(StreamKind::Stdout, stdout_bytes.finish());
            emit(StreamKind::Stderr, stderr_bytes.finish());
            Ok::<_, SandboxError>(())
        };

        if let Ok(result) = tokio::time::timeout(timeout, collect).await {
            result?;
        } else {
            warn!(timeout = ?timeout, "Exec exceeded timeout, stopping container");
            if let Err(e) = self.stop(handle, Duration::ZERO).await {
                error!(error = %e, "Failed to stop container after timeout");
            }
            #[allow(clippy::cast_possible_truncation)]
            return Err(SandboxError::ExecutionTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(SandboxError::container)?;
        let exit_code = inspect.exit_code.unwrap_or(0);
        debug!(exit_code, "Exec finished");

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    #[instrument(skip(self, contents), fields(container = %handle.short_id(), bytes = contents.len()))]
    async fn write_file(&self, handle: &ContainerHandle, path: &str, contents: &[u8]) -> Result<()> {
        let archive = single_file_archive(path, contents)?;
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(&handle.id, Some(options), archive.into())
            .await
            .map_err(|e| {
                error!(error = %e, path, "Failed to upload file");
                SandboxError::container(e)
            })?;
        debug!(path, "Uploaded file");
        Ok(())
    }

    #[instrument(skip(self), fields(container = %handle.short_id()))]
    async fn exec_detached(&self, handle: &ContainerHandle, argv: &[String]) -> Result<()> {
        let exec = self
            .client
            .create_exec(
                &handle.id,
                CreateExecOptions::<String> {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(SandboxError::container)?;

        self.client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(SandboxError::container)?;

        debug!(exec = %exec.id, "Started detached process");
        Ok(())
    }

    async fn inspect_networks(
        &self,
        handle: &ContainerHandle,
    ) -> Result<HashMap<String, NetworkAttachment>> {
        let info = self
            .client
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(SandboxError::container)?;

        let networks = info
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();

        Ok(networks
            .into_iter()
            .filter_map(|(name, endpoint)| {
                let ip_address = endpoint.ip_address.filter(|ip| !ip.is_empty())?;
                Some((name, NetworkAttachment { ip_address }))
            })
            .collect())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(SandboxError::container(e)),
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let mut last_status = String::new();
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| {
                SandboxError::ContainerFault(format!("Failed to pull image {image}: {e}"))
            })?;
            if let Some(error) = info.error {
                return Err(SandboxError::ContainerFault(format!(
                    "Failed to pull image {image}: {error}"
                )));
            }
            if let Some(status) = info.status {
                if status != last_status {
                    debug!(status = %status, "Pull progress");
                    last_status = status;
                }
            }
        }

        info!("Pulled image");
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(SandboxError::container)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .cloned()
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                debug!(container = %id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(SandboxError::container(e)),
        }
    }
}
