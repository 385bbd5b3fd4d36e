//! Docker-backed [`ContainerRuntime`], grounded on the bollard usage in
//! the node agent's predecessor build-container manager: create, start,
//! bind-mount, wait, collect logs/output, remove.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::models::{HostConfig, Mount as DockerMount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use v6_types::status::RunStatus;

use crate::{ContainerRuntime, JobHandle, JobResult, JobSpec, RuntimeError};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Docker(e.to_string()))?;
        Ok(DockerRuntime { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, spec: JobSpec) -> Result<Box<dyn JobHandle>, RuntimeError> {
        let container_name = format!("v6-run-{}", spec.run_id);

        // Best-effort pull; a cached local image is fine even if this fails.
        if let Err(e) = self
            .docker
            .create_image(
                Some(bollard::image::CreateImageOptions {
                    from_image: spec.image.clone(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .find(|r| r.is_err())
            .transpose()
        {
            log::warn!("pull of {} did not complete cleanly: {e}", spec.image);
        }

        let mounts: Vec<DockerMount> = spec
            .mounts
            .iter()
            .map(|m| DockerMount {
                target: Some(m.container_path.clone()),
                source: Some(m.host_path.display().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: Some(mounts),
            network_mode: spec.network_name.clone(),
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let options = Some(CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        });
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            ),
            ..Default::default()
        };

        let create_result = self.docker.create_container(options, config).await;
        let container = match create_result {
            Ok(c) => c,
            Err(e) => {
                log::error!("failed to create container for run {}: {e}", spec.run_id);
                return Ok(Box::new(DockerJobHandle {
                    docker: self.docker.clone(),
                    container_name,
                    container_id: None,
                    precomputed_failure: Some(RunStatus::StartFailed),
                }));
            }
        };

        if let Err(e) = self
            .docker
            .start_container::<String>(&container.id, None)
            .await
        {
            log::error!("failed to start container {}: {e}", container.id);
            return Ok(Box::new(DockerJobHandle {
                docker: self.docker.clone(),
                container_name,
                container_id: Some(container.id),
                precomputed_failure: Some(RunStatus::StartFailed),
            }));
        }

        Ok(Box::new(DockerJobHandle {
            docker: self.docker.clone(),
            container_name,
            container_id: Some(container.id),
            precomputed_failure: None,
        }))
    }
}

struct DockerJobHandle {
    docker: Docker,
    container_name: String,
    container_id: Option<String>,
    precomputed_failure: Option<RunStatus>,
}

#[async_trait]
impl JobHandle for DockerJobHandle {
    async fn wait(&mut self) -> Result<JobResult, RuntimeError> {
        if let Some(status) = self.precomputed_failure {
            return Ok(JobResult {
                status,
                exit_code: None,
                logs: String::new(),
                output: Vec::new(),
            });
        }
        let container_id = self
            .container_id
            .as_ref()
            .ok_or_else(|| RuntimeError::NotFound(self.container_name.clone()))?;

        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);
        let mut exit_code = None;
        while let Some(next) = stream.next().await {
            match next {
                Ok(response) => exit_code = Some(response.status_code),
                Err(e) => log::warn!("error while waiting on container {container_id}: {e}"),
            }
        }

        let status = match exit_code {
            Some(0) => RunStatus::Completed,
            Some(_) => RunStatus::Crashed,
            None => RunStatus::UnknownError,
        };

        let output = self.read_output_file(container_id).await.unwrap_or_default();

        self.cleanup(container_id).await;

        Ok(JobResult {
            status,
            exit_code,
            logs: String::new(),
            output,
        })
    }

    async fn kill(&mut self) -> Result<(), RuntimeError> {
        if let Some(container_id) = self.container_id.clone() {
            if let Err(e) = self.docker.stop_container(&container_id, None).await {
                log::debug!("stop_container({container_id}) failed (may already be stopped): {e}");
            }
            self.cleanup(&container_id).await;
        }
        Ok(())
    }
}

impl DockerJobHandle {
    async fn read_output_file(&self, container_id: &str) -> Option<Vec<u8>> {
        let options = Some(DownloadFromContainerOptions {
            path: "/app/output.txt",
        });
        let mut stream = self.docker.download_from_container(container_id, options);
        let mut tar_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => tar_bytes.extend_from_slice(&bytes),
                Err(e) => {
                    log::debug!("no output.txt retrievable from {container_id}: {e}");
                    return None;
                }
            }
        }
        extract_single_file_from_tar(&tar_bytes)
    }

    async fn cleanup(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            log::debug!("remove_container({container_id}) failed: {e}");
        }
    }
}

fn extract_single_file_from_tar(tar_bytes: &[u8]) -> Option<Vec<u8>> {
    use std::io::Read;
    let mut archive = tar::Archive::new(tar_bytes);
    let mut entries = archive.entries().ok()?;
    let mut entry = entries.next()?.ok()?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).ok()?;
    Some(buf)
}
