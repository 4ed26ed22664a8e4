use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::ContainerEngine;
use crate::archive::TranscodedArchive;
use crate::config::EvaluatorConfig;
use crate::error::EngineError;
use crate::logs::{self, Channel};

/// Waiting on a container legitimately blocks for as long as the program
/// runs, so requests are effectively unbounded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// [`ContainerEngine`] backed by a Docker daemon.
pub struct DockerEngine {
    docker: Docker,
    upload_chunk_size: usize,
    max_output_bytes: usize,
}

impl DockerEngine {
    /// Connects to `config.docker_host`, or to the local default socket when
    /// it is unset. No request is made until the engine is used.
    pub fn new(config: &EvaluatorConfig) -> Result<Self, EngineError> {
        Ok(Self::with_docker(connect(config.docker_host.as_deref())?, config))
    }

    pub fn with_docker(docker: Docker, config: &EvaluatorConfig) -> Self {
        Self {
            docker,
            upload_chunk_size: config.upload_chunk_size,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

fn connect(host: Option<&str>) -> Result<Docker, EngineError> {
    let timeout = REQUEST_TIMEOUT.as_secs();
    let docker = match host {
        None => Docker::connect_with_local_defaults()?,
        #[cfg(unix)]
        Some(host) if host.starts_with("unix://") => {
            Docker::connect_with_unix(host, timeout, API_DEFAULT_VERSION)?
        }
        Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
            Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION)?
        }
        Some(host) => return Err(EngineError::UnsupportedHost(host.to_string())),
    };
    Ok(docker.with_timeout(REQUEST_TIMEOUT))
}

/// Splits an image reference into the `fromImage` and `tag` pull parameters.
/// Docker pulls every tag of a repository when none is given, so untagged
/// references pull `latest`. Digest references carry no tag.
fn pull_params(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}

/// Concatenates a byte stream, failing once it grows past `limit`.
async fn collect_bounded<S>(stream: S, limit: usize) -> Result<Vec<u8>, EngineError>
where
    S: Stream<Item = Result<Bytes, bollard::errors::Error>>,
{
    futures::pin_mut!(stream);
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Err(EngineError::TooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        debug!(%image, "Pulling image");
        let (from_image, tag) = pull_params(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        // Failures after the pull started arrive as progress messages.
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(info) = progress.next().await {
            if let Some(error) = info?.error {
                return Err(EngineError::Api {
                    status: 200,
                    message: error,
                });
            }
        }

        Ok(())
    }

    async fn create_container(&self, image: &str, cmd: &[String]) -> Result<String, EngineError> {
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd.to_vec()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        for warning in &created.warnings {
            warn!(container = %created.id, %warning, "Engine warning on create");
        }

        Ok(created.id)
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: TranscodedArchive,
    ) -> Result<(), EngineError> {
        debug!(container = %id, bytes = archive.len(), %path, "Uploading archive");
        let options = UploadToContainerOptions {
            path,
            ..Default::default()
        };

        let (chunks, reader) = archive.into_stream(self.upload_chunk_size);
        let uploaded = self
            .docker
            .upload_to_container_streaming(id, Some(options), chunks)
            .await;

        // A read error ends the body early; report it ahead of whatever the
        // engine made of the truncated archive.
        reader
            .await
            .map_err(|e| EngineError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        uploaded?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut waited = self.docker.wait_container(id, Some(options));
        match waited.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error; only a message
            // makes it a failed wait.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code }))
                if error.is_empty() =>
            {
                Ok(code)
            }
            Some(Err(bollard::errors::Error::DockerContainerWaitError { error, .. })) => {
                Err(EngineError::Protocol(error))
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Protocol(format!(
                "wait on container {id} ended without a status"
            ))),
        }
    }

    async fn container_logs(&self, id: &str) -> Result<Bytes, EngineError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: "all".to_string(),
            ..Default::default()
        };

        // bollard splits the stream into frames already; they are framed
        // again so every engine hands the orchestrator the same format.
        let mut output = self.docker.logs(id, Some(options));
        let mut raw = Vec::new();
        while let Some(frame) = output.next().await {
            let (channel, message) = match frame? {
                LogOutput::StdErr { message } => (Channel::Stderr, message),
                LogOutput::StdOut { message }
                | LogOutput::StdIn { message }
                | LogOutput::Console { message } => (Channel::Stdout, message),
            };
            if raw.len() + logs::HEADER_LEN + message.len() > self.max_output_bytes {
                return Err(EngineError::TooLarge {
                    limit: self.max_output_bytes,
                });
            }
            raw.extend(logs::encode_frame(channel, &message));
        }

        Ok(Bytes::from(raw))
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Option<Bytes>, EngineError> {
        let options = DownloadFromContainerOptions { path };
        let tar = self.docker.download_from_container(id, Some(options));

        match collect_bounded(tar, self.max_output_bytes).await {
            Ok(tar) => Ok(Some(Bytes::from(tar))),
            Err(EngineError::NotFound(message)) => {
                debug!(container = %id, %path, %message, "Path not found in container");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}
