//! The seam between the orchestrator and whatever runs containers.
//!
//! [`DockerEngine`] talks to a Docker daemon through `bollard`. Tests swap in
//! their own implementation.

mod docker;

pub use docker::DockerEngine;

use async_trait::async_trait;
use bytes::Bytes;

use crate::archive::TranscodedArchive;
use crate::error::EngineError;

/// The container engine calls an evaluation needs.
///
/// Implementations must be safe to share between concurrent evaluations; each
/// call only touches the container it names.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Makes `image` available locally.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Creates a stopped container running `image` with `cmd` as its
    /// arguments. Returns the container id.
    async fn create_container(&self, image: &str, cmd: &[String]) -> Result<String, EngineError>;

    /// Unpacks a tar archive into directory `path` of the container.
    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: TranscodedArchive,
    ) -> Result<(), EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// The container's combined stdout and stderr, still framed.
    async fn container_logs(&self, id: &str) -> Result<Bytes, EngineError>;

    /// A tar archive holding `path`, or `None` if the path does not exist.
    async fn download_archive(&self, id: &str, path: &str) -> Result<Option<Bytes>, EngineError>;

    /// Removes the container, killing it first if it still runs.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}
