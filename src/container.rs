//! Container lifecycle for one evaluation.
//!
//! A [`Container`] is created by [`ContainerOrchestrator::create_container`]
//! and consumed by [`ContainerOrchestrator::destroy`], so it can only be
//! destroyed once. A container that is dropped without being destroyed (the
//! evaluation future was cancelled, or something panicked) schedules its own
//! removal on the current runtime.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::archive::{self, TranscodedArchive};
use crate::config::EvaluatorConfig;
use crate::engine::ContainerEngine;
use crate::error::{EngineError, EvaluationError, Result};
use crate::evaluation::ResourceLimits;
use crate::logs;

/// Home directory of the evaluation user inside every evaluator image.
pub const HOME_PATH: &str = "/home/coursemology";

/// Where evaluator images write their test report.
pub const REPORT_PATH: &str = "/home/coursemology/package/report.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Started,
    Exited,
    Destroyed,
}

/// Handle to an engine-managed container.
pub struct Container {
    id: String,
    image: String,
    args: Vec<String>,
    state: ContainerState,
    exit_code: Option<i64>,
    engine: Arc<dyn ContainerEngine>,
}

impl Container {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Set once the container has exited.
    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("args", &self.args)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.state == ContainerState::Destroyed {
            return;
        }

        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(container = %id, "Container dropped before destroy, removing in background");
                let engine = Arc::clone(&self.engine);
                handle.spawn(async move {
                    if let Err(e) = engine.remove_container(&id).await {
                        warn!(container = %id, error = %e, "Background container removal failed");
                    }
                });
            }
            Err(_) => {
                warn!(container = %id, "Container dropped outside a runtime and was not removed");
            }
        }
    }
}

/// Drives containers through create, inject, run, collect and destroy.
pub struct ContainerOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    image_prefix: String,
    pull_images: bool,
    wait_timeout: Option<Duration>,
    max_output_bytes: usize,
}

impl ContainerOrchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &EvaluatorConfig) -> Self {
        Self {
            engine,
            image_prefix: config.image_prefix.clone(),
            pull_images: config.pull_images,
            wait_timeout: config.wait_timeout,
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// The full image reference for an image identifier.
    pub fn image_reference(&self, image_identifier: &str) -> String {
        format!("{}{}", self.image_prefix, image_identifier)
    }

    /// Creates a container for `image_identifier` with `limits` translated into
    /// launch arguments.
    #[instrument(skip(self, limits))]
    pub async fn create_container(
        &self,
        image_identifier: &str,
        limits: &ResourceLimits,
    ) -> Result<Container> {
        let image = self.image_reference(image_identifier);
        let args = limits.to_args();

        let creation_failed = |source: EngineError| EvaluationError::ContainerCreation {
            image: image.clone(),
            source,
        };

        if self.pull_images {
            self.engine.pull_image(&image).await.map_err(creation_failed)?;
        }

        let id = self
            .engine
            .create_container(&image, &args)
            .await
            .map_err(creation_failed)?;
        info!(container = %id, %image, ?args, "Created container");

        Ok(Container {
            id,
            image,
            args,
            state: ContainerState::Created,
            exit_code: None,
            engine: Arc::clone(&self.engine),
        })
    }

    /// Copies a transcoded package into the container's home directory.
    #[instrument(skip_all, fields(container = %container.id))]
    pub async fn inject(&self, container: &Container, archive: TranscodedArchive) -> Result<()> {
        self.engine
            .upload_archive(&container.id, HOME_PATH, archive)
            .await
            .map_err(|source| EvaluationError::Injection {
                container: container.id.clone(),
                source,
            })
    }

    /// Starts the container and blocks until it exits. Returns the exit code.
    #[instrument(skip_all, fields(container = %container.id))]
    pub async fn run(&self, container: &mut Container) -> Result<i64> {
        self.engine
            .start_container(&container.id)
            .await
            .map_err(|source| execution_error(container, "start", source))?;
        container.state = ContainerState::Started;
        debug!("Container started");

        let wait = self.engine.wait_container(&container.id);
        let exited = match self.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                EvaluationError::WaitTimeout {
                    container: container.id.clone(),
                    seconds: limit.as_secs(),
                }
            })?,
            None => wait.await,
        };
        let exit_code = exited.map_err(|source| execution_error(container, "wait for", source))?;

        container.state = ContainerState::Exited;
        container.exit_code = Some(exit_code);
        info!(exit_code, "Container exited");
        Ok(exit_code)
    }

    /// Reads the container's output and splits it into `(stdout, stderr)`.
    #[instrument(skip_all, fields(container = %container.id))]
    pub async fn collect_logs(&self, container: &Container) -> Result<(Vec<u8>, Vec<u8>)> {
        let raw = self
            .engine
            .container_logs(&container.id)
            .await
            .map_err(|source| execution_error(container, "read logs of", source))?;

        Ok(logs::demultiplex(&raw)?)
    }

    /// Reads one file out of the container. A missing file is `Ok(None)`.
    #[instrument(skip(self, container), fields(container = %container.id))]
    pub async fn extract_file(&self, container: &Container, path: &str) -> Result<Option<Vec<u8>>> {
        let extract_failed = |source| execution_error(container, "extract a file from", source);

        let Some(tar) = self
            .engine
            .download_archive(&container.id, path)
            .await
            .map_err(extract_failed)?
        else {
            debug!("File absent");
            return Ok(None);
        };

        archive::extract_single_file(&tar[..], self.max_output_bytes)
            .map_err(|e| extract_failed(EngineError::Io(e)))
    }

    /// Removes the container. A failure is returned but not retried.
    ///
    /// The container counts as destroyed only once the engine has answered.
    /// If this future is dropped while the request is in flight, the handle's
    /// drop schedules another removal, and the engine treats the second one
    /// as a no-op or a not-found.
    #[instrument(skip_all, fields(container = %container.id))]
    pub async fn destroy(&self, mut container: Container) -> std::result::Result<(), EngineError> {
        let removed = self.engine.remove_container(&container.id).await;
        container.state = ContainerState::Destroyed;
        removed?;
        info!("Destroyed container");
        Ok(())
    }
}

fn execution_error(container: &Container, step: &'static str, source: EngineError) -> EvaluationError {
    EvaluationError::Execution {
        container: container.id.clone(),
        step,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        removed: AtomicUsize,
        hang_first_remove: bool,
    }

    #[async_trait]
    impl ContainerEngine for CountingEngine {
        async fn pull_image(&self, _image: &str) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        async fn create_container(
            &self,
            _image: &str,
            _cmd: &[String],
        ) -> std::result::Result<String, EngineError> {
            Ok("c0ffee".to_string())
        }

        async fn upload_archive(
            &self,
            _id: &str,
            _path: &str,
            _archive: TranscodedArchive,
        ) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        async fn start_container(&self, _id: &str) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        async fn wait_container(&self, _id: &str) -> std::result::Result<i64, EngineError> {
            Ok(3)
        }

        async fn container_logs(&self, _id: &str) -> std::result::Result<Bytes, EngineError> {
            Ok(Bytes::new())
        }

        async fn download_archive(
            &self,
            _id: &str,
            _path: &str,
        ) -> std::result::Result<Option<Bytes>, EngineError> {
            Ok(None)
        }

        async fn remove_container(&self, _id: &str) -> std::result::Result<(), EngineError> {
            let previous = self.removed.fetch_add(1, Ordering::SeqCst);
            if self.hang_first_remove && previous == 0 {
                futures::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn orchestrator() -> (Arc<CountingEngine>, ContainerOrchestrator) {
        let engine = Arc::new(CountingEngine::default());
        let orchestrator = ContainerOrchestrator::new(engine.clone(), &EvaluatorConfig::default());
        (engine, orchestrator)
    }

    #[test]
    fn test_image_reference() {
        let (_, orchestrator) = orchestrator();
        assert_eq!(
            orchestrator.image_reference("python:2.7"),
            "coursemology/evaluator-image-python:2.7"
        );
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let (engine, orchestrator) = orchestrator();
        let limits = ResourceLimits::default();

        let mut container = orchestrator.create_container("python:3.10", &limits).await.unwrap();
        assert_eq!(container.state(), ContainerState::Created);
        assert!(container.args().is_empty());

        assert_eq!(orchestrator.run(&mut container).await.unwrap(), 3);
        assert_eq!(container.state(), ContainerState::Exited);
        assert_eq!(container.exit_code(), Some(3));

        orchestrator.destroy(container).await.unwrap();
        assert_eq!(engine.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_container_is_removed_in_background() {
        let (engine, orchestrator) = orchestrator();
        let container = orchestrator
            .create_container("java", &ResourceLimits::default())
            .await
            .unwrap();
        drop(container);

        for _ in 0..100 {
            if engine.removed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_destroy_schedules_removal() {
        let engine = Arc::new(CountingEngine {
            hang_first_remove: true,
            ..CountingEngine::default()
        });
        let orchestrator = ContainerOrchestrator::new(engine.clone(), &EvaluatorConfig::default());
        let container = orchestrator
            .create_container("java", &ResourceLimits::default())
            .await
            .unwrap();

        let destroy = orchestrator.destroy(container);
        assert!(tokio::time::timeout(Duration::from_millis(20), destroy)
            .await
            .is_err());

        for _ in 0..100 {
            if engine.removed.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.removed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_completed_destroy_removes_once() {
        let (engine, orchestrator) = orchestrator();
        let container = orchestrator
            .create_container("java", &ResourceLimits::default())
            .await
            .unwrap();
        orchestrator.destroy(container).await.unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let (_, orchestrator) = orchestrator();
        let container = orchestrator
            .create_container("python:3.10", &ResourceLimits::default())
            .await
            .unwrap();

        assert_eq!(orchestrator.extract_file(&container, REPORT_PATH).await.unwrap(), None);
        orchestrator.destroy(container).await.unwrap();
    }
}
