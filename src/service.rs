//! The entry point: run one [`Evaluation`] to completion.

use std::io;
use std::sync::Arc;

use tracing::{instrument, warn};

use crate::archive;
use crate::config::EvaluatorConfig;
use crate::container::{Container, ContainerOrchestrator, REPORT_PATH};
use crate::engine::{ContainerEngine, DockerEngine};
use crate::error::{EngineError, EvaluationError, Result};
use crate::evaluation::{Evaluation, EvaluationResult, Package};

/// Maps a submission's language onto an evaluator image identifier.
pub trait ImageResolver: Send + Sync {
    fn image_for(&self, language: &str) -> Result<String>;
}

/// Uses the language identifier itself as the image identifier, so
/// `python:2.7` runs `<prefix>python:2.7`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LanguageImage;

impl ImageResolver for LanguageImage {
    fn image_for(&self, language: &str) -> Result<String> {
        let language = language.trim();
        if language.is_empty() {
            return Err(EvaluationError::ImageResolution {
                language: language.to_string(),
                reason: "language identifier is empty".to_string(),
            });
        }
        Ok(language.to_string())
    }
}

/// Runs evaluations against a container engine.
///
/// Evaluations share nothing but the engine, so one service can serve many
/// concurrent [`execute`](Self::execute) calls.
///
/// # Example
///
/// ```no_run
/// use package_evaluator::{Evaluation, EvaluationService, EvaluatorConfig, Package};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let service = EvaluationService::new(EvaluatorConfig::from_env())?;
/// let evaluation = Evaluation::new(Package::open("submission.zip")?, "python:3.10")
///     .with_time_limit(5)
///     .with_memory_limit(256);
///
/// let result = service.execute(evaluation).await?;
/// println!("exit {}: {}", result.exit_code, result.stdout_lossy());
/// # Ok(())
/// # }
/// ```
pub struct EvaluationService {
    orchestrator: ContainerOrchestrator,
    resolver: Box<dyn ImageResolver>,
    spool_threshold: usize,
}

impl EvaluationService {
    /// A service talking to the Docker engine named in `config`.
    pub fn new(config: EvaluatorConfig) -> std::result::Result<Self, EngineError> {
        let engine = DockerEngine::new(&config)?;
        Ok(Self::with_engine(Arc::new(engine), &config))
    }

    pub fn with_engine(engine: Arc<dyn ContainerEngine>, config: &EvaluatorConfig) -> Self {
        Self {
            orchestrator: ContainerOrchestrator::new(engine, config),
            resolver: Box::new(LanguageImage),
            spool_threshold: config.spool_threshold,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: impl ImageResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn orchestrator(&self) -> &ContainerOrchestrator {
        &self.orchestrator
    }

    /// Runs the package in a fresh container and collects what it produced.
    ///
    /// Once the container exists it is destroyed before this returns, whether
    /// or not the evaluation succeeded. A failed destroy is logged and does not
    /// change the outcome.
    #[instrument(skip_all, fields(language = %evaluation.language))]
    pub async fn execute(&self, evaluation: Evaluation) -> Result<EvaluationResult> {
        let Evaluation {
            package,
            language,
            limits,
        } = evaluation;

        let image = self.resolver.image_for(&language)?;
        let mut container = self.orchestrator.create_container(&image, &limits).await?;

        let outcome = self.evaluate(&mut container, package).await;

        let id = container.id().to_string();
        if let Err(e) = self.orchestrator.destroy(container).await {
            warn!(container = %id, error = %e, "Failed to destroy container");
        }

        outcome
    }

    async fn evaluate(&self, container: &mut Container, package: Package) -> Result<EvaluationResult> {
        let threshold = self.spool_threshold;
        let archive = tokio::task::spawn_blocking(move || archive::transcode(package, threshold))
            .await
            .map_err(|e| EvaluationError::Transcode(io::Error::new(io::ErrorKind::Other, e)))??;

        self.orchestrator.inject(container, archive).await?;
        let exit_code = self.orchestrator.run(container).await?;
        let (stdout, stderr) = self.orchestrator.collect_logs(container).await?;
        let test_report = self.orchestrator.extract_file(container, REPORT_PATH).await?;

        Ok(EvaluationResult {
            stdout,
            stderr,
            test_report,
            exit_code,
        })
    }
}
