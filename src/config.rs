//! Configuration for the evaluator.

use std::time::Duration;

/// Namespace every evaluator image lives under.
pub const DEFAULT_IMAGE_PREFIX: &str = "coursemology/evaluator-image-";

/// Configuration for an [`crate::EvaluationService`].
///
/// Built once and handed to the service at construction.
///
/// # Example
///
/// ```
/// use package_evaluator::EvaluatorConfig;
/// use std::time::Duration;
///
/// let config = EvaluatorConfig::default()
///     .with_docker_host("tcp://docker.internal:2375")
///     .with_pull_images(false)
///     .with_wait_timeout(Duration::from_secs(120));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorConfig {
    /// Where the Docker daemon listens, in `DOCKER_HOST` form
    /// (`unix:///var/run/docker.sock`, `tcp://host:2375`, `http://host:2375`).
    /// `None` uses the platform's local default.
    pub docker_host: Option<String>,

    /// Prefix joined with the language's image identifier.
    pub image_prefix: String,

    /// Pull the image before every container creation.
    pub pull_images: bool,

    /// Upper bound on waiting for a container to exit. `None` waits forever and
    /// leaves time limits to the image's entrypoint.
    pub wait_timeout: Option<Duration>,

    /// Transcoded archives larger than this spill to a temporary file.
    pub spool_threshold: usize,

    /// Chunk size used when streaming the package into the container.
    pub upload_chunk_size: usize,

    /// Largest log output or extracted file read back from a container.
    pub max_output_bytes: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            pull_images: true,
            wait_timeout: None,
            spool_threshold: 8 * 1024 * 1024,
            upload_chunk_size: 64 * 1024,
            max_output_bytes: 64 * 1024 * 1024,
        }
    }
}

impl EvaluatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `DOCKER_HOST`, `EVALUATOR_IMAGE_PREFIX`,
    /// `EVALUATOR_PULL_IMAGES` and `EVALUATOR_WAIT_TIMEOUT_SECS`.
    ///
    /// Unparseable values are ignored. `DOCKER_HOST` is kept as given; a
    /// scheme the engine cannot serve is rejected by
    /// [`crate::DockerEngine::new`].
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("DOCKER_HOST").filter(|h| !h.trim().is_empty()) {
            config.docker_host = Some(host.trim().to_string());
        }
        if let Some(prefix) = lookup("EVALUATOR_IMAGE_PREFIX") {
            config.image_prefix = prefix;
        }
        if let Some(pull) = lookup("EVALUATOR_PULL_IMAGES").as_deref().and_then(parse_bool) {
            config.pull_images = pull;
        }
        if let Some(secs) = lookup("EVALUATOR_WAIT_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
        {
            config.wait_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config
    }

    #[must_use]
    pub fn with_docker_host(mut self, host: impl Into<String>) -> Self {
        self.docker_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.image_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_pull_images(mut self, pull: bool) -> Self {
        self.pull_images = pull;
        self
    }

    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_spool_threshold(mut self, bytes: usize) -> Self {
        self.spool_threshold = bytes;
        self
    }

    #[must_use]
    pub fn with_upload_chunk_size(mut self, bytes: usize) -> Self {
        self.upload_chunk_size = bytes;
        self
    }

    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
