//! Error types for package evaluation.
//!
//! [`EvaluationError`] is what callers of [`crate::EvaluationService::execute`]
//! see. [`EngineError`] is the lower-level failure reported by a
//! [`crate::engine::ContainerEngine`]; the orchestrator translates it into the
//! evaluation taxonomy at its boundary.

use thiserror::Error;

use crate::logs::LogStreamError;

/// Failure of a single evaluation. None of these are retried.
#[derive(Error, Debug)]
pub enum EvaluationError {
    /// The external language-to-image lookup failed.
    #[error("no evaluator image for language {language:?}: {reason}")]
    ImageResolution { language: String, reason: String },

    /// The submitted package is not a usable zip archive.
    #[error(transparent)]
    PackageFormat(#[from] PackageFormatError),

    /// I/O failure while converting the package to tar.
    #[error("failed to transcode package: {0}")]
    Transcode(#[source] std::io::Error),

    /// The engine rejected the image or launch arguments. No container exists.
    #[error("failed to create container from image {image}")]
    ContainerCreation {
        image: String,
        #[source]
        source: EngineError,
    },

    /// The package could not be copied into the container.
    #[error("failed to inject package into container {container}")]
    Injection {
        container: String,
        #[source]
        source: EngineError,
    },

    /// Start, wait, log retrieval or report extraction failed.
    #[error("failed to {step} container {container}")]
    Execution {
        container: String,
        step: &'static str,
        #[source]
        source: EngineError,
    },

    /// The container did not exit within the configured wait timeout.
    #[error("container {container} still running after {seconds}s")]
    WaitTimeout { container: String, seconds: u64 },

    /// The combined log stream was not correctly framed.
    #[error(transparent)]
    LogStream(#[from] LogStreamError),
}

/// Why a package was rejected.
#[derive(Error, Debug)]
pub enum PackageFormatError {
    #[error("package is not a valid zip archive")]
    Zip(#[source] zip::result::ZipError),

    /// An entry name is absolute or climbs out of the package directory.
    #[error("package entry {name:?} escapes the package directory")]
    UnsafeEntryName { name: String },
}

/// Errors reported by a container engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine says the container, image or path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine answered with an error status.
    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The request never got a usable answer.
    #[error("transport error: {0}")]
    Transport(#[source] bollard::errors::Error),

    /// `DOCKER_HOST` names a transport this engine cannot use.
    #[error("unsupported docker host {0:?}")]
    UnsupportedHost(String),

    /// A response body grew past the configured cap.
    #[error("response exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine answered successfully but the body made no sense.
    #[error("unexpected engine response: {0}")]
    Protocol(String),
}

impl EngineError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;

        match err {
            Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            Error::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            // Errors reported inside an otherwise successful streamed response.
            Error::DockerStreamError { error } => EngineError::Api {
                status: 200,
                message: error,
            },
            other => EngineError::Transport(other),
        }
    }
}

/// Result type alias for evaluation operations.
pub type Result<T> = std::result::Result<T, EvaluationError>;
