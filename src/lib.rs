//! Runs user-submitted code packages inside short-lived Docker containers.
//!
//! An [`Evaluation`] carries a zip package, a language and optional limits.
//! [`EvaluationService::execute`] converts the package to tar, copies it into a
//! fresh container of the language's evaluator image, runs the container to
//! completion and returns its stdout, stderr, exit code and test report.
//!
//! Time and memory limits are passed to the image's entrypoint as `-c` and
//! `-m` flags; the entrypoint enforces them.
//!
//! # Example
//!
//! ```no_run
//! use package_evaluator::{Evaluation, EvaluationService, EvaluatorConfig, Package};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = EvaluationService::new(EvaluatorConfig::from_env())?;
//!     let package = Package::open("submission.zip")?;
//!
//!     let result = service.execute(Evaluation::new(package, "python:3.10")).await?;
//!     match &result.test_report {
//!         Some(report) => println!("report: {} bytes", report.len()),
//!         None => println!("no report"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod logs;
pub mod service;

pub use config::EvaluatorConfig;
pub use container::{Container, ContainerOrchestrator, ContainerState};
pub use engine::{ContainerEngine, DockerEngine};
pub use error::{EngineError, EvaluationError, PackageFormatError, Result};
pub use evaluation::{Evaluation, EvaluationResult, Package, ResourceLimits};
pub use service::{EvaluationService, ImageResolver, LanguageImage};
