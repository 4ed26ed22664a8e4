//! Inputs and outputs of a single evaluation.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::num::NonZeroU32;
use std::path::Path;

/// Kilobytes per megabyte, as understood by the evaluator images.
pub const MEMORY_LIMIT_RATIO: u64 = 1024;

trait PackageSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> PackageSource for T {}

/// A zip archive of the submission's source files.
///
/// Consumed exactly once, when the evaluation runs.
pub struct Package {
    source: Box<dyn PackageSource>,
}

impl Package {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: Read + Seek + Send + 'static,
    {
        Self {
            source: Box::new(reader),
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_reader(Cursor::new(bytes.into()))
    }

    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_reader(File::open(path)?))
    }
}

impl Read for Package {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf)
    }
}

impl Seek for Package {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.source.seek(pos)
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package").finish_non_exhaustive()
    }
}

/// Limits handed to the evaluator image's entrypoint, which enforces them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU time budget in seconds.
    pub time_limit: Option<NonZeroU32>,
    /// Memory budget in megabytes.
    pub memory_limit: Option<NonZeroU32>,
}

impl ResourceLimits {
    /// Launch arguments understood by the evaluator images: `-c<seconds>` and
    /// `-m<kilobytes>`. Absent limits produce no flag.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(seconds) = self.time_limit {
            args.push(format!("-c{seconds}"));
        }
        if let Some(megabytes) = self.memory_limit {
            args.push(format!("-m{}", u64::from(megabytes.get()) * MEMORY_LIMIT_RATIO));
        }
        args
    }
}

/// A request to run one package.
#[derive(Debug)]
pub struct Evaluation {
    pub package: Package,
    pub language: String,
    pub limits: ResourceLimits,
}

impl Evaluation {
    pub fn new(package: Package, language: impl Into<String>) -> Self {
        Self {
            package,
            language: language.into(),
            limits: ResourceLimits::default(),
        }
    }

    /// Sets the time limit in seconds. Zero means no limit.
    #[must_use]
    pub fn with_time_limit(mut self, seconds: u32) -> Self {
        self.limits.time_limit = NonZeroU32::new(seconds);
        self
    }

    /// Sets the memory limit in megabytes. Zero means no limit.
    #[must_use]
    pub fn with_memory_limit(mut self, megabytes: u32) -> Self {
        self.limits.memory_limit = NonZeroU32::new(megabytes);
        self
    }
}

/// What came out of running a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The report file's raw bytes, or `None` when the package produced none.
    pub test_report: Option<Vec<u8>>,
    pub exit_code: i64,
}

impl EvaluationResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}
