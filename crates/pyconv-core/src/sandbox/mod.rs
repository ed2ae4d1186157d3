//! Isolated execution with a single capture artifact.
//!
//! A [`Sandbox`] run creates a scoped directory, stages the job's files into
//! it, spawns the interpreter on the entry script with the directory as cwd
//! and all stdio discarded, and waits under a hard wall-clock timeout. The
//! only thing read back is the capture artifact, whose absolute path the
//! child receives in [`CAPTURE_ENV`].
//!
//! # Trust boundary
//!
//! This is a *disposable* execution scope, not a hardened jail: the child
//! runs with the caller's privileges. What is guaranteed:
//!
//! - the environment is scrubbed ([`EnvFilter`]) before the child starts,
//! - the child (and its process group on unix) is killed at the deadline,
//!   and the group is killed after a normal exit too,
//! - the scoped directory is removed on every exit path, including timeout
//!   and spawn failure.

mod env;
mod process;

pub use env::{EnvFilter, EnvMode, FilteredEnv};
pub(crate) use process::{isolate_group, ChildExt};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::host::HostInterpreter;

/// Hard wall-clock limit for one isolated run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Environment variable carrying the absolute capture artifact path.
pub const CAPTURE_ENV: &str = "PYCONV_CAPTURE";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to prepare scoped directory: {0}")]
    Setup(#[source] io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("isolated run exceeded {0:?} and was killed")]
    Timeout(Duration),

    #[error("isolated run exited abnormally (code {code:?})")]
    Crashed { code: Option<i32> },

    #[error("isolated run finished without producing {0}")]
    CaptureMissing(String),

    #[error("failed to read capture artifact: {0}")]
    ReadCapture(#[source] io::Error),

    #[error("failed waiting for isolated run: {0}")]
    Wait(#[source] io::Error),
}

/// A file written into the scoped directory before the child starts.
#[derive(Debug, Clone, Copy)]
pub struct StagedFile<'a> {
    pub name: &'a str,
    pub contents: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxJob<'a> {
    pub interpreter: &'a HostInterpreter,
    /// Staged file name passed to the interpreter as its script.
    pub entry: &'a str,
    pub files: &'a [StagedFile<'a>],
    /// File name (inside the scoped directory) the child must produce.
    pub capture: &'a str,
}

#[derive(Debug)]
pub struct SandboxOutcome {
    pub capture: Vec<u8>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
    root: Option<PathBuf>,
    env: EnvFilter,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            root: None,
            env: EnvFilter::scrub(),
        }
    }
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Create scoped directories under `root` instead of the system temp dir.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_env(mut self, env: EnvFilter) -> Self {
        self.env = env;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn env(&self) -> &EnvFilter {
        &self.env
    }

    pub fn run(&self, job: &SandboxJob<'_>) -> Result<SandboxOutcome, SandboxError> {
        let scope = self.scoped_dir().map_err(SandboxError::Setup)?;
        debug!(dir = %scope.path().display(), "sandbox scope created");

        let result = self.run_in(scope.path(), job);

        let dir = scope.path().to_path_buf();
        if let Err(e) = scope.close() {
            warn!(dir = %dir.display(), error = %e, "failed to remove sandbox scope");
        }
        result
    }

    fn scoped_dir(&self) -> io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pyconv-sandbox-");
        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;
        }
        Ok(dir)
    }

    fn run_in(&self, dir: &Path, job: &SandboxJob<'_>) -> Result<SandboxOutcome, SandboxError> {
        for file in job.files {
            fs::write(dir.join(file.name), file.contents).map_err(SandboxError::Setup)?;
        }
        let capture_path = dir.join(job.capture);

        let mut cmd = job.interpreter.command();
        cmd.arg(dir.join(job.entry))
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let filtered = self.env.apply(&mut cmd);
        cmd.env(CAPTURE_ENV, &capture_path);
        cmd.env("TMPDIR", dir);
        isolate_group(&mut cmd);
        debug!(removed = filtered.removed.len(), "sandbox env filtered");

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: job.interpreter.program().display().to_string(),
            source,
        })?;

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => {
                // Anything the payload forked dies with the leader.
                child.kill_group();
                status
            }
            Ok(None) => {
                child.terminate();
                return Err(SandboxError::Timeout(self.timeout));
            }
            Err(e) => {
                child.terminate();
                return Err(SandboxError::Wait(e));
            }
        };
        let elapsed = start.elapsed();
        debug!(?status, ?elapsed, "sandbox child exited");

        if !status.success() {
            return Err(SandboxError::Crashed {
                code: status.code(),
            });
        }

        match fs::read(&capture_path) {
            Ok(capture) => Ok(SandboxOutcome { capture, elapsed }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SandboxError::CaptureMissing(job.capture.to_string()))
            }
            Err(e) => Err(SandboxError::ReadCapture(e)),
        }
    }
}
