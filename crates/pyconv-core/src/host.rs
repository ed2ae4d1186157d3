//! The host decoder: which interpreter runs, and which version it reports.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;

use crate::sandbox::{isolate_group, ChildExt, EnvFilter};

const VERSION_SCRIPT: &str = "import sys; print('%d.%d' % sys.version_info[:2])";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not report its version within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {code:?} while reporting its version")]
    Failed { program: String, code: Option<i32> },

    #[error("failed to read version from {program}: {source}")]
    ReadOutput {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognised version label {0:?}")]
    BadLabel(String),
}

/// How to invoke the host interpreter: program plus leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterpreter {
    program: PathBuf,
    args: Vec<OsString>,
}

impl HostInterpreter {
    /// CPython in isolated mode (`-I`: no user site, no `PYTHON*`, script
    /// dir not on `sys.path`) without bytecode writes (`-B`).
    pub fn python(program: impl Into<PathBuf>) -> Self {
        Self::with_args(program, ["-I", "-B"])
    }

    pub fn with_args<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl Default for HostInterpreter {
    fn default() -> Self {
        Self::python("python3")
    }
}

/// Version identification capability.
pub trait VersionSource: Send + Sync {
    fn version_label(&self) -> Result<String, HostError>;
}

/// A label fixed at construction (config override, tests, or a probe
/// resolved once at startup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedVersion(String);

impl FixedVersion {
    pub fn new(label: impl Into<String>) -> Result<Self, HostError> {
        let label = label.into();
        parse_version_label(&label)
            .map(Self)
            .ok_or(HostError::BadLabel(label))
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl VersionSource for FixedVersion {
    fn version_label(&self) -> Result<String, HostError> {
        Ok(self.0.clone())
    }
}

/// Asks the interpreter itself.
#[derive(Debug, Clone)]
pub struct InterpreterVersion {
    interpreter: HostInterpreter,
    timeout: Duration,
    env: EnvFilter,
}

impl InterpreterVersion {
    pub fn new(interpreter: HostInterpreter, timeout: Duration) -> Self {
        Self {
            interpreter,
            timeout,
            env: EnvFilter::scrub(),
        }
    }

    pub fn with_env(mut self, env: EnvFilter) -> Self {
        self.env = env;
        self
    }

    /// Probe once and pin the answer.
    pub fn resolve(&self) -> Result<FixedVersion, HostError> {
        Ok(FixedVersion(self.version_label()?))
    }
}

impl VersionSource for InterpreterVersion {
    fn version_label(&self) -> Result<String, HostError> {
        let program = self.interpreter.program().display().to_string();
        let mut cmd = self.interpreter.command();
        cmd.args(["-c", VERSION_SCRIPT])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        self.env.apply(&mut cmd);
        isolate_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| HostError::Spawn {
            program: program.clone(),
            source,
        })?;
        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) | Err(_) => {
                child.terminate();
                return Err(HostError::Timeout {
                    program,
                    timeout: self.timeout,
                });
            }
        };
        if !status.success() {
            return Err(HostError::Failed {
                program,
                code: status.code(),
            });
        }

        let mut out = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_string(&mut out)
                .map_err(|source| HostError::ReadOutput { program, source })?;
        }
        parse_version_label(&out).ok_or_else(|| HostError::BadLabel(out.trim().to_string()))
    }
}

/// Accepts `MAJOR.MINOR` (surrounding whitespace ignored).
pub fn parse_version_label(text: &str) -> Option<String> {
    let text = text.trim();
    let (major, minor) = text.split_once('.')?;
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    (numeric(major) && numeric(minor)).then(|| text.to_string())
}
