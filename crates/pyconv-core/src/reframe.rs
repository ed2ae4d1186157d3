//! Payload re-framing (Marshal -> PYC).
//!
//! The payload grammar belongs to whichever interpreter runs the
//! conversion, so the bytes are not validated here. They are pushed through
//! that interpreter's own `marshal.loads` path inside a [`Sandbox`], with
//! `marshal` swapped for a capture shim. Whatever reaches `loads` is the
//! payload; the container is the host's magic followed by it.
//!
//! Interception only holds if nothing reaches the real decoder first. A
//! payload that digs the builtin module out some other way runs unchecked
//! and simply produces no capture. The sandbox executes untrusted code with
//! the caller's privileges.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::convert::{file_stem, Conversion, Direction};
use crate::host::{HostError, HostInterpreter, VersionSource};
use crate::magic::{MagicTable, VersionMagicEntry};
use crate::sandbox::{Sandbox, SandboxError, SandboxJob, StagedFile};

/// Extension of re-framed output.
pub const CONTAINER_SUFFIX: &str = ".pyc";

const SHIM_FILE: &str = "marshal_capture.py";
const RUNNER_FILE: &str = "runner.py";
const PAYLOAD_FILE: &str = "payload.bin";
const CAPTURE_FILE: &str = "captured.marshal";

// Same public surface as `marshal`; `loads`/`load` record their input and
// end the process before anything is decoded.
const SHIM_SOURCE: &str = r#"import os
import marshal as _real

dumps = _real.dumps
dump = _real.dump
version = _real.version


def loads(data, *args, **kwargs):
    with open(os.environ['PYCONV_CAPTURE'], 'wb') as out:
        out.write(bytes(data))
    os._exit(0)


def load(file, *args, **kwargs):
    loads(file.read())
"#;

// Installs the shim, then treats the input as a loader script when it
// compiles as source, and as raw marshal data otherwise.
const RUNNER_SOURCE: &str = r#"import os
import sys

here = os.path.dirname(os.path.abspath(__file__))
sys.path.insert(0, here)
import marshal_capture
sys.modules['marshal'] = marshal_capture

with open(os.path.join(here, 'payload.bin'), 'rb') as src:
    data = src.read()
try:
    code = compile(data.decode('utf-8'), '<payload>', 'exec')
except (UnicodeDecodeError, SyntaxError, ValueError):
    code = None

if code is None:
    marshal_capture.loads(data)
else:
    exec(code, {'__name__': '__main__'})
"#;

#[derive(Debug, Error)]
pub enum ReframeError {
    #[error("cannot identify host version: {0}")]
    Host(#[from] HostError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

#[derive(Clone)]
pub struct Reframer {
    table: Arc<MagicTable>,
    version: Arc<dyn VersionSource>,
    interpreter: HostInterpreter,
    sandbox: Sandbox,
}

impl std::fmt::Debug for Reframer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reframer")
            .field("interpreter", &self.interpreter)
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl Reframer {
    pub fn new(
        table: Arc<MagicTable>,
        version: Arc<dyn VersionSource>,
        interpreter: HostInterpreter,
        sandbox: Sandbox,
    ) -> Self {
        Self {
            table,
            version,
            interpreter,
            sandbox,
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn host_version(&self) -> Result<String, HostError> {
        self.version.version_label()
    }

    /// The table entry for the host's version (or the fallback).
    pub fn host_entry(&self) -> Result<&VersionMagicEntry, HostError> {
        let label = self.host_version()?;
        let entry = self.table.resolve(&label);
        if entry.version_label != label {
            debug!(host = %label, fallback = %entry.version_label, "no magic for host version");
        }
        Ok(entry)
    }

    pub fn reframe_detailed(
        &self,
        data: &[u8],
        filename: &str,
    ) -> Result<Conversion, ReframeError> {
        let entry = self.host_entry()?;

        let files = [
            StagedFile {
                name: SHIM_FILE,
                contents: SHIM_SOURCE.as_bytes(),
            },
            StagedFile {
                name: RUNNER_FILE,
                contents: RUNNER_SOURCE.as_bytes(),
            },
            StagedFile {
                name: PAYLOAD_FILE,
                contents: data,
            },
        ];
        let outcome = self.sandbox.run(&SandboxJob {
            interpreter: &self.interpreter,
            entry: RUNNER_FILE,
            files: &files,
            capture: CAPTURE_FILE,
        })?;

        let mut bytes = Vec::with_capacity(entry.magic_bytes.len() + outcome.capture.len());
        bytes.extend_from_slice(&entry.magic_bytes);
        bytes.extend_from_slice(&outcome.capture);
        info!(
            version = %entry.version_label,
            payload_len = outcome.capture.len(),
            elapsed = ?outcome.elapsed,
            "re-framed payload"
        );

        Ok(Conversion {
            bytes,
            name: container_name(filename),
            direction: Direction::PayloadToContainer,
        })
    }

    pub fn reframe(&self, data: &[u8], filename: &str) -> Option<Conversion> {
        self.reframe_detailed(data, filename)
            .map_err(|e| warn!(file = filename, error = %e, "re-framing failed"))
            .ok()
    }
}

/// `dir/name_marshal.py` -> `name_marshal.pyc`.
pub fn container_name(filename: &str) -> String {
    format!("{}{CONTAINER_SUFFIX}", file_stem(filename))
}
