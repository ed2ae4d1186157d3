//! Converter configuration.
//!
//! Every field has a default, so an empty file (or no file) is a complete
//! configuration:
//!
//! ```yaml
//! interpreter: python3
//! host_version: "3.12"        # skip asking the interpreter
//! max_input_bytes: 52428800
//! sandbox:
//!   timeout_secs: 15
//!   root: /var/tmp/pyconv
//!   env_allow: [HTTP_PROXY]
//!   env_passthrough: false
//! scan:
//!   max_offset: 100
//!   module_marker: "<code object <module> at "
//!   max_repr_bytes: 4096
//! magic:
//!   default_version: "3.11"
//!   overrides:
//!     "3.14": "2b0e0d0a000000000000000000000000"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoder::{InterpreterDecoder, DEFAULT_MAX_REPR_BYTES};
use crate::extract::{ScanSettings, DEFAULT_MAX_OFFSET, FIRST_OFFSET, MODULE_MARKER};
use crate::host::{parse_version_label, HostInterpreter};
use crate::magic::{MagicError, MagicTable, DEFAULT_VERSION};
use crate::sandbox::{EnvFilter, Sandbox, DEFAULT_TIMEOUT};

/// Upload limit applied before bytes reach the core.
pub const DEFAULT_MAX_INPUT_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Magic(#[from] MagicError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterConfig {
    /// Interpreter program used for decoding, version probing and re-framing.
    pub interpreter: String,

    /// Pin the host version label instead of asking the interpreter.
    pub host_version: Option<String>,

    pub max_input_bytes: u64,

    pub sandbox: SandboxConfig,

    pub scan: ScanConfig,

    pub magic: MagicConfig,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            host_version: None,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            sandbox: SandboxConfig::default(),
            scan: ScanConfig::default(),
            magic: MagicConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    pub timeout_secs: u64,

    /// Parent for scoped directories (system temp dir when unset).
    pub root: Option<PathBuf>,

    /// Variables let through the credential scrub.
    pub env_allow: Vec<String>,

    /// Skip credential scrubbing. Interpreter hijack variables are still removed.
    pub env_passthrough: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            root: None,
            env_allow: Vec::new(),
            env_passthrough: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    pub max_offset: usize,
    pub module_marker: String,
    pub max_repr_bytes: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_offset: DEFAULT_MAX_OFFSET,
            module_marker: MODULE_MARKER.to_string(),
            max_repr_bytes: DEFAULT_MAX_REPR_BYTES,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MagicConfig {
    pub default_version: String,

    /// Version label -> 16 bytes as 32 hex characters.
    pub overrides: BTreeMap<String, String>,
}

impl Default for MagicConfig {
    fn default() -> Self {
        Self {
            default_version: DEFAULT_VERSION.to_string(),
            overrides: BTreeMap::new(),
        }
    }
}

impl ConverterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        // An empty (or comment-only) document is null, not an empty map.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(value)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::Invalid("interpreter must not be empty".into()));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_secs must be at least 1".into(),
            ));
        }
        if self.scan.max_offset < FIRST_OFFSET {
            return Err(ConfigError::Invalid(
                "scan.max_offset must be at least 1".into(),
            ));
        }
        if self.scan.module_marker.is_empty() {
            return Err(ConfigError::Invalid(
                "scan.module_marker must not be empty".into(),
            ));
        }
        if self.scan.max_repr_bytes < self.scan.module_marker.len() {
            return Err(ConfigError::Invalid(
                "scan.max_repr_bytes is shorter than scan.module_marker".into(),
            ));
        }
        if let Some(label) = &self.host_version {
            if parse_version_label(label).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "host_version {label:?} is not MAJOR.MINOR"
                )));
            }
        }
        self.magic_table()?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.timeout_secs)
    }

    pub fn interpreter(&self) -> HostInterpreter {
        HostInterpreter::python(&self.interpreter)
    }

    pub fn env_filter(&self) -> EnvFilter {
        let base = if self.sandbox.env_passthrough {
            EnvFilter::passthrough()
        } else {
            EnvFilter::scrub()
        };
        base.with_allowed(self.sandbox.env_allow.iter().cloned())
    }

    pub fn magic_table(&self) -> Result<MagicTable, ConfigError> {
        Ok(MagicTable::with_overrides(
            &self.magic.overrides,
            &self.magic.default_version,
        )?)
    }

    pub fn sandbox(&self) -> Sandbox {
        let sandbox = Sandbox::new(self.timeout()).with_env(self.env_filter());
        match &self.sandbox.root {
            Some(root) => sandbox.with_root(root),
            None => sandbox,
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            max_offset: self.scan.max_offset,
            module_marker: self.scan.module_marker.clone(),
        }
    }

    pub fn decoder(&self) -> InterpreterDecoder {
        InterpreterDecoder::new(self.interpreter())
            .with_env(self.env_filter())
            .with_max_repr_bytes(self.scan.max_repr_bytes)
    }
}
