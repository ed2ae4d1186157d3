//! Environment scrubbing for interpreter children.
//!
//! Everything the sandbox and the decoder probe spawn runs code we did not
//! write (the payload may be an arbitrary loader script), so the child gets a
//! filtered copy of our environment:
//!
//! - **Hijack** variables (`PYTHON*`, preload hooks) are always removed; they
//!   could redirect module resolution around the shim.
//! - **Scrub** patterns (credentials) are removed unless explicitly allowed.
//! - **Passthrough** skips credential scrubbing entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::process::Command;

/// Removed in every mode.
const HIJACK_PATTERNS: &[&str] = &[
    "PYTHON*",
    "LD_PRELOAD",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
];

/// Credential patterns removed in scrub mode.
const DEFAULT_SCRUB_PATTERNS: &[&str] = &[
    // Cloud providers
    "AWS_*",
    "AZURE_*",
    "GCP_*",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "GOOGLE_CLOUD_*",
    "DIGITALOCEAN_*",
    "CLOUDFLARE_*",
    // Bot / API tokens
    "TELEGRAM_*",
    "BOT_TOKEN",
    "OPENAI_*",
    "ANTHROPIC_*",
    "HF_*",
    // Dev tools & CI
    "GITHUB_*",
    "GITLAB_*",
    "NPM_*",
    "CARGO_REGISTRY_*",
    "PYPI_*",
    "TWINE_*",
    "DOCKER_*",
    // Generic secret patterns (suffix)
    "*_TOKEN",
    "*_SECRET",
    "*_KEY",
    "*_PASSWORD",
    "*_CREDENTIALS",
    "*_AUTH",
    // Database & connection strings
    "*_DATABASE_URL",
    "*_DSN",
    "DATABASE_URL",
    "REDIS_URL",
    // Agents & keyrings
    "SSH_*",
    "GPG_*",
    "VAULT_*",
    "KUBECONFIG",
    "*_SESSION",
    "*_COOKIE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvMode {
    /// Scrub credential patterns (default)
    #[default]
    Scrub,
    /// Keep everything except hijack variables
    Passthrough,
}

#[derive(Debug, Clone, Default)]
pub struct EnvFilter {
    mode: EnvMode,
    explicit_allow: BTreeSet<String>,
}

/// Environment handed to a child. Values are passed through as raw
/// `OsString`s; keys that are not UTF-8 cannot be matched and are removed.
#[derive(Debug, Clone, Default)]
pub struct FilteredEnv {
    pub vars: BTreeMap<String, OsString>,
    /// Removed keys, sorted; values are never kept.
    pub removed: Vec<String>,
}

impl EnvFilter {
    pub fn scrub() -> Self {
        Self::default()
    }

    pub fn passthrough() -> Self {
        Self {
            mode: EnvMode::Passthrough,
            explicit_allow: BTreeSet::new(),
        }
    }

    /// Let `keys` through the credential scrub. Hijack variables stay out.
    pub fn with_allowed<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.explicit_allow.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn mode(&self) -> EnvMode {
        self.mode
    }

    pub fn filter<I, K, V>(&self, env: I) -> FilteredEnv
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut out = FilteredEnv::default();
        for (key, value) in env {
            let key = match key.into().into_string() {
                Ok(key) => key,
                Err(raw) => {
                    out.removed.push(raw.to_string_lossy().into_owned());
                    continue;
                }
            };
            if self.keeps(&key) {
                out.vars.insert(key, value.into());
            } else {
                out.removed.push(key);
            }
        }
        out.removed.sort();
        out
    }

    pub fn filter_current(&self) -> FilteredEnv {
        self.filter(std::env::vars_os())
    }

    fn keeps(&self, key: &str) -> bool {
        if matches_any(key, HIJACK_PATTERNS) {
            return false;
        }
        self.mode == EnvMode::Passthrough
            || self.explicit_allow.contains(key)
            || !matches_any(key, DEFAULT_SCRUB_PATTERNS)
    }

    /// Replace `cmd`'s environment with the filtered current environment.
    pub fn apply(&self, cmd: &mut Command) -> FilteredEnv {
        let filtered = self.filter_current();
        cmd.env_clear();
        cmd.envs(&filtered.vars);
        filtered
    }
}

fn matches_any(key: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| matches_glob(key, pattern))
}

/// `*` wildcard matching: `PREFIX*`, `*SUFFIX`, `PREFIX*SUFFIX` or exact.
fn matches_glob(key: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        None => key == pattern,
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
    }
}
