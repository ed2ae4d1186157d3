//! Detect-and-dispatch facade.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConverterConfig};
use crate::detect::is_container;
use crate::extract::Extractor;
use crate::host::{FixedVersion, HostError, InterpreterVersion};
use crate::magic::MagicTable;
use crate::reframe::Reframer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ContainerToPayload,
    PayloadToContainer,
}

impl Direction {
    pub fn describe(self) -> &'static str {
        match self {
            Direction::ContainerToPayload => "PYC -> Marshal",
            Direction::PayloadToContainer => "Marshal -> PYC",
        }
    }
}

/// A successful conversion. Bytes and name always travel together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub bytes: Vec<u8>,
    pub name: String,
    pub direction: Direction,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot identify host version: {0}")]
    Host(#[from] HostError),
}

/// Converts in whichever direction the input calls for.
///
/// Stateless between calls and cheap to clone; clones share the magic
/// table and the configured extractor/re-framer.
#[derive(Debug, Clone)]
pub struct Converter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    table: Arc<MagicTable>,
    extractor: Extractor,
    reframer: Reframer,
}

impl Converter {
    pub fn new(table: Arc<MagicTable>, extractor: Extractor, reframer: Reframer) -> Self {
        Self {
            inner: Arc::new(Inner {
                table,
                extractor,
                reframer,
            }),
        }
    }

    /// Wire everything from `config`. The host version is identified here,
    /// once, unless the config pins it.
    pub fn from_config(config: &ConverterConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let table = Arc::new(config.magic_table()?);
        let interpreter = config.interpreter();

        let version = match &config.host_version {
            Some(label) => FixedVersion::new(label.clone())?,
            None => InterpreterVersion::new(interpreter.clone(), config.timeout())
                .with_env(config.env_filter())
                .resolve()?,
        };
        debug!(version = version.label(), "host version identified");

        let extractor = Extractor::new(Arc::new(config.decoder()))
            .with_settings(config.scan_settings());
        let reframer = Reframer::new(
            Arc::clone(&table),
            Arc::new(version),
            interpreter,
            config.sandbox(),
        );
        Ok(Self::new(table, extractor, reframer))
    }

    pub fn table(&self) -> &MagicTable {
        &self.inner.table
    }

    pub fn extractor(&self) -> &Extractor {
        &self.inner.extractor
    }

    pub fn reframer(&self) -> &Reframer {
        &self.inner.reframer
    }

    pub fn convert(&self, data: &[u8], filename: &str) -> Option<Conversion> {
        let out = if is_container(data) {
            debug!(file = filename, "container input, extracting payload");
            self.inner.extractor.extract(data, filename)
        } else {
            debug!(file = filename, "payload input, re-framing");
            self.inner.reframer.reframe(data, filename)
        };
        if let Some(conversion) = &out {
            info!(
                file = filename,
                output = %conversion.name,
                direction = conversion.direction.describe(),
                "converted"
            );
        }
        out
    }

    /// [`Converter::convert`] on the blocking pool, so a sandbox run does
    /// not stall the async workers.
    pub async fn convert_offloaded(&self, data: Vec<u8>, filename: String) -> Option<Conversion> {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.convert(&data, &filename)).await {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "conversion task failed");
                None
            }
        }
    }
}

/// File name without directory and final extension.
pub(crate) fn file_stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodeOutcome, FnDecoder};
    use crate::host::HostInterpreter;
    use crate::sandbox::Sandbox;
    use std::time::Duration;

    fn module_decoder() -> Extractor {
        Extractor::new(Arc::new(FnDecoder(|slice: &[u8]| {
            if slice.starts_with(b"MOD!") {
                DecodeOutcome::Decoded {
                    repr: "<code object <module> at 0x1, file \"x\", line 1>".into(),
                }
            } else {
                DecodeOutcome::Rejected
            }
        })))
    }

    fn converter(host: HostInterpreter) -> Converter {
        let table = Arc::new(MagicTable::builtin());
        let reframer = Reframer::new(
            Arc::clone(&table),
            Arc::new(FixedVersion::new("3.11").unwrap()),
            host,
            Sandbox::new(Duration::from_secs(10)),
        );
        Converter::new(table, module_decoder(), reframer)
    }

    fn container(payload: &[u8]) -> Vec<u8> {
        let mut data = MagicTable::builtin().lookup("3.11").to_vec();
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn converter_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Converter>();
    }

    #[test]
    fn file_stem_handles_paths_and_dots() {
        assert_eq!(file_stem("a/b/c.pyc"), "c");
        assert_eq!(file_stem("c.tar.pyc"), "c.tar");
        assert_eq!(file_stem(".hidden"), ".hidden");
        assert_eq!(file_stem("plain"), "plain");
    }

    #[test]
    fn container_input_is_extracted() {
        let out = converter(HostInterpreter::default())
            .convert(&container(b"MOD!rest"), "app.pyc")
            .unwrap();
        assert_eq!(out.direction, Direction::ContainerToPayload);
        assert_eq!(out.name, "app_marshal.py");
    }

    #[test]
    fn container_without_module_fails() {
        let out = converter(HostInterpreter::default()).convert(&container(b"junk"), "app.pyc");
        assert!(out.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn payload_input_is_reframed() {
        let host = HostInterpreter::with_args(
            "/bin/sh",
            ["-c", "cp payload.bin \"$PYCONV_CAPTURE\"", "sh"],
        );
        let out = converter(host).convert(b"\xe3raw", "app_marshal.py").unwrap();
        assert_eq!(out.direction, Direction::PayloadToContainer);
        assert_eq!(out.name, "app_marshal.pyc");
        assert_eq!(out.bytes, container(b"\xe3raw"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn offloaded_conversions_run_concurrently() {
        let host = HostInterpreter::with_args(
            "/bin/sh",
            ["-c", "cp payload.bin \"$PYCONV_CAPTURE\"", "sh"],
        );
        let conv = converter(host);
        let tasks: Vec<_> = (0..4u8)
            .map(|i| {
                let conv = conv.clone();
                tokio::spawn(async move {
                    conv.convert_offloaded(vec![b'p', i], format!("f{i}.py")).await
                })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            let out = task.await.unwrap().unwrap();
            assert_eq!(out.name, format!("f{i}.pyc"));
            assert_eq!(&out.bytes[16..], &[b'p', i as u8]);
        }
    }
}
