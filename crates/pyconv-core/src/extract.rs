//! Payload extraction (PYC -> Marshal).
//!
//! The container's pre-payload region is never parsed. Instead the
//! extractor walks candidate offsets `1..=max_offset`, asks the decoder
//! whether `data[offset..]` decodes, and accepts the first offset whose
//! decoded object reads as a module-level code object.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::convert::{file_stem, Conversion, Direction};
use crate::decoder::{DecodeOutcome, DecoderError, PayloadDecoder};
use crate::pyrepr::{bytes_literal, comment_safe};

/// First offset tried. Offset 0 is the version tag and never a payload.
pub const FIRST_OFFSET: usize = 1;

/// Last offset tried, inclusive.
pub const DEFAULT_MAX_OFFSET: usize = 100;

/// Substring of the decoded repr that identifies a top-level code unit.
///
/// CPython has printed code objects this way since 3.0, but the wording
/// is not a stable interface, hence [`ScanSettings::module_marker`].
pub const MODULE_MARKER: &str = "<code object <module> at ";

/// Appended to the input stem to name the loader output.
pub const PAYLOAD_SUFFIX: &str = "_marshal.py";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Found(usize),
    NotFound,
}

/// Where to look and what counts as a module-level code object.
///
/// `module_marker` is matched against the decoder's repr, which is capped
/// (see [`crate::decoder::DEFAULT_MAX_REPR_BYTES`]); a match has to occur
/// within that prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub max_offset: usize,
    pub module_marker: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_offset: DEFAULT_MAX_OFFSET,
            module_marker: MODULE_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no module-level code object at offsets 1..={max_offset}")]
    Exhausted { max_offset: usize },

    #[error(transparent)]
    Decoder(#[from] DecoderError),
}

#[derive(Clone)]
pub struct Extractor {
    decoder: Arc<dyn PayloadDecoder>,
    settings: ScanSettings,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Extractor {
    pub fn new(decoder: Arc<dyn PayloadDecoder>) -> Self {
        Self {
            decoder,
            settings: ScanSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ScanSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Find the payload offset.
    ///
    /// Rejected slices, decodes without the marker, and a decoder crash at
    /// one offset are all negative cases; the scan moves on. Only a decoder
    /// that cannot be (re)started aborts it.
    pub fn scan(&self, data: &[u8]) -> Result<ScanOutcome, DecoderError> {
        let last = self.settings.max_offset.min(data.len().saturating_sub(1));
        if last < FIRST_OFFSET {
            return Ok(ScanOutcome::NotFound);
        }

        let mut session = self.decoder.session(data)?;
        for offset in FIRST_OFFSET..=last {
            match session.decode_at(offset) {
                Ok(DecodeOutcome::Decoded { repr }) => {
                    if repr.contains(&self.settings.module_marker) {
                        debug!(offset, "module code object found");
                        return Ok(ScanOutcome::Found(offset));
                    }
                    debug!(offset, "decoded, but not a module code object");
                }
                Ok(DecodeOutcome::Rejected) => {}
                Err(e) if e.is_recoverable() => {
                    debug!(offset, error = %e, "decoder crashed, skipping offset");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ScanOutcome::NotFound)
    }

    pub fn extract_detailed(
        &self,
        data: &[u8],
        filename: &str,
    ) -> Result<Conversion, ExtractError> {
        let offset = match self.scan(data)? {
            ScanOutcome::Found(offset) => offset,
            ScanOutcome::NotFound => {
                return Err(ExtractError::Exhausted {
                    max_offset: self.settings.max_offset,
                })
            }
        };
        let payload = &data[offset..];
        info!(offset, payload_len = payload.len(), "extracted payload");
        Ok(Conversion {
            bytes: render_loader(payload, filename).into_bytes(),
            name: payload_name(filename),
            direction: Direction::ContainerToPayload,
        })
    }

    pub fn extract(&self, data: &[u8], filename: &str) -> Option<Conversion> {
        self.extract_detailed(data, filename)
            .map_err(|e| warn!(file = filename, error = %e, "extraction failed"))
            .ok()
    }
}

/// A self-executing loader that rebuilds and runs `payload`.
pub fn render_loader(payload: &[u8], filename: &str) -> String {
    format!(
        "# Marshal/PYC converter\n\
         # File name: [{}] ({})\n\
         \n\
         exec(__import__('marshal').loads({}),globals())",
        comment_safe(filename),
        Direction::ContainerToPayload.describe(),
        bytes_literal(payload),
    )
}

/// `dir/name.pyc` -> `name_marshal.py`.
pub fn payload_name(filename: &str) -> String {
    format!("{}{PAYLOAD_SUFFIX}", file_stem(filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FnDecoder;

    const MODULE_REPR: &str = "<code object <module> at 0x7f, file \"m.py\", line 1>";

    // `MOD!` decodes to a module code object, `FN!` to a nested one.
    fn tagged_decoder() -> Arc<dyn PayloadDecoder> {
        Arc::new(FnDecoder(|slice: &[u8]| {
            if slice.starts_with(b"MOD!") {
                DecodeOutcome::Decoded {
                    repr: MODULE_REPR.to_string(),
                }
            } else if slice.starts_with(b"FN!") {
                DecodeOutcome::Decoded {
                    repr: "<code object helper at 0x7f, file \"m.py\", line 3>".to_string(),
                }
            } else {
                DecodeOutcome::Rejected
            }
        }))
    }

    fn with_payload_at(offset: usize, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; offset];
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn finds_payload_after_header() {
        let data = with_payload_at(16, b"MOD!body");
        let extractor = Extractor::new(tagged_decoder());
        assert_eq!(extractor.scan(&data).unwrap(), ScanOutcome::Found(16));
    }

    #[test]
    fn never_tries_offset_zero() {
        let data = b"MOD!body".to_vec();
        let extractor = Extractor::new(tagged_decoder());
        assert_eq!(extractor.scan(&data).unwrap(), ScanOutcome::NotFound);
    }

    #[test]
    fn offset_100_is_the_last_attempt() {
        let extractor = Extractor::new(tagged_decoder());
        assert_eq!(
            extractor.scan(&with_payload_at(100, b"MOD!")).unwrap(),
            ScanOutcome::Found(100)
        );
        assert_eq!(
            extractor.scan(&with_payload_at(101, b"MOD!")).unwrap(),
            ScanOutcome::NotFound
        );
        assert!(extractor
            .extract(&with_payload_at(101, b"MOD!"), "late.pyc")
            .is_none());
    }

    #[test]
    fn nested_code_object_is_a_false_positive() {
        let mut data = with_payload_at(8, b"FN!xxxx");
        data.extend_from_slice(b"MOD!");
        let extractor = Extractor::new(tagged_decoder());
        assert_eq!(extractor.scan(&data).unwrap(), ScanOutcome::Found(15));
    }

    #[test]
    fn marker_is_configurable() {
        let data = with_payload_at(4, b"FN!");
        let extractor = Extractor::new(tagged_decoder()).with_settings(ScanSettings {
            module_marker: "<code object helper".to_string(),
            ..ScanSettings::default()
        });
        assert_eq!(extractor.scan(&data).unwrap(), ScanOutcome::Found(4));
    }

    #[test]
    fn recoverable_crash_skips_offset() {
        struct Flaky;
        struct FlakySession<'a>(&'a [u8]);

        impl PayloadDecoder for Flaky {
            fn session<'a>(
                &'a self,
                data: &'a [u8],
            ) -> Result<Box<dyn crate::decoder::DecodeSession + 'a>, DecoderError> {
                Ok(Box::new(FlakySession(data)))
            }
        }

        impl crate::decoder::DecodeSession for FlakySession<'_> {
            fn decode_at(&mut self, offset: usize) -> Result<DecodeOutcome, DecoderError> {
                if offset < 5 {
                    return Err(DecoderError::Crashed {
                        offset,
                        source: std::io::ErrorKind::UnexpectedEof.into(),
                    });
                }
                Ok(if self.0[offset..].starts_with(b"MOD!") {
                    DecodeOutcome::Decoded {
                        repr: MODULE_REPR.to_string(),
                    }
                } else {
                    DecodeOutcome::Rejected
                })
            }
        }

        let extractor = Extractor::new(Arc::new(Flaky));
        assert_eq!(
            extractor.scan(&with_payload_at(6, b"MOD!")).unwrap(),
            ScanOutcome::Found(6)
        );
    }

    #[test]
    fn wrapper_embeds_payload_from_offset() {
        let data = with_payload_at(16, b"MOD!\x00'\xff");
        let out = Extractor::new(tagged_decoder())
            .extract(&data, "dir/sample.pyc")
            .unwrap();

        assert_eq!(out.name, "sample_marshal.py");
        assert_eq!(out.direction, Direction::ContainerToPayload);
        assert_eq!(
            String::from_utf8(out.bytes).unwrap(),
            "# Marshal/PYC converter\n\
             # File name: [dir/sample.pyc] (PYC -> Marshal)\n\
             \n\
             exec(__import__('marshal').loads(b\"MOD!\\x00'\\xff\"),globals())"
        );
    }

    #[test]
    fn exhausted_reports_bound() {
        let err = Extractor::new(tagged_decoder())
            .extract_detailed(b"\xa7\r\r\nnothing here", "x.pyc")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Exhausted { max_offset: 100 }));
        assert_eq!(
            err.to_string(),
            "no module-level code object at offsets 1..=100"
        );
    }

    #[test]
    fn payload_name_replaces_extension() {
        assert_eq!(payload_name("a.pyc"), "a_marshal.py");
        assert_eq!(payload_name("a.b.pyc"), "a.b_marshal.py");
        assert_eq!(payload_name("noext"), "noext_marshal.py");
    }

    #[test]
    fn filename_newlines_cannot_break_out_of_comment() {
        let text = render_loader(b"x", "evil\nimport os");
        assert!(text.starts_with("# Marshal/PYC converter\n# File name: [evil?import os]"));
    }
}
