//! Conversion between `.pyc` containers and bare marshal payloads.
//!
//! - [`detect`] classifies input by its first four bytes.
//! - [`extract`] finds the payload inside a container by probing offsets
//!   with the host interpreter's decoder ([`decoder`]).
//! - [`reframe`] wraps a payload in the host version's magic ([`magic`]),
//!   capturing the payload through an intercepted `marshal.loads` inside a
//!   [`sandbox`].
//! - [`convert`] ties these together behind [`Converter`].

pub mod config;
pub mod convert;
pub mod decoder;
pub mod detect;
pub mod extract;
pub mod host;
pub mod magic;
pub mod pyrepr;
pub mod reframe;
pub mod sandbox;

pub use config::{ConfigError, ConverterConfig};
pub use convert::{Conversion, Converter, Direction, SetupError};
pub use detect::{detect_format, is_container, Format};
pub use extract::{ExtractError, Extractor, ScanOutcome, ScanSettings};
pub use magic::{MagicTable, VersionMagicEntry};
pub use reframe::{ReframeError, Reframer};
