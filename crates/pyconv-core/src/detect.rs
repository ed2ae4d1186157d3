//! Container detection.
//!
//! A cheap structural check on the first four bytes. It is a heuristic:
//! anything that looks like a header is classified as a container, and
//! misclassification surfaces later as an extraction failure.

use serde::Serialize;

/// `CR CR LF`, expected at offset 1.
pub const CONTAINER_MARKER: [u8; 3] = [0x0D, 0x0D, 0x0A];

/// Inputs shorter than this are never containers.
pub const MIN_CONTAINER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// `.pyc` container: version magic followed by a payload.
    Container,
    /// Bare marshal payload (or a loader script embedding one).
    Payload,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Container => "container",
            Format::Payload => "payload",
        }
    }
}

pub fn is_container(data: &[u8]) -> bool {
    data.len() >= MIN_CONTAINER_LEN && data[1..MIN_CONTAINER_LEN] == CONTAINER_MARKER
}

pub fn detect_format(data: &[u8]) -> Format {
    if is_container(data) {
        Format::Container
    } else {
        Format::Payload
    }
}
