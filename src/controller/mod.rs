//! Industrial controller tag access.
//!
//! The monitor only needs three operations on named tags: read a boolean,
//! write a boolean, write a string. Errors are classified so the caller can
//! tell a lost link (fatal) from a single failed tag operation (retryable).

mod memory;
pub mod mqtt;

use std::time::Duration;

pub use memory::{InMemoryController, TagWrite};
pub use mqtt::{MqttController, MqttControllerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    /// Controller unreachable or the connection was lost.
    #[error("controller connection failed: {0}")]
    Connectivity(String),

    /// A single tag read or write was rejected while the link stayed up.
    #[error("tag {tag}: {status}")]
    TagIo { tag: String, status: String },

    /// No answer for a tag within the round-trip timeout.
    #[error("tag {tag}: no response within {after:?}")]
    Timeout { tag: String, after: Duration },
}

impl ControllerError {
    pub fn tag_io(tag: &str, status: impl Into<String>) -> Self {
        ControllerError::TagIo {
            tag: tag.to_string(),
            status: status.into(),
        }
    }

    /// Only a lost connection is fatal without retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControllerError::Connectivity(_))
    }
}

pub type TagResult<T> = std::result::Result<T, ControllerError>;

pub trait Controller {
    fn read_bool(&mut self, tag: &str) -> TagResult<bool>;

    fn write_bool(&mut self, tag: &str, value: bool) -> TagResult<()>;

    fn write_string(&mut self, tag: &str, value: &str) -> TagResult<()>;
}

impl<C: Controller + ?Sized> Controller for &mut C {
    fn read_bool(&mut self, tag: &str) -> TagResult<bool> {
        (**self).read_bool(tag)
    }

    fn write_bool(&mut self, tag: &str, value: bool) -> TagResult<()> {
        (**self).write_bool(tag, value)
    }

    fn write_string(&mut self, tag: &str, value: &str) -> TagResult<()> {
        (**self).write_string(tag, value)
    }
}

impl<C: Controller + ?Sized> Controller for Box<C> {
    fn read_bool(&mut self, tag: &str) -> TagResult<bool> {
        (**self).read_bool(tag)
    }

    fn write_bool(&mut self, tag: &str, value: bool) -> TagResult<()> {
        (**self).write_bool(tag, value)
    }

    fn write_string(&mut self, tag: &str, value: &str) -> TagResult<()> {
        (**self).write_string(tag, value)
    }
}

/// Parse a boolean tag payload: `1/0`, `true/false`, `on/off`, case-insensitive.
pub fn parse_bool_payload(payload: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}
