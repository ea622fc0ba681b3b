//! Device port addressing.
//!
//! Endpoint format: `device:port`
//!
//! An endpoint names one port of one device instance. It is used both as the
//! source of a multicast message (the output port that emitted it) and as a
//! key into incoming-edge maps (the input ports that receive it).

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Separator between the device id and the port name.
pub const SEPARATOR: char = ':';

/// An address of the form `device:port`.
///
/// Equality, ordering and hashing are all defined over the canonical string,
/// so an endpoint can be looked up in a map by `&str`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    full: String,
    split: usize,
}

impl Endpoint {
    /// Create an endpoint from separate device and port parts.
    pub fn new(device: impl AsRef<str>, port: impl AsRef<str>) -> Result<Self, AddressingError> {
        let (device, port) = (device.as_ref(), port.as_ref());
        let full = format!("{device}{SEPARATOR}{port}");
        if device.is_empty() {
            return Err(AddressingError::EmptyDevice(full));
        }
        if port.is_empty() {
            return Err(AddressingError::EmptyPort(full));
        }
        if device.contains(SEPARATOR) || port.contains(SEPARATOR) {
            return Err(AddressingError::Separators(full));
        }
        Ok(Self {
            split: device.len(),
            full,
        })
    }

    /// The device id.
    pub fn device(&self) -> &str {
        &self.full[..self.split]
    }

    /// The port name on the device.
    pub fn port(&self) -> &str {
        &self.full[self.split + SEPARATOR.len_utf8()..]
    }

    /// The canonical `device:port` string.
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl Eq for Endpoint {}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.full.cmp(&other.full)
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl Borrow<str> for Endpoint {
    fn borrow(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for Endpoint {
    type Err = AddressingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device, port) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| AddressingError::MissingSeparator(s.to_string()))?;
        Self::new(device, port)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = AddressingError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&str> for Endpoint {
    type Error = AddressingError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.full
    }
}

/// Error parsing or building an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressingError {
    #[error("endpoint must contain a ':' separator, got: {0}")]
    MissingSeparator(String),
    #[error("endpoint must contain exactly one ':' separator, got: {0}")]
    Separators(String),
    #[error("endpoint device cannot be empty, got: {0}")]
    EmptyDevice(String),
    #[error("endpoint port cannot be empty, got: {0}")]
    EmptyPort(String),
}
