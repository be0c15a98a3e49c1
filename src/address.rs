//! Device locators.
//!
//! An address is opaque to the session; the only structure the core relies on
//! is the split between the physical port and an optional sub-channel:
//!
//! | Address            | Port            | Channel |
//! |--------------------|-----------------|---------|
//! | `COM3`             | `COM3`          | –       |
//! | `/dev/ttyUSB0::7`  | `/dev/ttyUSB0`  | `7`     |
//! | `GPIB0::12`        | `GPIB0`         | `12`    |
//! | `SN1234::0::2`     | `SN1234`        | `0::2`  |
//!
//! The port is the default channel-sharing key: every address with the same
//! port ends up on the same [`Channel`](crate::channel::Channel).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommError;

const SEPARATOR: &str = "::";

/// Parsed device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    raw: String,
    split: Option<usize>,
}

impl Address {
    /// Parse an address string.
    pub fn parse(raw: &str) -> Result<Self, CommError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CommError::InvalidAddress(raw.to_string()));
        }

        let split = raw.find(SEPARATOR);
        if let Some(idx) = split {
            let port = &raw[..idx];
            let channel = &raw[idx + SEPARATOR.len()..];
            if port.is_empty() || channel.is_empty() || channel.split(SEPARATOR).any(str::is_empty)
            {
                return Err(CommError::InvalidAddress(raw.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            split,
        })
    }

    /// Physical port part (everything before the first `::`).
    pub fn port(&self) -> &str {
        match self.split {
            Some(idx) => &self.raw[..idx],
            None => &self.raw,
        }
    }

    /// Sub-channel part, if any.
    pub fn channel(&self) -> Option<&str> {
        self.split.map(|idx| &self.raw[idx + SEPARATOR.len()..])
    }

    /// Sub-channel as a number (GPIB primary address, Modbus slave id).
    ///
    /// Falls back to the port when there is no channel, so a bare `12` works
    /// as a GPIB address.
    pub fn number(&self) -> Option<u32> {
        self.channel().unwrap_or(self.port()).parse().ok()
    }

    /// Full address string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.raw)
    }
}

impl FromStr for Address {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = CommError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_port() {
        let address = Address::parse("COM3").unwrap();
        assert_eq!(address.port(), "COM3");
        assert_eq!(address.channel(), None);
        assert_eq!(address.number(), None);
    }

    #[test]
    fn test_port_and_channel() {
        let address: Address = "/dev/ttyUSB0::7".parse().unwrap();
        assert_eq!(address.port(), "/dev/ttyUSB0");
        assert_eq!(address.channel(), Some("7"));
        assert_eq!(address.number(), Some(7));
    }

    #[test]
    fn test_nested_channel_is_kept_whole() {
        let address = Address::parse("SN1234::0::2").unwrap();
        assert_eq!(address.port(), "SN1234");
        assert_eq!(address.channel(), Some("0::2"));
        assert_eq!(address.number(), None);
    }

    #[test]
    fn test_bare_gpib_number() {
        let address = Address::parse("12").unwrap();
        assert_eq!(address.number(), Some(12));
    }

    #[test]
    fn test_rejects_malformed() {
        for raw in ["", "   ", "::3", "COM3::", "SN1::::2"] {
            assert!(Address::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn test_serde_round_trip_through_string() {
        #[derive(Deserialize)]
        struct Holder {
            address: Address,
        }
        let holder: Holder = toml::from_str(r#"address = "GPIB0::5""#).unwrap();
        assert_eq!(holder.address.port(), "GPIB0");
        assert_eq!(holder.address.number(), Some(5));
    }
}
