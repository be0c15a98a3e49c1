//! Transport backends.
//!
//! The core reaches physical media only through two narrow traits:
//!
//! - [`Backend`]: knows how to turn a locator plus [`TransportSettings`] into an
//!   open [`Link`]. One backend instance may open many links over time (every
//!   reconnect opens a fresh one).
//! - [`Link`]: an open connection. Raw write, raw read, close, plus attach/detach
//!   hooks for media that multiplex several device addresses behind one handle
//!   (a Prologix bridge, a Modbus line).
//!
//! Backend configuration (baud rate, parity, terminators, anything in
//! [`TransportSettings::extra`]) is passthrough; the session never interprets it.
//!
//! # Implementations
//!
//! | Backend | Kind | Sharing key |
//! |---|---|---|
//! | [`serial::SerialBackend`] | `serial` | port |
//! | [`prologix::PrologixBackend`] | `prologix` | controller port |
//! | [`modbus::ModbusBackend`] | `modbus` | port (slave id in the channel part) |
//! | [`mock::MockBackend`] | `mock` | port |

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;

pub mod mock;
pub mod modbus;
pub mod prologix;
pub mod serial;

pub use mock::{MockBackend, MockCall, MockReply};
pub use modbus::ModbusBackend;
pub use prologix::PrologixBackend;
pub use serial::{SerialBackend, SerialLink};

// =============================================================================
// Backend identity
// =============================================================================

/// Physical medium family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// RS-232 / USB-serial.
    Serial,
    /// GPIB through a Prologix GPIB-USB controller.
    Prologix,
    /// Modbus RTU slaves on a serial line.
    Modbus,
    /// In-process simulated instrument.
    Simulated,
    /// Scriptable test backend.
    Mock,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendKind::Serial => "serial",
            BackendKind::Prologix => "prologix",
            BackendKind::Modbus => "modbus",
            BackendKind::Simulated => "simulated",
            BackendKind::Mock => "mock",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Transport tunables handed to [`Backend::open`].
///
/// Defaults are the common RS-232 instrument settings: 9600 8N1, commands
/// terminated with CR, responses terminated with LF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Read timeout enforced by the backend.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Settle time between the write and the read of a query.
    #[serde(with = "humantime_serde")]
    pub inter_command_delay: Duration,
    /// Baud rate (9600, 115200, ...).
    pub baud_rate: u32,
    /// Data bits (7 or 8).
    pub data_bits: u8,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
    /// Parity setting.
    pub parity: Parity,
    /// Appended to every outgoing command.
    pub output_terminator: String,
    /// End-of-response marker for [`ReadUntil::Terminator`].
    pub input_terminator: String,
    /// Backend-specific options the core passes through untouched.
    pub extra: BTreeMap<String, String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            inter_command_delay: Duration::from_millis(100),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            output_terminator: "\r".to_string(),
            input_terminator: "\n".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl TransportSettings {
    /// Set the read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the write-to-read settle time.
    pub fn with_inter_command_delay(mut self, delay: Duration) -> Self {
        self.inter_command_delay = delay;
        self
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set both terminators.
    pub fn with_terminators(mut self, output: &str, input: &str) -> Self {
        self.output_terminator = output.to_string();
        self.input_terminator = input.to_string();
        self
    }

    /// Add a passthrough option.
    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }
}

// =============================================================================
// Exchange primitives
// =============================================================================

/// How a raw read decides the response is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadUntil {
    /// The configured input terminator.
    Terminator,
    /// A specific delimiter sequence.
    Delimiter(Vec<u8>),
    /// Exactly this many bytes.
    Length(usize),
}

/// Raw response of one exchange, as seen by validators.
///
/// Writes produce an acknowledgement rather than data; the default validator
/// accepts acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    bytes: Bytes,
    ack: bool,
}

impl Response {
    /// Acknowledgement of a completed write.
    pub fn ack() -> Self {
        Self {
            bytes: Bytes::new(),
            ack: true,
        }
    }

    /// Data returned by a read.
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            ack: false,
        }
    }

    /// Whether this is a write acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.ack
    }

    /// Raw bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume into raw bytes.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Text with surrounding whitespace and terminators removed.
    pub fn text(&self) -> Cow<'_, str> {
        match String::from_utf8_lossy(&self.bytes) {
            Cow::Borrowed(s) => Cow::Borrowed(s.trim()),
            Cow::Owned(s) => Cow::Owned(s.trim().to_string()),
        }
    }

    /// Text parsed as a float.
    pub fn as_f64(&self) -> Option<f64> {
        self.text().parse().ok()
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Factory for open links on one physical medium.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Medium family.
    fn kind(&self) -> BackendKind;

    /// Channel-sharing key for an address. Addresses with equal locators share
    /// one open link.
    fn locator(&self, address: &Address) -> String {
        address.port().to_string()
    }

    /// Open a link to `locator`.
    async fn open(
        &self,
        locator: &str,
        settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>>;
}

/// Open connection on one physical medium.
///
/// Every call carries the target address so multiplexing links can route it.
/// Callers guarantee that at most one call is in progress per link.
#[async_trait]
pub trait Link: Send {
    /// A device at `address` starts using this link.
    async fn attach(&mut self, _address: &Address) -> anyhow::Result<()> {
        Ok(())
    }

    /// A device at `address` stops using this link.
    async fn detach(&mut self, _address: &Address) -> anyhow::Result<()> {
        Ok(())
    }

    /// Send a payload to `address`.
    async fn write(&mut self, address: &Address, payload: &[u8]) -> anyhow::Result<()>;

    /// Read one response from `address`.
    async fn read(&mut self, address: &Address, until: &ReadUntil) -> anyhow::Result<Bytes>;

    /// Release the underlying handle.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Hardware backend for a kind named in configuration.
///
/// Returns `None` for kinds that need a concrete instance from the caller
/// (simulated instruments, mocks).
pub fn backend_for(kind: BackendKind) -> Option<Arc<dyn Backend>> {
    match kind {
        BackendKind::Serial => Some(Arc::new(SerialBackend::new())),
        BackendKind::Prologix => Some(Arc::new(PrologixBackend::new())),
        BackendKind::Modbus => Some(Arc::new(ModbusBackend::new())),
        BackendKind::Simulated | BackendKind::Mock => None,
    }
}
