//! Modbus RTU over a serial line.
//!
//! Addresses are `PORT::SLAVE`; every slave on a port shares one channel, so
//! the busy flag keeps their request/response frames from interleaving on the
//! wire.
//!
//! The link moves raw frames. Framing and checking happen in [`ModbusClient`],
//! which builds requests, reads the exact response length through the session
//! and validates the CRC, so a corrupted frame is retried like any other
//! failed exchange.
//!
//! Supported function codes: `0x03` read holding registers, `0x06` write
//! single register, `0x10` write multiple registers.

use async_trait::async_trait;
use bytes::Bytes;
use crc::{Crc, CRC_16_MODBUS};
use std::time::Duration;
use thiserror::Error;

use super::serial::{open_port, SerialLink};
use super::{Backend, BackendKind, Link, ReadUntil, TransportSettings};
use crate::address::Address;
use crate::error::{CommError, CommResult};
use crate::session::Session;
use crate::validator::Validator;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Read holding registers.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Write single register.
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Write multiple registers.
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Stale bytes from other slaves are drained this long before each request.
const PRE_WRITE_DRAIN: Duration = Duration::from_millis(5);

// =============================================================================
// Codec
// =============================================================================

/// Frame-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Frame shorter than the smallest valid response.
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    /// CRC does not match the frame contents.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Crc {
        /// CRC computed over the frame.
        expected: u16,
        /// CRC carried by the frame.
        actual: u16,
    },
    /// Response from a different slave.
    #[error("response from slave {actual}, expected {expected}")]
    WrongSlave {
        /// Slave that was addressed.
        expected: u8,
        /// Slave that answered.
        actual: u8,
    },
    /// Slave returned an exception code.
    #[error("slave exception {code:#04x} for function {function:#04x}")]
    Exception {
        /// Function that failed.
        function: u8,
        /// Modbus exception code.
        code: u8,
    },
    /// Function code does not match the request.
    #[error("unexpected function {actual:#04x}, expected {expected:#04x}")]
    WrongFunction {
        /// Requested function.
        expected: u8,
        /// Function in the response.
        actual: u8,
    },
    /// Payload length disagrees with the request.
    #[error("unexpected payload length {0}")]
    BadLength(usize),
}

/// Word order of 32-bit values spread over two registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WordOrder {
    /// High word in the lower register.
    #[default]
    HighFirst,
    /// Low word in the lower register.
    LowFirst,
}

/// Append the CRC (low byte first) to a frame body.
pub fn seal(mut body: Vec<u8>) -> Vec<u8> {
    let crc = MODBUS_CRC.checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

/// Check CRC, slave and function of a response frame and return its body
/// (everything between the function code and the CRC).
pub fn check_frame(frame: &[u8], slave: u8, function: u8) -> Result<&[u8], ModbusError> {
    if frame.len() < 5 {
        return Err(ModbusError::TooShort(frame.len()));
    }
    let (content, crc_bytes) = frame.split_at(frame.len() - 2);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let expected = MODBUS_CRC.checksum(content);
    if actual != expected {
        return Err(ModbusError::Crc { expected, actual });
    }
    if content[0] != slave {
        return Err(ModbusError::WrongSlave {
            expected: slave,
            actual: content[0],
        });
    }
    if content[1] == function | 0x80 {
        return Err(ModbusError::Exception {
            function,
            code: content[2],
        });
    }
    if content[1] != function {
        return Err(ModbusError::WrongFunction {
            expected: function,
            actual: content[1],
        });
    }
    Ok(&content[2..])
}

/// Request for `count` holding registers starting at `start`.
pub fn read_holding_request(slave: u8, start: u16, count: u16) -> Vec<u8> {
    let mut body = vec![slave, READ_HOLDING_REGISTERS];
    body.extend_from_slice(&start.to_be_bytes());
    body.extend_from_slice(&count.to_be_bytes());
    seal(body)
}

/// Response length of a read-holding request.
pub fn read_holding_response_len(count: u16) -> usize {
    5 + 2 * count as usize
}

/// Register values out of a read-holding response.
pub fn parse_holding_response(frame: &[u8], slave: u8, count: u16) -> Result<Vec<u16>, ModbusError> {
    let body = check_frame(frame, slave, READ_HOLDING_REGISTERS)?;
    let byte_count = body[0] as usize;
    let data = &body[1..];
    if byte_count != 2 * count as usize || data.len() != byte_count {
        return Err(ModbusError::BadLength(data.len()));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Request writing one register. The slave echoes it back unchanged.
pub fn write_single_request(slave: u8, register: u16, value: u16) -> Vec<u8> {
    let mut body = vec![slave, WRITE_SINGLE_REGISTER];
    body.extend_from_slice(&register.to_be_bytes());
    body.extend_from_slice(&value.to_be_bytes());
    seal(body)
}

/// Request writing consecutive registers. The response is 8 bytes.
pub fn write_multiple_request(slave: u8, start: u16, values: &[u16]) -> Vec<u8> {
    let mut body = vec![slave, WRITE_MULTIPLE_REGISTERS];
    body.extend_from_slice(&start.to_be_bytes());
    body.extend_from_slice(&(values.len() as u16).to_be_bytes());
    body.push((values.len() * 2) as u8);
    for value in values {
        body.extend_from_slice(&value.to_be_bytes());
    }
    seal(body)
}

/// Combine two registers into an IEEE-754 float.
pub fn registers_to_f32(registers: [u16; 2], order: WordOrder) -> f32 {
    let (high, low) = match order {
        WordOrder::HighFirst => (registers[0], registers[1]),
        WordOrder::LowFirst => (registers[1], registers[0]),
    };
    f32::from_bits(((high as u32) << 16) | low as u32)
}

/// Split an IEEE-754 float over two registers.
pub fn f32_to_registers(value: f32, order: WordOrder) -> [u16; 2] {
    let bits = value.to_bits();
    let (high, low) = ((bits >> 16) as u16, bits as u16);
    match order {
        WordOrder::HighFirst => [high, low],
        WordOrder::LowFirst => [low, high],
    }
}

/// Validator accepting only well-formed frames from `slave` for `function`.
pub fn frame_validator(slave: u8, function: u8) -> Validator {
    Validator::new("modbus frame", move |response| {
        check_frame(response.bytes(), slave, function).is_ok()
    })
}

// =============================================================================
// Client
// =============================================================================

/// Register-level access to one slave through a resilient session.
#[derive(Debug, Clone)]
pub struct ModbusClient {
    session: Session,
    slave: u8,
}

impl ModbusClient {
    /// Client for the slave named by the session address (`PORT::SLAVE`).
    pub fn new(session: Session) -> CommResult<Self> {
        let slave = session
            .address()
            .channel()
            .and_then(|c| c.parse::<u8>().ok())
            .filter(|id| (1..=247).contains(id))
            .ok_or_else(|| CommError::InvalidAddress(session.address().to_string()))?;
        Ok(Self { session, slave })
    }

    /// Slave id.
    pub fn slave(&self) -> u8 {
        self.slave
    }

    fn decode_error(&self, err: ModbusError) -> CommError {
        CommError::Transient {
            address: self.session.address().to_string(),
            reason: err.to_string(),
        }
    }

    /// Read `count` holding registers.
    pub async fn read_registers(&self, start: u16, count: u16) -> CommResult<Vec<u16>> {
        let response = self
            .session
            .query_until(
                read_holding_request(self.slave, start, count),
                ReadUntil::Length(read_holding_response_len(count)),
                Some(&frame_validator(self.slave, READ_HOLDING_REGISTERS)),
            )
            .await?;
        parse_holding_response(response.bytes(), self.slave, count)
            .map_err(|e| self.decode_error(e))
    }

    /// Write one holding register.
    pub async fn write_register(&self, register: u16, value: u16) -> CommResult<()> {
        self.session
            .query_until(
                write_single_request(self.slave, register, value),
                ReadUntil::Length(8),
                Some(&frame_validator(self.slave, WRITE_SINGLE_REGISTER)),
            )
            .await?;
        Ok(())
    }

    /// Read a float stored in two consecutive registers.
    pub async fn read_float(&self, start: u16, order: WordOrder) -> CommResult<f32> {
        let registers = self.read_registers(start, 2).await?;
        match registers.as_slice() {
            [a, b] => Ok(registers_to_f32([*a, *b], order)),
            _ => Err(self.decode_error(ModbusError::BadLength(registers.len() * 2))),
        }
    }

    /// Write a float into two consecutive registers.
    pub async fn write_float(&self, start: u16, value: f32, order: WordOrder) -> CommResult<()> {
        self.session
            .query_until(
                write_multiple_request(self.slave, start, &f32_to_registers(value, order)),
                ReadUntil::Length(8),
                Some(&frame_validator(self.slave, WRITE_MULTIPLE_REGISTERS)),
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// Backend
// =============================================================================

struct ModbusLink {
    serial: SerialLink,
}

#[async_trait]
impl Link for ModbusLink {
    async fn write(&mut self, _address: &Address, payload: &[u8]) -> anyhow::Result<()> {
        self.serial.prepare_exchange().await;
        self.serial.drain_stale(PRE_WRITE_DRAIN).await;
        self.serial.send(payload).await
    }

    async fn read(&mut self, _address: &Address, until: &ReadUntil) -> anyhow::Result<Bytes> {
        self.serial.receive(until).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.serial.shutdown().await
    }
}

/// Opens raw serial links for Modbus RTU traffic.
#[derive(Debug, Clone, Default)]
pub struct ModbusBackend;

impl ModbusBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }

    /// Common Modbus RTU line settings: 38400 8N1, 50ms timeout, no
    /// terminators.
    pub fn default_settings() -> TransportSettings {
        TransportSettings {
            timeout: Duration::from_millis(50),
            inter_command_delay: Duration::from_millis(50),
            baud_rate: 38400,
            output_terminator: String::new(),
            input_terminator: String::new(),
            ..TransportSettings::default()
        }
    }
}

#[async_trait]
impl Backend for ModbusBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Modbus
    }

    async fn open(
        &self,
        locator: &str,
        settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>> {
        let port = open_port(locator, settings).await?;
        Ok(Box::new(ModbusLink {
            serial: SerialLink::new(port, settings.clone(), locator),
        }))
    }
}
