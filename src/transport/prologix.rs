//! GPIB through a Prologix GPIB-USB controller.
//!
//! One controller serial port fronts many GPIB instruments, so every address
//! with the same controller port shares one channel. The link keeps track of
//! which instruments are attached and re-targets the controller (`++addr N`)
//! whenever consecutive exchanges go to different instruments.
//!
//! Controller protocol used here:
//!
//! | Command | When |
//! |---|---|
//! | `++rst` | on open, followed by the controller's reset time |
//! | `++mode 1` / `++auto 0` | on open: controller mode, no read-after-write |
//! | `++addr N` | before an exchange with a different instrument |
//! | `++read eoi` | before every read |
//! | `++clr` / `++loc` | on detach: clear the instrument, return it to local |

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info};

use super::serial::{open_port, SerialLink};
use super::{Backend, BackendKind, Link, ReadUntil, TransportSettings};
use crate::address::Address;

/// Time the controller needs after `++rst`.
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_secs(6);

const ESC: u8 = 0x1B;

/// Escape payload bytes the controller would otherwise interpret.
///
/// CR, LF, ESC and `+` inside instrument data must be preceded by ESC.
pub fn escape_payload(payload: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(payload.len());
    for &byte in payload {
        if matches!(byte, b'\r' | b'\n' | ESC | b'+') {
            escaped.push(ESC);
        }
        escaped.push(byte);
    }
    escaped
}

/// Link to a Prologix controller and the instruments behind it.
pub struct PrologixLink {
    serial: SerialLink,
    devices: Vec<u32>,
    current: Option<u32>,
}

impl PrologixLink {
    /// Reset and configure a controller reachable over `serial`.
    pub async fn initialize(mut serial: SerialLink, reset_settle: Duration) -> anyhow::Result<Self> {
        serial.send(b"++rst").await?;
        info!(reset_settle = ?reset_settle, "Resetting Prologix GPIB-USB controller");
        tokio::time::sleep(reset_settle).await;
        serial.send(b"++mode 1").await?;
        serial.send(b"++auto 0").await?;

        Ok(Self {
            serial,
            devices: Vec::new(),
            current: None,
        })
    }

    /// GPIB addresses currently attached.
    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    fn gpib_address(address: &Address) -> anyhow::Result<u32> {
        address
            .number()
            .filter(|n| *n <= 30)
            .ok_or_else(|| anyhow::anyhow!("'{}' is not a GPIB primary address (0-30)", address))
    }

    async fn select(&mut self, address: &Address) -> anyhow::Result<()> {
        let gpib = Self::gpib_address(address)?;
        if !self.devices.contains(&gpib) {
            anyhow::bail!("GPIB device at address {} is not connected", gpib);
        }
        if self.current != Some(gpib) {
            self.serial.send(format!("++addr {}", gpib).as_bytes()).await?;
            self.current = Some(gpib);
        }
        Ok(())
    }
}

#[async_trait]
impl Link for PrologixLink {
    async fn attach(&mut self, address: &Address) -> anyhow::Result<()> {
        let gpib = Self::gpib_address(address)?;
        if !self.devices.contains(&gpib) {
            self.devices.push(gpib);
        }
        debug!(gpib, devices = self.devices.len(), "Attached GPIB device");
        Ok(())
    }

    async fn detach(&mut self, address: &Address) -> anyhow::Result<()> {
        self.select(address).await?;
        self.serial.send(b"++clr").await?;
        self.serial.send(b"++loc").await?;

        let gpib = Self::gpib_address(address)?;
        self.devices.retain(|d| *d != gpib);
        debug!(gpib, devices = self.devices.len(), "Detached GPIB device");
        Ok(())
    }

    async fn write(&mut self, address: &Address, payload: &[u8]) -> anyhow::Result<()> {
        self.serial.prepare_exchange().await;
        self.select(address).await?;
        self.serial.send(&escape_payload(payload)).await
    }

    async fn read(&mut self, address: &Address, until: &ReadUntil) -> anyhow::Result<Bytes> {
        self.select(address).await?;
        self.serial.send(b"++read eoi").await?;
        self.serial.receive(until).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.devices.clear();
        self.current = None;
        self.serial.shutdown().await
    }
}

/// Opens [`PrologixLink`]s.
///
/// Addresses are either `PORT::N` (controller port and GPIB address) or a bare
/// `N`, in which case the backend's default controller port is used.
#[derive(Debug, Clone)]
pub struct PrologixBackend {
    controller_port: Option<String>,
    reset_settle: Duration,
}

impl Default for PrologixBackend {
    fn default() -> Self {
        Self {
            controller_port: None,
            reset_settle: DEFAULT_RESET_SETTLE,
        }
    }
}

impl PrologixBackend {
    /// Backend with the standard controller reset time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller port used for bare GPIB addresses.
    pub fn with_controller_port(mut self, port: &str) -> Self {
        self.controller_port = Some(port.to_string());
        self
    }

    /// Override the wait after `++rst`.
    pub fn with_reset_settle(mut self, reset_settle: Duration) -> Self {
        self.reset_settle = reset_settle;
        self
    }
}

#[async_trait]
impl Backend for PrologixBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Prologix
    }

    fn locator(&self, address: &Address) -> String {
        match (address.channel(), &self.controller_port) {
            (Some(_), _) => address.port().to_string(),
            (None, Some(port)) => port.clone(),
            (None, None) => "prologix".to_string(),
        }
    }

    async fn open(
        &self,
        locator: &str,
        settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>> {
        let port = open_port(locator, settings).await?;
        let serial = SerialLink::new(port, settings.clone(), locator);
        let link = PrologixLink::initialize(serial, self.reset_settle).await?;
        Ok(Box::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_payload() {
        assert_eq!(escape_payload(b"VOLT 1"), b"VOLT 1".to_vec());
        assert_eq!(
            escape_payload(b"+1\r"),
            vec![ESC, b'+', b'1', ESC, b'\r']
        );
    }

    #[test]
    fn test_locator_uses_controller_port() {
        let backend = PrologixBackend::new().with_controller_port("/dev/ttyUSB3");
        assert_eq!(backend.locator(&Address::parse("12").unwrap()), "/dev/ttyUSB3");
        assert_eq!(backend.locator(&Address::parse("COM7::12").unwrap()), "COM7");
    }

    #[test]
    fn test_gpib_address_range() {
        assert!(PrologixLink::gpib_address(&Address::parse("COM7::30").unwrap()).is_ok());
        assert!(PrologixLink::gpib_address(&Address::parse("COM7::31").unwrap()).is_err());
        assert!(PrologixLink::gpib_address(&Address::parse("COM7").unwrap()).is_err());
    }
}
