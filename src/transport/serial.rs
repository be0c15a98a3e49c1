//! Serial (RS-232 / USB-serial) backend.
//!
//! [`SerialLink`] does the framing on top of any async byte stream: it appends
//! the output terminator to each command and reads until the input terminator,
//! a byte count, or the read timeout. The real port is opened through
//! `tokio-serial` behind the `serial` feature; tests drive the same link over
//! `tokio::io::duplex`.
//!
//! # Feature Flag
//!
//! ```toml
//! [dependencies]
//! daq_comm = { version = "0.3", features = ["serial"] }
//! ```

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use super::{Backend, BackendKind, Link, ReadUntil, TransportSettings};
use crate::address::Address;

/// Stale input is drained for this long after a port opens.
const OPEN_DRAIN_WINDOW: Duration = Duration::from_millis(50);

// =============================================================================
// Port Abstraction
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Satisfied by `tokio_serial::SerialStream`, `tokio::io::DuplexStream` and
/// any other `AsyncRead + AsyncWrite + Unpin + Send` type.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port with the configured framing.
///
/// Port opening is blocking, so it runs on the blocking pool.
#[cfg(feature = "serial")]
pub async fn open_port(path: &str, settings: &TransportSettings) -> anyhow::Result<DynSerial> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => anyhow::bail!("unsupported data bits: {}", other),
    };
    let stop_bits = match settings.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => anyhow::bail!("unsupported stop bits: {}", other),
    };
    let parity = match settings.parity {
        super::Parity::None => tokio_serial::Parity::None,
        super::Parity::Even => tokio_serial::Parity::Even,
        super::Parity::Odd => tokio_serial::Parity::Odd,
    };

    let path_owned = path.to_string();
    let baud_rate = settings.baud_rate;
    let timeout = settings.timeout;

    let port = spawn_blocking(move || {
        tokio_serial::new(&path_owned, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(timeout)
            .open_native_async()
            .context(format!("Failed to open serial port: {}", path_owned))
    })
    .await
    .context("spawn_blocking for serial port opening failed")??;

    Ok(Box::new(port))
}

/// Serial support compiled out.
#[cfg(not(feature = "serial"))]
pub async fn open_port(path: &str, _settings: &TransportSettings) -> anyhow::Result<DynSerial> {
    anyhow::bail!(
        "Serial support not enabled, cannot open {}. Rebuild with --features serial",
        path
    )
}

/// Read and discard whatever arrives within `window`.
///
/// Returns the number of bytes discarded.
pub async fn drain_input<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}

// =============================================================================
// Link
// =============================================================================

/// Terminator-framed link over an async byte stream.
///
/// Input left over from an earlier exchange is discarded before every command,
/// and after a timed-out read the link also waits one timeout for the late
/// reply before writing again, so a reply is never handed to the next command.
pub struct SerialLink {
    port: BufReader<DynSerial>,
    settings: TransportSettings,
    locator: String,
    late_reply_expected: bool,
}

impl SerialLink {
    /// Wrap an already open port.
    pub fn new(port: DynSerial, settings: TransportSettings, locator: &str) -> Self {
        Self {
            port: BufReader::new(port),
            settings,
            locator: locator.to_string(),
            late_reply_expected: false,
        }
    }

    /// Settings this link was opened with.
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Discard stale input (responses to commands nobody read).
    pub async fn drain_stale(&mut self, window: Duration) -> usize {
        let discarded = drain_input(&mut self.port, window).await;
        if discarded > 0 {
            debug!(locator = %self.locator, bytes = discarded, "Discarded stale input");
        }
        discarded
    }

    /// Discard input that is already available, without waiting.
    pub fn discard_pending(&mut self) -> usize {
        let mut total = self.port.buffer().len();
        self.port.consume(total);

        let mut discard = [0u8; 256];
        while let Some(Ok(n)) = self.port.get_mut().read(&mut discard).now_or_never() {
            if n == 0 {
                break;
            }
            total += n;
        }
        if total > 0 {
            debug!(locator = %self.locator, bytes = total, "Discarded unread input");
        }
        total
    }

    /// Clear input belonging to earlier exchanges before a new command.
    pub async fn prepare_exchange(&mut self) -> usize {
        let mut discarded = 0;
        if self.late_reply_expected {
            self.late_reply_expected = false;
            discarded += self.drain_stale(self.settings.timeout).await;
        }
        discarded + self.discard_pending()
    }

    /// Write `payload` followed by the output terminator.
    pub async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + self.settings.output_terminator.len());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(self.settings.output_terminator.as_bytes());

        let port = self.port.get_mut();
        port.write_all(&frame)
            .await
            .with_context(|| format!("write to {} failed", self.locator))?;
        port.flush()
            .await
            .with_context(|| format!("flush of {} failed", self.locator))?;
        Ok(())
    }

    /// Read one response.
    ///
    /// Terminator-framed responses come back with surrounding whitespace and the
    /// terminator removed; length-framed responses come back untouched.
    pub async fn receive(&mut self, until: &ReadUntil) -> anyhow::Result<Bytes> {
        let timeout = self.settings.timeout;
        let delimiter = match until {
            ReadUntil::Terminator => self.settings.input_terminator.as_bytes().to_vec(),
            ReadUntil::Delimiter(delimiter) => delimiter.clone(),
            ReadUntil::Length(length) => {
                let mut buf = vec![0u8; *length];
                tokio::time::timeout(timeout, self.port.read_exact(&mut buf))
                    .await
                    .map_err(|_| {
                        self.late_reply_expected = true;
                        anyhow::anyhow!(
                            "timed out after {:?} waiting for {} bytes from {}",
                            timeout,
                            length,
                            self.locator
                        )
                    })?
                    .with_context(|| format!("read from {} failed", self.locator))?;
                return Ok(Bytes::from(buf));
            }
        };

        let raw = tokio::time::timeout(timeout, read_until_sequence(&mut self.port, &delimiter))
            .await
            .map_err(|_| {
                self.late_reply_expected = true;
                anyhow::anyhow!(
                    "timed out after {:?} waiting for response from {}",
                    timeout,
                    self.locator
                )
            })?
            .with_context(|| format!("read from {} failed", self.locator))?;

        Ok(Bytes::from(trim_ascii(&raw).to_vec()))
    }

    /// Shut down the underlying stream.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.port
            .get_mut()
            .shutdown()
            .await
            .with_context(|| format!("close of {} failed", self.locator))
    }
}

async fn read_until_sequence<R>(reader: &mut R, delimiter: &[u8]) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let Some(&last) = delimiter.last() else {
        // No delimiter: take whatever arrives in one read
        let mut chunk = [0u8; 256];
        let n = reader.read(&mut chunk).await?;
        buf.extend_from_slice(&chunk[..n]);
        return Ok(buf);
    };

    loop {
        let n = reader.read_until(last, &mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "port closed before terminator",
            ));
        }
        if buf.ends_with(delimiter) {
            buf.truncate(buf.len() - delimiter.len());
            return Ok(buf);
        }
    }
}

fn trim_ascii(raw: &[u8]) -> &[u8] {
    let start = raw.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |idx| idx + 1);
    &raw[start..end]
}

#[async_trait]
impl Link for SerialLink {
    async fn write(&mut self, _address: &Address, payload: &[u8]) -> anyhow::Result<()> {
        self.prepare_exchange().await;
        self.send(payload).await
    }

    async fn read(&mut self, _address: &Address, until: &ReadUntil) -> anyhow::Result<Bytes> {
        self.receive(until).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.shutdown().await
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Opens [`SerialLink`]s on local serial ports.
#[derive(Debug, Clone, Default)]
pub struct SerialBackend;

impl SerialBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for SerialBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    async fn open(
        &self,
        locator: &str,
        settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>> {
        let port = open_port(locator, settings).await?;
        let mut link = SerialLink::new(port, settings.clone(), locator);
        link.drain_stale(OPEN_DRAIN_WINDOW).await;
        Ok(Box::new(link))
    }
}
