//! Scriptable backend for testing without hardware.
//!
//! Every link opened by one [`MockBackend`] shares the same state, so a test
//! keeps a clone of the backend and inspects the call log and counters after
//! handing the original to a session.
//!
//! Reads consume the reply script in order. When the script is empty the
//! responder (if any) answers based on the last payload written, otherwise the
//! default reply is returned.
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = MockBackend::new()
//!     .with_script([MockReply::fail("timeout"), MockReply::data("1.0")]);
//! let backend: Arc<dyn Backend> = Arc::new(mock.clone());
//! // ... drive a session ...
//! assert_eq!(mock.read_count(), 2);
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{Backend, BackendKind, Link, ReadUntil, TransportSettings};
use crate::address::Address;

/// One scripted read outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Return these bytes.
    Data(Bytes),
    /// Fail the read with this message.
    Fail(String),
}

impl MockReply {
    /// Successful reply.
    pub fn data(text: &str) -> Self {
        MockReply::Data(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Failing reply.
    pub fn fail(message: &str) -> Self {
        MockReply::Fail(message.to_string())
    }
}

/// Recorded link operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// Link opened for this locator.
    Open(String),
    /// Address attached.
    Attach(String),
    /// Address detached.
    Detach(String),
    /// Payload written to address.
    Write(String, Vec<u8>),
    /// Read from address.
    Read(String),
    /// Link closed.
    Close,
}

/// Computes a reply from the last written payload.
pub type Responder = Arc<dyn Fn(&[u8]) -> MockReply + Send + Sync>;

struct MockState {
    script: VecDeque<MockReply>,
    responder: Option<Responder>,
    default_reply: MockReply,
    latency: Duration,
    failing_opens: u32,
    failing_writes: u32,
    last_write: Vec<u8>,
    calls: Vec<MockCall>,
    opens: usize,
    closes: usize,
    writes: usize,
    reads: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Mock transport backend.
#[derive(Clone)]
pub struct MockBackend {
    kind: BackendKind,
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockBackend")
            .field("kind", &self.kind)
            .field("scripted", &state.script.len())
            .field("opens", &state.opens)
            .finish()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend that answers every read with `"1.0"`.
    pub fn new() -> Self {
        Self {
            kind: BackendKind::Mock,
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                responder: None,
                default_reply: MockReply::data("1.0"),
                latency: Duration::ZERO,
                failing_opens: 0,
                failing_writes: 0,
                last_write: Vec::new(),
                calls: Vec::new(),
                opens: 0,
                closes: 0,
                writes: 0,
                reads: 0,
                in_flight: 0,
                max_in_flight: 0,
            })),
        }
    }

    /// Report a different backend kind (to stand in for serial, prologix, ...).
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Queue replies consumed by successive reads.
    pub fn with_script(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.state.lock().script.extend(replies);
        self
    }

    /// Answer reads from the last written payload once the script is exhausted.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> MockReply + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
        self
    }

    /// Reply used when neither script nor responder applies.
    pub fn with_default_reply(self, reply: MockReply) -> Self {
        self.state.lock().default_reply = reply;
        self
    }

    /// Simulated time spent in every write and read.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Fail the next `count` opens.
    pub fn fail_opens(&self, count: u32) {
        self.state.lock().failing_opens = count;
    }

    /// Fail every open from now on.
    pub fn fail_all_opens(&self) {
        self.state.lock().failing_opens = u32::MAX;
    }

    /// Fail the next `count` writes.
    pub fn fail_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    /// Append replies to the script.
    pub fn push_replies(&self, replies: impl IntoIterator<Item = MockReply>) {
        self.state.lock().script.extend(replies);
    }

    /// Every recorded operation, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Payloads written, as text, in order.
    pub fn written(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Write(_, payload) => Some(String::from_utf8_lossy(payload).into_owned()),
                _ => None,
            })
            .collect()
    }

    /// Links opened (successful opens only).
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    /// Links closed.
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Write calls, including failed ones.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    /// Read calls, including failed ones.
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    /// Highest number of link operations ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    fn enter(&self) -> Duration {
        let mut state = self.state.lock();
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        state.latency
    }

    fn exit(&self) {
        self.state.lock().in_flight -= 1;
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn open(
        &self,
        locator: &str,
        _settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>> {
        {
            let mut state = self.state.lock();
            if state.failing_opens > 0 {
                if state.failing_opens != u32::MAX {
                    state.failing_opens -= 1;
                }
                anyhow::bail!("mock open of '{}' refused", locator);
            }
            state.opens += 1;
            state.calls.push(MockCall::Open(locator.to_string()));
        }
        Ok(Box::new(MockLink {
            backend: self.clone(),
            open: true,
        }))
    }
}

struct MockLink {
    backend: MockBackend,
    open: bool,
}

impl MockLink {
    fn ensure_open(&self) -> anyhow::Result<()> {
        if !self.open {
            anyhow::bail!("mock link is closed");
        }
        Ok(())
    }
}

#[async_trait]
impl Link for MockLink {
    async fn attach(&mut self, address: &Address) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.backend
            .state
            .lock()
            .calls
            .push(MockCall::Attach(address.to_string()));
        Ok(())
    }

    async fn detach(&mut self, address: &Address) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.backend
            .state
            .lock()
            .calls
            .push(MockCall::Detach(address.to_string()));
        Ok(())
    }

    async fn write(&mut self, address: &Address, payload: &[u8]) -> anyhow::Result<()> {
        self.ensure_open()?;
        let latency = self.backend.enter();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let mut state = self.backend.state.lock();
            state.writes += 1;
            state
                .calls
                .push(MockCall::Write(address.to_string(), payload.to_vec()));
            state.last_write = payload.to_vec();
            if state.failing_writes > 0 {
                state.failing_writes -= 1;
                Err(anyhow::anyhow!("mock write to {} failed", address))
            } else {
                Ok(())
            }
        };

        self.backend.exit();
        result
    }

    async fn read(&mut self, address: &Address, _until: &ReadUntil) -> anyhow::Result<Bytes> {
        self.ensure_open()?;
        let latency = self.backend.enter();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let reply = {
            let mut state = self.backend.state.lock();
            state.reads += 1;
            state.calls.push(MockCall::Read(address.to_string()));
            match state.script.pop_front() {
                Some(reply) => reply,
                None => match &state.responder {
                    Some(responder) => responder(&state.last_write),
                    None => state.default_reply.clone(),
                },
            }
        };

        self.backend.exit();
        match reply {
            MockReply::Data(bytes) => Ok(bytes),
            MockReply::Fail(message) => Err(anyhow::anyhow!(message)),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.open {
            self.open = false;
            let mut state = self.backend.state.lock();
            state.closes += 1;
            state.calls.push(MockCall::Close);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(raw: &str) -> Address {
        Address::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockBackend::new().with_script([MockReply::fail("boom"), MockReply::data("42")]);
        let mut link = mock.open("mock", &TransportSettings::default()).await.unwrap();
        let addr = address("mock::1");

        assert!(link.read(&addr, &ReadUntil::Terminator).await.is_err());
        assert_eq!(
            link.read(&addr, &ReadUntil::Terminator).await.unwrap(),
            Bytes::from_static(b"42")
        );
        assert_eq!(
            link.read(&addr, &ReadUntil::Terminator).await.unwrap(),
            Bytes::from_static(b"1.0")
        );
        assert_eq!(mock.read_count(), 3);
    }

    #[tokio::test]
    async fn test_responder_sees_last_write() {
        let mock = MockBackend::new().with_responder(|written| {
            MockReply::Data(Bytes::from(written.to_ascii_lowercase()))
        });
        let mut link = mock.open("mock", &TransportSettings::default()).await.unwrap();
        let addr = address("mock");

        link.write(&addr, b"IDN?").await.unwrap();
        let reply = link.read(&addr, &ReadUntil::Terminator).await.unwrap();
        assert_eq!(reply, Bytes::from_static(b"idn?"));
    }

    #[tokio::test]
    async fn test_failing_opens_are_counted_down() {
        let mock = MockBackend::new();
        mock.fail_opens(1);
        let settings = TransportSettings::default();

        assert!(mock.open("mock", &settings).await.is_err());
        assert!(mock.open("mock", &settings).await.is_ok());
        assert_eq!(mock.open_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_io() {
        let mock = MockBackend::new();
        let mut link = mock.open("mock", &TransportSettings::default()).await.unwrap();
        link.close().await.unwrap();
        link.close().await.unwrap();

        assert!(link.write(&address("mock"), b"X").await.is_err());
        assert_eq!(mock.close_count(), 1);
        assert_eq!(mock.write_count(), 0);
    }
}
