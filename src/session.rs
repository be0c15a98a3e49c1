//! Resilient session to one instrument.
//!
//! A [`Session`] binds one address to one backend and runs every exchange
//! through the same loop:
//!
//! 1. wait for the shared channel to be free and mark it busy,
//! 2. perform the raw operation and validate the response,
//! 3. on success reset the failure counters and return,
//! 4. on failure retry, reconnect, or give up according to the
//!    [`RetryPolicy`].
//!
//! A session that gives up moves to [`ConnectionState::Failed`], leaves its
//! channel and returns [`CommError::CommunicationLost`]. Callers never see the
//! individual transient failures.
//!
//! # Example
//!
//! ```rust,ignore
//! let mediator = Arc::new(ChannelMediator::new());
//! let session = Session::new(
//!     Address::parse("COM3")?,
//!     Arc::new(SerialBackend::new()),
//!     TransportSettings::default(),
//!     RetryPolicy::default(),
//!     mediator,
//! );
//! session.open().await?;
//! let idn = session.query("*IDN?", None).await?;
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::channel::{Channel, ChannelMediator, ExchangeGuard, SessionId};
use crate::error::{CommError, CommResult};
use crate::recovery::{Escalation, NextStep, RetryPolicy};
use crate::transport::{Backend, BackendKind, ReadUntil, Response, TransportSettings};
use crate::validator::{accepts_by_default, Validator};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not open, or closed by the caller.
    Disconnected,
    /// Opening, or reopening during a reconnect.
    Connecting,
    /// Open and idle.
    Connected,
    /// Open and inside an exchange.
    Busy,
    /// Gave up after exhausting the recovery budgets.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Busy => "busy",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Lifetime counters of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Exchanges that eventually succeeded.
    pub exchanges: u64,
    /// Failed attempts that were recovered or escalated.
    pub failed_attempts: u64,
    /// Reconnect cycles performed.
    pub reconnects: u64,
}

struct Status {
    state: ConnectionState,
    escalation: Escalation,
    channel: Option<Arc<Channel>>,
    stats: SessionStats,
}

struct SessionInner {
    id: SessionId,
    address: Address,
    backend: Arc<dyn Backend>,
    settings: TransportSettings,
    policy: RetryPolicy,
    mediator: Arc<ChannelMediator>,
    status: Mutex<Status>,
}

/// Handle to a resilient session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("backend", &self.inner.backend.kind())
            .field("state", &self.state())
            .finish()
    }
}

enum Exchange<'a> {
    Write(&'a [u8]),
    Read(&'a ReadUntil),
    Query(&'a [u8], &'a ReadUntil),
}

impl Exchange<'_> {
    fn label(&self) -> &'static str {
        match self {
            Exchange::Write(_) => "write",
            Exchange::Read(_) => "read",
            Exchange::Query(..) => "query",
        }
    }
}

impl Session {
    /// Create a disconnected session.
    pub fn new(
        address: Address,
        backend: Arc<dyn Backend>,
        settings: TransportSettings,
        policy: RetryPolicy,
        mediator: Arc<ChannelMediator>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                address,
                backend,
                settings,
                policy,
                mediator,
                status: Mutex::new(Status {
                    state: ConnectionState::Disconnected,
                    escalation: Escalation::default(),
                    channel: None,
                    stats: SessionStats::default(),
                }),
            }),
        }
    }

    /// Process-unique id, also the occupant id on the channel.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Instrument address.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Backend family.
    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    /// Transport settings the link was opened with.
    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    /// Recovery policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.lock().state
    }

    /// Failure counters of the operation in progress (zero when idle).
    pub fn escalation(&self) -> Escalation {
        self.inner.status.lock().escalation
    }

    /// Lifetime counters.
    pub fn stats(&self) -> SessionStats {
        self.inner.status.lock().stats
    }

    /// Channel this session occupies while open.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.inner.status.lock().channel.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.status.lock().state = state;
    }

    fn not_connected(&self, state: ConnectionState) -> CommError {
        CommError::NotConnected {
            address: self.inner.address.to_string(),
            state: state.to_string(),
        }
    }

    /// Join the shared channel for this address, opening the link if needed.
    ///
    /// Opening an already open session is a no-op.
    pub async fn open(&self) -> CommResult<()> {
        {
            let mut status = self.inner.status.lock();
            match status.state {
                ConnectionState::Connected | ConnectionState::Busy => return Ok(()),
                ConnectionState::Connecting => return Err(self.not_connected(status.state)),
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    status.state = ConnectionState::Connecting;
                }
            }
        }
        let opening = Opening { session: self };

        let joined = self
            .inner
            .mediator
            .join(
                self.inner.id,
                &self.inner.address,
                self.inner.backend.clone(),
                &self.inner.settings,
                self.inner.policy.poll_interval,
            )
            .await;
        opening.finish();

        let mut status = self.inner.status.lock();
        match joined {
            Ok(channel) => {
                info!(
                    address = %self.inner.address,
                    backend = %self.inner.backend.kind(),
                    locator = channel.locator(),
                    "Session connected"
                );
                status.channel = Some(channel);
                status.escalation.reset();
                status.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                status.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Leave the channel.
    ///
    /// Closing a failed session only resets its state; it already left its
    /// channel when it failed.
    pub async fn close(&self) -> CommResult<()> {
        let channel = {
            let mut status = self.inner.status.lock();
            match status.state {
                ConnectionState::Disconnected => return Err(self.not_connected(status.state)),
                ConnectionState::Failed => {
                    status.state = ConnectionState::Disconnected;
                    return Ok(());
                }
                _ => {}
            }
            status.channel.take()
        };

        let result = match channel {
            Some(channel) => {
                self.inner
                    .mediator
                    .leave(
                        self.inner.id,
                        &self.inner.address,
                        &channel,
                        self.inner.policy.poll_interval,
                    )
                    .await
            }
            None => Ok(()),
        };

        self.set_state(ConnectionState::Disconnected);
        info!(address = %self.inner.address, "Session closed");
        result
    }

    /// Send `payload`. Succeeds with an acknowledgement response.
    pub async fn write(
        &self,
        payload: impl AsRef<[u8]>,
        validator: Option<&Validator>,
    ) -> CommResult<Response> {
        self.run(Exchange::Write(payload.as_ref()), validator).await
    }

    /// Read one terminator-framed response.
    pub async fn read(&self, validator: Option<&Validator>) -> CommResult<Response> {
        self.read_until(ReadUntil::Terminator, validator).await
    }

    /// Read one response framed by `until`.
    pub async fn read_until(
        &self,
        until: ReadUntil,
        validator: Option<&Validator>,
    ) -> CommResult<Response> {
        self.run(Exchange::Read(&until), validator).await
    }

    /// Write, settle, read as one exchange.
    pub async fn query(
        &self,
        payload: impl AsRef<[u8]>,
        validator: Option<&Validator>,
    ) -> CommResult<Response> {
        self.query_until(payload, ReadUntil::Terminator, validator)
            .await
    }

    /// Query whose response is framed by `until`.
    pub async fn query_until(
        &self,
        payload: impl AsRef<[u8]>,
        until: ReadUntil,
        validator: Option<&Validator>,
    ) -> CommResult<Response> {
        self.run(Exchange::Query(payload.as_ref(), &until), validator)
            .await
    }

    fn connected_channel(&self) -> CommResult<Arc<Channel>> {
        let status = self.inner.status.lock();
        match (&status.channel, status.state) {
            (
                Some(channel),
                ConnectionState::Connected | ConnectionState::Busy | ConnectionState::Connecting,
            ) => {
                Ok(channel.clone())
            }
            (_, state) => Err(self.not_connected(state)),
        }
    }

    fn publish(&self, state: ConnectionState, escalation: Escalation) {
        let mut status = self.inner.status.lock();
        status.state = state;
        status.escalation = escalation;
    }

    async fn run(
        &self,
        exchange: Exchange<'_>,
        validator: Option<&Validator>,
    ) -> CommResult<Response> {
        let channel = self.connected_channel()?;
        let policy = &self.inner.policy;
        let mut escalation = Escalation::default();
        let mut attempts = 0u32;

        loop {
            let mut guard = channel.acquire(self.inner.id, policy.poll_interval).await?;
            self.publish(ConnectionState::Busy, escalation);
            attempts += 1;

            let reason = match self.attempt(&mut guard, &exchange, validator).await {
                Ok(response) => {
                    drop(guard);
                    self.publish(ConnectionState::Connected, Escalation::default());
                    self.inner.status.lock().stats.exchanges += 1;
                    return Ok(response);
                }
                Err(reason) => reason,
            };

            self.inner.status.lock().stats.failed_attempts += 1;
            warn!(
                address = %self.inner.address,
                operation = exchange.label(),
                attempt = attempts,
                reconnects = escalation.reconnect_count,
                reason = %reason,
                "Exchange failed"
            );

            match escalation.record_failure(policy) {
                NextStep::Retry => {
                    drop(guard);
                    self.publish(ConnectionState::Connected, escalation);
                }
                NextStep::Reconnect => {
                    self.publish(ConnectionState::Connecting, escalation);
                    warn!(
                        address = %self.inner.address,
                        cycle = escalation.reconnect_count,
                        "Reconnecting"
                    );
                    if let Err(e) = guard.reconnect(policy.reconnect_settle).await {
                        warn!(address = %self.inner.address, error = %e, "Reconnect failed");
                    }
                    drop(guard);
                    self.inner.status.lock().stats.reconnects += 1;
                    self.publish(ConnectionState::Connected, escalation);
                }
                NextStep::GiveUp => {
                    drop(guard);
                    return Err(self.give_up(&channel, attempts, escalation, reason).await);
                }
            }
        }
    }

    async fn attempt(
        &self,
        guard: &mut ExchangeGuard,
        exchange: &Exchange<'_>,
        validator: Option<&Validator>,
    ) -> Result<Response, String> {
        let address = &self.inner.address;
        let raw = match exchange {
            Exchange::Write(payload) => guard.write(address, payload).await.map(|()| Response::ack()),
            Exchange::Read(until) => guard.read(address, until).await.map(Response::data),
            Exchange::Query(payload, until) => {
                match guard.write(address, payload).await {
                    Ok(()) => {
                        tokio::time::sleep(self.inner.settings.inter_command_delay).await;
                        guard.read(address, until).await.map(Response::data)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        let response = raw.map_err(|e| format!("{:#}", e))?;

        let accepted = match validator {
            Some(v) => v.check(&response),
            None => accepts_by_default(&response),
        };
        if accepted {
            debug!(address = %address, bytes = response.bytes().len(), "Exchange ok");
            Ok(response)
        } else {
            let rule = validator.map_or("default", Validator::name);
            Err(format!("response {:?} rejected by {} validator", response.text(), rule))
        }
    }

    async fn give_up(
        &self,
        channel: &Arc<Channel>,
        attempts: u32,
        escalation: Escalation,
        last_error: String,
    ) -> CommError {
        {
            let mut status = self.inner.status.lock();
            status.state = ConnectionState::Failed;
            status.escalation = escalation;
            status.channel = None;
        }

        if let Err(e) = self
            .inner
            .mediator
            .leave(
                self.inner.id,
                &self.inner.address,
                channel,
                self.inner.policy.poll_interval,
            )
            .await
        {
            warn!(address = %self.inner.address, error = %e, "Leaving channel after failure failed");
        }

        warn!(
            address = %self.inner.address,
            attempts,
            reconnects = escalation.reconnect_count,
            "Communication lost"
        );

        CommError::CommunicationLost {
            address: self.inner.address.to_string(),
            attempts,
            reconnects: escalation.reconnect_count,
            last_error,
        }
    }
}

/// Returns a session stuck in `Connecting` to `Disconnected` when `open` is
/// dropped before the join completes.
struct Opening<'a> {
    session: &'a Session,
}

impl Opening<'_> {
    fn finish(self) {
        std::mem::forget(self);
    }
}

impl Drop for Opening<'_> {
    fn drop(&mut self) {
        let mut status = self.session.inner.status.lock();
        if status.state == ConnectionState::Connecting {
            debug!(address = %self.session.inner.address, "Open cancelled");
            status.state = ConnectionState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBackend, MockReply};

    fn session_on(mock: &MockBackend, raw: &str) -> Session {
        Session::new(
            Address::parse(raw).unwrap(),
            Arc::new(mock.clone()),
            TransportSettings::default().with_inter_command_delay(std::time::Duration::ZERO),
            RetryPolicy::immediate(),
            Arc::new(ChannelMediator::new()),
        )
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let mock = MockBackend::new();
        let session = session_on(&mock, "COM1");
        session.open().await.unwrap();
        session.open().await.unwrap();
        assert_eq!(mock.open_count(), 1);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_twice_is_not_connected() {
        let mock = MockBackend::new();
        let session = session_on(&mock, "COM1");
        session.open().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.close().await,
            Err(CommError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_open_returns_to_disconnected() {
        let mock = MockBackend::new();
        mock.fail_all_opens();
        let session = session_on(&mock, "COM1");
        assert!(matches!(
            session.open().await,
            Err(CommError::OpenFailed { .. })
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancelled_open_returns_to_disconnected() {
        let mock = MockBackend::new();
        let mediator = Arc::new(ChannelMediator::new());
        let share = |raw: &str| {
            Session::new(
                Address::parse(raw).unwrap(),
                Arc::new(mock.clone()),
                TransportSettings::default(),
                RetryPolicy::immediate(),
                mediator.clone(),
            )
        };
        let first = share("COM1::1");
        let second = share("COM1::2");
        first.open().await.unwrap();

        let channel = first.channel().unwrap();
        let exchange = channel.acquire(first.id(), first.policy().poll_interval).await.unwrap();
        let attempt = tokio::time::timeout(std::time::Duration::from_millis(10), second.open()).await;
        assert!(attempt.is_err());
        assert_eq!(second.state(), ConnectionState::Disconnected);

        drop(exchange);
        second.open().await.unwrap();
        assert_eq!(second.state(), ConnectionState::Connected);
        assert_eq!(mock.open_count(), 1);
    }

    #[tokio::test]
    async fn test_write_is_acknowledged() {
        let mock = MockBackend::new();
        let session = session_on(&mock, "COM1");
        session.open().await.unwrap();
        let response = session.write("OUTP ON", None).await.unwrap();
        assert!(response.is_ack());
        assert_eq!(mock.written(), vec!["OUTP ON".to_string()]);
    }

    #[tokio::test]
    async fn test_validator_rejection_is_retried() {
        let mock = MockBackend::new().with_script([MockReply::data("ERR"), MockReply::data("2.5")]);
        let session = session_on(&mock, "COM1");
        session.open().await.unwrap();

        let response = session
            .query("MEAS?", Some(&Validator::numeric()))
            .await
            .unwrap();
        assert_eq!(response.as_f64(), Some(2.5));
        assert_eq!(mock.write_count(), 2);
        assert_eq!(session.stats().failed_attempts, 1);
        assert_eq!(session.escalation(), Escalation::default());
    }

    #[tokio::test]
    async fn test_state_display() {
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}
