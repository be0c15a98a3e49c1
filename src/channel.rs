//! Shared channels and the mediator that hands them out.
//!
//! Several sessions may sit on one physical link (instruments behind one GPIB
//! controller, Modbus slaves on one serial line). A [`Channel`] owns that link
//! and records which sessions occupy it and whether any of them is mid-exchange.
//!
//! An exchange is bracketed by an [`ExchangeGuard`]. Acquiring one polls the
//! channel until no occupant is busy, then marks the caller busy; dropping the
//! guard clears the flag. At most one guard exists per channel at any time, so
//! link I/O from different sessions never interleaves.
//!
//! [`ChannelMediator`] is the registry keyed by locator. The first session for
//! a locator opens the link; the last one to leave closes it and removes the
//! channel, so a later session for the same locator gets a fresh link.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::error::{CommError, CommResult};
use crate::transport::{Backend, BackendKind, Link, ReadUntil, TransportSettings};

/// Process-unique session identifier.
pub type SessionId = u64;

type LinkSlot = Arc<tokio::sync::Mutex<Option<Box<dyn Link>>>>;

#[derive(Debug)]
struct Occupant {
    address: Address,
    busy: bool,
}

/// One open link plus its occupants.
pub struct Channel {
    locator: String,
    generation: u64,
    backend: Arc<dyn Backend>,
    settings: TransportSettings,
    occupants: Mutex<HashMap<SessionId, Occupant>>,
    link: LinkSlot,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("locator", &self.locator)
            .field("generation", &self.generation)
            .field("backend", &self.backend.kind())
            .field("occupants", &self.occupant_count())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl Channel {
    fn new(
        locator: String,
        generation: u64,
        backend: Arc<dyn Backend>,
        settings: TransportSettings,
        link: Box<dyn Link>,
    ) -> Self {
        Self {
            locator,
            generation,
            backend,
            settings,
            occupants: Mutex::new(HashMap::new()),
            link: Arc::new(tokio::sync::Mutex::new(Some(link))),
        }
    }

    /// Sharing key of this channel.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Distinguishes successive channels created for the same locator.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Backend family the link was opened with.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Whether any occupant is mid-exchange.
    pub fn is_busy(&self) -> bool {
        self.occupants.lock().values().any(|o| o.busy)
    }

    /// Number of sessions on this channel.
    pub fn occupant_count(&self) -> usize {
        self.occupants.lock().len()
    }

    fn add_occupant(&self, id: SessionId, address: Address) {
        self.occupants.lock().insert(
            id,
            Occupant {
                address,
                busy: false,
            },
        );
    }

    fn remove_occupant(&self, id: SessionId) -> usize {
        let mut occupants = self.occupants.lock();
        occupants.remove(&id);
        occupants.len()
    }

    fn occupant_addresses(&self) -> Vec<Address> {
        self.occupants
            .lock()
            .values()
            .map(|o| o.address.clone())
            .collect()
    }

    /// Mark `id` busy if nobody else is. `Err` when `id` is not an occupant.
    fn try_mark_busy(&self, id: SessionId) -> Result<bool, ()> {
        let mut occupants = self.occupants.lock();
        if !occupants.contains_key(&id) {
            return Err(());
        }
        if occupants.values().any(|o| o.busy) {
            return Ok(false);
        }
        if let Some(occupant) = occupants.get_mut(&id) {
            occupant.busy = true;
        }
        Ok(true)
    }

    fn clear_busy(&self, id: SessionId) {
        if let Some(occupant) = self.occupants.lock().get_mut(&id) {
            occupant.busy = false;
        }
    }

    /// Wait until the channel is free, then take it for session `id`.
    ///
    /// Polls every `poll_interval`. There is no timeout: a waiter is released
    /// as soon as the current occupant finishes its exchange.
    pub async fn acquire(
        self: &Arc<Self>,
        id: SessionId,
        poll_interval: Duration,
    ) -> CommResult<ExchangeGuard> {
        loop {
            match self.try_mark_busy(id) {
                Ok(true) => break,
                Ok(false) => tokio::time::sleep(poll_interval).await,
                Err(()) => {
                    return Err(CommError::NotConnected {
                        address: self.locator.clone(),
                        state: format!("session {} is not on this channel", id),
                    })
                }
            }
        }

        let busy = BusyMark {
            channel: self.clone(),
            id,
        };
        let link = self.link.clone().lock_owned().await;
        Ok(ExchangeGuard {
            channel: self.clone(),
            link,
            busy,
        })
    }
}

/// Busy flag held by one session; cleared on drop, including when the
/// acquiring future is cancelled.
struct BusyMark {
    channel: Arc<Channel>,
    id: SessionId,
}

impl Drop for BusyMark {
    fn drop(&mut self) {
        self.channel.clear_busy(self.id);
    }
}

/// Exclusive use of a channel's link for one exchange.
///
/// Releases the link, then clears the owner's busy flag, on drop.
pub struct ExchangeGuard {
    channel: Arc<Channel>,
    // Field order is drop order: the link is unlocked before the flag clears.
    link: OwnedMutexGuard<Option<Box<dyn Link>>>,
    busy: BusyMark,
}

impl fmt::Debug for ExchangeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeGuard")
            .field("locator", &self.channel.locator)
            .field("session", &self.busy.id)
            .finish()
    }
}

impl ExchangeGuard {
    fn link(&mut self) -> anyhow::Result<&mut Box<dyn Link>> {
        let locator = &self.channel.locator;
        (*self.link)
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("link to {} is closed", locator))
    }

    /// Raw write.
    pub async fn write(&mut self, address: &Address, payload: &[u8]) -> anyhow::Result<()> {
        self.link()?.write(address, payload).await
    }

    /// Raw read.
    pub async fn read(&mut self, address: &Address, until: &ReadUntil) -> anyhow::Result<bytes::Bytes> {
        self.link()?.read(address, until).await
    }

    async fn attach(&mut self, address: &Address) -> anyhow::Result<()> {
        self.link()?.attach(address).await
    }

    async fn detach(&mut self, address: &Address) -> anyhow::Result<()> {
        self.link()?.detach(address).await
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = (*self.link).take() {
            if let Err(e) = link.close().await {
                warn!(locator = %self.channel.locator, error = %e, "Closing link failed");
            }
        }
    }

    /// Close the link, wait `settle`, open a fresh one and re-attach every
    /// occupant.
    ///
    /// The channel stays busy throughout, so no other session can touch the
    /// link while it is being replaced. On failure the slot is left empty and
    /// later exchanges fail until the next successful reconnect.
    pub async fn reconnect(&mut self, settle: Duration) -> anyhow::Result<()> {
        self.close_link().await;
        tokio::time::sleep(settle).await;

        let channel = self.channel.clone();
        let mut link = channel
            .backend
            .open(&channel.locator, &channel.settings)
            .await?;
        for address in channel.occupant_addresses() {
            link.attach(&address).await?;
        }
        *self.link = Some(link);

        info!(locator = %channel.locator, "Reopened link");
        Ok(())
    }
}

/// Registry of open channels keyed by locator.
///
/// Create one per process (or per test) and share it through an `Arc`.
pub struct ChannelMediator {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    // Serializes join/leave per locator; other ports are never held up.
    membership: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generations: AtomicU64,
}

impl fmt::Debug for ChannelMediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelMediator")
            .field("channels", &self.channels.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ChannelMediator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMediator {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            membership: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
        }
    }

    /// Channel registered for `locator`, if any.
    pub fn channel(&self, locator: &str) -> Option<Arc<Channel>> {
        self.channels.lock().get(locator).cloned()
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether any session on `locator` is mid-exchange.
    pub fn is_busy(&self, locator: &str) -> bool {
        self.channel(locator).is_some_and(|c| c.is_busy())
    }

    fn membership(&self, locator: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.membership
            .lock()
            .entry(locator.to_string())
            .or_default()
            .clone()
    }

    /// Put session `id` on the channel for `address`, opening the link if this
    /// is the first session for its locator.
    pub async fn join(
        &self,
        id: SessionId,
        address: &Address,
        backend: Arc<dyn Backend>,
        settings: &TransportSettings,
        poll_interval: Duration,
    ) -> CommResult<Arc<Channel>> {
        let locator = backend.locator(address);
        let _membership = self.membership(&locator).lock_owned().await;
        let open_failed = |reason: String| CommError::OpenFailed {
            address: address.to_string(),
            backend: backend.kind(),
            reason,
        };

        let existing = self.channel(&locator);
        let channel = match existing {
            Some(channel) => {
                if channel.backend_kind() != backend.kind() {
                    return Err(open_failed(format!(
                        "{} is already open through the {} backend",
                        locator,
                        channel.backend_kind()
                    )));
                }
                debug!(locator = %locator, session = id, "Reusing shared channel");
                channel
            }
            None => {
                let link = backend
                    .open(&locator, settings)
                    .await
                    .map_err(|e| open_failed(format!("{:#}", e)))?;
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                let channel = Arc::new(Channel::new(
                    locator.clone(),
                    generation,
                    backend.clone(),
                    settings.clone(),
                    link,
                ));
                self.channels.lock().insert(locator.clone(), channel.clone());
                info!(locator = %locator, backend = %backend.kind(), generation, "Opened channel");
                channel
            }
        };

        channel.add_occupant(id, address.clone());
        let mut guard = channel.acquire(id, poll_interval).await?;
        if let Err(e) = guard.attach(address).await {
            let remaining = channel.remove_occupant(id);
            if remaining == 0 {
                guard.close_link().await;
                self.unregister(&channel);
            }
            return Err(open_failed(format!("{:#}", e)));
        }
        drop(guard);

        Ok(channel)
    }

    /// Take session `id` off `channel`. Closes the link when it was the last
    /// occupant.
    ///
    /// Waits for any exchange in progress on the channel to finish first.
    pub async fn leave(
        &self,
        id: SessionId,
        address: &Address,
        channel: &Arc<Channel>,
        poll_interval: Duration,
    ) -> CommResult<()> {
        let _membership = self.membership(&channel.locator).lock_owned().await;
        let mut guard = channel.acquire(id, poll_interval).await?;

        if let Err(e) = guard.detach(address).await {
            warn!(address = %address, error = %e, "Detach failed");
        }

        let remaining = channel.remove_occupant(id);
        debug!(locator = %channel.locator, session = id, remaining, "Left channel");
        if remaining == 0 {
            guard.close_link().await;
            self.unregister(channel);
            info!(locator = %channel.locator, generation = channel.generation, "Closed channel");
        }
        Ok(())
    }

    fn unregister(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels.lock();
        if channels
            .get(&channel.locator)
            .is_some_and(|c| Arc::ptr_eq(c, channel))
        {
            channels.remove(&channel.locator);
        }
    }
}
