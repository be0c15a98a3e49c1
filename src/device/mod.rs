//! Device facade: named knobs and meters on top of a resilient session.
//!
//! A [`Driver`] describes an instrument model: which backends can reach it,
//! which knobs and meters it has, and what to set on connect (presets) and
//! before disconnect (postsets). A [`Device`] is one connected instance.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──connect──▶ Connecting ──▶ Ready ──disconnect──▶ Disconnecting ──▶ Disconnected
//!                                │                                                      │
//!                                └──── (no backend opened) ◀──────────────────── connect ┘
//! ```
//!
//! Connecting tries each binding in preference order until one opens, reads
//! back every knob that has a getter, then applies the presets in order.
//! Disconnecting applies every postset, collecting failures instead of
//! stopping at the first, and always releases the session.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::channel::ChannelMediator;
use crate::error::{AdapterFailure, CommError, CommResult};
use crate::recovery::RetryPolicy;
use crate::session::Session;
use crate::transport::{Backend, TransportSettings};

pub mod capability;
pub mod value;

pub use capability::{normalize, CapabilityTable, DeviceContext, KnobCache};
pub use value::Value;

/// One backend a driver can be reached through, with its line settings.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Backend to open.
    pub backend: Arc<dyn Backend>,
    /// Settings handed to the backend.
    pub settings: TransportSettings,
}

impl Binding {
    /// Binding with explicit settings.
    pub fn new(backend: Arc<dyn Backend>, settings: TransportSettings) -> Self {
        Self { backend, settings }
    }
}

/// A knob name and the value to give it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobSetting {
    /// Knob name.
    pub knob: String,
    /// Value to set.
    pub value: Value,
}

impl KnobSetting {
    /// Pair a knob with a value.
    pub fn new(knob: &str, value: impl Into<Value>) -> Self {
        Self {
            knob: knob.to_string(),
            value: value.into(),
        }
    }
}

/// Overlay `overrides` on `defaults`.
///
/// Knobs already in `defaults` keep their position and take the new value;
/// knobs only in `overrides` are appended in their own order.
pub fn merge_settings(defaults: &[KnobSetting], overrides: &[KnobSetting]) -> Vec<KnobSetting> {
    let mut merged = defaults.to_vec();
    for item in overrides {
        let key = normalize(&item.knob);
        match merged.iter_mut().find(|m| normalize(&m.knob) == key) {
            Some(existing) => existing.value = item.value.clone(),
            None => merged.push(item.clone()),
        }
    }
    merged
}

/// An instrument model.
pub trait Driver: Send + Sync {
    /// Model name, used in errors and logs.
    fn name(&self) -> &str;

    /// Backends able to reach this model, most preferred first.
    fn bindings(&self) -> Vec<Binding>;

    /// Knobs and meters.
    fn capabilities(&self) -> CapabilityTable;

    /// Knob values applied after connecting, in order.
    fn presets(&self) -> Vec<KnobSetting> {
        Vec::new()
    }

    /// Knob values applied before disconnecting, in order.
    fn postsets(&self) -> Vec<KnobSetting> {
        Vec::new()
    }
}

/// Per-instance settings for [`Device::new`].
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Display name. Defaults to the driver name.
    pub name: Option<String>,
    /// Use only this binding instead of the driver's list.
    pub binding: Option<Binding>,
    /// Replaces the settings of every binding tried.
    pub settings: Option<TransportSettings>,
    /// Overrides merged onto the driver presets.
    pub presets: Vec<KnobSetting>,
    /// Overrides merged onto the driver postsets.
    pub postsets: Vec<KnobSetting>,
    /// Recovery policy for the session.
    pub policy: RetryPolicy,
    /// Registry of shared channels.
    pub mediator: Arc<ChannelMediator>,
}

impl DeviceOptions {
    /// Defaults on the given mediator.
    pub fn new(mediator: Arc<ChannelMediator>) -> Self {
        Self {
            name: None,
            binding: None,
            settings: None,
            presets: Vec::new(),
            postsets: Vec::new(),
            policy: RetryPolicy::default(),
            mediator,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Force a single binding.
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Replace the settings of every binding.
    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Add preset overrides.
    pub fn with_presets(mut self, presets: Vec<KnobSetting>) -> Self {
        self.presets = presets;
        self
    }

    /// Add postset overrides.
    pub fn with_postsets(mut self, postsets: Vec<KnobSetting>) -> Self {
        self.postsets = postsets;
        self
    }

    /// Set the recovery policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Lifecycle of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, never connected.
    Uninitialized,
    /// Binding a backend, probing knobs, applying presets.
    Connecting,
    /// Usable.
    Ready,
    /// Applying postsets, releasing the session.
    Disconnecting,
    /// Disconnected by the caller.
    Disconnected,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Connecting => "connecting",
            Lifecycle::Ready => "ready",
            Lifecycle::Disconnecting => "disconnecting",
            Lifecycle::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// A connected instrument.
pub struct Device {
    name: String,
    address: Address,
    driver: Arc<dyn Driver>,
    table: CapabilityTable,
    presets: Vec<KnobSetting>,
    postsets: Vec<KnobSetting>,
    options: DeviceOptions,
    knobs: KnobCache,
    session: Mutex<Option<Session>>,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Device {
    /// Build an unconnected device. The capability table is built here, once.
    pub fn new(driver: Arc<dyn Driver>, address: Address, options: DeviceOptions) -> Self {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| driver.name().to_string());
        let table = driver.capabilities();
        let presets = merge_settings(&driver.presets(), &options.presets);
        let postsets = merge_settings(&driver.postsets(), &options.postsets);

        Self {
            name,
            address,
            driver,
            table,
            presets,
            postsets,
            options,
            knobs: KnobCache::default(),
            session: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    /// Build and connect in one step.
    pub async fn open(
        driver: Arc<dyn Driver>,
        address: Address,
        options: DeviceOptions,
    ) -> CommResult<Self> {
        let device = Self::new(driver, address, options);
        device.connect().await?;
        Ok(device)
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// Knob and meter names.
    pub fn capabilities(&self) -> &CapabilityTable {
        &self.table
    }

    /// Merged presets, in application order.
    pub fn presets(&self) -> &[KnobSetting] {
        &self.presets
    }

    /// Merged postsets, in application order.
    pub fn postsets(&self) -> &[KnobSetting] {
        &self.postsets
    }

    /// Session bound during connect.
    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    /// Last known value of a knob. `None` when unknown.
    pub fn knob_value(&self, knob: &str) -> Option<Value> {
        self.knobs.get(&normalize(knob))
    }

    /// Last known values of every knob.
    pub fn knob_values(&self) -> HashMap<String, Option<Value>> {
        self.knobs.snapshot()
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        *self.lifecycle.lock() = state;
    }

    fn not_connected(&self, state: Lifecycle) -> CommError {
        CommError::NotConnected {
            address: self.address.to_string(),
            state: state.to_string(),
        }
    }

    fn context(&self, allowed: &[Lifecycle]) -> CommResult<DeviceContext> {
        let state = self.lifecycle();
        if !allowed.contains(&state) {
            return Err(self.not_connected(state));
        }
        match self.session() {
            Some(session) => Ok(DeviceContext::new(session, self.knobs.clone())),
            None => Err(self.not_connected(state)),
        }
    }

    /// Bind a backend, probe knobs, apply presets.
    ///
    /// Connecting a `Ready` device is a no-op.
    pub async fn connect(&self) -> CommResult<()> {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            let previous = *lifecycle;
            match previous {
                Lifecycle::Ready => return Ok(()),
                Lifecycle::Connecting | Lifecycle::Disconnecting => {
                    return Err(self.not_connected(previous))
                }
                Lifecycle::Uninitialized | Lifecycle::Disconnected => {
                    *lifecycle = Lifecycle::Connecting;
                }
            }
            previous
        };

        let session = match self.bind().await {
            Ok(session) => session,
            Err(e) => {
                self.set_lifecycle(previous);
                return Err(e);
            }
        };
        *self.session.lock() = Some(session.clone());

        if let Err(e) = self.initialize().await {
            warn!(device = %self.name, error = %e, "Initialization failed, releasing session");
            if let Err(close_err) = session.close().await {
                debug!(device = %self.name, error = %close_err, "Session close after failed init");
            }
            self.session.lock().take();
            self.set_lifecycle(Lifecycle::Disconnected);
            return Err(e);
        }

        self.set_lifecycle(Lifecycle::Ready);
        info!(
            device = %self.name,
            address = %self.address,
            backend = %session.backend_kind(),
            "Device ready"
        );
        Ok(())
    }

    async fn bind(&self) -> CommResult<Session> {
        let bindings = match &self.options.binding {
            Some(binding) => vec![binding.clone()],
            None => self.driver.bindings(),
        };

        let mut failures = Vec::new();
        for binding in bindings {
            let settings = self
                .options
                .settings
                .clone()
                .unwrap_or_else(|| binding.settings.clone());
            let kind = binding.backend.kind();
            let session = Session::new(
                self.address.clone(),
                binding.backend,
                settings,
                self.options.policy.clone(),
                self.options.mediator.clone(),
            );

            match session.open().await {
                Ok(()) => return Ok(session),
                Err(e) => {
                    let message = match e {
                        CommError::OpenFailed { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    debug!(device = %self.name, backend = %kind, error = %message, "Backend rejected");
                    failures.push(AdapterFailure {
                        backend: kind,
                        message,
                    });
                }
            }
        }

        Err(CommError::NoAdapterAvailable {
            device: self.name.clone(),
            address: self.address.to_string(),
            failures,
        })
    }

    async fn initialize(&self) -> CommResult<()> {
        let ctx = self.context(&[Lifecycle::Connecting])?;

        for knob in self.table.knob_names() {
            let value = match self.table.knob_getter(knob) {
                Some(getter) => Some(getter(ctx.clone()).await?),
                None => None,
            };
            debug!(device = %self.name, knob = %knob, value = ?value, "Probed knob");
            self.knobs.set(knob, value);
        }

        for preset in self.presets.clone() {
            self.apply(&[Lifecycle::Connecting], &preset.knob, preset.value)
                .await?;
        }
        Ok(())
    }

    async fn apply(&self, allowed: &[Lifecycle], knob: &str, value: Value) -> CommResult<()> {
        let ctx = self.context(allowed)?;
        let setter = self
            .table
            .setter(knob)
            .ok_or_else(|| CommError::UnknownKnob {
                device: self.name.clone(),
                knob: knob.to_string(),
            })?;

        setter(ctx, value.clone()).await?;
        debug!(device = %self.name, knob = %knob, value = %value, "Knob set");
        self.knobs.set(&normalize(knob), Some(value));
        Ok(())
    }

    /// Set a knob and remember the value.
    pub async fn set(&self, knob: &str, value: impl Into<Value>) -> CommResult<()> {
        self.apply(&[Lifecycle::Ready], knob, value.into()).await
    }

    /// Read a knob back from the instrument, falling back to the cached value
    /// for knobs without a getter.
    pub async fn get(&self, knob: &str) -> CommResult<Option<Value>> {
        let ctx = self.context(&[Lifecycle::Ready])?;
        if self.table.setter(knob).is_none() {
            return Err(CommError::UnknownKnob {
                device: self.name.clone(),
                knob: knob.to_string(),
            });
        }
        match self.table.knob_getter(knob) {
            Some(getter) => {
                let value = getter(ctx).await?;
                self.knobs.set(&normalize(knob), Some(value.clone()));
                Ok(Some(value))
            }
            None => Ok(self.knob_value(knob)),
        }
    }

    /// Measure a meter.
    pub async fn measure(&self, meter: &str) -> CommResult<Value> {
        let ctx = self.context(&[Lifecycle::Ready])?;
        let getter = self
            .table
            .meter_getter(meter)
            .ok_or_else(|| CommError::UnknownMeter {
                device: self.name.clone(),
                meter: meter.to_string(),
            })?;
        getter(ctx).await
    }

    /// Apply postsets and release the session.
    ///
    /// The session is released even when postsets fail; their errors come
    /// back together as [`CommError::ShutdownFailed`].
    pub async fn disconnect(&self) -> CommResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Ready {
                return Err(self.not_connected(*lifecycle));
            }
            *lifecycle = Lifecycle::Disconnecting;
        }

        let mut errors = Vec::new();
        for postset in &self.postsets {
            if let Err(e) = self
                .apply(&[Lifecycle::Disconnecting], &postset.knob, postset.value.clone())
                .await
            {
                warn!(device = %self.name, knob = %postset.knob, error = %e, "Postset failed");
                errors.push(e);
            }
        }

        let session = self.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                // A session that already gave up has nothing left to release
                if !matches!(e, CommError::NotConnected { .. }) {
                    errors.push(e);
                }
            }
        }
        self.set_lifecycle(Lifecycle::Disconnected);
        info!(device = %self.name, errors = errors.len(), "Device disconnected");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CommError::ShutdownFailed(errors))
        }
    }
}
