//! Capability tables: which knobs and meters a driver exposes and how.
//!
//! A driver registers plain async functions once, when its table is built:
//!
//! ```rust,ignore
//! async fn set_voltage(ctx: DeviceContext, value: Value) -> CommResult<()> { ... }
//! async fn get_voltage(ctx: DeviceContext) -> CommResult<Value> { ... }
//! async fn measure_current(ctx: DeviceContext) -> CommResult<Value> { ... }
//!
//! CapabilityTable::new()
//!     .knob_with_getter("voltage", set_voltage, get_voltage)
//!     .meter("current", measure_current)
//! ```
//!
//! Lookups accept names with spaces in place of underscores
//! (`"output voltage"` finds `output_voltage`).

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::value::Value;
use crate::error::CommResult;
use crate::session::Session;

/// Boxed knob setter.
pub type SetFn = Arc<dyn Fn(DeviceContext, Value) -> BoxFuture<'static, CommResult<()>> + Send + Sync>;

/// Boxed knob getter or meter.
pub type GetFn = Arc<dyn Fn(DeviceContext) -> BoxFuture<'static, CommResult<Value>> + Send + Sync>;

/// Canonical form of a knob or meter name.
pub fn normalize(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// Last known knob values. `None` means unknown (never read, no getter).
#[derive(Debug, Clone, Default)]
pub struct KnobCache {
    values: Arc<Mutex<HashMap<String, Option<Value>>>>,
}

impl KnobCache {
    /// Cached value of `knob`.
    pub fn get(&self, knob: &str) -> Option<Value> {
        self.values.lock().get(knob).cloned().flatten()
    }

    /// Record `value` for `knob`.
    pub fn set(&self, knob: &str, value: Option<Value>) {
        self.values.lock().insert(knob.to_string(), value);
    }

    /// Snapshot of every entry.
    pub fn snapshot(&self) -> HashMap<String, Option<Value>> {
        self.values.lock().clone()
    }
}

/// What setters, getters and meters receive.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    session: Session,
    knobs: KnobCache,
}

impl DeviceContext {
    pub(crate) fn new(session: Session, knobs: KnobCache) -> Self {
        Self { session, knobs }
    }

    /// Resilient session to the instrument.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Cached value of another knob (for drivers whose commands depend on
    /// the current range or mode).
    pub fn knob(&self, name: &str) -> Option<Value> {
        self.knobs.get(&normalize(name))
    }

    /// Mark a knob's cached value as unknown (a mode change on the
    /// instrument reset it, for example).
    pub fn invalidate(&self, name: &str) {
        let name = normalize(name);
        if self.knobs.values.lock().contains_key(&name) {
            self.knobs.set(&name, None);
        }
    }
}

struct KnobEntry {
    setter: SetFn,
    getter: Option<GetFn>,
}

/// Knobs and meters of one driver, in declaration order.
#[derive(Default)]
pub struct CapabilityTable {
    knobs: HashMap<String, KnobEntry>,
    knob_order: Vec<String>,
    meters: HashMap<String, GetFn>,
    meter_order: Vec<String>,
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityTable")
            .field("knobs", &self.knob_order)
            .field("meters", &self.meter_order)
            .finish()
    }
}

fn box_setter<F, Fut>(setter: F) -> SetFn
where
    F: Fn(DeviceContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommResult<()>> + Send + 'static,
{
    Arc::new(move |ctx, value| setter(ctx, value).boxed())
}

fn box_getter<F, Fut>(getter: F) -> GetFn
where
    F: Fn(DeviceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommResult<Value>> + Send + 'static,
{
    Arc::new(move |ctx| getter(ctx).boxed())
}

impl CapabilityTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_knob(mut self, name: &str, entry: KnobEntry) -> Self {
        let name = normalize(name);
        if self.knobs.insert(name.clone(), entry).is_none() {
            self.knob_order.push(name);
        }
        self
    }

    /// Knob that can be set but not read back.
    pub fn knob<F, Fut>(self, name: &str, setter: F) -> Self
    where
        F: Fn(DeviceContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommResult<()>> + Send + 'static,
    {
        self.insert_knob(
            name,
            KnobEntry {
                setter: box_setter(setter),
                getter: None,
            },
        )
    }

    /// Knob whose current value can be read from the instrument.
    pub fn knob_with_getter<S, SFut, G, GFut>(self, name: &str, setter: S, getter: G) -> Self
    where
        S: Fn(DeviceContext, Value) -> SFut + Send + Sync + 'static,
        SFut: Future<Output = CommResult<()>> + Send + 'static,
        G: Fn(DeviceContext) -> GFut + Send + Sync + 'static,
        GFut: Future<Output = CommResult<Value>> + Send + 'static,
    {
        self.insert_knob(
            name,
            KnobEntry {
                setter: box_setter(setter),
                getter: Some(box_getter(getter)),
            },
        )
    }

    /// Read-only quantity.
    pub fn meter<F, Fut>(mut self, name: &str, getter: F) -> Self
    where
        F: Fn(DeviceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommResult<Value>> + Send + 'static,
    {
        let name = normalize(name);
        if self.meters.insert(name.clone(), box_getter(getter)).is_none() {
            self.meter_order.push(name);
        }
        self
    }

    /// Knob names in declaration order.
    pub fn knob_names(&self) -> &[String] {
        &self.knob_order
    }

    /// Meter names in declaration order.
    pub fn meter_names(&self) -> &[String] {
        &self.meter_order
    }

    /// Setter for `name`.
    pub fn setter(&self, name: &str) -> Option<SetFn> {
        self.knobs.get(&normalize(name)).map(|k| k.setter.clone())
    }

    /// Getter for knob `name`, if it has one.
    pub fn knob_getter(&self, name: &str) -> Option<GetFn> {
        self.knobs
            .get(&normalize(name))
            .and_then(|k| k.getter.clone())
    }

    /// Getter for meter `name`.
    pub fn meter_getter(&self, name: &str) -> Option<GetFn> {
        self.meters.get(&normalize(name)).cloned()
    }
}
