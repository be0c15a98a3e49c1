//! Simulated instrument following the 2D Hénon map.
//!
//! Two knobs (`a`, `b`) and two meters (`x`, `y`). Every `x` measurement
//! advances the map one step:
//!
//! ```text
//! x' = 1 - a·x² + y
//! y' = b·x
//! ```
//!
//! The instrument lives behind [`HenonBackend`] and speaks a small text
//! protocol, so it exercises the full session path (busy flag, validation,
//! retries) without hardware:
//!
//! | Command | Reply |
//! |---|---|
//! | `A <v>` / `B <v>` | none |
//! | `A?` / `B?` | current parameter |
//! | `X?` | advances the map, returns x |
//! | `Y?` | current y |

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::device::{Binding, CapabilityTable, DeviceContext, Driver, KnobSetting, Value};
use crate::error::{CommError, CommResult};
use crate::transport::{Backend, BackendKind, Link, ReadUntil, TransportSettings};
use crate::validator::Validator;

#[derive(Debug, Clone, Copy, PartialEq)]
struct HenonState {
    a: f64,
    b: f64,
    x: f64,
    y: f64,
}

impl HenonState {
    fn step(&mut self) {
        let x = 1.0 - self.a * self.x * self.x + self.y;
        self.y = self.b * self.x;
        self.x = x;
    }
}

/// In-process backend hosting one simulated Hénon instrument.
///
/// Clones share the instrument, which also survives reconnects.
#[derive(Debug, Clone)]
pub struct HenonBackend {
    state: Arc<Mutex<HenonState>>,
}

impl Default for HenonBackend {
    fn default() -> Self {
        Self::with_initial(0.1, 0.0)
    }
}

impl HenonBackend {
    /// Instrument starting at `(0.1, 0.0)`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Instrument starting at `(x, y)` with the classic parameters.
    pub fn with_initial(x: f64, y: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HenonState {
                a: 1.4,
                b: 0.3,
                x,
                y,
            })),
        }
    }

    /// Current `(a, b, x, y)`.
    pub fn snapshot(&self) -> (f64, f64, f64, f64) {
        let s = *self.state.lock();
        (s.a, s.b, s.x, s.y)
    }
}

#[async_trait]
impl Backend for HenonBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn open(
        &self,
        _locator: &str,
        _settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>> {
        Ok(Box::new(HenonLink {
            state: self.state.clone(),
            pending: None,
            open: true,
        }))
    }
}

struct HenonLink {
    state: Arc<Mutex<HenonState>>,
    pending: Option<String>,
    open: bool,
}

impl HenonLink {
    fn handle(&mut self, command: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let mut parts = command.split_whitespace();
        let head = parts.next().unwrap_or_default().to_ascii_uppercase();

        match (head.as_str(), parts.next()) {
            ("A", Some(raw)) => state.a = raw.parse()?,
            ("B", Some(raw)) => state.b = raw.parse()?,
            ("A?", None) => self.pending = Some(state.a.to_string()),
            ("B?", None) => self.pending = Some(state.b.to_string()),
            ("X?", None) => {
                state.step();
                self.pending = Some(state.x.to_string());
            }
            ("Y?", None) => self.pending = Some(state.y.to_string()),
            _ => anyhow::bail!("unrecognized command '{}'", command),
        }
        Ok(())
    }
}

#[async_trait]
impl Link for HenonLink {
    async fn write(&mut self, _address: &Address, payload: &[u8]) -> anyhow::Result<()> {
        if !self.open {
            anyhow::bail!("simulated link is closed");
        }
        let command = std::str::from_utf8(payload)?.trim().to_string();
        self.handle(&command)
    }

    async fn read(&mut self, _address: &Address, _until: &ReadUntil) -> anyhow::Result<Bytes> {
        if !self.open {
            anyhow::bail!("simulated link is closed");
        }
        self.pending
            .take()
            .map(Bytes::from)
            .ok_or_else(|| anyhow::anyhow!("no response pending"))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.open = false;
        Ok(())
    }
}

// =============================================================================
// Driver
// =============================================================================

fn numeric(knob: &str, value: &Value) -> CommResult<f64> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CommError::InvalidValue {
            knob: knob.to_string(),
            value: value.to_string(),
            reason: format!("expected a finite number, got {}", value.type_name()),
        })
}

async fn query_float(ctx: &DeviceContext, command: &str) -> CommResult<Value> {
    let response = ctx
        .session()
        .query(command, Some(&Validator::numeric()))
        .await?;
    // The numeric validator guarantees the parse
    Ok(Value::Float(response.as_f64().unwrap_or(f64::NAN)))
}

async fn set_a(ctx: DeviceContext, value: Value) -> CommResult<()> {
    let a = numeric("a", &value)?;
    ctx.session().write(format!("A {}", a), None).await?;
    Ok(())
}

async fn get_a(ctx: DeviceContext) -> CommResult<Value> {
    query_float(&ctx, "A?").await
}

async fn set_b(ctx: DeviceContext, value: Value) -> CommResult<()> {
    let b = numeric("b", &value)?;
    ctx.session().write(format!("B {}", b), None).await?;
    Ok(())
}

async fn get_b(ctx: DeviceContext) -> CommResult<Value> {
    query_float(&ctx, "B?").await
}

async fn measure_x(ctx: DeviceContext) -> CommResult<Value> {
    query_float(&ctx, "X?").await
}

async fn measure_y(ctx: DeviceContext) -> CommResult<Value> {
    query_float(&ctx, "Y?").await
}

/// Driver for the simulated Hénon instrument.
#[derive(Debug, Clone, Default)]
pub struct HenonMapper {
    backend: HenonBackend,
}

impl HenonMapper {
    /// Driver bound to a fresh simulated instrument.
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver bound to an existing simulated instrument.
    pub fn with_backend(backend: HenonBackend) -> Self {
        Self { backend }
    }

    /// The simulated instrument.
    pub fn backend(&self) -> &HenonBackend {
        &self.backend
    }
}

impl Driver for HenonMapper {
    fn name(&self) -> &str {
        "HenonMapper"
    }

    fn bindings(&self) -> Vec<Binding> {
        let settings = TransportSettings::default()
            .with_timeout(Duration::from_millis(10))
            .with_inter_command_delay(Duration::ZERO);
        vec![Binding::new(Arc::new(self.backend.clone()), settings)]
    }

    fn capabilities(&self) -> CapabilityTable {
        CapabilityTable::new()
            .knob_with_getter("a", set_a, get_a)
            .knob_with_getter("b", set_b, get_b)
            .meter("x", measure_x)
            .meter("y", measure_y)
    }

    fn presets(&self) -> Vec<KnobSetting> {
        vec![KnobSetting::new("a", 1.4), KnobSetting::new("b", 0.3)]
    }
}
