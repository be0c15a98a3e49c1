//! # daq_comm
//!
//! Resilient communication layer for laboratory instruments. Drivers describe
//! an instrument as named knobs and meters; this crate turns `set` and
//! `measure` calls into byte exchanges on serial, GPIB (Prologix) or Modbus
//! links and keeps them alive across transient faults.
//!
//! ## Crate Structure
//!
//! - **`device`**: the facade. A [`Device`] dispatches knob and meter names
//!   through a capability table and runs the connect/disconnect lifecycle
//!   (presets, postsets).
//! - **`session`**: the resilient session. Every write, read and query is
//!   validated and, on failure, repeated, then retried after a reconnect,
//!   then reported as [`CommError::CommunicationLost`].
//! - **`channel`**: the channel mediator. Sessions whose addresses map to the
//!   same physical locator share one open link and never interleave exchanges.
//! - **`recovery`**: retry budgets and the escalation counters.
//! - **`validator`**: response predicates, including the default check.
//! - **`transport`**: the `Backend`/`Link` traits and the serial, Prologix,
//!   Modbus and mock implementations.
//! - **`drivers`**: instrument drivers (a simulated Hénon-map instrument).
//! - **`config`** / **`tracing_setup`**: Figment configuration and tracing
//!   subscriber setup for binaries.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use daq_comm::{drivers::HenonMapper, Address, ChannelMediator, Device, DeviceOptions};
//!
//! # async fn run() -> daq_comm::CommResult<()> {
//! let mediator = Arc::new(ChannelMediator::new());
//! let device = Device::open(
//!     Arc::new(HenonMapper::new()),
//!     Address::parse("sim")?,
//!     DeviceOptions::new(mediator),
//! )
//! .await?;
//!
//! device.set("a", 1.2).await?;
//! let x = device.measure("x").await?;
//! println!("x = {}", x);
//! device.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod channel;
pub mod config;
pub mod device;
pub mod drivers;
pub mod error;
pub mod recovery;
pub mod session;
pub mod tracing_setup;
pub mod transport;
pub mod validator;

pub use address::Address;
pub use channel::{Channel, ChannelMediator, ExchangeGuard};
pub use config::CommConfig;
pub use device::{Device, DeviceContext, DeviceOptions, Driver, KnobSetting, Lifecycle, Value};
pub use error::{CommError, CommResult};
pub use recovery::{Escalation, NextStep, RetryPolicy};
pub use session::{ConnectionState, Session, SessionStats};
pub use transport::{Backend, BackendKind, Link, ReadUntil, Response, TransportSettings};
pub use validator::Validator;
