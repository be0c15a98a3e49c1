//! Error types for the communication layer.
//!
//! `CommError` is the single error type that crosses the public API. Its variants
//! follow how far a failure is allowed to travel:
//!
//! - **`Transient`**: one write/read/query failed (backend error or rejected
//!   response). Sessions retry these internally; callers only see one when they
//!   drive a [`Link`](crate::transport::Link) directly.
//! - **`CommunicationLost`**: the retry and reconnect budgets are spent. Fatal for
//!   the session; the experiment layer decides whether to abort or skip the device.
//! - **`NotConnected`**: the session or device was never opened or is already closed.
//! - **`NoAdapterAvailable`**: no declared backend could be opened. Carries every
//!   per-backend failure so the user sees why each one was rejected.
//! - **`UnknownKnob`** / **`UnknownMeter`**: a name the device does not declare.
//!
//! Everything except `Transient` is surfaced immediately and never retried.

use std::fmt;
use thiserror::Error;

use crate::transport::BackendKind;

/// Convenience alias for results using the communication error type.
pub type CommResult<T> = std::result::Result<T, CommError>;

/// Why one backend could not be bound while a device was connecting.
#[derive(Debug, Clone)]
pub struct AdapterFailure {
    /// Backend that was tried.
    pub backend: BackendKind,
    /// Rendered error chain from the backend.
    pub message: String,
}

impl fmt::Display for AdapterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in trying {} backend, got: {}", self.backend, self.message)
    }
}

/// Primary error type for sessions, channels and devices.
#[derive(Error, Debug)]
pub enum CommError {
    /// Operation attempted on a session or device that is not open.
    #[error("Not connected: instrument at address {address} ({state})")]
    NotConnected {
        /// Device address.
        address: String,
        /// State the session or device was in.
        state: String,
    },

    /// A single exchange failed. Recovered locally by the session.
    #[error("Transient communication failure with {address}: {reason}")]
    Transient {
        /// Device address.
        address: String,
        /// Backend error or validator rejection.
        reason: String,
    },

    /// Retry and reconnect budgets exhausted.
    ///
    /// **Error Type**: Permanent for this session.
    ///
    /// **Recovery Strategy**: Handled by a higher layer (abort the run, skip the
    /// device, alert the operator).
    #[error(
        "Unable to communicate with instrument at address {address} \
         after {attempts} attempts and {reconnects} reconnects: {last_error}"
    )]
    CommunicationLost {
        /// Device address.
        address: String,
        /// Total exchange attempts made for the failing call.
        attempts: u32,
        /// Reconnect cycles performed for the failing call.
        reconnects: u32,
        /// Reason of the final failed attempt.
        last_error: String,
    },

    /// The backend could not open a link for this address.
    #[error("Failed to open {backend} link for {address}: {reason}")]
    OpenFailed {
        /// Device address.
        address: String,
        /// Backend that was asked to open.
        backend: BackendKind,
        /// Rendered error chain from the backend.
        reason: String,
    },

    /// None of the declared backends could be opened.
    #[error("Unable to connect an adapter to instrument {device} at address {address}:{}", render_failures(.failures))]
    NoAdapterAvailable {
        /// Driver name.
        device: String,
        /// Device address.
        address: String,
        /// One entry per backend that was tried, in preference order.
        failures: Vec<AdapterFailure>,
    },

    /// Knob name not declared by the device (or declared without a setter).
    #[error("{knob} cannot be set on {device}")]
    UnknownKnob {
        /// Device name.
        device: String,
        /// Requested knob.
        knob: String,
    },

    /// Meter name not declared by the device.
    #[error("{meter} cannot be measured on {device}")]
    UnknownMeter {
        /// Device name.
        device: String,
        /// Requested meter.
        meter: String,
    },

    /// Address string does not follow the locator grammar.
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// Value has the wrong type or is out of range for a knob.
    #[error("Invalid value {value} for {knob}: {reason}")]
    InvalidValue {
        /// Knob being set.
        knob: String,
        /// Rendered value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but are semantically wrong.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure outside an exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more postsets failed while disconnecting. The session was closed anyway.
    #[error("Shutdown failed with errors: {}", render_errors(.0))]
    ShutdownFailed(Vec<CommError>),
}

impl CommError {
    /// Whether the session may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CommError::Transient { .. })
    }

    /// Whether the device behind this error should be treated as gone.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommError::CommunicationLost { .. } | CommError::NoAdapterAvailable { .. }
        )
    }
}

impl From<figment::Error> for CommError {
    fn from(err: figment::Error) -> Self {
        CommError::Config(Box::new(err))
    }
}

fn render_failures(failures: &[AdapterFailure]) -> String {
    failures.iter().map(|f| format!("\n  {f}")).collect()
}

fn render_errors(errors: &[CommError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_communication_lost_names_address() {
        let err = CommError::CommunicationLost {
            address: "GPIB0::12".into(),
            attempts: 6,
            reconnects: 1,
            last_error: "invalid response ''".into(),
        };
        let text = err.to_string();
        assert!(text.contains("GPIB0::12"));
        assert!(text.contains("6 attempts"));
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_no_adapter_lists_every_backend() {
        let err = CommError::NoAdapterAvailable {
            device: "Keithley2400".into(),
            address: "COM3".into(),
            failures: vec![
                AdapterFailure {
                    backend: BackendKind::Serial,
                    message: "port busy".into(),
                },
                AdapterFailure {
                    backend: BackendKind::Prologix,
                    message: "controller not found".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("serial backend, got: port busy"));
        assert!(text.contains("prologix backend, got: controller not found"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = CommError::ShutdownFailed(vec![
            CommError::UnknownKnob {
                device: "Henon-sim".into(),
                knob: "c".into(),
            },
            CommError::Transient {
                address: "sim".into(),
                reason: "timeout".into(),
            },
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
        assert!(err.to_string().contains("c cannot be set"));
    }
}
