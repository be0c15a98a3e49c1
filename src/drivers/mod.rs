//! Instrument drivers.
//!
//! Configuration names drivers by identifier; [`driver_for`] resolves them.

use std::sync::Arc;

use crate::device::Driver;

pub mod henon;

pub use henon::{HenonBackend, HenonMapper};

/// Identifiers accepted by [`driver_for`].
pub const DRIVER_NAMES: &[&str] = &["henon"];

/// Driver for a configuration identifier (case-insensitive; the model name
/// is accepted too).
pub fn driver_for(name: &str) -> Option<Arc<dyn Driver>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "henon" | "henonmapper" => Some(Arc::new(HenonMapper::new())),
        _ => None,
    }
}
