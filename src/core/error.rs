//! Error types for the register polling core.
//!
//! The error taxonomy separates failures that make a catalogue impossible to
//! plan (`Config`) from failures observed at runtime on the bus (`Device`,
//! `Transport`) and from malformed user input (`Value`). Configuration errors
//! abort catalogue construction; runtime errors never abort the bus loop,
//! they only flip per-register error flags.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PollError>;

/// Errors produced by the polling core.
#[derive(Debug, Error)]
pub enum PollError {
    /// Impossible register/device configuration: overlapping registers,
    /// width over 64 bits, mixed block types in one set, hole or count
    /// limits already exceeded, double cache assignment.
    #[error("configuration error: {0}")]
    Config(String),

    /// The device reported a structured protocol-level failure for a query.
    #[error("device error: {0}")]
    Device(String),

    /// Transport-level or otherwise unclassified failure during query
    /// execution.
    #[error("transport error: {0}")]
    Transport(String),

    /// A text value could not be decoded into the register's format.
    #[error("invalid value: {0}")]
    Value(String),
}

impl PollError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a device-side error.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a value decoding error.
    pub fn value(msg: impl Into<String>) -> Self {
        Self::Value(msg.into())
    }

    /// Check if this is a configuration error.
    #[inline]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
