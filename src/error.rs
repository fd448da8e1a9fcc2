//! Error taxonomy.
//!
//! Recoverable conditions (command rejection, wait expiry) are plain values
//! handled by the owning component; nothing in here aborts the process.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single vehicle command call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The vehicle refused the command (wrong mode, no GPS lock, disarmed...).
    #[error("command rejected by vehicle: {reason}")]
    Rejected { reason: &'static str },

    /// The link to the vehicle is gone; per-stream reconnect is the
    /// telemetry manager's job, command callers just see this.
    #[error("vehicle link closed")]
    LinkClosed,
}

/// A telemetry condition wait that expired before the predicate held.
///
/// This is an outcome, not a fault: callers decide whether expiry is fatal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("timed out after {timeout:?} waiting for telemetry condition")]
pub struct WaitTimeout {
    pub timeout: Duration,
}

/// Invalid configuration value, rejected at construction time.
///
/// Values are never silently clamped into a different meaning.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("config field `{field}` out of range: {value} (expected {expected})")]
pub struct ConfigError {
    pub field: &'static str,
    pub value: f64,
    pub expected: &'static str,
}

/// Failure of a multi-step flight sequence (arm + takeoff, land + disarm).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlightError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Timeout(#[from] WaitTimeout),
}
