//! The vehicle link seam.
//!
//! Everything below the trait is out of scope for this crate: the real link
//! speaks MAVLink through a companion process, the simulated one lives in
//! [`sim`]. The engine only ever sees async command calls and per-class
//! subscription streams.

pub mod sim;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::control::ControlVector;
use crate::error::CommandError;
use crate::telemetry::{Attitude, Battery, FlightState, Position, RcChannels};

/// Asynchronous command and telemetry interface to the vehicle.
///
/// Subscriptions hand out the receiving half of a channel; each stream is
/// infinite for the life of the connection and is not restartable without
/// reconnecting the link.
#[async_trait]
pub trait VehicleLink: Send + Sync + 'static {
    async fn arm(&self) -> Result<(), CommandError>;
    async fn takeoff(&self, altitude_m: f64) -> Result<(), CommandError>;
    async fn land(&self) -> Result<(), CommandError>;
    /// Enter or leave offboard (setpoint-driven) mode.
    async fn set_offboard(&self, enable: bool) -> Result<(), CommandError>;
    /// Stream one velocity setpoint. Callers are expected to send these at a
    /// steady rate while offboard mode is active.
    async fn set_velocity(&self, setpoint: ControlVector) -> Result<(), CommandError>;

    fn subscribe_position(&self) -> mpsc::Receiver<Position>;
    fn subscribe_attitude(&self) -> mpsc::Receiver<Attitude>;
    fn subscribe_battery(&self) -> mpsc::Receiver<Battery>;
    fn subscribe_flight_state(&self) -> mpsc::Receiver<FlightState>;
    fn subscribe_rc_channels(&self) -> mpsc::Receiver<RcChannels>;
}
