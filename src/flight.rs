//! Multi-step flight sequences built from link commands and telemetry waits.

use std::time::Duration;

use crate::control::ControlVector;
use crate::error::FlightError;
use crate::telemetry::TelemetryHandle;
use crate::vehicle::VehicleLink;

const TAKEOFF_TIMEOUT: Duration = Duration::from_secs(60);
const LANDING_TIMEOUT: Duration = Duration::from_secs(60);
const ALTITUDE_TOLERANCE_M: f64 = 0.5;

/// Arm, take off to `altitude_m`, wait for the climb, then hand control to
/// the setpoint stream by entering offboard mode.
pub async fn arm_and_takeoff<L: VehicleLink + ?Sized>(
    link: &L,
    telemetry: &TelemetryHandle,
    altitude_m: f64,
) -> Result<(), FlightError> {
    log::info!("arming");
    link.arm().await?;

    log::info!("taking off to {altitude_m:.1}m");
    link.takeoff(altitude_m).await?;
    telemetry
        .wait_for_altitude(altitude_m, ALTITUDE_TOLERANCE_M, TAKEOFF_TIMEOUT)
        .await?;

    // Offboard needs a setpoint already streaming before the mode switch is
    // accepted; prime it with a hover.
    let _ = link.set_velocity(ControlVector::ZERO).await;
    link.set_offboard(true).await?;
    log::info!("takeoff complete, offboard active");
    Ok(())
}

/// Land and wait until the vehicle reports it is on the ground.
pub async fn land_and_disarm<L: VehicleLink + ?Sized>(
    link: &L,
    telemetry: &TelemetryHandle,
) -> Result<(), FlightError> {
    log::info!("landing");
    link.land().await?;
    telemetry.wait_for_landed(LANDING_TIMEOUT).await?;
    log::info!("landed");
    Ok(())
}
