//! Telemetry ingestion and caching.
//!
//! Several telemetry classes stream at tens of Hz over the vehicle link. On a
//! cooperative scheduler, a consumer that blocks for any fixed duration per
//! item delays every other ready task, including command dispatch, by that
//! duration, repeated per item. A takeoff can then appear to silently hang
//! for seconds while the scheduler grinds through queued telemetry.
//!
//! The manager therefore splits "receive and cache" from "act on cached
//! value": one background task per class receives the next item, overwrites
//! its cache slot, and immediately hands the scheduler back with zero added
//! delay. Consumers read the slots at their own cadence.
//!
//! Each slot is a `tokio::sync::watch` channel: exactly one writer (that
//! class's consumption task), any number of readers, and reads hand out
//! copies of the latest value, never references into live state. Slots are
//! written atomically as whole values, so a cancelled manager can never leave
//! a torn snapshot behind. No ordering is guaranteed *across* classes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::WaitTimeout;
use crate::vehicle::VehicleLink;

/// Cache poll period for [`TelemetryHandle::wait_for`].
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Back-off before re-subscribing a dropped stream.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Telemetry snapshot types: immutable values, one per class
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub relative_altitude_m: f64,
    pub timestamp: Instant,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            latitude_deg: 0.0,
            longitude_deg: 0.0,
            relative_altitude_m: 0.0,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attitude {
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    pub timestamp: Instant,
}

impl Default for Attitude {
    fn default() -> Self {
        Self { roll_deg: 0.0, pitch_deg: 0.0, yaw_deg: 0.0, timestamp: Instant::now() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Battery {
    pub remaining_pct: f64,
    pub voltage_v: f64,
    pub timestamp: Instant,
}

impl Default for Battery {
    fn default() -> Self {
        Self { remaining_pct: 100.0, voltage_v: 0.0, timestamp: Instant::now() }
    }
}

/// Vehicle flight mode as reported over the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightMode {
    Unknown,
    Manual,
    Position,
    Takeoff,
    Hold,
    Offboard,
    Land,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlightState {
    pub armed: bool,
    pub in_air: bool,
    pub mode: FlightMode,
    pub timestamp: Instant,
}

impl Default for FlightState {
    fn default() -> Self {
        Self {
            armed: false,
            in_air: false,
            mode: FlightMode::Unknown,
            timestamp: Instant::now(),
        }
    }
}

/// One RC channels frame: normalized channel values in received order.
#[derive(Debug, Clone, PartialEq)]
pub struct RcChannels {
    pub values: Vec<f32>,
    pub timestamp: Instant,
}

impl RcChannels {
    /// Channel value by index, if the frame carried that many channels.
    pub fn channel(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owns the per-class consumption tasks. Dropping (or stopping) the manager
/// cancels them all; readers keep working off the last cached values.
pub struct TelemetryManager {
    tasks: Vec<JoinHandle<()>>,
    handle: TelemetryHandle,
}

impl TelemetryManager {
    /// Subscribe to every telemetry class on the link and launch one
    /// consumption task per class. A dropped stream is re-subscribed by its
    /// own task after a short back-off; the other classes never notice.
    pub fn start<L: VehicleLink>(link: Arc<L>) -> Self {
        let (pos_tx, pos_rx) = watch::channel(Position::default());
        let (att_tx, att_rx) = watch::channel(Attitude::default());
        let (bat_tx, bat_rx) = watch::channel(Battery::default());
        let (fs_tx, fs_rx) = watch::channel(FlightState::default());
        let (rc_tx, rc_rx) = watch::channel(None::<RcChannels>);

        let tasks = vec![
            spawn_consumer("position", Arc::clone(&link), L::subscribe_position, pos_tx),
            spawn_consumer("attitude", Arc::clone(&link), L::subscribe_attitude, att_tx),
            spawn_consumer("battery", Arc::clone(&link), L::subscribe_battery, bat_tx),
            spawn_consumer("flight_state", Arc::clone(&link), L::subscribe_flight_state, fs_tx),
            // RC frames may never arrive at all (no transmitter bound); the
            // slot distinguishes "never seen" from "last seen".
            tokio::spawn(async move {
                loop {
                    let mut rx = link.subscribe_rc_channels();
                    while let Some(frame) = rx.recv().await {
                        rc_tx.send_replace(Some(frame));
                        tokio::task::yield_now().await;
                    }
                    log::warn!("telemetry stream 'rc_channels' dropped, resubscribing");
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                }
            }),
        ];

        log::debug!("telemetry manager started ({} streams)", tasks.len());

        Self {
            tasks,
            handle: TelemetryHandle {
                position: pos_rx,
                attitude: att_rx,
                battery: bat_rx,
                flight_state: fs_rx,
                rc_channels: rc_rx,
            },
        }
    }

    /// A cheap clonable view of the cache.
    pub fn handle(&self) -> TelemetryHandle {
        self.handle.clone()
    }

    /// Cancel all consumption tasks. Idempotent.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::debug!("telemetry manager stopped");
    }
}

impl Drop for TelemetryManager {
    // Cancellation must hold on every exit path, not just the happy one.
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_consumer<L, T, S>(
    class: &'static str,
    link: Arc<L>,
    subscribe: S,
    slot: watch::Sender<T>,
) -> JoinHandle<()>
where
    L: VehicleLink,
    T: Clone + Send + Sync + 'static,
    S: Fn(&L) -> mpsc::Receiver<T> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut rx = subscribe(&link);
            while let Some(item) = rx.recv().await {
                slot.send_replace(item);
                // Hand the scheduler straight back. A fixed sleep here would
                // stall every other ready task once per item, at stream rate.
                tokio::task::yield_now().await;
            }
            // Sender side dropped: only this class reconnects; the slot
            // keeps serving the last value received in the meantime.
            log::warn!("telemetry stream '{class}' dropped, resubscribing");
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    })
}

// ============================================================================
// Handle
// ============================================================================

/// Instantaneous, non-blocking reads of the latest cached telemetry, plus
/// bounded condition waits. Never awaits the vehicle link.
#[derive(Clone)]
pub struct TelemetryHandle {
    position: watch::Receiver<Position>,
    attitude: watch::Receiver<Attitude>,
    battery: watch::Receiver<Battery>,
    flight_state: watch::Receiver<FlightState>,
    rc_channels: watch::Receiver<Option<RcChannels>>,
}

impl TelemetryHandle {
    pub fn position(&self) -> Position {
        self.position.borrow().clone()
    }

    pub fn attitude(&self) -> Attitude {
        self.attitude.borrow().clone()
    }

    pub fn battery(&self) -> Battery {
        self.battery.borrow().clone()
    }

    pub fn flight_state(&self) -> FlightState {
        self.flight_state.borrow().clone()
    }

    /// Latest RC frame, or `None` if no frame has ever been received.
    pub fn rc_channels(&self) -> Option<RcChannels> {
        self.rc_channels.borrow().clone()
    }

    /// Poll the cache until `predicate` holds or `timeout` elapses.
    pub async fn wait_for<F>(&self, mut predicate: F, timeout: Duration) -> Result<(), WaitTimeout>
    where
        F: FnMut(&TelemetryHandle) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                if predicate(self) {
                    return;
                }
                tokio::time::sleep(WAIT_POLL).await;
            }
        })
        .await
        .map_err(|_| WaitTimeout { timeout })
    }

    /// Wait until relative altitude is within `tolerance_m` of `target_m`.
    pub async fn wait_for_altitude(
        &self,
        target_m: f64,
        tolerance_m: f64,
        timeout: Duration,
    ) -> Result<(), WaitTimeout> {
        self.wait_for(
            move |t| (t.position().relative_altitude_m - target_m).abs() <= tolerance_m,
            timeout,
        )
        .await
    }

    /// Wait until the vehicle reports it is no longer in the air.
    pub async fn wait_for_landed(&self, timeout: Duration) -> Result<(), WaitTimeout> {
        self.wait_for(|t| !t.flight_state().in_air, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::sim::SimVehicle;

    #[tokio::test(start_paused = true)]
    async fn reads_reflect_latest_item_per_class() {
        let sim = SimVehicle::new(50.0);
        sim.start_streams();
        let manager = TelemetryManager::start(Arc::new(sim.clone()));
        let telemetry = manager.handle();

        // Let a few generator ticks land in the cache.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(telemetry.battery().remaining_pct, 100.0);
        assert!(!telemetry.flight_state().armed);

        sim.arm().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(telemetry.flight_state().armed);
    }

    #[tokio::test(start_paused = true)]
    async fn rc_slot_is_none_until_first_frame() {
        let sim = SimVehicle::new(50.0);
        let manager = TelemetryManager::start(Arc::new(sim.clone()));
        let telemetry = manager.handle();

        assert!(telemetry.rc_channels().is_none());

        sim.set_rc_channel(6, 0.9);
        sim.start_streams();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let rc = telemetry.rc_channels().expect("frame cached");
        assert_eq!(rc.channel(6), Some(0.9));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_times_out_with_error() {
        let sim = SimVehicle::new(50.0);
        sim.start_streams();
        let manager = TelemetryManager::start(Arc::new(sim.clone()));
        let telemetry = manager.handle();

        let result = telemetry
            .wait_for(|t| t.flight_state().armed, Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(WaitTimeout { timeout: Duration::from_secs(1) }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_altitude_resolves_during_climb() {
        let sim = SimVehicle::new(50.0);
        sim.start_streams();
        let manager = TelemetryManager::start(Arc::new(sim.clone()));
        let telemetry = manager.handle();

        sim.arm().await.unwrap();
        sim.takeoff(5.0).await.unwrap();

        telemetry
            .wait_for_altitude(5.0, 0.5, Duration::from_secs(30))
            .await
            .expect("climb reaches target within timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_consumption() {
        let sim = SimVehicle::new(50.0);
        sim.start_streams();
        let mut manager = TelemetryManager::start(Arc::new(sim.clone()));
        let telemetry = manager.handle();

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop();
        let frozen = telemetry.position();

        sim.arm().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Cache no longer advances, but the last value is still readable.
        assert_eq!(telemetry.position(), frozen);
        assert!(!telemetry.flight_state().armed);
    }
}
