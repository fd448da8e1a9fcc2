//! Simulated vehicle link.
//!
//! A minimal in-process stand-in for a PX4-style autopilot: command
//! acceptance rules, a first-order climb/descend model, and noisy telemetry
//! generation at a configurable rate. Used by the demo binary and the test
//! suite; physics fidelity is explicitly not a goal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::control::ControlVector;
use crate::error::CommandError;
use crate::telemetry::{Attitude, Battery, FlightMode, FlightState, Position, RcChannels};

const CLIMB_RATE_M_S: f64 = 2.0;
const DESCENT_RATE_M_S: f64 = 1.0;
const LANDED_ALTITUDE_M: f64 = 0.05;
const SUBSCRIBER_BUFFER: usize = 64;

/// Cheap handle to the shared simulator state; clones refer to the same
/// vehicle.
#[derive(Clone)]
pub struct SimVehicle {
    inner: Arc<SimInner>,
}

struct SimInner {
    state: Mutex<SimState>,
    subscribers: Mutex<Subscribers>,
    inject_failures: AtomicU32,
    land_requests: AtomicU32,
    offboard_requests: AtomicU32,
    generator: Mutex<Option<JoinHandle<()>>>,
    telemetry_rate_hz: f64,
}

struct SimState {
    armed: bool,
    in_air: bool,
    mode: FlightMode,
    altitude_m: f64,
    target_altitude_m: f64,
    battery_pct: f64,
    rc_values: Vec<f32>,
    last_setpoint: Option<ControlVector>,
    setpoint_count: u64,
}

#[derive(Default)]
struct Subscribers {
    position: Vec<mpsc::Sender<Position>>,
    attitude: Vec<mpsc::Sender<Attitude>>,
    battery: Vec<mpsc::Sender<Battery>>,
    flight_state: Vec<mpsc::Sender<FlightState>>,
    rc_channels: Vec<mpsc::Sender<RcChannels>>,
}

impl SimVehicle {
    pub fn new(telemetry_rate_hz: f64) -> Self {
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState {
                    armed: false,
                    in_air: false,
                    mode: FlightMode::Unknown,
                    altitude_m: 0.0,
                    target_altitude_m: 0.0,
                    battery_pct: 100.0,
                    rc_values: Vec::new(),
                    last_setpoint: None,
                    setpoint_count: 0,
                }),
                subscribers: Mutex::new(Subscribers::default()),
                inject_failures: AtomicU32::new(0),
                land_requests: AtomicU32::new(0),
                offboard_requests: AtomicU32::new(0),
                generator: Mutex::new(None),
                telemetry_rate_hz,
            }),
        }
    }

    /// Launch the telemetry generator. Streams run until [`stop_streams`]
    /// (or runtime shutdown).
    ///
    /// [`stop_streams`]: SimVehicle::stop_streams
    pub fn start_streams(&self) {
        let inner = Arc::clone(&self.inner);
        let period = Duration::from_secs_f64(1.0 / inner.telemetry_rate_hz);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.step(period.as_secs_f64());
                inner.broadcast();
            }
        });
        if let Some(old) = self.inner.generator.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn stop_streams(&self) {
        if let Some(handle) = self.inner.generator.lock().take() {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // Test / scenario controls
    // ------------------------------------------------------------------

    /// Set one normalized RC channel value; the vehicle starts emitting RC
    /// frames once any channel has been set.
    pub fn set_rc_channel(&self, index: usize, value: f32) {
        let mut state = self.inner.state.lock();
        if state.rc_values.len() <= index {
            state.rc_values.resize(index + 1, 0.0);
        }
        state.rc_values[index] = value;
    }

    /// Make the next `n` `set_velocity` calls fail.
    pub fn inject_failures(&self, n: u32) {
        self.inner.inject_failures.store(n, Ordering::Relaxed);
    }

    pub fn land_requests(&self) -> u32 {
        self.inner.land_requests.load(Ordering::Relaxed)
    }

    pub fn offboard_requests(&self) -> u32 {
        self.inner.offboard_requests.load(Ordering::Relaxed)
    }

    pub fn last_setpoint(&self) -> Option<ControlVector> {
        self.inner.state.lock().last_setpoint
    }

    pub fn setpoint_count(&self) -> u64 {
        self.inner.state.lock().setpoint_count
    }

    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().armed
    }
}

impl SimInner {
    fn step(&self, dt_s: f64) {
        let mut state = self.state.lock();

        let target = state.target_altitude_m;
        if state.altitude_m < target {
            state.altitude_m = (state.altitude_m + CLIMB_RATE_M_S * dt_s).min(target);
        } else if state.altitude_m > target {
            state.altitude_m = (state.altitude_m - DESCENT_RATE_M_S * dt_s).max(target);
        }

        if state.mode == FlightMode::Takeoff && state.altitude_m >= target {
            state.mode = FlightMode::Hold;
        }
        if state.mode == FlightMode::Land && state.altitude_m <= LANDED_ALTITUDE_M {
            state.altitude_m = 0.0;
            state.in_air = false;
            state.armed = false;
            state.mode = FlightMode::Hold;
        }

        if state.armed {
            state.battery_pct = (state.battery_pct - 0.01 * dt_s).max(0.0);
        }
    }

    fn broadcast(&self) {
        let now = Instant::now();
        let (position, attitude, battery, flight_state, rc) = {
            let state = self.state.lock();
            (
                Position {
                    latitude_deg: 47.3977 + rand::random_range(-1e-6..1e-6),
                    longitude_deg: 8.5456 + rand::random_range(-1e-6..1e-6),
                    relative_altitude_m: state.altitude_m + rand::random_range(-0.02..0.02),
                    timestamp: now,
                },
                Attitude {
                    roll_deg: rand::random_range(-0.3..0.3),
                    pitch_deg: rand::random_range(-0.3..0.3),
                    yaw_deg: rand::random_range(-0.5..0.5),
                    timestamp: now,
                },
                Battery {
                    remaining_pct: state.battery_pct,
                    voltage_v: 11.1 + rand::random_range(-0.05..0.05),
                    timestamp: now,
                },
                FlightState {
                    armed: state.armed,
                    in_air: state.in_air,
                    mode: state.mode,
                    timestamp: now,
                },
                (!state.rc_values.is_empty()).then(|| RcChannels {
                    values: state.rc_values.clone(),
                    timestamp: now,
                }),
            )
        };

        let mut subs = self.subscribers.lock();
        fan_out(&mut subs.position, position);
        fan_out(&mut subs.attitude, attitude);
        fan_out(&mut subs.battery, battery);
        fan_out(&mut subs.flight_state, flight_state);
        if let Some(rc) = rc {
            fan_out(&mut subs.rc_channels, rc);
        }
    }
}

// Non-blocking fan-out: a full subscriber drops the frame (it only ever
// wants the latest anyway), a closed one is forgotten.
fn fan_out<T: Clone>(senders: &mut Vec<mpsc::Sender<T>>, item: T) {
    senders.retain(|tx| !matches!(tx.try_send(item.clone()), Err(mpsc::error::TrySendError::Closed(_))));
}

#[async_trait]
impl super::VehicleLink for SimVehicle {
    async fn arm(&self) -> Result<(), CommandError> {
        let mut state = self.inner.state.lock();
        if state.in_air {
            return Err(CommandError::Rejected { reason: "already flying" });
        }
        state.armed = true;
        if state.mode == FlightMode::Unknown {
            state.mode = FlightMode::Hold;
        }
        Ok(())
    }

    async fn takeoff(&self, altitude_m: f64) -> Result<(), CommandError> {
        let mut state = self.inner.state.lock();
        if !state.armed {
            return Err(CommandError::Rejected { reason: "not armed" });
        }
        state.mode = FlightMode::Takeoff;
        state.target_altitude_m = altitude_m;
        state.in_air = true;
        Ok(())
    }

    async fn land(&self) -> Result<(), CommandError> {
        self.inner.land_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        if state.in_air {
            state.mode = FlightMode::Land;
            state.target_altitude_m = 0.0;
        }
        Ok(())
    }

    async fn set_offboard(&self, enable: bool) -> Result<(), CommandError> {
        self.inner.offboard_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        if enable {
            if !state.armed {
                return Err(CommandError::Rejected { reason: "cannot enter offboard while disarmed" });
            }
            state.mode = FlightMode::Offboard;
        } else if state.mode == FlightMode::Offboard {
            state.mode = FlightMode::Hold;
        }
        Ok(())
    }

    async fn set_velocity(&self, setpoint: ControlVector) -> Result<(), CommandError> {
        if self
            .inner
            .inject_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CommandError::Rejected { reason: "injected link fault" });
        }
        let mut state = self.inner.state.lock();
        if !state.armed || state.mode != FlightMode::Offboard {
            return Err(CommandError::Rejected { reason: "not in offboard mode" });
        }
        state.last_setpoint = Some(setpoint);
        state.setpoint_count += 1;
        Ok(())
    }

    fn subscribe_position(&self) -> mpsc::Receiver<Position> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscribers.lock().position.push(tx);
        rx
    }

    fn subscribe_attitude(&self) -> mpsc::Receiver<Attitude> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscribers.lock().attitude.push(tx);
        rx
    }

    fn subscribe_battery(&self) -> mpsc::Receiver<Battery> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscribers.lock().battery.push(tx);
        rx
    }

    fn subscribe_flight_state(&self) -> mpsc::Receiver<FlightState> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscribers.lock().flight_state.push(tx);
        rx
    }

    fn subscribe_rc_channels(&self) -> mpsc::Receiver<RcChannels> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscribers.lock().rc_channels.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::VehicleLink;

    #[tokio::test]
    async fn takeoff_requires_arming_first() {
        let sim = SimVehicle::new(50.0);
        assert_eq!(
            sim.takeoff(5.0).await,
            Err(CommandError::Rejected { reason: "not armed" })
        );
        sim.arm().await.unwrap();
        sim.takeoff(5.0).await.unwrap();
    }

    #[tokio::test]
    async fn setpoints_rejected_outside_offboard() {
        let sim = SimVehicle::new(50.0);
        sim.arm().await.unwrap();
        assert!(sim.set_velocity(ControlVector::ZERO).await.is_err());

        sim.set_offboard(true).await.unwrap();
        sim.set_velocity(ControlVector::new(0.1, 0.0, 0.0, 0.0)).await.unwrap();
        assert_eq!(sim.setpoint_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let sim = SimVehicle::new(50.0);
        sim.arm().await.unwrap();
        sim.set_offboard(true).await.unwrap();
        sim.inject_failures(2);

        assert!(sim.set_velocity(ControlVector::ZERO).await.is_err());
        assert!(sim.set_velocity(ControlVector::ZERO).await.is_err());
        assert!(sim.set_velocity(ControlVector::ZERO).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn landing_descends_and_disarms() {
        let sim = SimVehicle::new(50.0);
        sim.start_streams();
        sim.arm().await.unwrap();
        sim.takeoff(4.0).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        sim.land().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!sim.is_armed());
        assert_eq!(sim.land_requests(), 1);
    }
}
