//! The per-tick control loop.
//!
//! Once per tick: drain operator actions, run arbitration, pull the command
//! from whichever source is authoritative, safety-gate it against the cached
//! flight state, and stream it to the vehicle. The loop only ever suspends on
//! its own ticker and on the link's command acknowledgment, never on
//! telemetry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::{Instant, MissedTickBehavior};

use crate::config::DispatchConfig;
use crate::control::keyboard::Action;
use crate::control::tracking::DetectionSlot;
use crate::control::{ControlSource, ControlVector, KeyboardController, ModeManager, TrackingController};
use crate::flight;
use crate::telemetry::{FlightMode, FlightState, TelemetryHandle};
use crate::vehicle::VehicleLink;

/// Minimum spacing between offboard recovery attempts.
const OFFBOARD_RETRY_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

pub struct ControlDispatcher<L: VehicleLink> {
    link: Arc<L>,
    telemetry: TelemetryHandle,
    mode: Arc<ModeManager>,
    keyboard: Arc<KeyboardController>,
    tracking: TrackingController,
    detections: DetectionSlot,
    config: DispatchConfig,
    running: Arc<AtomicBool>,
    consecutive_failures: u32,
    safety_land_requested: bool,
    last_offboard_attempt: Option<Instant>,
}

impl<L: VehicleLink> ControlDispatcher<L> {
    pub fn new(
        link: Arc<L>,
        telemetry: TelemetryHandle,
        mode: Arc<ModeManager>,
        keyboard: Arc<KeyboardController>,
        tracking: TrackingController,
        detections: DetectionSlot,
        config: DispatchConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            link,
            telemetry,
            mode,
            keyboard,
            tracking,
            detections,
            config,
            running,
            consecutive_failures: 0,
            safety_land_requested: false,
            last_offboard_attempt: None,
        }
    }

    /// Run until the operator quits or the running flag is cleared, then
    /// attempt a final land-and-disarm regardless of how the loop ended.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!("control loop started at {:.1} Hz", self.config.control_rate_hz);

        'ticks: while self.running.load(Ordering::Relaxed) {
            ticker.tick().await;

            while let Some(action) = self.keyboard.poll_action() {
                match action {
                    Action::Quit => {
                        log::info!("quit requested");
                        break 'ticks;
                    }
                    Action::EmergencyStop => self.emergency_stop().await,
                    Action::ArmTakeoff => self.spawn_arm_takeoff(),
                    Action::Land => self.spawn_land(),
                    Action::ToggleTracking => {
                        self.mode.toggle();
                    }
                }
            }

            self.tick(Instant::now()).await;
        }

        // Unrecoverable or operator-requested exit: always try to put the
        // vehicle on the ground before returning.
        if let Err(e) = flight::land_and_disarm(self.link.as_ref(), &self.telemetry).await {
            log::error!("final landing attempt failed: {e}");
        }
        log::info!("control loop stopped");
    }

    async fn tick(&mut self, now: Instant) {
        let observation = *self.detections.borrow();
        let velocity = self.tracking.update(observation.as_ref(), now);

        let rc = self.telemetry.rc_channels();
        let source = self.mode.evaluate(rc.as_ref(), self.tracking.is_active(), now);

        let setpoint = match source {
            // Hardware owns the link directly; software stays silent.
            ControlSource::Rc => return,
            ControlSource::Manual => self.keyboard.get_input(),
            ControlSource::Autonomous => velocity.to_vector(self.tracking.config()),
            ControlSource::None => ControlVector::ZERO,
        };

        let flight_state = self.telemetry.flight_state();
        if !offboard_ready(&flight_state) {
            // A setpoint sent now would just be rejected. For the sources
            // that want control, try to win offboard back instead.
            if matches!(source, ControlSource::Manual | ControlSource::Autonomous) {
                self.try_recover_offboard(now, &flight_state).await;
            }
            return;
        }

        match self.link.set_velocity(setpoint).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.safety_land_requested = false;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                log::error!(
                    "setpoint dispatch failed ({} consecutive): {e}",
                    self.consecutive_failures
                );
                if self.consecutive_failures >= self.config.max_consecutive_failures
                    && !self.safety_land_requested
                {
                    log::warn!(
                        "{} consecutive dispatch failures, requesting safety land",
                        self.consecutive_failures
                    );
                    if let Err(e) = self.link.land().await {
                        log::error!("safety land request failed: {e}");
                    }
                    self.safety_land_requested = true;
                }
            }
        }
    }

    async fn emergency_stop(&mut self) {
        log::warn!("EMERGENCY STOP - forcing hover");
        self.tracking.reset();
        if let Err(e) = self.link.set_velocity(ControlVector::ZERO).await {
            log::error!("emergency hover dispatch failed: {e}");
        }
    }

    async fn try_recover_offboard(&mut self, now: Instant, flight_state: &FlightState) {
        if !flight_state.armed {
            log::debug!("skipping setpoint: vehicle disarmed");
            return;
        }
        if self
            .last_offboard_attempt
            .is_some_and(|t| now.duration_since(t) < OFFBOARD_RETRY_PERIOD)
        {
            return;
        }
        self.last_offboard_attempt = Some(now);

        // The mode switch wants a setpoint already streaming; prime then ask.
        let _ = self.link.set_velocity(ControlVector::ZERO).await;
        match self.link.set_offboard(true).await {
            Ok(()) => log::info!("offboard mode re-engaged"),
            Err(e) => log::warn!("offboard recovery failed: {e}"),
        }
    }

    fn spawn_arm_takeoff(&self) {
        let link = Arc::clone(&self.link);
        let telemetry = self.telemetry.clone();
        let altitude = self.config.takeoff_altitude_m;
        tokio::spawn(async move {
            match flight::arm_and_takeoff(link.as_ref(), &telemetry, altitude).await {
                Ok(()) => log::info!("arm & takeoff sequence complete"),
                Err(e) => log::error!("arm & takeoff failed: {e}"),
            }
        });
    }

    fn spawn_land(&self) {
        let link = Arc::clone(&self.link);
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            match flight::land_and_disarm(link.as_ref(), &telemetry).await {
                Ok(()) => log::info!("landing sequence complete"),
                Err(e) => log::error!("landing failed: {e}"),
            }
        });
    }
}

fn offboard_ready(flight_state: &FlightState) -> bool {
    flight_state.armed && flight_state.mode == FlightMode::Offboard
}
