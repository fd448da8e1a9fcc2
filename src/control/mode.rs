//! Control-source arbitration.
//!
//! One state machine decides which source owns the vehicle each tick, in
//! strict precedence order:
//!
//! 1. RC hardware switch asserted: RC wins unconditionally. This models the
//!    pilot's physical override and is never negotiable by software.
//! 2. Keyboard activity within the manual timeout: manual teleoperation.
//! 3. Autonomous enabled and a valid track exists: tracking output.
//! 4. Otherwise no source: the dispatcher holds a hover.
//!
//! Arbitration never fails: a missing or short RC frame reads as "switch not
//! asserted" (fail-safe toward software control, not toward ambiguity). The
//! state is owned here exclusively; everyone else sees copies. Nothing is
//! persisted; a restart comes up with autonomous disabled, the safest state.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ModeConfig;
use crate::telemetry::RcChannels;

/// The authoritative command source. Precedence: Rc > Manual > Autonomous > None.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSource {
    None,
    Rc,
    Manual,
    Autonomous,
}

#[derive(Debug)]
struct ModeState {
    active_source: ControlSource,
    autonomous_enabled: bool,
    last_manual_activity: Option<Instant>,
    rc_switch: bool,
    last_rc_value: Option<f32>,
    changed_at: Option<Instant>,
}

/// Snapshot of the arbitration state for external inspection.
#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub active_source: ControlSource,
    pub tracking_enabled: bool,
    pub rc_switch: bool,
    pub rc_value: Option<f32>,
    /// Seconds since the active source last changed, if it ever has.
    pub seconds_since_change: Option<f64>,
}

pub struct ModeManager {
    config: ModeConfig,
    state: Mutex<ModeState>,
}

impl ModeManager {
    pub fn new(config: ModeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ModeState {
                active_source: ControlSource::None,
                autonomous_enabled: false,
                last_manual_activity: None,
                rc_switch: false,
                last_rc_value: None,
                changed_at: None,
            }),
        }
    }

    /// Enable autonomous output. Returns whether the flag actually changed.
    pub fn enable(&self) -> bool {
        let mut state = self.state.lock();
        if state.autonomous_enabled {
            return false;
        }
        state.autonomous_enabled = true;
        log::info!("tracking ENABLED");
        true
    }

    /// Disable autonomous output. Returns whether the flag actually changed.
    pub fn disable(&self) -> bool {
        let mut state = self.state.lock();
        if !state.autonomous_enabled {
            return false;
        }
        state.autonomous_enabled = false;
        log::info!("tracking DISABLED");
        true
    }

    /// Flip the autonomous flag; returns the new state.
    pub fn toggle(&self) -> bool {
        let mut state = self.state.lock();
        state.autonomous_enabled = !state.autonomous_enabled;
        log::info!(
            "tracking {}",
            if state.autonomous_enabled { "ENABLED" } else { "DISABLED" }
        );
        state.autonomous_enabled
    }

    pub fn autonomous_enabled(&self) -> bool {
        self.state.lock().autonomous_enabled
    }

    /// Stamp manual activity. Called by the keyboard controller for every
    /// processed input event.
    pub fn notify_manual_activity(&self) {
        self.state.lock().last_manual_activity = Some(Instant::now());
    }

    /// Run one arbitration pass and return the active source.
    pub fn evaluate(
        &self,
        rc: Option<&RcChannels>,
        track_active: bool,
        now: Instant,
    ) -> ControlSource {
        let mut state = self.state.lock();

        let rc_value = rc.and_then(|frame| frame.channel(self.config.rc_channel));
        let rc_high = rc_value.is_some_and(|v| v > self.config.rc_threshold);
        state.rc_switch = rc_high;
        if rc_value.is_some() {
            state.last_rc_value = rc_value;
        }

        let manual_live = state
            .last_manual_activity
            .is_some_and(|t| now.duration_since(t) <= self.config.manual_timeout());

        let source = if rc_high {
            ControlSource::Rc
        } else if manual_live {
            ControlSource::Manual
        } else if state.autonomous_enabled && track_active {
            ControlSource::Autonomous
        } else {
            ControlSource::None
        };

        if source != state.active_source {
            log::info!("control source {:?} -> {:?}", state.active_source, source);
            state.active_source = source;
            state.changed_at = Some(now);
        }
        source
    }

    pub fn status(&self) -> ModeStatus {
        let state = self.state.lock();
        ModeStatus {
            active_source: state.active_source,
            tracking_enabled: state.autonomous_enabled,
            rc_switch: state.rc_switch,
            rc_value: state.last_rc_value,
            seconds_since_change: state
                .changed_at
                .map(|t| Instant::now().duration_since(t).as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn rc_frame(channel: usize, value: f32) -> RcChannels {
        let mut values = vec![0.0; channel + 1];
        values[channel] = value;
        RcChannels { values, timestamp: Instant::now() }
    }

    fn manager() -> ModeManager {
        ModeManager::new(ModeConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn rc_switch_wins_over_everything() {
        let mode = manager();
        mode.enable();
        mode.notify_manual_activity();
        let frame = rc_frame(6, 0.9);

        assert_eq!(mode.evaluate(Some(&frame), true, Instant::now()), ControlSource::Rc);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_rc_frame_reads_as_switch_not_asserted() {
        let mode = manager();
        mode.notify_manual_activity();
        assert_eq!(mode.evaluate(None, false, Instant::now()), ControlSource::Manual);

        // A frame too short to carry the aux channel is equally benign.
        let short = RcChannels { values: vec![0.9; 3], timestamp: Instant::now() };
        assert_eq!(mode.evaluate(Some(&short), false, Instant::now()), ControlSource::Manual);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_lapses_into_autonomous_after_timeout() {
        let mode = manager();
        mode.enable();
        mode.notify_manual_activity();

        tokio::time::advance(Duration::from_millis(2900)).await;
        assert_eq!(mode.evaluate(None, true, Instant::now()), ControlSource::Manual);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(mode.evaluate(None, true, Instant::now()), ControlSource::Autonomous);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_autonomous_never_activates() {
        let mode = manager();
        mode.notify_manual_activity();
        tokio::time::advance(Duration::from_secs(10)).await;

        // Manual long expired, a track exists, but the flag is down.
        assert_eq!(mode.evaluate(None, true, Instant::now()), ControlSource::None);
    }

    #[tokio::test(start_paused = true)]
    async fn no_track_means_no_autonomous() {
        let mode = manager();
        mode.enable();
        assert_eq!(mode.evaluate(None, false, Instant::now()), ControlSource::None);
    }

    #[test]
    fn enable_disable_report_actual_changes() {
        let mode = manager();
        assert!(mode.enable());
        assert!(!mode.enable());
        assert!(mode.disable());
        assert!(!mode.disable());
    }

    #[test]
    fn toggle_twice_returns_to_original_state() {
        let mode = manager();
        let original = mode.autonomous_enabled();
        assert_eq!(mode.toggle(), !original);
        assert_eq!(mode.toggle(), original);
    }

    #[tokio::test(start_paused = true)]
    async fn rc_release_falls_back_by_precedence() {
        let mode = manager();
        mode.enable();
        let high = rc_frame(6, 0.95);
        let low = rc_frame(6, 0.1);

        assert_eq!(mode.evaluate(Some(&high), true, Instant::now()), ControlSource::Rc);
        assert_eq!(mode.evaluate(Some(&low), true, Instant::now()), ControlSource::Autonomous);

        let status = mode.status();
        assert!(!status.rc_switch);
        assert_eq!(status.rc_value, Some(0.1));
    }
}
