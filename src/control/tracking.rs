//! Vision-driven tracking controller.
//!
//! Turns a target bounding-box observation (or its absence) into a smoothed,
//! bounded velocity command: yaw to keep the target horizontally centered,
//! forward/backward to hold the target's apparent size at the configured
//! ratio. Altitude is never touched: the vertical axis stays at zero no
//! matter what the detector reports.
//!
//! All gains are deliberately low and every output runs through an
//! exponential moving average; jittery detections must not translate into
//! jittery flight.

use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::TrackingConfig;
use crate::control::ControlVector;

/// How fast held smoothing state decays toward zero while the detector is
/// briefly blind (per tick, before the loss timeout expires).
const BLIND_DECAY: f64 = 0.9;

/// One detection observation in frame-normalized coordinates.
///
/// `center_x_norm` is the horizontal offset of the bbox center from frame
/// center, in [-1, 1] (+1 = right edge). `bbox_height_ratio` is bbox height
/// over frame height; a larger ratio means a closer target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub center_x_norm: f64,
    pub center_y_norm: f64,
    pub bbox_height_ratio: f64,
    pub confidence: f64,
}

/// Physical-unit command produced per tick, bounded by the configured maxima.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityCommand {
    pub forward_m_s: f64,
    pub yaw_rate_deg_s: f64,
}

impl VelocityCommand {
    /// Map into normalized stick space by the configured maxima:
    /// x = forward fraction, r = yaw fraction, lateral and vertical zero.
    pub fn to_vector(self, config: &TrackingConfig) -> ControlVector {
        ControlVector::new(
            self.forward_m_s / config.max_forward_velocity,
            0.0,
            0.0,
            self.yaw_rate_deg_s / config.max_yaw_rate,
        )
    }
}

pub struct TrackingController {
    config: TrackingConfig,
    smoothed_yaw_rate: f64,
    smoothed_forward: f64,
    last_observation: Option<Instant>,
    track_active: bool,
}

impl TrackingController {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            smoothed_yaw_rate: 0.0,
            smoothed_forward: 0.0,
            last_observation: None,
            track_active: false,
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Whether a valid track currently exists.
    pub fn is_active(&self) -> bool {
        self.track_active
    }

    /// Advance one control tick.
    ///
    /// Observations below `min_confidence` count as no observation. While
    /// blind the output is an immediate hover; once blind for longer than
    /// `track_loss_timeout` the track is dropped and smoothing state is
    /// zeroed, so a re-acquired target ramps up from rest instead of lurching
    /// back to the pre-loss command.
    pub fn update(&mut self, observation: Option<&Observation>, now: Instant) -> VelocityCommand {
        let observation =
            observation.filter(|o| o.confidence >= self.config.min_confidence);

        let Some(obs) = observation else {
            return self.handle_blind(now);
        };

        self.last_observation = Some(now);
        self.track_active = true;

        let yaw_raw = if obs.center_x_norm.abs() > self.config.center_deadzone {
            (self.config.p_gain_yaw * obs.center_x_norm)
                .clamp(-self.config.max_yaw_rate, self.config.max_yaw_rate)
        } else {
            0.0
        };

        // Larger bbox ratio = closer; positive error = too far = approach.
        let ratio_error = self.config.target_bbox_ratio - obs.bbox_height_ratio;
        let forward_raw = (self.config.p_gain_forward * ratio_error).clamp(
            -self.config.max_forward_velocity,
            self.config.max_forward_velocity,
        );

        let alpha = self.config.velocity_smoothing;
        self.smoothed_yaw_rate = alpha * self.smoothed_yaw_rate + (1.0 - alpha) * yaw_raw;
        self.smoothed_forward = alpha * self.smoothed_forward + (1.0 - alpha) * forward_raw;

        VelocityCommand {
            forward_m_s: self.smoothed_forward,
            yaw_rate_deg_s: self.smoothed_yaw_rate,
        }
    }

    fn handle_blind(&mut self, now: Instant) -> VelocityCommand {
        if self.track_active {
            let blind_for = self
                .last_observation
                .map(|t| now.duration_since(t))
                .unwrap_or_default();
            if blind_for >= self.config.track_loss_timeout() {
                log::warn!("track lost (no detection for {:.1}s)", blind_for.as_secs_f64());
                self.track_active = false;
                self.smoothed_yaw_rate = 0.0;
                self.smoothed_forward = 0.0;
            } else {
                // Short blind spells keep a fading memory of the last command
                // so a quick re-detect does not restart the approach cold.
                self.smoothed_yaw_rate *= BLIND_DECAY;
                self.smoothed_forward *= BLIND_DECAY;
            }
        }
        VelocityCommand::default()
    }

    pub fn reset(&mut self) {
        self.smoothed_yaw_rate = 0.0;
        self.smoothed_forward = 0.0;
        self.last_observation = None;
        self.track_active = false;
    }
}

/// Latest-observation slot written by the detection source and read by the
/// control dispatcher once per tick.
pub type DetectionSlot = watch::Receiver<Option<Observation>>;

pub fn detection_channel() -> (watch::Sender<Option<Observation>>, DetectionSlot) {
    watch::channel(None)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn obs(center_x: f64, ratio: f64) -> Observation {
        Observation {
            center_x_norm: center_x,
            center_y_norm: 0.0,
            bbox_height_ratio: ratio,
            confidence: 0.9,
        }
    }

    fn controller() -> TrackingController {
        TrackingController::new(TrackingConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn offset_inside_deadzone_yields_no_yaw() {
        let mut ctl = controller();
        // deadzone is 0.10; 0.05 is inside it
        let cmd = ctl.update(Some(&obs(0.05, 0.25)), Instant::now());
        assert_eq!(cmd.yaw_rate_deg_s, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn forward_velocity_matches_proportional_law() {
        let config = TrackingConfig { velocity_smoothing: 0.0, ..Default::default() };
        let mut ctl = TrackingController::new(config);
        // target 0.25, observed 0.10, gain 0.05 -> +0.0075 m/s (approach)
        let cmd = ctl.update(Some(&obs(0.0, 0.10)), Instant::now());
        assert!((cmd.forward_m_s - 0.0075).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn outputs_never_exceed_configured_maxima() {
        let config = TrackingConfig {
            p_gain_yaw: 1000.0,
            p_gain_forward: 1000.0,
            velocity_smoothing: 0.0,
            ..Default::default()
        };
        let max_yaw = config.max_yaw_rate;
        let max_fwd = config.max_forward_velocity;
        let mut ctl = TrackingController::new(config);

        let cmd = ctl.update(Some(&obs(1.0, 0.01)), Instant::now());
        assert!(cmd.yaw_rate_deg_s.abs() <= max_yaw);
        assert!(cmd.forward_m_s.abs() <= max_fwd);

        let v = cmd.to_vector(ctl.config());
        assert!(v.x.abs() <= 1.0 && v.r.abs() <= 1.0);
        assert_eq!((v.y, v.z), (0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn vertical_axis_is_always_zero() {
        let mut ctl = controller();
        let cmd = ctl.update(Some(&obs(0.8, 0.05)), Instant::now());
        let v = cmd.to_vector(ctl.config());
        assert_eq!(v.z, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn low_confidence_counts_as_blind() {
        let mut ctl = controller();
        let weak = Observation { confidence: 0.2, ..obs(0.5, 0.25) };
        let cmd = ctl.update(Some(&weak), Instant::now());
        assert_eq!(cmd, VelocityCommand::default());
        assert!(!ctl.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn track_loss_forces_hover_and_restarts_smoothing_from_zero() {
        let mut ctl = controller();

        // Build up a nonzero smoothed command.
        for _ in 0..20 {
            ctl.update(Some(&obs(0.8, 0.10)), Instant::now());
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        assert!(ctl.is_active());

        // Stay blind past the loss timeout.
        tokio::time::advance(Duration::from_millis(2100)).await;
        let cmd = ctl.update(None, Instant::now());
        assert_eq!(cmd, VelocityCommand::default());
        assert!(!ctl.is_active());

        // Re-acquire: first command ramps from zero, not the pre-loss value.
        let resumed = ctl.update(Some(&obs(0.8, 0.10)), Instant::now());
        let alpha = ctl.config().velocity_smoothing;
        let expected_yaw = (1.0 - alpha) * (ctl.config().p_gain_yaw * 0.8);
        assert!((resumed.yaw_rate_deg_s - expected_yaw).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn brief_blind_spell_decays_but_keeps_track() {
        let mut ctl = controller();
        ctl.update(Some(&obs(0.8, 0.10)), Instant::now());

        tokio::time::advance(Duration::from_millis(500)).await;
        let cmd = ctl.update(None, Instant::now());
        assert_eq!(cmd, VelocityCommand::default());
        assert!(ctl.is_active());
    }
}
