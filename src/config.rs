//! Configuration for the control stack.
//!
//! All gains and limits default to deliberately conservative values: the
//! tracking loop should follow gently, never chase. Validation happens once,
//! up front; a bad value is an error, not a clamp.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tracking controller gains and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Horizontal offset magnitude below which no yaw correction is applied.
    pub center_deadzone: f64,
    /// Yaw rate command cap, deg/s.
    pub max_yaw_rate: f64,
    /// Forward/backward speed cap, m/s.
    pub max_forward_velocity: f64,
    /// Yaw rate per unit of horizontal offset, deg/s.
    pub p_gain_yaw: f64,
    /// Forward velocity per unit of bbox-ratio error, m/s.
    pub p_gain_forward: f64,
    /// EMA factor for output smoothing; higher is smoother but slower.
    pub velocity_smoothing: f64,
    /// Target bbox height as a fraction of frame height.
    pub target_bbox_ratio: f64,
    /// Observations below this confidence are treated as no detection.
    pub min_confidence: f64,
    /// Seconds without a detection before the track is declared lost.
    pub track_loss_timeout_s: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            center_deadzone: 0.10,
            max_yaw_rate: 15.0,
            max_forward_velocity: 1.5,
            p_gain_yaw: 8.0,
            p_gain_forward: 0.05,
            velocity_smoothing: 0.85,
            target_bbox_ratio: 0.25,
            min_confidence: 0.5,
            track_loss_timeout_s: 2.0,
        }
    }
}

impl TrackingConfig {
    pub fn track_loss_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.track_loss_timeout_s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("center_deadzone", self.center_deadzone, 0.0..1.0, "[0, 1)")?;
        check_positive("max_yaw_rate", self.max_yaw_rate)?;
        check_positive("max_forward_velocity", self.max_forward_velocity)?;
        check_positive("p_gain_yaw", self.p_gain_yaw)?;
        check_positive("p_gain_forward", self.p_gain_forward)?;
        check_range("velocity_smoothing", self.velocity_smoothing, 0.0..1.0, "[0, 1)")?;
        check_open_unit("target_bbox_ratio", self.target_bbox_ratio)?;
        check_range("min_confidence", self.min_confidence, 0.0..1.0, "[0, 1)")?;
        check_positive("track_loss_timeout_s", self.track_loss_timeout_s)?;
        Ok(())
    }
}

/// Mode manager arbitration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    /// Index of the auxiliary RC channel carrying the hardware override switch.
    pub rc_channel: usize,
    /// Normalized channel value above which the switch counts as asserted.
    pub rc_threshold: f32,
    /// Seconds of keyboard silence after which manual control lapses.
    pub manual_timeout_s: f64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            rc_channel: 6,
            rc_threshold: 0.5,
            manual_timeout_s: 3.0,
        }
    }
}

impl ModeConfig {
    pub fn manual_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.manual_timeout_s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_open_unit("rc_threshold", f64::from(self.rc_threshold))?;
        check_positive("manual_timeout_s", self.manual_timeout_s)?;
        Ok(())
    }
}

/// Keyboard axis sensitivities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    /// Scale for pitch/roll/yaw axes, (0, 1].
    pub sensitivity: f64,
    /// Scale for the throttle axis, (0, 1].
    pub throttle_sensitivity: f64,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.7,
            throttle_sensitivity: 0.3,
        }
    }
}

impl KeyboardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_half_open_unit("sensitivity", self.sensitivity)?;
        check_half_open_unit("throttle_sensitivity", self.throttle_sensitivity)?;
        Ok(())
    }
}

/// Control dispatcher timing and safety parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Control loop rate. Must stay >= 10 Hz or the vehicle's offboard
    /// watchdog treats the setpoint stream as lost.
    pub control_rate_hz: f64,
    /// Consecutive setpoint failures before a safety land is requested.
    pub max_consecutive_failures: u32,
    /// Altitude for the arm-and-takeoff action, meters.
    pub takeoff_altitude_m: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            control_rate_hz: 20.0,
            max_consecutive_failures: 20,
            takeoff_altitude_m: 5.0,
        }
    }
}

impl DispatchConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.control_rate_hz)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("control_rate_hz", self.control_rate_hz)?;
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError {
                field: "max_consecutive_failures",
                value: 0.0,
                expected: "> 0",
            });
        }
        check_positive("takeoff_altitude_m", self.takeoff_altitude_m)?;
        Ok(())
    }
}

/// Full stack configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking: TrackingConfig,
    pub mode: ModeConfig,
    pub keyboard: KeyboardConfig,
    pub dispatch: DispatchConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracking.validate()?;
        self.mode.validate()?;
        self.keyboard.validate()?;
        self.dispatch.validate()?;
        Ok(())
    }
}

fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError { field, value, expected: "> 0" })
    }
}

fn check_range(
    field: &'static str,
    value: f64,
    range: std::ops::Range<f64>,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if value.is_finite() && range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError { field, value, expected })
    }
}

// (0, 1)
fn check_open_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError { field, value, expected: "(0, 1)" })
    }
}

// (0, 1]
fn check_half_open_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError { field, value, expected: "(0, 1]" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_sensitivity_is_rejected_not_clamped() {
        let cfg = KeyboardConfig { sensitivity: 1.5, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "sensitivity");

        let cfg = KeyboardConfig { sensitivity: 0.0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn smoothing_must_stay_below_one() {
        let cfg = TrackingConfig { velocity_smoothing: 1.0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_gain_is_rejected() {
        let cfg = TrackingConfig { p_gain_forward: -0.05, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "p_gain_forward");
    }

    #[test]
    fn rc_threshold_bounds() {
        let cfg = ModeConfig { rc_threshold: 1.0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ModeConfig { rc_threshold: 0.99, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }
}
