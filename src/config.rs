//! The configuration surface enumerated in spec.md §6.
//!
//! This crate only defines the typed surface; reading it from a file,
//! environment, or CLI flags is the excluded external adapter's job
//! (spec.md §1 Non-goals: "configuration file parsing"). Defaults below
//! are taken from the original prototype's `config.py`.

use serde::{Deserialize, Serialize};

/// One (threshold_px, speed) breakpoint in the dynamic speed limit table.
pub type SpeedRange = (f64, f64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub pan_kp: f64,
    pub pan_ki: f64,
    pub pan_kd: f64,
    pub tilt_kp: f64,
    pub tilt_ki: f64,
    pub tilt_kd: f64,

    /// Absolute bound on the I-term contribution before multiplication by ki.
    pub integral_max: f64,

    /// Pixel radius inside which P and I contributions are suppressed.
    pub deadband: f64,

    /// Exponential smoothing factor, (0, 1]. 1.0 disables smoothing.
    pub speed_smoothing: f64,

    pub pan_invert: bool,
    pub tilt_invert: bool,

    pub kf_process_noise: f64,
    pub kf_measurement_noise: f64,

    /// Pixel-velocity to VISCA-speed multiplier.
    pub feed_forward_gain: f64,

    /// Seconds; added to dt in Estimator::predict.
    pub system_latency: f64,

    pub min_pan_speed: i32,
    pub max_pan_speed: i32,
    pub min_tilt_speed: i32,
    pub max_tilt_speed: i32,

    /// Ordered (threshold_px, speed) pairs with implicit origin (0, 0).
    pub dynamic_speed_ranges: Vec<SpeedRange>,

    /// Distance beyond the last table entry at which `global_max` is
    /// reached (spec.md §4.E "fallback_dist").
    pub fallback_dist: f64,

    /// Pixels; side of the center seed box.
    pub reticle_size: u32,

    /// Seconds; target control loop period.
    pub loop_interval: f64,

    /// Maximum raw zoom value reported by the camera.
    pub zoom_max_hex: u32,

    /// Zoom factor at `zoom_max_hex` (supplemented from `config.py`;
    /// needed by the Telemetry API's zoom-factor formula, spec.md §6).
    pub zoom_max_x: f64,

    /// Counts-per-degree, pan axis (supplemented from `config.py`; spec.md
    /// glossary implies one shared value, the prototype keeps them
    /// independent).
    pub pan_counts_per_degree: f64,
    pub tilt_counts_per_degree: f64,

    /// On tracker loss, auto-disengage (emit Stop, return to STANDBY)
    /// instead of the prototype's default of staying engaged with no
    /// drive packets. See DESIGN.md Open Question 1.
    pub auto_disengage_on_loss: bool,

    /// Keep-alive window for manual commands, seconds (spec.md §4.F).
    pub manual_keepalive: f64,

    /// VISCA inquiry interval, seconds (spec.md §4.B).
    pub inquiry_interval: f64,

    /// VISCA receive timeout, seconds (spec.md §4.B / §5).
    pub visca_recv_timeout: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            pan_kp: 0.5,
            tilt_kp: 0.5,
            pan_kd: 0.9,
            tilt_kd: 0.9,
            pan_ki: 0.05,
            tilt_ki: 0.05,
            integral_max: 1.0,
            speed_smoothing: 0.5,
            pan_invert: true,
            tilt_invert: false,
            deadband: 10.0,
            kf_process_noise: 1e-5,
            kf_measurement_noise: 1e-1,
            feed_forward_gain: 0.05,
            system_latency: 0.2,
            max_pan_speed: 6,
            max_tilt_speed: 6,
            min_pan_speed: 1,
            min_tilt_speed: 1,
            dynamic_speed_ranges: vec![(50.0, 0.5), (100.0, 1.0), (200.0, 2.0), (300.0, 4.0)],
            fallback_dist: 600.0,
            reticle_size: 50,
            loop_interval: 0.033,
            pan_counts_per_degree: 24.0,
            tilt_counts_per_degree: 24.0,
            zoom_max_hex: 0x4000,
            zoom_max_x: 20.0,
            auto_disengage_on_loss: false,
            manual_keepalive: 0.25,
            inquiry_interval: 0.2,
            visca_recv_timeout: 0.01,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_prototype() {
        let cfg = TrackingConfig::default();
        assert_eq!(cfg.pan_kp, 0.5);
        assert_eq!(cfg.deadband, 10.0);
        assert_eq!(cfg.dynamic_speed_ranges.len(), 4);
        assert!(cfg.pan_invert);
        assert!(!cfg.tilt_invert);
    }
}
