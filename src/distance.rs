/// Log-distance path-loss estimate from median RSSI.
///
/// `d = 10 ^ ((reference - median) / (10 * n))`, where `reference` is the
/// RSSI at 1 m from calibration and `n` the environment's path-loss
/// exponent. Good for "roughly 2 m" versus "roughly 10 m", not for ranging.
use crate::calibration::CalibrationProfile;
use crate::defaults::{MAX_DISTANCE_M, PATH_LOSS_EXPONENT};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceConfig {
    /// Path-loss exponent `n`
    pub path_loss_exponent: f32,
    /// Estimates above this are reported out of range (meters)
    pub max_distance_m: f32,
}

impl DistanceConfig {
    pub const fn new() -> Self {
        Self {
            path_loss_exponent: PATH_LOSS_EXPONENT,
            max_distance_m: MAX_DISTANCE_M,
        }
    }
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// An approximate distance. Out-of-range is never zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distance {
    Meters(f32),
    OutOfRange,
}

impl Distance {
    pub fn meters(&self) -> Option<f32> {
        match self {
            Distance::Meters(m) => Some(*m),
            Distance::OutOfRange => None,
        }
    }

    pub fn is_in_range(&self) -> bool {
        matches!(self, Distance::Meters(_))
    }
}

#[derive(Debug, Clone)]
pub struct DistanceEstimator {
    config: DistanceConfig,
    profile: CalibrationProfile,
}

impl DistanceEstimator {
    pub const fn new(config: DistanceConfig, profile: CalibrationProfile) -> Self {
        Self { config, profile }
    }

    pub fn config(&self) -> DistanceConfig {
        self.config
    }

    pub fn set_config(&mut self, config: DistanceConfig) {
        self.config = config;
    }

    pub fn profile(&self) -> CalibrationProfile {
        self.profile
    }

    /// Use a freshly calibrated reference from the next estimate on.
    pub fn set_profile(&mut self, profile: CalibrationProfile) {
        self.profile = profile;
    }

    pub fn estimate(&self, median: i8) -> Distance {
        let n = self.config.path_loss_exponent;
        let exponent = (self.profile.reference as f32 - median as f32) / (10.0 * n);
        let meters = libm::powf(10.0, exponent);

        if !meters.is_finite() || meters > self.config.max_distance_m {
            Distance::OutOfRange
        } else {
            Distance::Meters(meters)
        }
    }
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        Self::new(DistanceConfig::new(), CalibrationProfile::default())
    }
}
