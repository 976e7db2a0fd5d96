/// Per-beacon signal pipeline: smoothing, proximity decision and distance.
///
/// One tracker follows the session beacon for one scan. Tuning changes apply
/// from the next sample without losing the running estimate.
use crate::calibration::CalibrationProfile;
use crate::distance::{Distance, DistanceConfig, DistanceEstimator};
use crate::protocol::DeviceMessage;
use crate::proximity::{ClassifierConfig, Proximity, ProximityClassifier};
use crate::smoothing::{SmoothingConfig, SmoothingFilter};

/// All runtime-tunable signal parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub smoothing: SmoothingConfig,
    pub classifier: ClassifierConfig,
    pub path_loss: DistanceConfig,
}

impl TrackerConfig {
    pub const fn new() -> Self {
        Self {
            smoothing: SmoothingConfig::new(),
            classifier: ClassifierConfig::new(),
            path_loss: DistanceConfig::new(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What the presentation layer needs after each sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityUpdate {
    pub raw: i8,
    pub ema: f32,
    pub median: i8,
    pub proximity: Proximity,
    pub distance: Distance,
}

impl ProximityUpdate {
    pub fn to_message(&self, ts: u64) -> DeviceMessage<'static> {
        DeviceMessage::Proximity {
            raw: self.raw,
            ema: self.ema,
            median: self.median,
            decision: self.proximity.as_str(),
            distance_m: self.distance.meters(),
            ts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProximityTracker {
    filter: SmoothingFilter,
    classifier: ProximityClassifier,
    estimator: DistanceEstimator,
}

impl ProximityTracker {
    pub fn new(config: TrackerConfig, profile: CalibrationProfile) -> Self {
        Self {
            filter: SmoothingFilter::new(config.smoothing.sanitized()),
            classifier: ProximityClassifier::new(config.classifier),
            estimator: DistanceEstimator::new(config.path_loss, profile),
        }
    }

    pub fn on_sample(&mut self, rssi: i8) -> ProximityUpdate {
        let estimate = self.filter.update(rssi);
        let proximity = self.classifier.classify(&estimate);
        let distance = self.estimator.estimate(estimate.median);

        log::debug!(
            "rssi={} ema={:.1} median={} -> {}",
            rssi,
            estimate.ema,
            estimate.median,
            proximity.as_str()
        );

        ProximityUpdate {
            raw: rssi,
            ema: estimate.ema,
            median: estimate.median,
            proximity,
            distance,
        }
    }

    pub fn config(&self) -> TrackerConfig {
        TrackerConfig {
            smoothing: self.filter.config(),
            classifier: self.classifier.config(),
            path_loss: self.estimator.config(),
        }
    }

    pub fn set_config(&mut self, config: TrackerConfig) {
        if config == self.config() {
            return;
        }
        log::info!("tracker tuning updated");
        self.filter.set_config(config.smoothing);
        self.classifier.set_config(config.classifier);
        self.estimator.set_config(config.path_loss);
    }

    pub fn reference(&self) -> CalibrationProfile {
        self.estimator.profile()
    }

    pub fn set_reference(&mut self, profile: CalibrationProfile) {
        log::info!("reference RSSI now {} dBm", profile.reference);
        self.estimator.set_profile(profile);
    }

    /// Drop all signal history; tuning and calibration are kept.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.classifier.reset();
    }
}

impl Default for ProximityTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::new(), CalibrationProfile::default())
    }
}
