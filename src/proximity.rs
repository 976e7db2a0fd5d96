/// Debounced Close / Far / Uncertain classification of the smoothed RSSI.
///
/// Close requires `consecutive_required` samples in a row at or above the
/// close threshold. One sample below resets the run, so walking away drops
/// Close on the very next advertisement.
use serde::Serialize;

use crate::defaults::{CLOSE_THRESHOLD, CONSECUTIVE_REQUIRED, FAR_THRESHOLD};
use crate::smoothing::SmoothedEstimate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Proximity {
    Close,
    Far,
    Uncertain,
}

impl Proximity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proximity::Close => "close",
            Proximity::Far => "far",
            Proximity::Uncertain => "uncertain",
        }
    }
}

/// Classifier thresholds, adjustable while a scan is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// EMA at or above this counts as a close sample (dBm)
    pub close_threshold: i8,
    /// EMA below this is Far (dBm)
    pub far_threshold: i8,
    /// Consecutive close samples before reporting Close
    pub consecutive_required: u8,
}

impl ClassifierConfig {
    pub const fn new() -> Self {
        Self {
            close_threshold: CLOSE_THRESHOLD,
            far_threshold: FAR_THRESHOLD,
            consecutive_required: CONSECUTIVE_REQUIRED,
        }
    }

    /// At least one close sample is always required.
    pub const fn sanitized(mut self) -> Self {
        if self.consecutive_required == 0 {
            self.consecutive_required = 1;
        }
        self
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ProximityClassifier {
    config: ClassifierConfig,
    consecutive_close: u8,
}

impl ProximityClassifier {
    pub const fn new(config: ClassifierConfig) -> Self {
        Self {
            config: config.sanitized(),
            consecutive_close: 0,
        }
    }

    pub fn config(&self) -> ClassifierConfig {
        self.config
    }

    /// Replace thresholds; takes effect on the next sample. The running
    /// count is kept.
    pub fn set_config(&mut self, config: ClassifierConfig) {
        if config.close_threshold <= config.far_threshold {
            log::warn!(
                "close threshold {} not above far threshold {}",
                config.close_threshold,
                config.far_threshold
            );
        }
        if config.consecutive_required == 0 {
            log::warn!("consecutive_required of 0 raised to 1");
        }
        self.config = config.sanitized();
    }

    pub fn consecutive_close(&self) -> u8 {
        self.consecutive_close
    }

    pub fn classify(&mut self, estimate: &SmoothedEstimate) -> Proximity {
        if estimate.ema >= self.config.close_threshold as f32 {
            self.consecutive_close = self.consecutive_close.saturating_add(1);
        } else {
            self.consecutive_close = 0;
        }

        if self.consecutive_close >= self.config.consecutive_required {
            Proximity::Close
        } else if estimate.ema < self.config.far_threshold as f32 {
            Proximity::Far
        } else {
            Proximity::Uncertain
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_close = 0;
    }
}

impl Default for ProximityClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::new())
    }
}
