/// Asymmetric EMA + rolling median over raw RSSI.
///
/// The estimate rises quickly towards a stronger signal (approaching
/// source) and decays slowly towards a weaker one, which keeps a single
/// faded advertisement from flickering the decision to "far".
use crate::buffer::{RawSample, SampleBuffer};
use crate::defaults::{EMA_ALPHA_FALL, EMA_ALPHA_RISE};

/// EMA blend coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingConfig {
    /// Weight of a sample stronger than the current estimate
    pub alpha_rise: f32,
    /// Weight of a sample weaker than or equal to the current estimate
    pub alpha_fall: f32,
}

impl SmoothingConfig {
    pub const fn new() -> Self {
        Self {
            alpha_rise: EMA_ALPHA_RISE,
            alpha_fall: EMA_ALPHA_FALL,
        }
    }

    /// Clamp both coefficients into `0.0..=1.0`. NaN falls back to the default.
    pub fn sanitized(self) -> Self {
        fn clamp(v: f32, fallback: f32) -> f32 {
            if v.is_nan() {
                fallback
            } else {
                v.clamp(0.0, 1.0)
            }
        }
        Self {
            alpha_rise: clamp(self.alpha_rise, EMA_ALPHA_RISE),
            alpha_fall: clamp(self.alpha_fall, EMA_ALPHA_FALL),
        }
    }
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of one filter step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedEstimate {
    pub ema: f32,
    pub median: i8,
}

#[derive(Debug, Clone)]
pub struct SmoothingFilter {
    config: SmoothingConfig,
    buffer: SampleBuffer,
    ema: Option<f32>,
    next_seq: u32,
}

impl SmoothingFilter {
    pub const fn new(config: SmoothingConfig) -> Self {
        Self {
            config,
            buffer: SampleBuffer::new(),
            ema: None,
            next_seq: 0,
        }
    }

    pub fn config(&self) -> SmoothingConfig {
        self.config
    }

    /// Swap coefficients; the running estimate is kept.
    pub fn set_config(&mut self, config: SmoothingConfig) {
        self.config = config.sanitized();
    }

    /// Feed one raw reading and return the updated estimate.
    pub fn update(&mut self, value: i8) -> SmoothedEstimate {
        let sample = RawSample {
            value,
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        self.buffer.push(sample);

        let v = value as f32;
        let ema = match self.ema {
            None => v,
            Some(prev) => {
                let alpha = if v > prev {
                    self.config.alpha_rise
                } else {
                    self.config.alpha_fall
                };
                alpha * v + (1.0 - alpha) * prev
            }
        };
        self.ema = Some(ema);

        // Buffer was just pushed to, so it cannot be empty.
        let median = self.buffer.median().unwrap_or(value);

        SmoothedEstimate { ema, median }
    }

    /// Current EMA, if any sample has been seen.
    pub fn ema(&self) -> Option<f32> {
        self.ema
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Forget all history, e.g. when scanning restarts for a new session.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.ema = None;
    }
}

impl Default for SmoothingFilter {
    fn default() -> Self {
        Self::new(SmoothingConfig::new())
    }
}
