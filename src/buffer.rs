/// Fixed-capacity ring buffer of recent raw RSSI samples.
///
/// Holds the last [`SAMPLE_WINDOW`] readings, overwriting the oldest once
/// full. Stack-only, no allocation.
use crate::defaults::SAMPLE_WINDOW;
use crate::error::{Error, Result};

/// One raw RSSI reading as delivered by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    /// Signal strength in dBm
    pub value: i8,
    /// Arrival order, monotonically increasing per filter
    pub seq: u32,
}

#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: [RawSample; SAMPLE_WINDOW],
    /// Slot the next write goes to
    head: usize,
    len: usize,
}

impl SampleBuffer {
    pub const fn new() -> Self {
        Self {
            samples: [RawSample { value: 0, seq: 0 }; SAMPLE_WINDOW],
            head: 0,
            len: 0,
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: RawSample) {
        self.samples[self.head] = sample;
        self.head = (self.head + 1) % SAMPLE_WINDOW;
        if self.len < SAMPLE_WINDOW {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == SAMPLE_WINDOW
    }

    pub const fn capacity(&self) -> usize {
        SAMPLE_WINDOW
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RawSample> + '_ {
        let start = (self.head + SAMPLE_WINDOW - self.len) % SAMPLE_WINDOW;
        (0..self.len).map(move |i| &self.samples[(start + i) % SAMPLE_WINDOW])
    }

    /// Copy of the current values, oldest first.
    pub fn values(&self) -> heapless::Vec<i8, SAMPLE_WINDOW> {
        self.iter().map(|s| s.value).collect()
    }

    /// Median of the buffered values (upper-middle for even counts).
    pub fn median(&self) -> Result<i8> {
        let mut values = self.values();
        median_in_place(&mut values).ok_or(Error::EmptyBuffer)
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort `values` and return the element at `len / 2`.
///
/// Returns `None` for an empty slice. Shared by the smoothing filter and the
/// calibration run so both agree on even-count behavior.
pub fn median_in_place(values: &mut [i8]) -> Option<i8> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[values.len() / 2])
}
