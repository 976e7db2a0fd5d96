/// One-meter RSSI calibration.
///
/// The user holds the device 1 m from the beacon while a [`Calibration`] run
/// collects every raw reading for a fixed window. The median becomes the new
/// reference for distance estimation and is persisted through a
/// [`CalibrationStore`] under [`CALIBRATION_KEY`].
use heapless::Vec;

use crate::buffer::median_in_place;
use crate::defaults::{
    CALIBRATION_KEY, CALIBRATION_WINDOW_MS, MAX_CALIBRATION_SAMPLES, MAX_CALIBRATION_WINDOW_MS, REFERENCE_RSSI,
};
use crate::error::{Error, Result, ScanFailure};
use crate::scanner::ScanRadio;

/// Calibrated RSSI at 1 m.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationProfile {
    pub reference: i8,
}

impl CalibrationProfile {
    pub const fn new(reference: i8) -> Self {
        Self { reference }
    }
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self::new(REFERENCE_RSSI)
    }
}

/// Small persistent key/value store for the calibration value.
pub trait CalibrationStore {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self, key: &str) -> Result<Option<i8>>;
    fn save(&mut self, key: &str, value: i8) -> Result<()>;
}

/// Read the stored profile, or the default if none is stored or the store
/// cannot be read.
pub fn load_profile<S: CalibrationStore + ?Sized>(store: &S) -> CalibrationProfile {
    match store.load(CALIBRATION_KEY) {
        Ok(Some(reference)) => CalibrationProfile::new(reference),
        Ok(None) => CalibrationProfile::default(),
        Err(e) => {
            log::warn!("calibration load failed ({}), using default", e);
            CalibrationProfile::default()
        }
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationOutcome {
    pub profile: CalibrationProfile,
    /// Samples the median was taken over
    pub samples: u16,
}

/// Poll-driven calibration run.
///
/// `begin` opens the radio, `on_sample` collects, and `poll` closes the
/// window once its deadline passes. Every exit path (completion, scan
/// failure, abort) stops the radio exactly once.
///
/// At most [`MAX_CALIBRATION_SAMPLES`] readings are kept; later ones only
/// bump [`Calibration::dropped`] and the median covers the first readings.
#[derive(Debug)]
pub struct Calibration {
    samples: Vec<i8, MAX_CALIBRATION_SAMPLES>,
    deadline_ms: Option<u64>,
    dropped: u32,
}

impl Calibration {
    pub const fn new() -> Self {
        Self {
            samples: Vec::new(),
            deadline_ms: None,
            dropped: 0,
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.deadline_ms.is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline_ms
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Samples discarded because the collection was full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Start a run of `duration_ms`, capped at [`MAX_CALIBRATION_WINDOW_MS`].
    /// A refused radio start leaves nothing running.
    pub fn begin<R: ScanRadio + ?Sized>(
        &mut self,
        radio: &mut R,
        now_ms: u64,
        duration_ms: u64,
    ) -> Result<()> {
        if self.is_collecting() {
            return Err(Error::CalibrationInProgress);
        }
        radio.start().map_err(|e| {
            log::error!("calibration scan failed to start: {:?}", e);
            Error::from(e)
        })?;

        if duration_ms > MAX_CALIBRATION_WINDOW_MS {
            log::warn!(
                "calibration window {} ms shortened to {} ms",
                duration_ms,
                MAX_CALIBRATION_WINDOW_MS
            );
        }
        let duration_ms = duration_ms.min(MAX_CALIBRATION_WINDOW_MS);
        self.samples.clear();
        self.dropped = 0;
        self.deadline_ms = Some(now_ms.saturating_add(duration_ms));
        log::info!("calibration started ({} ms window)", duration_ms);
        Ok(())
    }

    /// Start a run with the default window.
    pub fn begin_default<R: ScanRadio + ?Sized>(&mut self, radio: &mut R, now_ms: u64) -> Result<()> {
        self.begin(radio, now_ms, CALIBRATION_WINDOW_MS)
    }

    /// Collect one raw reading. Ignored outside a run.
    pub fn on_sample(&mut self, rssi: i8) {
        if !self.is_collecting() {
            return;
        }
        if self.samples.push(rssi).is_err() {
            if self.dropped == 0 {
                log::warn!(
                    "calibration buffer full ({} samples), dropping readings",
                    MAX_CALIBRATION_SAMPLES
                );
            }
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    /// Close the window once the deadline has passed.
    ///
    /// Returns `None` while collecting (or when idle). On completion the
    /// median is saved and returned.
    pub fn poll<R, S>(
        &mut self,
        now_ms: u64,
        radio: &mut R,
        store: &mut S,
    ) -> Option<Result<CalibrationOutcome>>
    where
        R: ScanRadio + ?Sized,
        S: CalibrationStore + ?Sized,
    {
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {}
            _ => return None,
        }
        self.finish(radio);

        let count = self.samples.len() as u16;
        let Some(reference) = median_in_place(&mut self.samples) else {
            log::warn!("calibration window closed with no samples");
            return Some(Err(Error::NoSamplesCollected));
        };

        if let Err(e) = store.save(CALIBRATION_KEY, reference) {
            log::error!("failed to persist calibration: {}", e);
            return Some(Err(Error::CalibrationStore));
        }

        log::info!("calibrated: {} dBm at 1 m over {} samples", reference, count);
        Some(Ok(CalibrationOutcome {
            profile: CalibrationProfile::new(reference),
            samples: count,
        }))
    }

    /// The radio failed mid-run. Ends the run and maps the failure.
    pub fn fail<R: ScanRadio + ?Sized>(&mut self, radio: &mut R, failure: ScanFailure) -> Error {
        log::error!("calibration scan failed: {:?}", failure);
        self.finish(radio);
        Error::from(failure)
    }

    /// Cancel a run. No-op when idle.
    pub fn abort<R: ScanRadio + ?Sized>(&mut self, radio: &mut R) {
        if self.is_collecting() {
            log::info!("calibration aborted");
        }
        self.finish(radio);
    }

    fn finish<R: ScanRadio + ?Sized>(&mut self, radio: &mut R) {
        if self.deadline_ms.take().is_some() {
            radio.stop();
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new()
    }
}
