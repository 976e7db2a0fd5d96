/// Error taxonomy for resource acquisition and protocol failures.
///
/// Verification outcomes (identity mismatch, geofence, weak signal, ...) are
/// not errors; they are carried by [`crate::integrity::Verdict`].

use thiserror::Error;

/// Why the radio could not deliver scan results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    /// Radio hardware absent or switched off.
    Unavailable,
    /// Scan/location permission not granted.
    PermissionDenied,
    /// Platform scan error with its raw code.
    Platform(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Radio hardware or the platform scanner is unavailable.
    #[error("BLE scanning unavailable")]
    ScanUnavailable,

    /// The user has not granted scan or location permission.
    #[error("scan or location permission denied")]
    PermissionDenied,

    /// The platform scanner reported a failure code.
    #[error("scan failed with platform code {0}")]
    ScanFailed(i32),

    /// No session appeared for the credential within the wait window.
    #[error("timed out waiting for session to become active")]
    SessionResolutionTimeout,

    /// The session store refused to install a watch.
    #[error("could not subscribe to session updates")]
    SubscriptionFailed,

    /// The session store failed a direct lookup.
    #[error("session lookup failed")]
    SessionSource,

    /// A resolution is already waiting on a watch.
    #[error("session resolution already in progress")]
    ResolutionInProgress,

    /// Calibration window closed without a single sample.
    #[error("no samples collected during calibration")]
    NoSamplesCollected,

    /// A calibration run is already active.
    #[error("calibration already in progress")]
    CalibrationInProgress,

    /// Persisting or loading the calibration reference failed.
    #[error("calibration store unavailable")]
    CalibrationStore,

    /// Median requested over an empty sample buffer.
    #[error("sample buffer is empty")]
    EmptyBuffer,

    /// An external record could not be decoded.
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
}

impl From<ScanFailure> for Error {
    fn from(failure: ScanFailure) -> Self {
        match failure {
            ScanFailure::Unavailable => Error::ScanUnavailable,
            ScanFailure::PermissionDenied => Error::PermissionDenied,
            ScanFailure::Platform(code) => Error::ScanFailed(code),
        }
    }
}

impl Error {
    /// Short machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ScanUnavailable => "scan_unavailable",
            Error::PermissionDenied => "permission_denied",
            Error::ScanFailed(_) => "scan_failed",
            Error::SessionResolutionTimeout => "session_timeout",
            Error::SubscriptionFailed => "subscription_failed",
            Error::SessionSource => "session_source",
            Error::ResolutionInProgress => "resolution_in_progress",
            Error::NoSamplesCollected => "no_samples",
            Error::CalibrationInProgress => "calibration_in_progress",
            Error::CalibrationStore => "calibration_store",
            Error::EmptyBuffer => "empty_buffer",
            Error::InvalidRecord(_) => "invalid_record",
        }
    }

    /// Whether the user can simply try again (rescan, re-request permission).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SessionResolutionTimeout | Error::PermissionDenied | Error::NoSamplesCollected
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;
