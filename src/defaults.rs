/// Default tuning values and fixed identifiers.
///
/// Everything a deployment might want to tune lives here as a compile-time
/// default. Runtime overrides go through the config structs and
/// `HostCommand`s, never through process-wide state.

// ── Signal processing ─────────────────────────────────────────────────

/// Number of raw samples kept for the median.
pub const SAMPLE_WINDOW: usize = 7;

/// EMA coefficient when the new sample is stronger than the estimate.
pub const EMA_ALPHA_RISE: f32 = 0.6;

/// EMA coefficient when the new sample is weaker than (or equal to) the estimate.
pub const EMA_ALPHA_FALL: f32 = 0.25;

/// Smoothed RSSI at or above which a sample counts towards "close" (dBm).
pub const CLOSE_THRESHOLD: i8 = -65;

/// Smoothed RSSI below which the source is reported "far" (dBm).
pub const FAR_THRESHOLD: i8 = -80;

/// Consecutive close samples required before reporting Close.
pub const CONSECUTIVE_REQUIRED: u8 = 2;

// ── Distance estimation ───────────────────────────────────────────────

/// Path-loss exponent for free space. Indoor environments run 2.5–4.
pub const PATH_LOSS_EXPONENT: f32 = 2.0;

/// Estimates beyond this (meters) are reported as out of range.
pub const MAX_DISTANCE_M: f32 = 50.0;

/// RSSI at 1 m used until a calibration has been stored (dBm).
pub const REFERENCE_RSSI: i8 = -59;

/// Key the calibrated reference is persisted under.
pub const CALIBRATION_KEY: &str = "rssi_at_1m";

/// Default calibration sampling window in milliseconds.
pub const CALIBRATION_WINDOW_MS: u64 = 5_000;

/// Longest calibration window accepted; longer requests are shortened.
pub const MAX_CALIBRATION_WINDOW_MS: u64 = 30_000;

/// Upper bound on samples kept during one calibration run.
/// At ~10 adverts/s even the longest window collects ~300; readings past
/// the bound are counted as dropped and left out of the median.
pub const MAX_CALIBRATION_SAMPLES: usize = 512;

// ── Scan duty cycle ───────────────────────────────────────────────────

/// Active scan window in milliseconds.
pub const SCAN_ACTIVE_MS: u64 = 4_000;

/// Pause between scan windows in milliseconds.
pub const SCAN_PAUSE_MS: u64 = 500;

// ── Session resolution ────────────────────────────────────────────────

/// How long a credential waits for its session to appear.
pub const RESOLVE_TIMEOUT_MS: u64 = 20_000;

/// Geofence radius applied to newly created sessions (meters).
pub const SESSION_RADIUS_M: f64 = 50.0;

/// Minimum RSSI applied to newly created sessions (dBm).
pub const SESSION_MIN_RSSI: i8 = -80;

// ── Integrity gate ────────────────────────────────────────────────────

/// Mean Earth radius used by the haversine geofence (meters).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Float slack on the geofence boundary (meters).
pub const GEOFENCE_TOLERANCE_M: f64 = 1e-6;

/// Clock difference above which the user must confirm (milliseconds).
pub const MAX_CLOCK_SKEW_MS: u64 = 120_000;

/// Filesystem locations of superuser binaries on rooted handsets.
pub static SU_PATHS: &[&str] = &[
    "/system/app/Superuser.apk",
    "/sbin/su",
    "/system/bin/su",
    "/system/xbin/su",
    "/data/local/xbin/su",
    "/data/local/bin/su",
];

/// Build tag marking a test-signed (dev) firmware image.
pub const TEST_BUILD_TAG: &str = "test-keys";

// ── Beacon identity ───────────────────────────────────────────────────

/// Service UUID every session beacon advertises its service data under.
/// Used as the base identifier when a session declares none.
pub const BEACON_SERVICE_UUID: &str = "7c1d0001-5a3e-4b8f-9c62-d1e0f3a4b5c6";

/// Same UUID as raw bytes in AD (little-endian) order.
pub const BEACON_SERVICE_UUID_LE: [u8; 16] = [
    0xc6, 0xb5, 0xa4, 0xf3, 0xe0, 0xd1, 0x62, 0x9c, 0x8f, 0x4b, 0x3e, 0x5a, 0x01, 0x00, 0x1d, 0x7c,
];

/// Maximum bytes of session token carried in the advertisement.
pub const BEACON_TOKEN_LEN: usize = 6;
