/// Attendance integrity gate.
///
/// Runs the checks in a fixed order and stops at the first failure:
/// identity, geofence, device trust, signal floor, clock skew. Clock skew
/// is soft: the user is asked to confirm instead of being rejected outright.
/// `diagnose` runs all of them for logs.
use heapless::Vec;

use crate::defaults::{EARTH_RADIUS_M, GEOFENCE_TOLERANCE_M, MAX_CLOCK_SKEW_MS, SU_PATHS, TEST_BUILD_TAG};
use crate::identity::{self, MatchMode};
use crate::protocol::DeviceMessage;
use crate::scanner::PresenceObservation;
use crate::session::{GeoPoint, SessionPolicy};

/// Device position as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub point: GeoPoint,
    pub accuracy_m: f32,
    /// Position came from a mock provider
    pub is_mock: bool,
}

/// Outcome of the device-trust probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceTrust {
    pub su_binary_found: bool,
    pub test_build: bool,
    pub mock_location: bool,
}

impl DeviceTrust {
    pub fn is_compromised(&self) -> bool {
        self.su_binary_found || self.test_build || self.mock_location
    }
}

/// Platform hooks needed to judge device trust.
pub trait TrustProbe {
    fn path_exists(&self, path: &str) -> bool;
    /// Firmware build tags, if the platform exposes them
    fn build_tags(&self) -> Option<&str>;
}

/// Look for superuser binaries, a test-signed build and a mocked location.
pub fn probe_device_trust<P: TrustProbe + ?Sized>(probe: &P, location: Option<&LocationFix>) -> DeviceTrust {
    let su_binary_found = SU_PATHS.iter().any(|path| probe.path_exists(path));
    let test_build = probe
        .build_tags()
        .is_some_and(|tags| tags.contains(TEST_BUILD_TAG));
    let mock_location = location.is_some_and(|fix| fix.is_mock);

    let trust = DeviceTrust {
        su_binary_found,
        test_build,
        mock_location,
    };
    if trust.is_compromised() {
        log::warn!("device trust: {:?}", trust);
    }
    trust
}

/// Great-circle distance in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = libm::sin(dlat / 2.0) * libm::sin(dlat / 2.0)
        + libm::cos(lat1) * libm::cos(lat2) * libm::sin(dlon / 2.0) * libm::sin(dlon / 2.0);
    let c = 2.0 * libm::atan2(libm::sqrt(h), libm::sqrt(1.0 - h));
    EARTH_RADIUS_M * c
}

/// Hard failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    IdentityMismatch,
    GeofenceViolation,
    DeviceIntegrityFailure,
    WeakSignal,
    /// The user declined to proceed despite clock skew
    ClockSkewRejected,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::IdentityMismatch => "identity_mismatch",
            Rejection::GeofenceViolation => "geofence_violation",
            Rejection::DeviceIntegrityFailure => "device_integrity_failure",
            Rejection::WeakSignal => "weak_signal",
            Rejection::ClockSkewRejected => "clock_skew_rejected",
        }
    }
}

/// Device clock disagrees with the server by more than the allowed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSkew {
    pub skew_ms: u64,
}

pub const CLOCK_SKEW_DETECTED: &str = "clock_skew_detected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
    NeedsConfirmation(ClockSkew),
}

impl Verdict {
    /// Resolve a pending confirmation. Final verdicts are returned as-is.
    pub fn confirm(self, proceed: bool) -> Verdict {
        match self {
            Verdict::NeedsConfirmation(skew) if proceed => {
                log::info!("user accepted {} ms clock skew", skew.skew_ms);
                Verdict::Accepted
            }
            Verdict::NeedsConfirmation(_) => Verdict::Rejected(Rejection::ClockSkewRejected),
            other => other,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    pub fn to_message<'a>(&self, session: &'a str) -> DeviceMessage<'a> {
        let (reason, pending, skew_ms) = match self {
            Verdict::Accepted => (None, None, None),
            Verdict::Rejected(r) => (Some(r.as_str()), None, None),
            Verdict::NeedsConfirmation(skew) => (None, Some(CLOCK_SKEW_DETECTED), Some(skew.skew_ms)),
        };
        DeviceMessage::Verdict {
            session,
            accepted: self.is_accepted(),
            reason,
            pending,
            skew_ms,
        }
    }
}

/// Every failing check, in check order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityVerdict {
    pub accepted: bool,
    pub reasons: Vec<&'static str, 5>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateConfig {
    pub match_mode: MatchMode,
    pub max_clock_skew_ms: u64,
    /// Slack on the geofence boundary for float noise (meters)
    pub geofence_tolerance_m: f64,
}

impl GateConfig {
    pub const fn new() -> Self {
        Self {
            match_mode: MatchMode::Lenient,
            max_clock_skew_ms: MAX_CLOCK_SKEW_MS,
            geofence_tolerance_m: GEOFENCE_TOLERANCE_M,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one verification attempt is judged on.
#[derive(Debug, Clone, Copy)]
pub struct Evidence<'a> {
    pub observation: &'a PresenceObservation,
    pub policy: &'a SessionPolicy,
    pub location: Option<&'a LocationFix>,
    pub trust: DeviceTrust,
    pub server_time_ms: u64,
    pub local_time_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityGate {
    config: GateConfig,
}

impl IntegrityGate {
    pub const fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// Short-circuiting verdict.
    pub fn evaluate(
        &self,
        observation: &PresenceObservation,
        policy: &SessionPolicy,
        location: Option<&LocationFix>,
        trust: DeviceTrust,
        server_time_ms: u64,
        local_time_ms: u64,
    ) -> Verdict {
        self.judge(&Evidence {
            observation,
            policy,
            location,
            trust,
            server_time_ms,
            local_time_ms,
        })
    }

    pub fn judge(&self, ev: &Evidence<'_>) -> Verdict {
        let verdict = if !self.identity_ok(ev) {
            Verdict::Rejected(Rejection::IdentityMismatch)
        } else if !self.geofence_ok(ev) {
            Verdict::Rejected(Rejection::GeofenceViolation)
        } else if ev.trust.is_compromised() {
            Verdict::Rejected(Rejection::DeviceIntegrityFailure)
        } else if !signal_ok(ev) {
            Verdict::Rejected(Rejection::WeakSignal)
        } else if let Some(skew) = self.clock_skew(ev) {
            Verdict::NeedsConfirmation(skew)
        } else {
            Verdict::Accepted
        };

        match verdict {
            Verdict::Accepted => log::info!("session {}: accepted", ev.policy.session_id),
            Verdict::Rejected(r) => {
                log::warn!("session {}: rejected ({})", ev.policy.session_id, r.as_str())
            }
            Verdict::NeedsConfirmation(s) => log::warn!(
                "session {}: clock skew {} ms needs confirmation",
                ev.policy.session_id,
                s.skew_ms
            ),
        }
        verdict
    }

    /// Run every check and collect all failures.
    pub fn diagnose(&self, ev: &Evidence<'_>) -> IntegrityVerdict {
        let mut reasons = Vec::new();
        let mut fail = |code: &'static str| {
            log::warn!("integrity check failed: {}", code);
            let _ = reasons.push(code);
        };

        if !self.identity_ok(ev) {
            fail(Rejection::IdentityMismatch.as_str());
        }
        if !self.geofence_ok(ev) {
            fail(Rejection::GeofenceViolation.as_str());
        }
        if ev.trust.is_compromised() {
            fail(Rejection::DeviceIntegrityFailure.as_str());
        }
        if !signal_ok(ev) {
            fail(Rejection::WeakSignal.as_str());
        }
        if self.clock_skew(ev).is_some() {
            fail(CLOCK_SKEW_DETECTED);
        }

        IntegrityVerdict {
            accepted: reasons.is_empty(),
            reasons,
        }
    }

    fn identity_ok(&self, ev: &Evidence<'_>) -> bool {
        identity::matches(ev.observation, ev.policy, self.config.match_mode)
    }

    /// Skipped unless the session declares both a location and a radius.
    /// Without a fix a declared geofence fails.
    fn geofence_ok(&self, ev: &Evidence<'_>) -> bool {
        let (Some(center), Some(radius)) = (ev.policy.reference_location, ev.policy.allowed_radius_m) else {
            return true;
        };
        let Some(fix) = ev.location else {
            log::warn!("geofence declared but no location fix");
            return false;
        };
        let distance = haversine_m(fix.point, center);
        log::debug!("{:.1} m from session location (radius {} m)", distance, radius);
        distance <= radius + self.config.geofence_tolerance_m
    }

    fn clock_skew(&self, ev: &Evidence<'_>) -> Option<ClockSkew> {
        let skew_ms = ev.server_time_ms.abs_diff(ev.local_time_ms);
        (skew_ms > self.config.max_clock_skew_ms).then_some(ClockSkew { skew_ms })
    }
}

fn signal_ok(ev: &Evidence<'_>) -> bool {
    ev.policy
        .min_rssi
        .map_or(true, |min| ev.observation.rssi >= min)
}
