/// JSON message protocol between the verification engine and its host.
///
/// All messages are newline-delimited JSON (NDJSON).
/// Uses `heapless` types for no_std/no-alloc operation.
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

/// Maximum length for MAC address strings ("AA:BB:CC:DD:EE:FF")
pub type MacString = String<18>;

/// Maximum length for UUID strings
pub type UuidString = String<37>;

/// Capacity of an embedded session token
pub const TOKEN_CAPACITY: usize = 16;

/// Session token carried in beacon service data
pub type TokenString = String<TOKEN_CAPACITY>;

/// Session, course and user identifiers
pub type IdString = String<40>;

/// Scanned one-time credential (QR payload)
pub type CredentialString = String<64>;

/// Messages sent from the engine to the host / presentation layer
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// Per-sample proximity update for the tracked beacon
    #[serde(rename = "proximity")]
    Proximity {
        raw: i8,
        ema: f32,
        median: i8,
        /// "close", "far" or "uncertain"
        decision: &'static str,
        /// Omitted when out of range
        #[serde(skip_serializing_if = "Option::is_none")]
        distance_m: Option<f32>,
        /// Milliseconds since start when captured
        ts: u64,
    },
    /// Outcome of one verification attempt
    #[serde(rename = "verdict")]
    Verdict {
        session: &'a str,
        accepted: bool,
        /// First failing check, if rejected
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
        /// Soft failure awaiting user confirmation
        #[serde(skip_serializing_if = "Option::is_none")]
        pending: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skew_ms: Option<u64>,
    },
    /// Calibration finished
    #[serde(rename = "calibration")]
    Calibration { reference: i8, samples: u16 },
    /// Session resolution progress
    #[serde(rename = "session")]
    Session {
        token: &'a str,
        /// "resolved", "waiting" or "timeout"
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
    },
    /// Engine status report
    #[serde(rename = "status")]
    Status {
        scanning: bool,
        /// Scan windows opened so far
        windows: u32,
        /// Calibrated RSSI at 1 m
        reference: i8,
        /// Uptime in seconds
        uptime: u32,
        version: &'static str,
    },
    /// A failure reported once to the host
    #[serde(rename = "error")]
    Error { code: &'static str, detail: &'a str },
    /// Accepted attempt, ready for persistence
    #[serde(rename = "submission")]
    Submission(AttendanceSubmission<'a>),
}

/// Attendance record handed to external persistence after acceptance.
///
/// The backend re-validates every field; `status` is always "pending".
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSubmission<'a> {
    pub session_id: &'a str,
    pub credential_token: &'a str,
    pub submitter_id: &'a str,
    pub beacon_identifier: &'a str,
    pub beacon_address: &'a str,
    pub beacon_rssi: i8,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f32,
    pub device_integrity: bool,
    pub mock_location_detected: bool,
    pub status: &'static str,
    pub submitted_at_ms: u64,
}

/// Status every fresh submission carries until the backend reviews it.
pub const SUBMISSION_PENDING: &str = "pending";

/// Commands sent from the host to the engine.
///
/// Deserialized manually via [`RawCommand`] in `comm::parse_command()` because
/// `serde_json_core` does not support internally tagged enums (`deserialize_any`).
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// Start the scan duty cycle
    Start,
    /// Stop scanning
    Stop,
    /// Request current status
    GetStatus,
    /// Update EMA coefficients
    SetSmoothing { alpha_rise: f32, alpha_fall: f32 },
    /// Update proximity thresholds
    SetThresholds {
        close: i8,
        far: i8,
        consecutive: u8,
    },
    /// Update the path-loss exponent
    SetPathLoss { exponent: f32 },
    /// Run a calibration at 1 m for the given window
    Calibrate { duration_ms: u64 },
    /// Resolve a scanned credential to its session
    Resolve { token: CredentialString },
    /// Answer a pending clock-skew confirmation
    ConfirmSkew { accept: bool },
}

/// Wire format for host commands: a flat struct that `serde_json_core` can
/// deserialize without `deserialize_any`. Converted to [`HostCommand`] in
/// `comm::parse_command()`.
#[derive(Deserialize)]
pub(crate) struct RawCommand {
    pub cmd: String<16>,
    #[serde(default)]
    pub alpha_rise: Option<f32>,
    #[serde(default)]
    pub alpha_fall: Option<f32>,
    #[serde(default)]
    pub close: Option<i8>,
    #[serde(default)]
    pub far: Option<i8>,
    #[serde(default)]
    pub consecutive: Option<u8>,
    #[serde(default)]
    pub n: Option<f32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub token: Option<CredentialString>,
    #[serde(default)]
    pub accept: Option<bool>,
}

/// Engine version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json<T: Serialize>(msg: &T) -> std::string::String {
        let mut buf = [0u8; MAX_MSG_LEN];
        let len = serde_json_core::to_slice(msg, &mut buf).unwrap();
        core::str::from_utf8(&buf[..len]).unwrap().into()
    }

    // ── DeviceMessage serialization ─────────────────────────────────

    #[test]
    fn serialize_proximity_message() {
        let json = to_json(&DeviceMessage::Proximity {
            raw: -62,
            ema: -64.5,
            median: -63,
            decision: "close",
            distance_m: Some(1.5),
            ts: 1200,
        });
        assert!(json.contains(r#""type":"proximity""#));
        assert!(json.contains(r#""raw":-62"#));
        assert!(json.contains(r#""decision":"close""#));
        assert!(json.contains(r#""distance_m":1.5"#));
    }

    #[test]
    fn proximity_out_of_range_omits_distance() {
        let json = to_json(&DeviceMessage::Proximity {
            raw: -95,
            ema: -93.0,
            median: -94,
            decision: "far",
            distance_m: None,
            ts: 0,
        });
        assert!(!json.contains("distance_m"));
    }

    #[test]
    fn serialize_rejected_verdict() {
        let json = to_json(&DeviceMessage::Verdict {
            session: "s-1",
            accepted: false,
            reason: Some("weak_signal"),
            pending: None,
            skew_ms: None,
        });
        assert!(json.contains(r#""type":"verdict""#));
        assert!(json.contains(r#""accepted":false"#));
        assert!(json.contains(r#""reason":"weak_signal""#));
        assert!(!json.contains("pending"));
    }

    #[test]
    fn serialize_pending_verdict() {
        let json = to_json(&DeviceMessage::Verdict {
            session: "s-1",
            accepted: false,
            reason: None,
            pending: Some("clock_skew"),
            skew_ms: Some(180_000),
        });
        assert!(json.contains(r#""pending":"clock_skew""#));
        assert!(json.contains(r#""skew_ms":180000"#));
    }

    #[test]
    fn serialize_status_message() {
        let json = to_json(&DeviceMessage::Status {
            scanning: true,
            windows: 3,
            reference: -61,
            uptime: 120,
            version: "0.1.0",
        });
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""reference":-61"#));
    }

    #[test]
    fn serialize_session_waiting_omits_id() {
        let json = to_json(&DeviceMessage::Session {
            token: "QR-1",
            state: "waiting",
            id: None,
        });
        assert!(json.contains(r#""state":"waiting""#));
        assert!(!json.contains(r#""id""#));
    }

    // ── Submission record ───────────────────────────────────────────

    #[test]
    fn submission_uses_camel_case_and_pending() {
        let json = to_json(&AttendanceSubmission {
            session_id: "s-1",
            credential_token: "QR-1",
            submitter_id: "student-9",
            beacon_identifier: "7c1d0001-5a3e-4b8f-9c62-d1e0f3a4b5c6",
            beacon_address: "C0:FF:EE:00:11:22",
            beacon_rssi: -70,
            latitude: 12.5,
            longitude: 77.25,
            accuracy_m: 8.0,
            device_integrity: true,
            mock_location_detected: false,
            status: SUBMISSION_PENDING,
            submitted_at_ms: 1_700_000_000_000,
        });
        assert!(json.contains(r#""sessionId":"s-1""#));
        assert!(json.contains(r#""credentialToken":"QR-1""#));
        assert!(json.contains(r#""beaconRssi":-70"#));
        assert!(json.contains(r#""deviceIntegrity":true"#));
        assert!(json.contains(r#""status":"pending""#));
    }

    #[test]
    fn submission_message_is_tagged() {
        let json = to_json(&DeviceMessage::Submission(AttendanceSubmission {
            session_id: "s-1",
            credential_token: "QR-1",
            submitter_id: "student-9",
            beacon_identifier: "7c1d0001-5a3e-4b8f-9c62-d1e0f3a4b5c6",
            beacon_address: "C0:FF:EE:00:11:22",
            beacon_rssi: -61,
            latitude: 0.0,
            longitude: 0.0,
            accuracy_m: 10.0,
            device_integrity: true,
            mock_location_detected: false,
            status: SUBMISSION_PENDING,
            submitted_at_ms: 5,
        }));
        assert!(json.starts_with(r#"{"type":"submission","sessionId":"s-1""#));
        assert!(json.len() < MAX_MSG_LEN);
    }

    // ── Version constant ────────────────────────────────────────────

    #[test]
    fn version_is_semver() {
        let parts: heapless::Vec<&str, 4> = VERSION.split('.').collect();
        assert_eq!(
            parts.len(),
            3,
            "VERSION should be semver (major.minor.patch)"
        );
        for part in &parts {
            assert!(part.parse::<u32>().is_ok(), "'{part}' is not a number");
        }
    }
}
