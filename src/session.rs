/// Attendance session records.
///
/// A session is owned by external storage; this crate decodes the record,
/// reads its verification requirements and flips it inactive when it ends.
/// Field names follow the stored record (camelCase).
use serde::{Deserialize, Serialize};

use crate::defaults::{BEACON_SERVICE_UUID, SESSION_MIN_RSSI, SESSION_RADIUS_M};
use crate::error::{Error, Result};
use crate::protocol::{CredentialString, IdString, MacString, TokenString, UuidString};
use crate::scanner::{encode_beacon_payload, truncate_str};

/// WGS-84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Verification requirements of one session.
///
/// Every `Option` is a check that only runs when the session declares it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPolicy {
    #[serde(rename = "id")]
    pub session_id: IdString,
    #[serde(rename = "courseId")]
    pub course_id: IdString,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    /// One-time credential the student scans (QR payload)
    #[serde(rename = "qrCodeValue")]
    pub credential_token: CredentialString,
    #[serde(
        rename = "requiredBeaconServiceUuid",
        default,
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_identifier: Option<UuidString>,
    #[serde(
        rename = "requiredBeaconSessionData",
        default,
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_embedded_token: Option<TokenString>,
    #[serde(
        rename = "requiredBeaconMac",
        default,
        deserialize_with = "non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_address: Option<MacString>,
    #[serde(rename = "allowedRadiusMeters", default, skip_serializing_if = "Option::is_none")]
    pub allowed_radius_m: Option<f64>,
    #[serde(rename = "minRequiredRssi", default, skip_serializing_if = "Option::is_none")]
    pub min_rssi: Option<i8>,
    #[serde(rename = "location", default, skip_serializing_if = "Option::is_none")]
    pub reference_location: Option<GeoPoint>,
    #[serde(rename = "createdAt")]
    pub created_at_ms: u64,
    #[serde(rename = "endedAt", default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
}

/// Stored records write `""` for a requirement that is not set.
fn non_empty<'de, D, T>(deserializer: D) -> core::result::Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + core::ops::Deref<Target = str>,
{
    Ok(Option::<T>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

/// Copy `s`, truncated on a char boundary to fit `N` bytes.
pub(crate) fn bounded<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    let _ = out.push_str(truncate_str(s, N));
    out
}

impl SessionPolicy {
    /// A freshly opened session as the instructor side creates it: active,
    /// advertising the first bytes of its id under the beacon service UUID,
    /// with the default radius and signal floor.
    pub fn open(
        session_id: &str,
        course_id: &str,
        credential_token: &str,
        location: Option<GeoPoint>,
        created_at_ms: u64,
    ) -> Self {
        Self {
            session_id: bounded(session_id),
            course_id: bounded(course_id),
            is_active: true,
            credential_token: bounded(credential_token),
            expected_identifier: Some(bounded(BEACON_SERVICE_UUID)),
            expected_embedded_token: Some(encode_beacon_payload(session_id)),
            expected_address: None,
            allowed_radius_m: Some(SESSION_RADIUS_M),
            min_rssi: Some(SESSION_MIN_RSSI),
            reference_location: location,
            created_at_ms,
            ended_at_ms: None,
        }
    }

    /// A session with no optional requirements at all.
    pub fn bare(session_id: &str, credential_token: &str, created_at_ms: u64) -> Self {
        Self {
            session_id: bounded(session_id),
            course_id: IdString::new(),
            is_active: true,
            credential_token: bounded(credential_token),
            expected_identifier: None,
            expected_embedded_token: None,
            expected_address: None,
            allowed_radius_m: None,
            min_rssi: None,
            reference_location: None,
            created_at_ms,
            ended_at_ms: None,
        }
    }

    /// Whether this is the active session behind `token`.
    pub fn accepts_credential(&self, token: &str) -> bool {
        self.is_active && self.credential_token.as_str() == token
    }

    /// End the session. The first end time sticks.
    pub fn close(&mut self, now_ms: u64) {
        if self.ended_at_ms.is_none() {
            self.ended_at_ms = Some(now_ms);
            log::info!("session {} ended", self.session_id);
        }
        self.is_active = false;
    }

    /// Decode one stored record.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let (policy, _): (Self, usize) = serde_json_core::from_slice(json)
            .map_err(|_| Error::InvalidRecord("malformed session record"))?;
        if policy.session_id.is_empty() {
            return Err(Error::InvalidRecord("missing id"));
        }
        if policy.credential_token.is_empty() {
            return Err(Error::InvalidRecord("missing qrCodeValue"));
        }
        Ok(policy)
    }

    /// Encode for storage. Returns bytes written.
    pub fn to_json(&self, buf: &mut [u8]) -> Result<usize> {
        serde_json_core::to_slice(self, buf).map_err(|_| Error::InvalidRecord("record too large"))
    }
}
