/// BLE advertisement parsing, radio capability and scan duty cycle.
///
/// The platform radio stack is external. It is driven through [`ScanRadio`]
/// and reports back on a single [`RadioEvent`] stream, so everything from
/// here up runs without hardware.
///
/// Session beacons advertise a short session token as 128-bit service data
/// under [`BEACON_SERVICE_UUID`]. Adverts without any 128-bit service UUID
/// yield no observation.
use core::fmt::Write;

use heapless::Vec;

use crate::defaults::{
    BEACON_SERVICE_UUID_LE, BEACON_TOKEN_LEN, SCAN_ACTIVE_MS, SCAN_PAUSE_MS,
};
use crate::error::ScanFailure;
use crate::protocol::{MacString, TokenString, UuidString, TOKEN_CAPACITY};

/// Maximum legacy advertisement payload.
pub const MAX_ADV_LEN: usize = 31;

/// Maximum service-data payload kept from one AD structure.
pub const MAX_SERVICE_DATA: usize = 24;

/// A detected presence signal, the unit every check downstream consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceObservation {
    /// Advertiser address ("AA:BB:CC:DD:EE:FF")
    pub address: MacString,
    /// Service UUID the beacon advertised under
    pub identifier: UuidString,
    /// Received signal strength (dBm)
    pub rssi: i8,
    /// Session token carried in the service data, if any
    pub embedded_token: Option<TokenString>,
}

/// Parsed BLE advertisement.
#[derive(Debug, Clone)]
pub struct BleEvent {
    pub mac: [u8; 6],
    pub rssi: i8,
    /// 128-bit service UUIDs, little-endian as on air
    pub service_uuids_128: Vec<[u8; 16], 2>,
    /// 128-bit service data (UUID, payload)
    pub service_data_128: Option<([u8; 16], Vec<u8, MAX_SERVICE_DATA>)>,
}

impl BleEvent {
    /// Reduce to a presence observation.
    ///
    /// Service data wins over a bare UUID list: its UUID becomes the
    /// identifier and its payload the embedded token. With only a UUID list,
    /// the well-known beacon UUID is preferred over any other.
    pub fn to_observation(&self) -> Option<PresenceObservation> {
        let (uuid, token) = match &self.service_data_128 {
            Some((uuid, payload)) => (*uuid, decode_token(payload)),
            None => {
                let uuid = self
                    .service_uuids_128
                    .iter()
                    .find(|u| **u == BEACON_SERVICE_UUID_LE)
                    .or_else(|| self.service_uuids_128.first())?;
                (*uuid, None)
            }
        };

        let mut address = MacString::new();
        format_mac(&self.mac, &mut address);
        let mut identifier = UuidString::new();
        format_uuid128(&uuid, &mut identifier);

        Some(PresenceObservation {
            address,
            identifier,
            rssi: self.rssi,
            embedded_token: token,
        })
    }
}

/// Parse advertisement data (AD structures).
///
/// AD structure format: [length] [type] [data...]
/// Types we care about:
///   0x06/0x07 = Incomplete/Complete list of 128-bit service UUIDs
///   0x21      = Service data, 128-bit UUID (first 16 bytes = UUID)
/// Everything else (flags, names, 16-bit UUIDs, manufacturer data) is skipped.
pub struct BleAdvParser;

impl BleAdvParser {
    pub fn parse(addr: &[u8; 6], rssi: i8, ad_data: &[u8]) -> BleEvent {
        let mut event = BleEvent {
            mac: *addr,
            rssi,
            service_uuids_128: Vec::new(),
            service_data_128: None,
        };

        let mut pos = 0;
        while pos < ad_data.len() {
            let len = ad_data[pos] as usize;
            if len == 0 || pos + 1 + len > ad_data.len() {
                break;
            }

            let ad_type = ad_data[pos + 1];
            let data = &ad_data[pos + 2..pos + 1 + len];

            match ad_type {
                0x06 | 0x07 => {
                    for chunk in data.chunks_exact(16) {
                        if let Ok(uuid) = <[u8; 16]>::try_from(chunk) {
                            let _ = event.service_uuids_128.push(uuid);
                        }
                    }
                }
                0x21 => {
                    if data.len() >= 16 {
                        let mut uuid = [0u8; 16];
                        uuid.copy_from_slice(&data[..16]);
                        let payload = &data[16..];
                        let keep = payload.len().min(MAX_SERVICE_DATA);
                        let mut bytes = Vec::new();
                        let _ = bytes.extend_from_slice(&payload[..keep]);
                        // Prefer our beacon's data if several are present
                        let replace = match &event.service_data_128 {
                            None => true,
                            Some((existing, _)) => {
                                *existing != BEACON_SERVICE_UUID_LE && uuid == BEACON_SERVICE_UUID_LE
                            }
                        };
                        if replace {
                            event.service_data_128 = Some((uuid, bytes));
                        }
                    }
                }
                _ => {}
            }

            pos += 1 + len;
        }

        event
    }
}

fn decode_token(payload: &[u8]) -> Option<TokenString> {
    if payload.is_empty() {
        return None;
    }
    let text = core::str::from_utf8(payload).ok()?;
    let mut token = TokenString::new();
    let _ = token.push_str(truncate_str(text, TOKEN_CAPACITY));
    Some(token)
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
pub fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Beacon side ─────────────────────────────────────────────────────

/// Session token as carried on air: the first [`BEACON_TOKEN_LEN`] bytes
/// of the session id.
pub fn encode_beacon_payload(session_id: &str) -> TokenString {
    let mut token = TokenString::new();
    let _ = token.push_str(truncate_str(session_id, BEACON_TOKEN_LEN));
    token
}

/// Build the advertisement a session beacon broadcasts: flags plus the
/// token as 128-bit service data. No name, no TX power.
pub fn build_advertisement(token: &str) -> Vec<u8, MAX_ADV_LEN> {
    let payload = truncate_str(token, BEACON_TOKEN_LEN).as_bytes();
    let mut adv = Vec::new();
    // LE General Discoverable, BR/EDR not supported
    let _ = adv.extend_from_slice(&[0x02, 0x01, 0x06]);
    let _ = adv.push((1 + 16 + payload.len()) as u8);
    let _ = adv.push(0x21);
    let _ = adv.extend_from_slice(&BEACON_SERVICE_UUID_LE);
    let _ = adv.extend_from_slice(payload);
    adv
}

// ── Formatting ──────────────────────────────────────────────────────

/// Format a 6-byte MAC address into "AA:BB:CC:DD:EE:FF" string
pub fn format_mac(mac: &[u8; 6], buf: &mut MacString) {
    let _ = write!(
        buf,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
}

/// Format an on-air (little-endian) 128-bit UUID in canonical lowercase form.
pub fn format_uuid128(le: &[u8; 16], buf: &mut UuidString) {
    for (i, b) in le.iter().rev().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            let _ = buf.push('-');
        }
        let _ = write!(buf, "{:02x}", b);
    }
}

// ── Radio capability ────────────────────────────────────────────────

/// Start/stop control over the platform scanner.
///
/// `start` reports synchronous refusals (radio off, permission missing).
/// Failures that happen later arrive as [`RadioEvent::Failed`].
pub trait ScanRadio {
    fn start(&mut self) -> Result<(), ScanFailure>;
    fn stop(&mut self);
}

/// Everything the radio reports, on one stream.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    Started,
    Observation(PresenceObservation),
    Failed(ScanFailure),
}

// ── Duty cycle ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycleConfig {
    pub active_ms: u64,
    pub pause_ms: u64,
}

impl DutyCycleConfig {
    pub const fn new() -> Self {
        Self {
            active_ms: SCAN_ACTIVE_MS,
            pause_ms: SCAN_PAUSE_MS,
        }
    }
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What the driver must do to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyAction {
    StartWindow,
    EndWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Active { until_ms: u64 },
    Paused { until_ms: u64 },
}

/// Repeating scan window: active, pause, active, ... until stopped.
///
/// Pure scheduler; the caller polls with the current time and applies the
/// returned action to its radio (or uses [`DutyCycle::drive`]).
#[derive(Debug, Clone)]
pub struct DutyCycle {
    config: DutyCycleConfig,
    phase: Phase,
    windows: u32,
}

impl DutyCycle {
    pub const fn new(config: DutyCycleConfig) -> Self {
        Self {
            config,
            phase: Phase::Stopped,
            windows: 0,
        }
    }

    /// Begin cycling. Returns `StartWindow` unless already running.
    pub fn start(&mut self, now_ms: u64) -> Option<DutyAction> {
        if self.phase != Phase::Stopped {
            return None;
        }
        self.open_window(now_ms);
        Some(DutyAction::StartWindow)
    }

    /// Stop cycling. Returns `EndWindow` only if a window is open, so
    /// repeated stops are no-ops.
    pub fn stop(&mut self) -> Option<DutyAction> {
        let was_active = matches!(self.phase, Phase::Active { .. });
        self.phase = Phase::Stopped;
        was_active.then_some(DutyAction::EndWindow)
    }

    /// Advance the schedule.
    pub fn poll(&mut self, now_ms: u64) -> Option<DutyAction> {
        match self.phase {
            Phase::Active { until_ms } if now_ms >= until_ms => {
                self.phase = Phase::Paused {
                    until_ms: now_ms.saturating_add(self.config.pause_ms),
                };
                Some(DutyAction::EndWindow)
            }
            Phase::Paused { until_ms } if now_ms >= until_ms => {
                self.open_window(now_ms);
                Some(DutyAction::StartWindow)
            }
            _ => None,
        }
    }

    /// Poll and apply the result to `radio`. A refused start stops the cycle.
    pub fn drive<R: ScanRadio>(&mut self, radio: &mut R, now_ms: u64) -> Result<(), ScanFailure> {
        match self.poll(now_ms) {
            Some(DutyAction::StartWindow) => {
                if let Err(e) = radio.start() {
                    log::error!("scan window failed to open: {:?}", e);
                    self.phase = Phase::Stopped;
                    return Err(e);
                }
            }
            Some(DutyAction::EndWindow) => radio.stop(),
            None => {}
        }
        Ok(())
    }

    /// When the next transition is due.
    pub fn next_deadline(&self) -> Option<u64> {
        match self.phase {
            Phase::Stopped => None,
            Phase::Active { until_ms } | Phase::Paused { until_ms } => Some(until_ms),
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase != Phase::Stopped
    }

    /// Whether a scan window is currently open.
    pub fn is_scanning(&self) -> bool {
        matches!(self.phase, Phase::Active { .. })
    }

    /// Scan windows opened since creation.
    pub fn windows(&self) -> u32 {
        self.windows
    }

    pub fn set_config(&mut self, config: DutyCycleConfig) {
        self.config = config;
    }

    fn open_window(&mut self, now_ms: u64) {
        self.windows = self.windows.wrapping_add(1);
        self.phase = Phase::Active {
            until_ms: now_ms.saturating_add(self.config.active_ms),
        };
    }
}

impl Default for DutyCycle {
    fn default() -> Self {
        Self::new(DutyCycleConfig::new())
    }
}
