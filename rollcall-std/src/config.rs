//! Host runtime configuration from environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rollcall::resolver::ResolverConfig;
use rollcall::scanner::DutyCycleConfig;
use rollcall::session::GeoPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Directory holding persisted calibration
    pub state_dir: PathBuf,
    /// NDJSON file of session records loaded at start
    pub sessions_path: Option<PathBuf>,
    pub duty: DutyCycleConfig,
    pub resolver: ResolverConfig,
    /// Fixed device position; no geofence can pass without one
    pub location: Option<GeoPoint>,
    pub location_accuracy_m: f32,
    /// Report the fixed position as coming from a mock provider
    pub location_mock: bool,
    pub submitter_id: String,
    /// Firmware build tags reported to the trust probe
    pub build_tags: Option<String>,
    /// Simulated device clock error, added to wall time
    pub clock_offset_ms: i64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("."),
            sessions_path: None,
            duty: DutyCycleConfig::new(),
            resolver: ResolverConfig::new(),
            location: None,
            location_accuracy_m: 10.0,
            location_mock: false,
            submitter_id: "anonymous".into(),
            build_tags: None,
            clock_offset_ms: 0,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults; set but
    /// unparseable keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(dir) = lookup("ROLLCALL_STATE_DIR") {
            cfg.state_dir = PathBuf::from(dir);
        }
        cfg.sessions_path = lookup("ROLLCALL_SESSIONS").map(PathBuf::from);
        if let Some(ms) = lookup("ROLLCALL_ACTIVE_MS") {
            cfg.duty.active_ms = ms.parse().context("ROLLCALL_ACTIVE_MS")?;
        }
        if let Some(ms) = lookup("ROLLCALL_PAUSE_MS") {
            cfg.duty.pause_ms = ms.parse().context("ROLLCALL_PAUSE_MS")?;
        }
        if let Some(ms) = lookup("ROLLCALL_RESOLVE_TIMEOUT_MS") {
            cfg.resolver.timeout_ms = ms.parse().context("ROLLCALL_RESOLVE_TIMEOUT_MS")?;
        }
        if let Some(loc) = lookup("ROLLCALL_LOCATION") {
            cfg.location = Some(parse_location(&loc).context("ROLLCALL_LOCATION")?);
        }
        if let Some(acc) = lookup("ROLLCALL_LOCATION_ACCURACY_M") {
            cfg.location_accuracy_m = acc.parse().context("ROLLCALL_LOCATION_ACCURACY_M")?;
        }
        if let Some(flag) = lookup("ROLLCALL_LOCATION_MOCK") {
            cfg.location_mock = parse_flag(&flag).context("ROLLCALL_LOCATION_MOCK")?;
        }
        if let Some(id) = lookup("ROLLCALL_STUDENT_ID") {
            cfg.submitter_id = id;
        }
        cfg.build_tags = lookup("ROLLCALL_BUILD_TAGS");
        if let Some(ms) = lookup("ROLLCALL_CLOCK_OFFSET_MS") {
            cfg.clock_offset_ms = ms.parse().context("ROLLCALL_CLOCK_OFFSET_MS")?;
        }

        if cfg.duty.active_ms == 0 {
            anyhow::bail!("ROLLCALL_ACTIVE_MS must be positive");
        }
        Ok(cfg)
    }
}

fn parse_flag(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => anyhow::bail!("expected true or false, got {other:?}"),
    }
}

/// "lat,lon" in degrees.
fn parse_location(s: &str) -> Result<GeoPoint> {
    let (lat, lon) = s.split_once(',').context("expected \"lat,lon\"")?;
    let latitude: f64 = lat.trim().parse().context("latitude")?;
    let longitude: f64 = lon.trim().parse().context("longitude")?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        anyhow::bail!("coordinates out of range: {latitude},{longitude}");
    }
    Ok(GeoPoint::new(latitude, longitude))
}
