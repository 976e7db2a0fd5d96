//! Host stand-ins for the phone platform: radio switch, clock and trust probe.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rollcall::error::ScanFailure;
use rollcall::integrity::TrustProbe;
use rollcall::scanner::ScanRadio;

/// Whether the feed should deliver advertisements right now.
pub(crate) static RADIO_ON: AtomicBool = AtomicBool::new(false);

/// The "radio" is the stdin feed; starting it just opens the gate.
pub struct FeedRadio {
    /// Refuse to start, as if the adapter were switched off
    pub disabled: bool,
}

impl ScanRadio for FeedRadio {
    fn start(&mut self) -> Result<(), ScanFailure> {
        if self.disabled {
            return Err(ScanFailure::Unavailable);
        }
        RADIO_ON.store(true, Ordering::Relaxed);
        log::debug!("radio on");
        Ok(())
    }

    fn stop(&mut self) {
        RADIO_ON.store(false, Ordering::Relaxed);
        log::debug!("radio off");
    }
}

pub fn radio_is_on() -> bool {
    RADIO_ON.load(Ordering::Relaxed)
}

/// Monotonic milliseconds since start, plus a skewable wall clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    boot: Instant,
    offset_ms: i64,
}

impl Clock {
    pub fn new(offset_ms: i64) -> Self {
        Self {
            boot: Instant::now(),
            offset_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    pub fn uptime_secs(&self) -> u32 {
        self.boot.elapsed().as_secs() as u32
    }

    /// Reference time, as the backend would stamp it.
    pub fn server_time_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// This device's idea of wall time.
    pub fn local_time_ms(&self) -> u64 {
        self.server_time_ms().saturating_add_signed(self.offset_ms)
    }
}

/// Trust probe over the host filesystem.
pub struct HostTrustProbe {
    pub build_tags: Option<String>,
}

impl TrustProbe for HostTrustProbe {
    fn path_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn build_tags(&self) -> Option<&str> {
        self.build_tags.as_deref()
    }
}
