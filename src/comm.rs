/// NDJSON transport helpers between the engine and its host.
///
/// The engine streams proximity updates, verdicts and status as
/// newline-delimited JSON. Commands arrive the same way, one per line.
use serde::Serialize;

use crate::protocol::{DeviceMessage, HostCommand, RawCommand, MAX_MSG_LEN};
use crate::tracker::TrackerConfig;

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize any record as one NDJSON line into `buf`.
/// Returns the number of bytes written, or None if it does not fit.
pub fn serialize_line<T: Serialize>(record: &T, buf: &mut [u8]) -> Option<usize> {
    let len = serde_json_core::to_slice(record, buf).ok()?;
    if len < buf.len() {
        buf[len] = b'\n';
        Some(len + 1)
    } else {
        log::warn!("no room for line terminator ({} bytes)", len);
        None
    }
}

/// Serialize a DeviceMessage as one NDJSON line.
pub fn serialize_message(msg: &DeviceMessage, buf: &mut [u8]) -> Option<usize> {
    serialize_line(msg, buf)
}

/// Deserialize a HostCommand from a JSON byte slice.
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    let (raw, _) = match serde_json_core::from_slice::<RawCommand>(trimmed) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("unparseable command: {:?}", e);
            return None;
        }
    };

    let cmd = match raw.cmd.as_str() {
        "start" => HostCommand::Start,
        "stop" => HostCommand::Stop,
        "status" => HostCommand::GetStatus,
        "set_smoothing" => HostCommand::SetSmoothing {
            alpha_rise: raw.alpha_rise?,
            alpha_fall: raw.alpha_fall?,
        },
        "set_thresholds" => HostCommand::SetThresholds {
            close: raw.close?,
            far: raw.far?,
            consecutive: raw.consecutive?,
        },
        "set_path_loss" => HostCommand::SetPathLoss { exponent: raw.n? },
        "calibrate" => HostCommand::Calibrate {
            duration_ms: raw.duration_ms.unwrap_or(crate::defaults::CALIBRATION_WINDOW_MS),
        },
        "resolve" => HostCommand::Resolve { token: raw.token? },
        "confirm_skew" => HostCommand::ConfirmSkew { accept: raw.accept? },
        other => {
            log::warn!("unknown command '{}'", other);
            return None;
        }
    };
    Some(cmd)
}

/// Apply the commands that only touch tuning or the scan flag.
///
/// Anything needing the radio, storage or a pending verdict is handed back
/// to the caller.
pub fn handle_command(
    cmd: HostCommand,
    config: &mut TrackerConfig,
    scanning: &mut bool,
) -> Option<HostCommand> {
    match cmd {
        HostCommand::Start => {
            *scanning = true;
            log::info!("Scanning started by host command");
            None
        }
        HostCommand::Stop => {
            *scanning = false;
            log::info!("Scanning stopped by host command");
            None
        }
        HostCommand::SetSmoothing {
            alpha_rise,
            alpha_fall,
        } => {
            config.smoothing.alpha_rise = alpha_rise;
            config.smoothing.alpha_fall = alpha_fall;
            config.smoothing = config.smoothing.sanitized();
            log::info!(
                "EMA coefficients set to rise={} fall={}",
                config.smoothing.alpha_rise,
                config.smoothing.alpha_fall
            );
            None
        }
        HostCommand::SetThresholds {
            close,
            far,
            consecutive,
        } => {
            config.classifier.close_threshold = close;
            config.classifier.far_threshold = far;
            config.classifier.consecutive_required = consecutive.max(1);
            log::info!(
                "Thresholds set to close={} far={} x{}",
                close,
                far,
                config.classifier.consecutive_required
            );
            None
        }
        HostCommand::SetPathLoss { exponent } => {
            if exponent.is_finite() && exponent > 0.0 {
                config.path_loss.path_loss_exponent = exponent;
                log::info!("Path-loss exponent set to {}", exponent);
            } else {
                log::warn!("ignoring path-loss exponent {}", exponent);
            }
            None
        }
        deferred => Some(deferred),
    }
}

// ── NDJSON line reader ─────────────────────────────────────────────────

/// NDJSON reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
/// An over-long line is discarded up to its newline.
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
    overflowed: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
            overflowed: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            let pos = core::mem::replace(&mut self.pos, 0);
            if core::mem::replace(&mut self.overflowed, false) || pos == 0 {
                return None;
            }
            Some(&self.buf[..pos])
        } else if self.overflowed {
            None
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            log::warn!("line exceeds {} bytes, discarding", MAX_MSG_LEN);
            self.overflowed = true;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && matches!(data[end - 1], b' ' | b'\n' | b'\r' | b'\t') {
        end -= 1;
    }
    &data[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CredentialString;

    // ── Command parsing ─────────────────────────────────────────────

    #[test]
    fn parse_simple_commands() {
        assert_eq!(parse_command(br#"{"cmd":"start"}"#), Some(HostCommand::Start));
        assert_eq!(parse_command(b"{\"cmd\":\"stop\"}\r\n"), Some(HostCommand::Stop));
        assert_eq!(parse_command(br#"{"cmd":"status"}"#), Some(HostCommand::GetStatus));
    }

    #[test]
    fn parse_tuning_commands() {
        assert_eq!(
            parse_command(br#"{"cmd":"set_thresholds","close":-62,"far":-78,"consecutive":3}"#),
            Some(HostCommand::SetThresholds {
                close: -62,
                far: -78,
                consecutive: 3
            })
        );
        assert_eq!(
            parse_command(br#"{"cmd":"set_smoothing","alpha_rise":0.5,"alpha_fall":0.2}"#),
            Some(HostCommand::SetSmoothing {
                alpha_rise: 0.5,
                alpha_fall: 0.2
            })
        );
        assert_eq!(
            parse_command(br#"{"cmd":"set_path_loss","n":2.5}"#),
            Some(HostCommand::SetPathLoss { exponent: 2.5 })
        );
    }

    #[test]
    fn parse_calibrate_defaults_window() {
        assert_eq!(
            parse_command(br#"{"cmd":"calibrate"}"#),
            Some(HostCommand::Calibrate { duration_ms: 5_000 })
        );
        assert_eq!(
            parse_command(br#"{"cmd":"calibrate","duration_ms":2000}"#),
            Some(HostCommand::Calibrate { duration_ms: 2_000 })
        );
    }

    #[test]
    fn parse_resolve_and_confirm() {
        assert_eq!(
            parse_command(br#"{"cmd":"resolve","token":"QR-abc"}"#),
            Some(HostCommand::Resolve {
                token: CredentialString::try_from("QR-abc").unwrap()
            })
        );
        assert_eq!(
            parse_command(br#"{"cmd":"confirm_skew","accept":false}"#),
            Some(HostCommand::ConfirmSkew { accept: false })
        );
    }

    #[test]
    fn missing_argument_is_rejected() {
        assert_eq!(parse_command(br#"{"cmd":"set_path_loss"}"#), None);
        assert_eq!(parse_command(br#"{"cmd":"resolve"}"#), None);
    }

    #[test]
    fn unknown_or_empty_is_rejected() {
        assert_eq!(parse_command(br#"{"cmd":"reboot"}"#), None);
        assert_eq!(parse_command(b"  \n"), None);
        assert_eq!(parse_command(b"{oops"), None);
    }

    // ── Command handling ────────────────────────────────────────────

    #[test]
    fn start_stop_toggle_scanning() {
        let mut cfg = TrackerConfig::new();
        let mut scanning = false;
        assert_eq!(handle_command(HostCommand::Start, &mut cfg, &mut scanning), None);
        assert!(scanning);
        handle_command(HostCommand::Stop, &mut cfg, &mut scanning);
        assert!(!scanning);
    }

    #[test]
    fn tuning_updates_config() {
        let mut cfg = TrackerConfig::new();
        let mut scanning = false;
        handle_command(
            HostCommand::SetThresholds {
                close: -60,
                far: -75,
                consecutive: 0,
            },
            &mut cfg,
            &mut scanning,
        );
        assert_eq!(cfg.classifier.close_threshold, -60);
        assert_eq!(cfg.classifier.far_threshold, -75);
        assert_eq!(cfg.classifier.consecutive_required, 1);

        handle_command(
            HostCommand::SetSmoothing {
                alpha_rise: 2.0,
                alpha_fall: 0.1,
            },
            &mut cfg,
            &mut scanning,
        );
        assert_eq!(cfg.smoothing.alpha_rise, 1.0);
        assert_eq!(cfg.smoothing.alpha_fall, 0.1);
    }

    #[test]
    fn invalid_path_loss_is_ignored() {
        let mut cfg = TrackerConfig::new();
        let mut scanning = false;
        handle_command(HostCommand::SetPathLoss { exponent: 0.0 }, &mut cfg, &mut scanning);
        assert_eq!(cfg.path_loss.path_loss_exponent, 2.0);
        handle_command(HostCommand::SetPathLoss { exponent: 3.0 }, &mut cfg, &mut scanning);
        assert_eq!(cfg.path_loss.path_loss_exponent, 3.0);
    }

    #[test]
    fn stateful_commands_are_handed_back() {
        let mut cfg = TrackerConfig::new();
        let mut scanning = false;
        let cmd = HostCommand::Calibrate { duration_ms: 100 };
        assert_eq!(handle_command(cmd.clone(), &mut cfg, &mut scanning), Some(cmd));
        assert_eq!(
            handle_command(HostCommand::GetStatus, &mut cfg, &mut scanning),
            Some(HostCommand::GetStatus)
        );
        assert_eq!(cfg, TrackerConfig::new());
    }

    // ── Serialization ───────────────────────────────────────────────

    #[test]
    fn serialized_message_ends_with_newline() {
        let mut buf = [0u8; MAX_MSG_LEN];
        let msg = DeviceMessage::Error {
            code: "scan_unavailable",
            detail: "BLE scanning unavailable",
        };
        let len = serialize_message(&msg, &mut buf).unwrap();
        assert_eq!(buf[len - 1], b'\n');
        let line = core::str::from_utf8(&buf[..len - 1]).unwrap();
        assert_eq!(
            line,
            r#"{"type":"error","code":"scan_unavailable","detail":"BLE scanning unavailable"}"#
        );
    }

    #[test]
    fn too_small_buffer_fails() {
        let mut buf = [0u8; 8];
        let msg = DeviceMessage::Calibration {
            reference: -61,
            samples: 40,
        };
        assert_eq!(serialize_message(&msg, &mut buf), None);
    }

    // ── Line reader ─────────────────────────────────────────────────

    fn feed_all(reader: &mut LineReader, data: &[u8]) -> std::vec::Vec<std::vec::Vec<u8>> {
        let mut lines = std::vec::Vec::new();
        for &b in data {
            if let Some(line) = reader.feed(b) {
                lines.push(line.to_vec());
            }
        }
        lines
    }

    #[test]
    fn reader_splits_lines_and_skips_blanks() {
        let mut reader = LineReader::new();
        let lines = feed_all(&mut reader, b"{\"cmd\":\"start\"}\r\n\n{\"cmd\":\"stop\"}\n");
        assert_eq!(lines, [b"{\"cmd\":\"start\"}".to_vec(), b"{\"cmd\":\"stop\"}".to_vec()]);
    }

    #[test]
    fn reader_drops_overlong_line_entirely() {
        let mut reader = LineReader::new();
        let mut data = std::vec![b'x'; MAX_MSG_LEN + 20];
        data.push(b'\n');
        data.extend_from_slice(b"ok\n");
        let lines = feed_all(&mut reader, &data);
        assert_eq!(lines, [b"ok".to_vec()]);
    }
}
