//! Stdin feed: one JSON object per line, routed by its first key.
//!
//! - `{"cmd":...}` host command
//! - `{"mac":"AA:BB:CC:DD:EE:FF","rssi":-62,"adv":"0201061121..."}` raw
//!   advertisement, AD bytes in hex
//! - anything else is a session record upsert

use heapless::String;
use rollcall::comm;
use rollcall::protocol::{HostCommand, MacString};
use rollcall::scanner::{BleAdvParser, PresenceObservation, MAX_ADV_LEN};
use rollcall::session::SessionPolicy;
use serde::Deserialize;

#[derive(Debug)]
pub enum FeedLine {
    Command(HostCommand),
    Observation(PresenceObservation),
    Session(SessionPolicy),
}

#[derive(Deserialize)]
struct AdvFrame {
    mac: MacString,
    rssi: i8,
    adv: String<64>,
}

pub fn classify(line: &[u8]) -> Option<FeedLine> {
    match first_key(line)? {
        "cmd" => comm::parse_command(line).map(FeedLine::Command),
        "mac" => parse_advert(line).map(FeedLine::Observation),
        _ => match SessionPolicy::from_json(line) {
            Ok(policy) => Some(FeedLine::Session(policy)),
            Err(e) => {
                log::warn!("feed line ignored: {}", e);
                None
            }
        },
    }
}

fn first_key(line: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(line).ok()?.trim_start();
    let rest = text.strip_prefix('{')?.trim_start().strip_prefix('"')?;
    rest.split('"').next()
}

/// Advertisements that carry no 128-bit service identifier yield nothing.
fn parse_advert(line: &[u8]) -> Option<PresenceObservation> {
    let (frame, _) = match serde_json_core::from_slice::<AdvFrame>(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("bad advertisement frame: {:?}", e);
            return None;
        }
    };
    let mac = parse_mac(&frame.mac)?;
    let ad = decode_hex(&frame.adv)?;
    BleAdvParser::parse(&mac, frame.rssi, &ad).to_observation()
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

fn decode_hex(s: &str) -> Option<heapless::Vec<u8, MAX_ADV_LEN>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = heapless::Vec::new();
    for pair in s.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(pair).ok()?;
        out.push(u8::from_str_radix(pair, 16).ok()?).ok()?;
    }
    Some(out)
}
