//! RollCall library: proximity attendance verification engine.
//!
//! Decides whether a student is physically present for an attendance session
//! by combining a BLE beacon's signal strength with session-bound identity
//! checks and device-integrity signals. This crate contains all signal
//! processing, matching, gating and protocol logic with no platform
//! dependencies, testable on any host with `cargo test`. Platform binaries
//! (the `rollcall-std` host runtime, a phone shell) are thin consumers that
//! provide radio access, storage and a presentation sink.
//!
//! The library is organized bottom-up:
//! - **Signal**: `buffer`, `smoothing`, `proximity`, `distance`,
//!   `calibration`, `tracker`. Raw RSSI in, Close/Far/Uncertain and an
//!   approximate distance out.
//! - **Verification**: `scanner`, `session`, `resolver`, `identity`,
//!   `integrity`. Beacon observations and session records in, a `Verdict` out.
//! - **Transport**: `protocol`, `comm`. NDJSON messages to and from the host.
//!
//! Everything is poll-driven: callers pass the current time in, nothing blocks
//! and nothing spawns.

#![cfg_attr(not(test), no_std)]

pub mod buffer;
pub mod calibration;
pub mod comm;
pub mod defaults;
pub mod distance;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod proximity;
pub mod resolver;
pub mod scanner;
pub mod session;
pub mod smoothing;
pub mod tracker;

pub use error::{Error, Result};
