//! RollCall host runtime
//!
//! Thread-based driver for the verification engine using std threads and
//! `std::sync::mpsc` channels. Stdin carries the feed (host commands, raw
//! advertisements, session record changes, see [`feed`]); stdout carries
//! NDJSON engine messages. Logs go to stderr.
//!
//! At end of input, an in-flight session resolution or calibration runs to
//! completion, then the runtime exits.

mod config;
mod feed;
mod platform;
mod sessions;
mod store;

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use rollcall::calibration::{load_profile, Calibration};
use rollcall::comm::{self, LineReader};
use rollcall::defaults::{BEACON_SERVICE_UUID, REFERENCE_RSSI};
use rollcall::identity::{self, MatchMode};
use rollcall::integrity::{
    probe_device_trust, DeviceTrust, Evidence, IntegrityGate, LocationFix, TrustProbe, Verdict,
};
use rollcall::protocol::{
    AttendanceSubmission, CredentialString, DeviceMessage, HostCommand, MsgBuffer, MAX_MSG_LEN,
    SUBMISSION_PENDING, VERSION,
};
use rollcall::proximity::Proximity;
use rollcall::resolver::{Resolution, SessionResolver, WatchId};
use rollcall::scanner::{DutyCycle, PresenceObservation, RadioEvent, ScanRadio};
use rollcall::session::SessionPolicy;
use rollcall::tracker::{ProximityTracker, TrackerConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use config::HostConfig;
use feed::FeedLine;
use platform::{Clock, FeedRadio, HostTrustProbe};
use sessions::SessionStore;
use store::FileCalibrationStore;

// ── Shared state ─────────────────────────────────────────────────────

static SCANNING: AtomicBool = AtomicBool::new(false);
static SCAN_WINDOWS: AtomicU32 = AtomicU32::new(0);
static REFERENCE: AtomicI8 = AtomicI8::new(REFERENCE_RSSI);
static TRACKER_CONFIG: Mutex<TrackerConfig> = Mutex::new(TrackerConfig::new());

/// Longest sleep between polls when no deadline is pending.
const IDLE_POLL_MS: u64 = 250;

fn tracker_config() -> TrackerConfig {
    *TRACKER_CONFIG.lock().unwrap_or_else(|p| p.into_inner())
}

fn set_tracker_config(config: TrackerConfig) {
    *TRACKER_CONFIG.lock().unwrap_or_else(|p| p.into_inner()) = config;
}

/// Sleep until `deadline`, capped at [`IDLE_POLL_MS`].
fn wait_for(deadline: Option<u64>, now_ms: u64) -> Duration {
    let ms = deadline
        .map(|d| d.saturating_sub(now_ms))
        .unwrap_or(IDLE_POLL_MS)
        .clamp(1, IDLE_POLL_MS);
    Duration::from_millis(ms)
}

enum ScanInput {
    Radio(RadioEvent),
    Calibrate { duration_ms: u64 },
    /// The tracking target in [`TrackSlot`] changed
    Retarget,
    Shutdown,
}

/// Latest tracking target, handed from the command thread to the scan
/// thread. A newer target overwrites one not yet picked up.
#[derive(Clone, Default)]
struct TrackSlot(Arc<Mutex<Option<Option<SessionPolicy>>>>);

impl TrackSlot {
    /// Follow this session's beacon, or nothing.
    fn hand_off(&self, target: Option<SessionPolicy>) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Some(target);
    }

    fn take(&self) -> Option<Option<SessionPolicy>> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

enum CommandInput {
    Host(HostCommand),
    Snapshot(WatchId, SessionPolicy),
    /// First close-range sample of the tracked beacon
    Detection(PresenceObservation),
    Shutdown,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    log::info!("RollCall v{} starting", VERSION);

    let config = HostConfig::from_env().context("loading configuration")?;
    let clock = Clock::new(config.clock_offset_ms);

    let calibration_store = FileCalibrationStore::new(&config.state_dir);
    let profile = load_profile(&calibration_store);
    REFERENCE.store(profile.reference, Ordering::Relaxed);
    log::info!("Reference RSSI at 1 m: {} dBm", profile.reference);

    // ── Channels ─────────────────────────────────────────────────────

    let (scan_tx, scan_rx) = mpsc::sync_channel::<ScanInput>(32);
    let (cmd_tx, cmd_rx) = mpsc::sync_channel::<CommandInput>(16);
    let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(32);

    // ── Session store ────────────────────────────────────────────────

    let notify_tx = Mutex::new(cmd_tx.clone());
    let sessions = SessionStore::new().with_notifier(Arc::new(move |watch, snapshot| {
        let tx = notify_tx.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(TrySendError::Full(_)) = tx.try_send(CommandInput::Snapshot(watch, snapshot)) {
            log::warn!("Command queue full, session snapshot for watch {} dropped", watch);
        }
    }));
    if let Some(path) = &config.sessions_path {
        let count = sessions.load_ndjson(path)?;
        log::info!("Loaded {} session record(s) from {}", count, path.display());
    }

    // ── Output thread ────────────────────────────────────────────────

    let output = thread::Builder::new()
        .name("output".into())
        .spawn(move || output_thread(output_rx))?;
    log::info!("Output thread spawned");

    // ── Scan thread ──────────────────────────────────────────────────

    let track = TrackSlot::default();
    let scan = {
        let worker = ScanLoop::new(
            DutyCycle::new(config.duty),
            calibration_store,
            clock,
            track.clone(),
            cmd_tx.clone(),
            output_tx.clone(),
        );
        thread::Builder::new()
            .name("scan".into())
            .spawn(move || worker.run(scan_rx))?
    };
    log::info!("Scan thread spawned");

    // ── Command thread ───────────────────────────────────────────────

    let command = {
        let probe = HostTrustProbe {
            build_tags: config.build_tags.clone(),
        };
        let worker = CommandLoop::new(
            &config,
            sessions.clone(),
            clock,
            Box::new(probe),
            track,
            scan_tx.clone(),
            output_tx,
        );
        thread::Builder::new()
            .name("command".into())
            .spawn(move || worker.run(cmd_rx))?
    };
    log::info!("Command thread spawned");

    // ── Feed (main thread) ───────────────────────────────────────────

    let fed = feed_loop(&cmd_tx, &scan_tx, &sessions);
    let _ = cmd_tx.send(CommandInput::Shutdown);

    command.join().map_err(|_| anyhow!("command thread panicked"))?;
    scan.join().map_err(|_| anyhow!("scan thread panicked"))?;
    drop(sessions);
    output.join().map_err(|_| anyhow!("output thread panicked"))?;
    log::info!("RollCall stopped");
    fed
}

// ── Feed ─────────────────────────────────────────────────────────────

/// Route stdin lines until EOF. Advertisements only reach the scan thread
/// while the radio is on.
fn feed_loop(
    cmd_tx: &SyncSender<CommandInput>,
    scan_tx: &SyncSender<ScanInput>,
    sessions: &SessionStore,
) -> anyhow::Result<()> {
    let mut reader = LineReader::new();
    let mut stdin = io::stdin().lock();
    let mut chunk = [0u8; 256];

    loop {
        let n = stdin.read(&mut chunk).context("reading stdin")?;
        if n == 0 {
            log::info!("Feed closed");
            return Ok(());
        }
        for &byte in &chunk[..n] {
            let Some(line) = reader.feed(byte) else {
                continue;
            };
            match feed::classify(line) {
                Some(FeedLine::Command(cmd)) => {
                    log::debug!("Command: {:?}", cmd);
                    cmd_tx
                        .send(CommandInput::Host(cmd))
                        .map_err(|_| anyhow!("command thread stopped"))?;
                }
                Some(FeedLine::Observation(obs)) => {
                    if platform::radio_is_on() {
                        let _ = scan_tx.try_send(ScanInput::Radio(RadioEvent::Observation(obs)));
                    }
                }
                Some(FeedLine::Session(policy)) => sessions.upsert(policy),
                None => {}
            }
        }
    }
}

// ── Output ───────────────────────────────────────────────────────────

fn emit(output_tx: &SyncSender<MsgBuffer>, msg: &DeviceMessage) {
    let mut buf = MsgBuffer::new();
    buf.resize_default(MAX_MSG_LEN).ok();
    match comm::serialize_message(msg, &mut buf) {
        Some(len) => {
            buf.truncate(len);
            if output_tx.try_send(buf).is_err() {
                log::warn!("Output queue full, message dropped");
            }
        }
        None => log::error!("Message too large to serialize"),
    }
}

fn emit_error(output_tx: &SyncSender<MsgBuffer>, err: rollcall::Error) {
    let detail = err.to_string();
    emit(
        output_tx,
        &DeviceMessage::Error {
            code: err.code(),
            detail: &detail,
        },
    );
}

/// Sole writer of stdout.
fn output_thread(output_rx: Receiver<MsgBuffer>) {
    log::info!("Output thread started");
    let stdout = io::stdout();

    while let Ok(msg) = output_rx.recv() {
        let mut out = stdout.lock();
        if let Err(e) = out.write_all(&msg).and_then(|_| out.flush()) {
            log::error!("stdout write failed: {}", e);
            break;
        }
    }
}

// ── Scan thread ──────────────────────────────────────────────────────

/// Owns the radio: duty cycle, calibration runs and proximity tracking.
struct ScanLoop {
    radio: FeedRadio,
    duty: DutyCycle,
    calibration: Calibration,
    store: FileCalibrationStore,
    tracker: ProximityTracker,
    tracked: Option<SessionPolicy>,
    targets: TrackSlot,
    detected: bool,
    clock: Clock,
    cmd_tx: SyncSender<CommandInput>,
    output_tx: SyncSender<MsgBuffer>,
}

impl ScanLoop {
    fn new(
        duty: DutyCycle,
        store: FileCalibrationStore,
        clock: Clock,
        targets: TrackSlot,
        cmd_tx: SyncSender<CommandInput>,
        output_tx: SyncSender<MsgBuffer>,
    ) -> Self {
        let tracker = ProximityTracker::new(tracker_config(), load_profile(&store));
        Self {
            radio: FeedRadio { disabled: false },
            duty,
            calibration: Calibration::new(),
            store,
            tracker,
            tracked: None,
            targets,
            detected: false,
            clock,
            cmd_tx,
            output_tx,
        }
    }

    fn run(mut self, rx: Receiver<ScanInput>) {
        log::info!("Scan thread started");
        let mut shutting_down = false;

        loop {
            if let Some(target) = self.targets.take() {
                self.follow(target);
            }
            let now = self.clock.now_ms();
            self.tracker.set_config(tracker_config());
            if !self.calibration.is_collecting() {
                self.reconcile_duty(now, !shutting_down && SCANNING.load(Ordering::Relaxed));
            }
            self.poll_calibration(now);

            if shutting_down && !self.calibration.is_collecting() {
                if self.duty.stop().is_some() {
                    self.radio.stop();
                }
                break;
            }

            let deadline = match (self.duty.next_deadline(), self.calibration.deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match rx.recv_timeout(wait_for(deadline, now)) {
                Ok(ScanInput::Radio(event)) => self.on_radio_event(event),
                Ok(ScanInput::Calibrate { duration_ms }) => self.begin_calibration(duration_ms),
                Ok(ScanInput::Retarget) => {}
                Ok(ScanInput::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    shutting_down = true;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        log::info!("Scan thread stopped");
    }

    fn follow(&mut self, target: Option<SessionPolicy>) {
        match &target {
            Some(p) => log::info!("Tracking beacon for session {}", p.session_id),
            None => log::info!("Tracking stopped"),
        }
        self.tracker.reset();
        self.detected = false;
        self.tracked = target;
    }

    /// Bring the duty cycle in line with the scanning flag, then advance it.
    fn reconcile_duty(&mut self, now: u64, want: bool) {
        if want && !self.duty.is_running() {
            self.duty.start(now);
            if let Err(failure) = self.radio.start() {
                self.duty.stop();
                self.scan_failed(rollcall::Error::from(failure));
                return;
            }
        } else if !want && self.duty.stop().is_some() {
            self.radio.stop();
        }

        if let Err(failure) = self.duty.drive(&mut self.radio, now) {
            self.scan_failed(rollcall::Error::from(failure));
        }
        SCAN_WINDOWS.store(self.duty.windows(), Ordering::Relaxed);
    }

    /// Report once and drop the scanning flag so the failure is not retried.
    fn scan_failed(&mut self, err: rollcall::Error) {
        SCANNING.store(false, Ordering::Relaxed);
        emit_error(&self.output_tx, err);
    }

    fn begin_calibration(&mut self, duration_ms: u64) {
        if self.duty.stop().is_some() {
            self.radio.stop();
        }
        if let Err(e) = self
            .calibration
            .begin(&mut self.radio, self.clock.now_ms(), duration_ms)
        {
            emit_error(&self.output_tx, e);
        }
    }

    fn poll_calibration(&mut self, now: u64) {
        match self.calibration.poll(now, &mut self.radio, &mut self.store) {
            Some(Ok(outcome)) => {
                self.tracker.set_reference(outcome.profile);
                REFERENCE.store(outcome.profile.reference, Ordering::Relaxed);
                emit(
                    &self.output_tx,
                    &DeviceMessage::Calibration {
                        reference: outcome.profile.reference,
                        samples: outcome.samples,
                    },
                );
            }
            Some(Err(e)) => emit_error(&self.output_tx, e),
            None => {}
        }
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Started => log::debug!("Scan window open"),
            RadioEvent::Failed(failure) => {
                let err = if self.calibration.is_collecting() {
                    self.calibration.fail(&mut self.radio, failure)
                } else {
                    if self.duty.stop().is_some() {
                        self.radio.stop();
                    }
                    rollcall::Error::from(failure)
                };
                self.scan_failed(err);
            }
            RadioEvent::Observation(obs) => {
                if self.calibration.is_collecting() {
                    if self.is_reference_beacon(&obs) {
                        self.calibration.on_sample(obs.rssi);
                    }
                    return;
                }
                self.track(obs);
            }
        }
    }

    /// Calibrate against the tracked session's beacon, or any RollCall
    /// beacon when no session is active.
    fn is_reference_beacon(&self, obs: &PresenceObservation) -> bool {
        match &self.tracked {
            Some(policy) => identity::matches(obs, policy, MatchMode::Lenient),
            None => obs.identifier.eq_ignore_ascii_case(BEACON_SERVICE_UUID),
        }
    }

    fn track(&mut self, obs: PresenceObservation) {
        let Some(policy) = &self.tracked else {
            return;
        };
        if !identity::matches(&obs, policy, MatchMode::Lenient) {
            return;
        }

        let update = self.tracker.on_sample(obs.rssi);
        emit(&self.output_tx, &update.to_message(self.clock.now_ms()));

        if update.proximity == Proximity::Close && !self.detected {
            let address = obs.address.clone();
            match self.cmd_tx.try_send(CommandInput::Detection(obs)) {
                Ok(()) => {
                    log::info!("Beacon {} in range, verifying", address);
                    self.detected = true;
                }
                // retried on the next close sample
                Err(TrySendError::Full(_)) => log::warn!("Command queue full, detection deferred"),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

// ── Command thread ───────────────────────────────────────────────────

/// Verification attempt held while the user decides on a clock skew.
struct Attempt {
    verdict: Verdict,
    observation: PresenceObservation,
    trust: DeviceTrust,
}

/// Owns session resolution and verification.
struct CommandLoop {
    resolver: SessionResolver,
    sessions: SessionStore,
    gate: IntegrityGate,
    probe: Box<dyn TrustProbe + Send>,
    config: HostConfig,
    clock: Clock,
    /// Credential being resolved
    awaiting: Option<CredentialString>,
    active: Option<SessionPolicy>,
    pending: Option<Attempt>,
    track: TrackSlot,
    scan_tx: SyncSender<ScanInput>,
    output_tx: SyncSender<MsgBuffer>,
}

impl CommandLoop {
    fn new(
        config: &HostConfig,
        sessions: SessionStore,
        clock: Clock,
        probe: Box<dyn TrustProbe + Send>,
        track: TrackSlot,
        scan_tx: SyncSender<ScanInput>,
        output_tx: SyncSender<MsgBuffer>,
    ) -> Self {
        Self {
            resolver: SessionResolver::new(config.resolver),
            sessions,
            gate: IntegrityGate::default(),
            probe,
            config: config.clone(),
            clock,
            awaiting: None,
            active: None,
            pending: None,
            track,
            scan_tx,
            output_tx,
        }
    }

    fn run(mut self, rx: Receiver<CommandInput>) {
        log::info!("Command thread started");
        let mut draining = false;

        loop {
            if let Err(e) = self.resolver.poll(&mut self.sessions, self.clock.now_ms()) {
                self.resolution_timed_out(e);
            }
            if draining && !self.resolver.is_waiting() {
                break;
            }

            let wait = wait_for(self.resolver.deadline(), self.clock.now_ms());
            match rx.recv_timeout(wait) {
                Ok(CommandInput::Host(cmd)) => self.on_host_command(cmd),
                Ok(CommandInput::Snapshot(watch, snapshot)) => {
                    if let Some(policy) =
                        self.resolver
                            .on_snapshot(&mut self.sessions, watch, &snapshot)
                    {
                        self.activate(policy);
                    }
                }
                Ok(CommandInput::Detection(obs)) => self.verify(obs),
                Ok(CommandInput::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    draining = true;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        self.resolver.abort(&mut self.sessions);
        let _ = self.scan_tx.send(ScanInput::Shutdown);
        log::info!("Command thread stopped");
    }

    fn on_host_command(&mut self, cmd: HostCommand) {
        let mut tuning = tracker_config();
        let mut scanning = SCANNING.load(Ordering::Relaxed);
        let deferred = comm::handle_command(cmd, &mut tuning, &mut scanning);
        set_tracker_config(tuning);
        SCANNING.store(scanning, Ordering::Relaxed);

        match deferred {
            None => {}
            Some(HostCommand::GetStatus) => emit(
                &self.output_tx,
                &DeviceMessage::Status {
                    scanning: SCANNING.load(Ordering::Relaxed),
                    windows: SCAN_WINDOWS.load(Ordering::Relaxed),
                    reference: REFERENCE.load(Ordering::Relaxed),
                    uptime: self.clock.uptime_secs(),
                    version: VERSION,
                },
            ),
            Some(HostCommand::Calibrate { duration_ms }) => {
                if let Err(TrySendError::Full(_)) =
                    self.scan_tx.try_send(ScanInput::Calibrate { duration_ms })
                {
                    log::warn!("Scan queue full, calibration request dropped");
                }
            }
            Some(HostCommand::Resolve { token }) => self.resolve(token),
            Some(HostCommand::ConfirmSkew { accept }) => match self.pending.take() {
                Some(attempt) => {
                    let verdict = attempt.verdict.confirm(accept);
                    self.conclude(verdict, &attempt.observation, attempt.trust);
                }
                None => log::warn!("No verdict awaiting confirmation"),
            },
            Some(other) => log::warn!("Unhandled command {:?}", other),
        }
    }

    fn resolve(&mut self, token: CredentialString) {
        let now = self.clock.now_ms();
        match self.resolver.resolve(&mut self.sessions, &token, now) {
            Ok(Resolution::Resolved(policy)) => self.activate(policy),
            Ok(Resolution::Waiting { deadline_ms }) => {
                log::info!("Waiting up to {} ms for session", deadline_ms.saturating_sub(now));
                emit(
                    &self.output_tx,
                    &DeviceMessage::Session {
                        token: &token,
                        state: "waiting",
                        id: None,
                    },
                );
                self.awaiting = Some(token);
            }
            Err(e) => emit_error(&self.output_tx, e),
        }
    }

    fn resolution_timed_out(&mut self, err: rollcall::Error) {
        if let Some(token) = self.awaiting.take() {
            emit(
                &self.output_tx,
                &DeviceMessage::Session {
                    token: &token,
                    state: "timeout",
                    id: None,
                },
            );
        }
        emit_error(&self.output_tx, err);
    }

    /// A session is live: follow its beacon until a final verdict.
    fn activate(&mut self, policy: SessionPolicy) {
        self.awaiting = None;
        self.pending = None;
        emit(
            &self.output_tx,
            &DeviceMessage::Session {
                token: &policy.credential_token,
                state: "resolved",
                id: Some(policy.session_id.as_str()),
            },
        );
        self.follow(Some(policy.clone()));
        SCANNING.store(true, Ordering::Relaxed);
        self.active = Some(policy);
    }

    /// Never waits on the scan queue; the slot is read on every scan pass.
    fn follow(&self, target: Option<SessionPolicy>) {
        self.track.hand_off(target);
        let _ = self.scan_tx.try_send(ScanInput::Retarget);
    }

    fn location(&self) -> Option<LocationFix> {
        self.config.location.map(|point| LocationFix {
            point,
            accuracy_m: self.config.location_accuracy_m,
            is_mock: self.config.location_mock,
        })
    }

    fn verify(&mut self, obs: PresenceObservation) {
        let Some(policy) = &self.active else {
            log::debug!("Detection with no active session ignored");
            return;
        };
        let location = self.location();
        let trust = probe_device_trust(&*self.probe, location.as_ref());
        let evidence = Evidence {
            observation: &obs,
            policy,
            location: location.as_ref(),
            trust,
            server_time_ms: self.clock.server_time_ms(),
            local_time_ms: self.clock.local_time_ms(),
        };

        let verdict = self.gate.judge(&evidence);
        if !verdict.is_accepted() {
            let all = self.gate.diagnose(&evidence);
            log::info!("Failing checks: {:?}", all.reasons);
        }

        if let Verdict::NeedsConfirmation(_) = verdict {
            emit(&self.output_tx, &verdict.to_message(&policy.session_id));
            self.pending = Some(Attempt {
                verdict,
                observation: obs,
                trust,
            });
            return;
        }
        self.conclude(verdict, &obs, trust);
    }

    /// Publish a final verdict, submit if accepted, and stop tracking.
    fn conclude(&mut self, verdict: Verdict, obs: &PresenceObservation, trust: DeviceTrust) {
        let Some(policy) = self.active.take() else {
            return;
        };
        emit(&self.output_tx, &verdict.to_message(&policy.session_id));

        if verdict.is_accepted() {
            let location = self.location();
            let submission = AttendanceSubmission {
                session_id: &policy.session_id,
                credential_token: &policy.credential_token,
                submitter_id: &self.config.submitter_id,
                beacon_identifier: &obs.identifier,
                beacon_address: &obs.address,
                beacon_rssi: obs.rssi,
                latitude: location.map_or(0.0, |l| l.point.latitude),
                longitude: location.map_or(0.0, |l| l.point.longitude),
                accuracy_m: location.map_or(0.0, |l| l.accuracy_m),
                device_integrity: !trust.is_compromised(),
                mock_location_detected: trust.mock_location,
                status: SUBMISSION_PENDING,
                submitted_at_ms: self.clock.local_time_ms(),
            };
            emit(&self.output_tx, &DeviceMessage::Submission(submission));
        }

        self.follow(None);
        SCANNING.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall::session::GeoPoint;

    struct CleanDevice;

    impl TrustProbe for CleanDevice {
        fn path_exists(&self, _path: &str) -> bool {
            false
        }

        fn build_tags(&self) -> Option<&str> {
            None
        }
    }

    struct Rig {
        cmd: CommandLoop,
        sessions: SessionStore,
        track: TrackSlot,
        scan_rx: Receiver<ScanInput>,
        output_rx: Receiver<MsgBuffer>,
    }

    fn rig_with(config: HostConfig, sessions: SessionStore, scan_capacity: usize) -> Rig {
        let (scan_tx, scan_rx) = mpsc::sync_channel(scan_capacity);
        let (output_tx, output_rx) = mpsc::sync_channel(64);
        let track = TrackSlot::default();
        let cmd = CommandLoop::new(
            &config,
            sessions.clone(),
            Clock::new(config.clock_offset_ms),
            Box::new(CleanDevice),
            track.clone(),
            scan_tx,
            output_tx,
        );
        Rig {
            cmd,
            sessions,
            track,
            scan_rx,
            output_rx,
        }
    }

    fn rig(config: HostConfig) -> Rig {
        let sessions =
            SessionStore::new().with_notifier(Arc::new(|_: WatchId, _: SessionPolicy| {}));
        rig_with(config, sessions, 8)
    }

    fn output(rx: &Receiver<MsgBuffer>) -> Vec<String> {
        rx.try_iter()
            .map(|msg| String::from_utf8(msg.to_vec()).unwrap())
            .collect()
    }

    fn beacon(rssi: i8) -> PresenceObservation {
        PresenceObservation {
            address: "C0:FF:EE:00:11:22".try_into().unwrap(),
            identifier: BEACON_SERVICE_UUID.try_into().unwrap(),
            rssi,
            embedded_token: None,
        }
    }

    fn resolve(token: &str) -> HostCommand {
        HostCommand::Resolve {
            token: CredentialString::try_from(token).unwrap(),
        }
    }

    fn has(lines: &[String], needle: &str) -> bool {
        lines.iter().any(|l| l.contains(needle))
    }

    // ── Resolution ──────────────────────────────────────────────────

    #[test]
    fn resolved_session_is_handed_to_scanner() {
        let mut rig = rig(HostConfig::default());
        rig.sessions.upsert(SessionPolicy::bare("s-1", "QR-1", 0));

        rig.cmd.on_host_command(resolve("QR-1"));

        let lines = output(&rig.output_rx);
        assert!(has(&lines, r#""state":"resolved""#));
        assert!(has(&lines, r#""id":"s-1""#));
        assert!(matches!(rig.track.take(), Some(Some(p)) if p.session_id.as_str() == "s-1"));
        assert!(matches!(rig.scan_rx.try_recv(), Ok(ScanInput::Retarget)));
    }

    #[test]
    fn snapshot_from_store_activates_waiting_resolution() {
        let (cmd_tx, cmd_rx) = mpsc::sync_channel::<CommandInput>(8);
        let notify_tx = Mutex::new(cmd_tx.clone());
        let sessions = SessionStore::new().with_notifier(Arc::new(move |watch, snapshot| {
            let _ = notify_tx
                .lock()
                .unwrap()
                .try_send(CommandInput::Snapshot(watch, snapshot));
        }));
        let mut rig = rig_with(HostConfig::default(), sessions, 8);

        rig.cmd.on_host_command(resolve("QR-9"));
        assert!(rig.cmd.resolver.is_waiting());
        rig.sessions.upsert(SessionPolicy::bare("s-9", "QR-9", 0));
        cmd_tx.send(CommandInput::Shutdown).unwrap();

        let Rig {
            cmd,
            sessions,
            track,
            scan_rx,
            output_rx,
        } = rig;
        thread::spawn(move || cmd.run(cmd_rx)).join().unwrap();

        let lines = output(&output_rx);
        assert!(has(&lines, r#""id":"s-9""#), "{lines:?}");
        assert!(matches!(track.take(), Some(Some(_))));
        assert_eq!(sessions.watch_count(), 0);
        assert!(scan_rx.try_iter().any(|m| matches!(m, ScanInput::Shutdown)));
    }

    #[test]
    fn shutdown_waits_for_resolution_deadline() {
        let mut config = HostConfig::default();
        config.resolver.timeout_ms = 50;
        let mut rig = rig(config);
        rig.cmd.on_host_command(resolve("QR-missing"));

        let (cmd_tx, cmd_rx) = mpsc::sync_channel(4);
        cmd_tx.send(CommandInput::Shutdown).unwrap();
        let Rig {
            cmd,
            scan_rx,
            output_rx,
            sessions,
            ..
        } = rig;
        thread::spawn(move || cmd.run(cmd_rx)).join().unwrap();

        let lines = output(&output_rx);
        assert!(has(&lines, r#""state":"waiting""#));
        assert!(has(&lines, r#""state":"timeout""#));
        assert!(has(&lines, r#""code":"session_timeout""#), "{lines:?}");
        assert_eq!(sessions.watch_count(), 0);
        assert!(scan_rx.try_iter().any(|m| matches!(m, ScanInput::Shutdown)));
    }

    // ── Verification ────────────────────────────────────────────────

    #[test]
    fn accepted_detection_submits_and_stops_tracking() {
        let config = HostConfig {
            location: Some(GeoPoint::new(12.97, 77.59)),
            submitter_id: "student-9".into(),
            ..HostConfig::default()
        };
        let mut rig = rig(config);
        rig.cmd.activate(SessionPolicy::bare("s-1", "QR-1", 0));
        rig.track.take();

        rig.cmd.verify(beacon(-60));

        let lines = output(&rig.output_rx);
        assert!(has(&lines, r#""type":"verdict","session":"s-1","accepted":true"#), "{lines:?}");
        assert!(has(&lines, r#""type":"submission""#));
        assert!(has(&lines, r#""submitterId":"student-9""#));
        assert!(has(&lines, r#""status":"pending""#));
        assert!(matches!(rig.track.take(), Some(None)));
        assert!(rig.cmd.active.is_none());
    }

    #[test]
    fn detection_without_session_is_ignored() {
        let mut rig = rig(HostConfig::default());
        rig.cmd.verify(beacon(-60));
        assert!(output(&rig.output_rx).is_empty());
        assert!(rig.track.take().is_none());
    }

    #[test]
    fn mock_location_is_rejected() {
        let config = HostConfig {
            location: Some(GeoPoint::new(12.97, 77.59)),
            location_mock: true,
            ..HostConfig::default()
        };
        let mut rig = rig(config);
        rig.cmd.activate(SessionPolicy::bare("s-1", "QR-1", 0));

        rig.cmd.verify(beacon(-60));

        let lines = output(&rig.output_rx);
        assert!(has(&lines, r#""reason":"device_integrity_failure""#), "{lines:?}");
        assert!(!has(&lines, "submission"));
    }

    #[test]
    fn clock_skew_waits_for_confirmation() {
        let config = HostConfig {
            clock_offset_ms: -180_000,
            ..HostConfig::default()
        };
        let mut rig = rig(config);
        rig.cmd.activate(SessionPolicy::bare("s-1", "QR-1", 0));
        rig.track.take();

        rig.cmd.verify(beacon(-60));
        let lines = output(&rig.output_rx);
        assert!(has(&lines, r#""pending":"clock_skew_detected""#), "{lines:?}");
        assert!(!has(&lines, "submission"));
        assert!(rig.cmd.pending.is_some());
        assert!(rig.track.take().is_none());

        rig.cmd.on_host_command(HostCommand::ConfirmSkew { accept: true });
        let lines = output(&rig.output_rx);
        assert!(has(&lines, r#""accepted":true"#));
        assert!(has(&lines, r#""type":"submission""#));
        assert!(matches!(rig.track.take(), Some(None)));
    }

    #[test]
    fn declined_clock_skew_is_final() {
        let config = HostConfig {
            clock_offset_ms: 180_000,
            ..HostConfig::default()
        };
        let mut rig = rig(config);
        rig.cmd.activate(SessionPolicy::bare("s-1", "QR-1", 0));
        rig.cmd.verify(beacon(-60));
        output(&rig.output_rx);

        rig.cmd.on_host_command(HostCommand::ConfirmSkew { accept: false });
        let lines = output(&rig.output_rx);
        assert!(has(&lines, r#""reason":"clock_skew_rejected""#), "{lines:?}");
        assert!(!has(&lines, "submission"));
        assert!(rig.cmd.pending.is_none());
    }

    // ── Thread hand-offs ────────────────────────────────────────────

    #[test]
    fn verdict_never_waits_on_full_scan_queue() {
        let sessions =
            SessionStore::new().with_notifier(Arc::new(|_: WatchId, _: SessionPolicy| {}));
        let mut rig = rig_with(HostConfig::default(), sessions, 1);
        rig.cmd.scan_tx.try_send(ScanInput::Shutdown).unwrap();

        rig.cmd.activate(SessionPolicy::bare("s-1", "QR-1", 0));
        rig.cmd.verify(beacon(-60));

        assert!(matches!(rig.track.take(), Some(None)));
        assert!(matches!(rig.scan_rx.try_recv(), Ok(ScanInput::Shutdown)));
    }

    #[test]
    fn detection_is_retried_when_command_queue_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let (cmd_tx, cmd_rx) = mpsc::sync_channel(1);
        let (output_tx, _output_rx) = mpsc::sync_channel(64);
        let track = TrackSlot::default();
        let mut scan = ScanLoop::new(
            DutyCycle::default(),
            FileCalibrationStore::new(dir.path()),
            Clock::new(0),
            track.clone(),
            cmd_tx.clone(),
            output_tx,
        );
        track.hand_off(Some(SessionPolicy::bare("s-1", "QR-1", 0)));
        scan.follow(track.take().unwrap());

        cmd_tx.try_send(CommandInput::Shutdown).unwrap();
        for _ in 0..4 {
            scan.on_radio_event(RadioEvent::Observation(beacon(-50)));
        }
        assert!(!scan.detected);

        assert!(matches!(cmd_rx.try_recv(), Ok(CommandInput::Shutdown)));
        scan.on_radio_event(RadioEvent::Observation(beacon(-50)));
        assert!(matches!(cmd_rx.try_recv(), Ok(CommandInput::Detection(_))));
        assert!(scan.detected);

        scan.on_radio_event(RadioEvent::Observation(beacon(-50)));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[test]
    fn newer_track_target_overwrites_older() {
        let slot = TrackSlot::default();
        slot.hand_off(Some(SessionPolicy::bare("s-1", "QR-1", 0)));
        slot.hand_off(None);
        assert!(matches!(slot.take(), Some(None)));
        assert!(slot.take().is_none());
    }
}
