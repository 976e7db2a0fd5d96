/// Credential-to-session resolution.
///
/// A scanned credential may arrive before the instructor's session is
/// visible in storage. The resolver looks it up once and, failing that,
/// watches for it until a deadline. Storage is reached through
/// [`SessionSource`]; watch snapshots and time are fed in by the caller.
use crate::defaults::RESOLVE_TIMEOUT_MS;
use crate::error::{Error, Result};
use crate::protocol::CredentialString;
use crate::session::{bounded, SessionPolicy};

/// Handle of an installed watch.
pub type WatchId = u32;

/// Session storage as the resolver needs it.
pub trait SessionSource {
    /// Active session whose credential equals `token`, if any.
    fn find_active(&mut self, token: &str) -> Result<Option<SessionPolicy>>;

    /// Start delivering snapshots of sessions with credential `token`.
    fn watch(&mut self, token: &str) -> Result<WatchId>;

    /// Stop a watch. Called exactly once per installed watch.
    fn cancel(&mut self, watch: WatchId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// How long to wait for the session to appear
    pub timeout_ms: u64,
}

impl ResolverConfig {
    pub const fn new() -> Self {
        Self {
            timeout_ms: RESOLVE_TIMEOUT_MS,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(SessionPolicy),
    /// A watch is installed; feed snapshots and poll until the deadline.
    Waiting { deadline_ms: u64 },
}

#[derive(Debug)]
struct PendingWatch {
    id: WatchId,
    token: CredentialString,
    deadline_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionResolver {
    config: ResolverConfig,
    pending: Option<PendingWatch>,
}

impl SessionResolver {
    pub const fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            pending: None,
        }
    }

    pub fn config(&self) -> ResolverConfig {
        self.config
    }

    pub fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.deadline_ms)
    }

    /// Look `token` up, installing a watch if it is not active yet.
    pub fn resolve<S: SessionSource + ?Sized>(
        &mut self,
        source: &mut S,
        token: &str,
        now_ms: u64,
    ) -> Result<Resolution> {
        if self.pending.is_some() {
            return Err(Error::ResolutionInProgress);
        }

        let found = source.find_active(token).map_err(|e| {
            log::error!("session lookup failed: {}", e);
            Error::SessionSource
        })?;
        if let Some(policy) = found.filter(|p| p.accepts_credential(token)) {
            log::info!("credential resolved to session {}", policy.session_id);
            return Ok(Resolution::Resolved(policy));
        }

        let id = source.watch(token).map_err(|e| {
            log::error!("session watch failed: {}", e);
            Error::SubscriptionFailed
        })?;

        // A session stored between the lookup and the watch produces no
        // further change, so look once more with the watch in place.
        match source.find_active(token) {
            Ok(Some(policy)) if policy.accepts_credential(token) => {
                source.cancel(id);
                log::info!("credential resolved to session {} while watching", policy.session_id);
                return Ok(Resolution::Resolved(policy));
            }
            Ok(_) => {}
            Err(e) => log::warn!("session re-check failed, waiting on watch: {}", e),
        }
        let deadline_ms = now_ms.saturating_add(self.config.timeout_ms);
        self.pending = Some(PendingWatch {
            id,
            token: bounded(token),
            deadline_ms,
        });
        log::info!("waiting up to {} ms for session", self.config.timeout_ms);
        Ok(Resolution::Waiting { deadline_ms })
    }

    /// Offer one watch snapshot. Returns the session once an active match
    /// arrives; the watch is cancelled at that point.
    pub fn on_snapshot<S: SessionSource + ?Sized>(
        &mut self,
        source: &mut S,
        watch: WatchId,
        snapshot: &SessionPolicy,
    ) -> Option<SessionPolicy> {
        let pending = self.pending.as_ref()?;
        if pending.id != watch {
            return None;
        }
        if !snapshot.accepts_credential(&pending.token) {
            log::debug!(
                "ignoring snapshot of session {} (active={})",
                snapshot.session_id,
                snapshot.is_active
            );
            return None;
        }

        self.cancel_pending(source);
        log::info!("session {} became active", snapshot.session_id);
        Some(snapshot.clone())
    }

    /// Expire the watch once its deadline has passed.
    pub fn poll<S: SessionSource + ?Sized>(&mut self, source: &mut S, now_ms: u64) -> Result<()> {
        match self.deadline() {
            Some(deadline) if now_ms >= deadline => {
                self.cancel_pending(source);
                log::warn!("no active session appeared before the deadline");
                Err(Error::SessionResolutionTimeout)
            }
            _ => Ok(()),
        }
    }

    /// Give up waiting. No-op when idle.
    pub fn abort<S: SessionSource + ?Sized>(&mut self, source: &mut S) {
        self.cancel_pending(source);
    }

    fn cancel_pending<S: SessionSource + ?Sized>(&mut self, source: &mut S) {
        if let Some(pending) = self.pending.take() {
            source.cancel(pending.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeSource {
        sessions: std::vec::Vec<SessionPolicy>,
        next_watch: WatchId,
        watches: u32,
        cancels: std::vec::Vec<WatchId>,
        lookup_broken: bool,
        watch_broken: bool,
    }

    impl SessionSource for FakeSource {
        fn find_active(&mut self, token: &str) -> Result<Option<SessionPolicy>> {
            if self.lookup_broken {
                return Err(Error::SessionSource);
            }
            Ok(self
                .sessions
                .iter()
                .find(|s| s.accepts_credential(token))
                .cloned())
        }

        fn watch(&mut self, _token: &str) -> Result<WatchId> {
            if self.watch_broken {
                return Err(Error::SubscriptionFailed);
            }
            self.watches += 1;
            self.next_watch += 1;
            Ok(self.next_watch)
        }

        fn cancel(&mut self, watch: WatchId) {
            self.cancels.push(watch);
        }
    }

    /// Stores its session the moment the first lookup comes back empty,
    /// as a concurrent writer would.
    #[derive(Default)]
    struct LateWriter {
        inner: FakeSource,
        lookups: u32,
    }

    impl SessionSource for LateWriter {
        fn find_active(&mut self, token: &str) -> Result<Option<SessionPolicy>> {
            let found = self.inner.find_active(token);
            self.lookups += 1;
            if self.lookups == 1 {
                self.inner.sessions.push(SessionPolicy::bare("s-1", token, 0));
            }
            found
        }

        fn watch(&mut self, token: &str) -> Result<WatchId> {
            self.inner.watch(token)
        }

        fn cancel(&mut self, watch: WatchId) {
            self.inner.cancel(watch)
        }
    }

    // ── Direct lookup ───────────────────────────────────────────────

    #[test]
    fn active_session_resolves_immediately() {
        let mut source = FakeSource::default();
        source.sessions.push(SessionPolicy::bare("s-1", "QR-1", 0));
        let mut r = SessionResolver::default();

        let res = r.resolve(&mut source, "QR-1", 0).unwrap();
        assert!(matches!(res, Resolution::Resolved(p) if p.session_id.as_str() == "s-1"));
        assert_eq!(source.watches, 0);
        assert!(!r.is_waiting());
    }

    #[test]
    fn session_stored_between_lookup_and_watch_resolves() {
        let mut source = LateWriter::default();
        let mut r = SessionResolver::default();

        let res = r.resolve(&mut source, "QR", 0).unwrap();
        assert!(matches!(res, Resolution::Resolved(p) if p.session_id.as_str() == "s-1"));
        assert!(!r.is_waiting());
        assert_eq!(source.inner.watches, 1);
        assert_eq!(source.inner.cancels, [1]);
        assert_eq!(r.poll(&mut source, 60_000), Ok(()));
    }

    #[test]
    fn failed_recheck_keeps_waiting() {
        struct FlakySource {
            inner: FakeSource,
            lookups: u32,
        }
        impl SessionSource for FlakySource {
            fn find_active(&mut self, token: &str) -> Result<Option<SessionPolicy>> {
                self.lookups += 1;
                if self.lookups > 1 {
                    return Err(Error::SessionSource);
                }
                self.inner.find_active(token)
            }
            fn watch(&mut self, token: &str) -> Result<WatchId> {
                self.inner.watch(token)
            }
            fn cancel(&mut self, watch: WatchId) {
                self.inner.cancel(watch)
            }
        }

        let mut source = FlakySource {
            inner: FakeSource::default(),
            lookups: 0,
        };
        let mut r = SessionResolver::default();
        let res = r.resolve(&mut source, "QR", 0).unwrap();
        assert_eq!(res, Resolution::Waiting { deadline_ms: 20_000 });
        assert!(source.inner.cancels.is_empty());
    }

    #[test]
    fn lookup_error_propagates() {
        let mut source = FakeSource {
            lookup_broken: true,
            ..Default::default()
        };
        let mut r = SessionResolver::default();
        assert_eq!(r.resolve(&mut source, "QR", 0), Err(Error::SessionSource));
        assert_eq!(source.watches, 0);
    }

    #[test]
    fn watch_failure_leaves_nothing_installed() {
        let mut source = FakeSource {
            watch_broken: true,
            ..Default::default()
        };
        let mut r = SessionResolver::default();
        assert_eq!(r.resolve(&mut source, "QR", 0), Err(Error::SubscriptionFailed));
        assert!(!r.is_waiting());
        r.abort(&mut source);
        assert!(source.cancels.is_empty());
    }

    // ── Waiting on a watch ──────────────────────────────────────────

    #[test]
    fn session_appearing_mid_wait_resolves_and_cancels_once() {
        let mut source = FakeSource::default();
        let mut r = SessionResolver::default();

        let res = r.resolve(&mut source, "QR-late", 0).unwrap();
        assert_eq!(res, Resolution::Waiting { deadline_ms: 20_000 });
        assert_eq!(r.poll(&mut source, 4_999), Ok(()));

        // Instructor opens the session 5 s in.
        let session = SessionPolicy::bare("s-late", "QR-late", 5_000);
        source.sessions.push(session.clone());
        let resolved = r.on_snapshot(&mut source, 1, &session).unwrap();
        assert_eq!(resolved.session_id.as_str(), "s-late");

        assert_eq!(r.poll(&mut source, 25_000), Ok(()));
        r.abort(&mut source);
        assert_eq!(source.cancels, [1]);
    }

    #[test]
    fn deadline_times_out_and_cancels_once() {
        let mut source = FakeSource::default();
        let mut r = SessionResolver::new(ResolverConfig { timeout_ms: 1_000 });
        r.resolve(&mut source, "QR", 100).unwrap();
        assert_eq!(r.poll(&mut source, 1_099), Ok(()));
        assert_eq!(r.poll(&mut source, 1_100), Err(Error::SessionResolutionTimeout));
        assert_eq!(r.poll(&mut source, 5_000), Ok(()));
        r.abort(&mut source);
        assert_eq!(source.cancels.len(), 1);
    }

    #[test]
    fn huge_timeout_never_expires_early() {
        let mut source = FakeSource::default();
        let mut r = SessionResolver::new(ResolverConfig { timeout_ms: u64::MAX });
        let res = r.resolve(&mut source, "QR", 5_000).unwrap();
        assert_eq!(res, Resolution::Waiting { deadline_ms: u64::MAX });
        assert_eq!(r.poll(&mut source, 5_001), Ok(()));
        assert!(r.is_waiting());
    }

    #[test]
    fn inactive_snapshot_is_ignored() {
        let mut source = FakeSource::default();
        let mut r = SessionResolver::default();
        r.resolve(&mut source, "QR", 0).unwrap();

        let mut ended = SessionPolicy::bare("s", "QR", 0);
        ended.close(1);
        assert!(r.on_snapshot(&mut source, 1, &ended).is_none());
        assert!(r.is_waiting());
        assert!(source.cancels.is_empty());
    }

    #[test]
    fn snapshot_for_other_watch_is_ignored() {
        let mut source = FakeSource::default();
        let mut r = SessionResolver::default();
        r.resolve(&mut source, "QR", 0).unwrap();
        let s = SessionPolicy::bare("s", "QR", 0);
        assert!(r.on_snapshot(&mut source, 7, &s).is_none());
        assert!(r.is_waiting());
    }

    #[test]
    fn second_resolve_while_waiting_is_rejected() {
        let mut source = FakeSource::default();
        let mut r = SessionResolver::default();
        r.resolve(&mut source, "A", 0).unwrap();
        assert_eq!(r.resolve(&mut source, "B", 0), Err(Error::ResolutionInProgress));
        assert_eq!(source.watches, 1);
    }

    #[test]
    fn abort_cancels_exactly_once() {
        let mut source = FakeSource::default();
        let mut r = SessionResolver::default();
        r.resolve(&mut source, "QR", 0).unwrap();
        r.abort(&mut source);
        r.abort(&mut source);
        assert_eq!(source.cancels, [1]);
        // A fresh resolution is allowed afterwards.
        assert!(r.resolve(&mut source, "QR", 0).is_ok());
    }
}
