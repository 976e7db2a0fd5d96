//! In-memory session store with change watches.
//!
//! Stands in for the remote document store. Records are loaded from an
//! NDJSON file at start and upserted from the feed while running; every
//! upsert is pushed to the watches on its credential, and a new watch is
//! sent the records it already covers.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rollcall::resolver::{SessionSource, WatchId};
use rollcall::session::SessionPolicy;
use rollcall::Error;

/// Receives `(watch, snapshot)` for every change a watch covers.
pub type Notifier = Arc<dyn Fn(WatchId, SessionPolicy) + Send + Sync>;

struct Watch {
    id: WatchId,
    token: String,
}

#[derive(Default)]
struct Inner {
    sessions: Vec<SessionPolicy>,
    watches: Vec<Watch>,
    next_watch: WatchId,
}

#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<Inner>>,
    notifier: Option<Notifier>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver watch snapshots through `notifier`. Without one, watches
    /// cannot be installed.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Load one record per line. Blank lines and `#` comments are skipped.
    pub fn load_ndjson(&self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut count = 0;
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let policy = SessionPolicy::from_json(line.as_bytes())
                .with_context(|| format!("{}:{}", path.display(), n + 1))?;
            self.upsert(policy);
            count += 1;
        }
        Ok(count)
    }

    /// Insert or replace by session id, then notify matching watches.
    pub fn upsert(&self, policy: SessionPolicy) {
        let watchers: Vec<WatchId> = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner
                .sessions
                .iter()
                .position(|s| s.session_id == policy.session_id)
            {
                Some(i) => inner.sessions[i] = policy.clone(),
                None => inner.sessions.push(policy.clone()),
            }
            inner
                .watches
                .iter()
                .filter(|w| w.token == policy.credential_token.as_str())
                .map(|w| w.id)
                .collect()
        };
        log::debug!(
            "session {} stored (active={}), {} watcher(s)",
            policy.session_id,
            policy.is_active,
            watchers.len()
        );

        if let Some(notify) = &self.notifier {
            for id in watchers {
                notify(id, policy.clone());
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionPolicy> {
        self.lock()
            .sessions
            .iter()
            .find(|s| s.session_id.as_str() == session_id)
            .cloned()
    }

    pub fn watch_count(&self) -> usize {
        self.lock().watches.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionSource for SessionStore {
    fn find_active(&mut self, token: &str) -> rollcall::Result<Option<SessionPolicy>> {
        Ok(self
            .lock()
            .sessions
            .iter()
            .find(|s| s.accepts_credential(token))
            .cloned())
    }

    fn watch(&mut self, token: &str) -> rollcall::Result<WatchId> {
        let Some(notify) = self.notifier.clone() else {
            log::error!("no notifier configured for session watches");
            return Err(Error::SubscriptionFailed);
        };
        let (id, current) = {
            let mut inner = self.lock();
            inner.next_watch = inner.next_watch.wrapping_add(1);
            let id = inner.next_watch;
            inner.watches.push(Watch {
                id,
                token: token.to_string(),
            });
            let current: Vec<SessionPolicy> = inner
                .sessions
                .iter()
                .filter(|s| s.credential_token.as_str() == token)
                .cloned()
                .collect();
            (id, current)
        };

        for policy in current {
            notify(id, policy);
        }
        Ok(id)
    }

    fn cancel(&mut self, watch: WatchId) {
        let mut inner = self.lock();
        let before = inner.watches.len();
        inner.watches.retain(|w| w.id != watch);
        if inner.watches.len() == before {
            log::warn!("cancel of unknown watch {}", watch);
        }
    }
}
