//! The single owner of session state.
//!
//! `SessionStore` persists the session, arms one expiry timer per session,
//! and broadcasts lifecycle events so UI code can notify the user and
//! navigate back to the entry page. `create`, `destroy`, `invalidate` and
//! timer expiry are serialized by a lifecycle mutex; persistence I/O runs
//! under that mutex only, so reads of the state lock never wait on disk.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::persistence::{FilePersistence, MemoryPersistence, SessionPersistence};
use super::{CredentialMaterial, CredentialStore, Session, UserProfile};
use crate::config::Config;

/// Buffered lifecycle events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Cap for absurd timeouts
const MAX_SESSION_DAYS: i64 = 36_500;

/// Outcome of checking a protected view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    /// Stop initializing and navigate to the entry page
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Logout,
    Expired,
    /// The server refused the session's credentials
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created,
    /// Shown to the user before an expired session is torn down
    ExpiryNotice,
    /// Session is gone; protected views must navigate to the entry page
    Ended { reason: EndReason },
}

/// Credential and session generation, read together under one lock.
#[derive(Debug, Clone)]
pub struct AuthSnapshot {
    pub credential: CredentialMaterial,
    pub generation: u64,
}

/// Clone is cheap: all clones share the same state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

struct Inner {
    /// Held across a whole mutation, persistence included
    lifecycle: Mutex<()>,
    state: RwLock<State>,
    timeout: Duration,
    persistence: Box<dyn SessionPersistence>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    /// Bumped by every install; lets stale timers and 401s be ignored
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl SessionStore {
    pub fn new<P>(timeout: Duration, persistence: P) -> Self
    where
        P: SessionPersistence + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                lifecycle: Mutex::new(()),
                state: RwLock::new(State::default()),
                timeout,
                persistence: Box::new(persistence),
                events,
            }),
        }
    }

    /// Process-lifetime session, nothing written to disk
    pub fn in_memory(timeout: Duration) -> Self {
        Self::new(timeout, MemoryPersistence::new())
    }

    /// File-backed store in the configured namespace
    pub fn from_config(config: &Config) -> Result<Self> {
        let persistence = FilePersistence::new(
            config.session_dir()?,
            CredentialStore::new(&config.storage_namespace),
        );
        Ok(Self::new(config.session_timeout(), persistence))
    }

    /// Start a session, replacing any existing one and re-arming the expiry
    /// timer. Must be called from within a Tokio runtime.
    pub fn create(&self, credential: CredentialMaterial, profile: Option<UserProfile>) {
        let cap = chrono::Duration::days(MAX_SESSION_DAYS);
        let lifetime = chrono::Duration::from_std(self.inner.timeout)
            .map(|lifetime| lifetime.min(cap))
            .unwrap_or(cap);
        let expire_after = lifetime.to_std().unwrap_or(self.inner.timeout);
        let session = Session::new(credential, profile, Utc::now(), lifetime);

        let scheme = session.credential.scheme();
        let generation = self.inner.install(session, expire_after, true);
        info!(generation, scheme, "Session created");
    }

    /// Reinstall a persisted session. Returns false when there is none or
    /// its expiry has already passed.
    pub fn restore(&self) -> bool {
        let session = match self.inner.persistence.load() {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Failed to load session, discarding it");
                if let Err(e) = self.inner.persistence.clear() {
                    warn!(error = %e, "Failed to clear unreadable session");
                }
                return false;
            }
        };

        let now = Utc::now();
        if session.is_expired_at(now) {
            debug!(expires_at = %session.expires_at, "Persisted session already expired");
            if let Err(e) = self.inner.persistence.clear() {
                warn!(error = %e, "Failed to clear expired session");
            }
            return false;
        }

        let remaining = session.time_until_expiry(now).to_std().unwrap_or_default();
        let generation = self.inner.install(session, remaining, false);
        info!(generation, remaining_secs = remaining.as_secs(), "Session restored");
        true
    }

    /// Tear down the session. Safe to call when there is none.
    pub fn destroy(&self) {
        let _lifecycle = self.inner.lifecycle();
        self.inner.end(EndReason::Logout);
    }

    /// Tear down the session because the server rejected it, unless a newer
    /// session has replaced the one that was rejected.
    pub fn invalidate(&self, generation: u64) -> bool {
        let _lifecycle = self.inner.lifecycle();
        let current = self.inner.read().generation;
        if current != generation {
            debug!(generation, current, "Ignoring rejection of replaced session");
            return false;
        }
        self.inner.end(EndReason::Rejected)
    }

    pub fn current_credential(&self) -> Option<CredentialMaterial> {
        self.inner.read().session.as_ref().map(|s| s.credential.clone())
    }

    pub fn current_profile(&self) -> Option<UserProfile> {
        self.inner.read().session.as_ref().and_then(|s| s.profile.clone())
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.read().session.clone()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().session.as_ref().map(|s| s.expires_at)
    }

    /// True iff credential material is present. Does not consult the clock;
    /// expiry happens only when the timer fires.
    pub fn is_active(&self) -> bool {
        self.inner.read().session.is_some()
    }

    pub fn authorization(&self) -> Option<AuthSnapshot> {
        let state = self.inner.read();
        state.session.as_ref().map(|s| AuthSnapshot {
            credential: s.credential.clone(),
            generation: state.generation,
        })
    }

    pub fn guard(&self) -> GuardDecision {
        if self.is_active() {
            GuardDecision::Allow
        } else {
            GuardDecision::Redirect
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the current session and arm a fresh timer. The previous
    /// timer is cancelled first so only one is ever pending.
    fn install(self: &Arc<Self>, session: Session, expire_after: Duration, persist: bool) -> u64 {
        let _lifecycle = self.lifecycle();
        if persist {
            if let Err(e) = self.persistence.save(&session) {
                warn!(error = %e, "Failed to save session");
            }
        }

        let mut state = self.write();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        state.session = Some(session);
        state.timer = Some(arm_timer(Arc::downgrade(self), state.generation, expire_after));
        let _ = self.events.send(SessionEvent::Created);
        state.generation
    }

    fn expire(&self, generation: u64) {
        let _lifecycle = self.lifecycle();
        {
            let mut state = self.write();
            if state.generation != generation || state.session.is_none() {
                debug!(generation, "Stale expiry timer ignored");
                return;
            }
            // This is the running timer; dropping the handle detaches it
            state.timer = None;
        }
        let _ = self.events.send(SessionEvent::ExpiryNotice);
        self.end(EndReason::Expired);
    }

    /// Caller holds the lifecycle lock.
    fn end(&self, reason: EndReason) -> bool {
        if let Err(e) = self.persistence.clear() {
            warn!(error = %e, "Failed to clear persisted session");
        }

        let mut state = self.write();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let ended = state.session.take().is_some();
        if ended {
            info!(?reason, generation = state.generation, "Session ended");
            let _ = self.events.send(SessionEvent::Ended { reason });
        }
        ended
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

fn arm_timer(inner: Weak<Inner>, generation: u64, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(generation);
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use tokio::sync::broadcast::error::TryRecvError;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    fn ended(reason: EndReason) -> SessionEvent {
        SessionEvent::Ended { reason }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_makes_session_active() {
        let store = SessionStore::in_memory(TIMEOUT);
        assert!(!store.is_active());
        assert!(store.current_credential().is_none());

        let cred = CredentialMaterial::token("abc");
        let profile = UserProfile::new("7", "Alice");
        store.create(cred.clone(), Some(profile.clone()));

        assert!(store.is_active());
        assert_eq!(store.current_credential(), Some(cred));
        assert_eq!(store.current_profile(), Some(profile));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_profile_does_not_block() {
        let store = SessionStore::in_memory(TIMEOUT);
        store.create(CredentialMaterial::basic("alice", "pw"), None);
        assert!(store.is_active());
        assert!(store.current_profile().is_none());
        assert!(store.authorization().is_some());
        assert_eq!(store.guard(), GuardDecision::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent() {
        let store = SessionStore::in_memory(TIMEOUT);
        let mut rx = store.subscribe();
        store.create(CredentialMaterial::token("abc"), None);

        store.destroy();
        assert!(!store.is_active());
        assert!(store.current_session().is_none());
        store.destroy();
        assert!(!store.is_active());
        assert!(store.current_session().is_none());

        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::Created, ended(EndReason::Logout)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_on_empty_store() {
        let store = SessionStore::in_memory(TIMEOUT);
        let mut rx = store.subscribe();
        store.destroy();
        assert!(!store.is_active());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_redirects_without_session() {
        let store = SessionStore::in_memory(TIMEOUT);
        assert_eq!(store.guard(), GuardDecision::Redirect);
        store.create(CredentialMaterial::token("abc"), None);
        assert_eq!(store.guard(), GuardDecision::Allow);
        store.destroy();
        assert_eq!(store.guard(), GuardDecision::Redirect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expires_session() {
        let store = SessionStore::in_memory(TIMEOUT);
        let mut rx = store.subscribe();
        store.create(CredentialMaterial::token("abc"), None);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(store.is_active());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.is_active());
        assert_eq!(store.guard(), GuardDecision::Redirect);
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Created,
                SessionEvent::ExpiryNotice,
                ended(EndReason::Expired),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreate_cancels_prior_timer() {
        let store = SessionStore::in_memory(TIMEOUT);
        let mut rx = store.subscribe();

        store.create(CredentialMaterial::token("first"), None);
        tokio::time::sleep(Duration::from_secs(30)).await;
        store.create(CredentialMaterial::token("second"), None);

        // Past the first timer's deadline
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(store.is_active());
        assert_eq!(store.current_credential(), Some(CredentialMaterial::token("second")));
        assert_eq!(drain(&mut rx), vec![SessionEvent::Created, SessionEvent::Created]);

        // Past the second timer's deadline
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!store.is_active());
        let notices = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == SessionEvent::ExpiryNotice)
            .count();
        assert_eq!(notices, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_timer() {
        let store = SessionStore::in_memory(TIMEOUT);
        let mut rx = store.subscribe();
        store.create(CredentialMaterial::token("abc"), None);
        store.destroy();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::Created, ended(EndReason::Logout)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_do_not_check_wall_clock() {
        // Activity is timer-driven: a session whose expires_at has passed by
        // the wall clock still reads as active until the timer fires.
        let store = SessionStore::in_memory(TIMEOUT);
        store.create(CredentialMaterial::token("abc"), None);

        let session = store.current_session().expect("session");
        let skewed_now = session.expires_at + chrono::Duration::seconds(5);
        assert!(session.is_expired_at(skewed_now));
        assert!(store.is_active());
        assert_eq!(store.guard(), GuardDecision::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_respects_generation() {
        let store = SessionStore::in_memory(TIMEOUT);
        let mut rx = store.subscribe();

        store.create(CredentialMaterial::token("old"), None);
        let old = store.authorization().expect("snapshot").generation;
        store.create(CredentialMaterial::token("new"), None);
        let new = store.authorization().expect("snapshot").generation;
        assert_ne!(old, new);

        assert!(!store.invalidate(old));
        assert!(store.is_active());

        assert!(store.invalidate(new));
        assert!(!store.is_active());
        assert!(!store.invalidate(new));

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Created,
                SessionEvent::Created,
                ended(EndReason::Rejected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_follows_lifecycle() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = SessionStore::new(TIMEOUT, persistence.clone());

        store.create(CredentialMaterial::token("abc"), None);
        let saved = persistence.load().unwrap().expect("saved session");
        assert_eq!(saved.credential, CredentialMaterial::token("abc"));

        store.destroy();
        assert!(persistence.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_rearms_remaining_time() {
        let session = Session::new(
            CredentialMaterial::token("abc"),
            Some(UserProfile::new("7", "Alice")),
            Utc::now() - chrono::Duration::seconds(30),
            chrono::Duration::seconds(60),
        );
        let store = SessionStore::new(TIMEOUT, MemoryPersistence::with_session(session));
        let mut rx = store.subscribe();

        assert!(store.restore());
        assert!(store.is_active());
        assert_eq!(store.current_profile(), Some(UserProfile::new("7", "Alice")));

        // Roughly 30s were left, not the full timeout
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!store.is_active());
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Created,
                SessionEvent::ExpiryNotice,
                ended(EndReason::Expired),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_discards_expired_session() {
        let session = Session::new(
            CredentialMaterial::token("abc"),
            None,
            Utc::now() - chrono::Duration::minutes(20),
            chrono::Duration::minutes(10),
        );
        let persistence = Arc::new(MemoryPersistence::with_session(session));
        let store = SessionStore::new(TIMEOUT, persistence.clone());

        assert!(!store.restore());
        assert!(!store.is_active());
        assert!(persistence.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_with_nothing_saved() {
        let store = SessionStore::in_memory(TIMEOUT);
        assert!(!store.restore());
        assert_eq!(store.guard(), GuardDecision::Redirect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_is_capped() {
        let store = SessionStore::in_memory(Duration::from_secs(10_000_000_000_000));
        store.create(CredentialMaterial::token("abc"), None);

        assert!(store.is_active());
        let session = store.current_session().expect("session");
        let lifetime = session.expires_at - session.created_at;
        assert_eq!(lifetime, chrono::Duration::days(MAX_SESSION_DAYS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_session_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store =
                SessionStore::new(TIMEOUT, FilePersistence::without_keychain(dir.path().to_path_buf()));
            store.create(
                CredentialMaterial::token("abc"),
                Some(UserProfile::new("7", "Alice")),
            );
        }

        let store =
            SessionStore::new(TIMEOUT, FilePersistence::without_keychain(dir.path().to_path_buf()));
        assert!(store.restore());
        assert_eq!(store.current_credential(), Some(CredentialMaterial::token("abc")));
        assert_eq!(store.current_profile(), Some(UserProfile::new("7", "Alice")));

        store.destroy();
        let fresh =
            SessionStore::new(TIMEOUT, FilePersistence::without_keychain(dir.path().to_path_buf()));
        assert!(!fresh.restore());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_discards_unreadable_session() {
        let dir = tempfile::tempdir().unwrap();
        let session_file = dir.path().join("session.json");
        std::fs::write(&session_file, "{not json").unwrap();

        let store =
            SessionStore::new(TIMEOUT, FilePersistence::without_keychain(dir.path().to_path_buf()));
        assert!(!store.restore());
        assert!(!store.is_active());
        assert!(!session_file.exists());
    }

    /// Reads the store from inside persistence calls
    #[derive(Default)]
    struct ObservingPersistence {
        store: OnceLock<SessionStore>,
        seen_active: Mutex<Vec<bool>>,
    }

    impl ObservingPersistence {
        fn observe(&self) {
            if let Some(store) = self.store.get() {
                self.seen_active.lock().unwrap().push(store.is_active());
            }
        }
    }

    impl SessionPersistence for ObservingPersistence {
        fn load(&self) -> Result<Option<Session>> {
            Ok(None)
        }

        fn save(&self, _session: &Session) -> Result<()> {
            self.observe();
            Ok(())
        }

        fn clear(&self) -> Result<()> {
            self.observe();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_not_blocked_by_persistence() {
        let persistence = Arc::new(ObservingPersistence::default());
        let store = SessionStore::new(TIMEOUT, persistence.clone());
        let _ = persistence.store.set(store.clone());

        store.create(CredentialMaterial::token("first"), None);
        store.create(CredentialMaterial::token("second"), None);
        store.destroy();

        // Persistence runs before the in-memory state changes
        assert_eq!(*persistence.seen_active.lock().unwrap(), vec![false, true, true]);
        assert!(!store.is_active());
    }
}
