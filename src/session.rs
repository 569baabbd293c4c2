//! Test sessions and the registry shared between control channels, the
//! reflector and the expiry sweep.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

/// Default idle time after which a session is expired.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Lifecycle of a test session. Only `Active` sessions are reflected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Configured,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Configured => write!(f, "configured"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Registry-assigned identity of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A negotiated test session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Session identifier chosen by the requester.
    pub sid: u32,
    /// Where the requester says its test packets come from.
    pub test_peer: SocketAddrV4,
    pub state: SessionState,
    /// Last time a control message arrived for this session.
    pub last_activity: Instant,
}

impl Session {
    /// A session fresh out of Request-Session, ready to be started.
    pub fn configured(sid: u32, test_peer: SocketAddrV4) -> Self {
        Session {
            sid,
            test_peer,
            state: SessionState::Configured,
            last_activity: Instant::now(),
        }
    }

    /// True if datagrams from `src` belong to this session.
    ///
    /// Only the IP is compared: the far side's test port is ephemeral.
    pub fn matches(&self, src: &SocketAddr) -> bool {
        self.state == SessionState::Active && src.ip() == IpAddr::V4(*self.test_peer.ip())
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > ttl
    }
}

/// Concurrent set of live sessions guarded by a single lock.
///
/// The lock is taken once per call and released before returning, so no
/// caller can hold it across an await point.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Session>>,
    next_key: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Session>> {
        // Each critical section is a single map operation, so poisoning is ignored.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a session and returns its key. Duplicate SIDs are allowed.
    pub fn add(&self, session: Session) -> SessionKey {
        let key = SessionKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(key, session);
        key
    }

    /// Removes a session by key.
    pub fn remove(&self, key: SessionKey) -> Option<Session> {
        self.lock().remove(&key)
    }

    pub fn get(&self, key: SessionKey) -> Option<Session> {
        self.lock().get(&key).cloned()
    }

    /// First active session whose test peer IP matches `src`.
    ///
    /// When several sessions share the IP the lowest key wins, which keeps the
    /// choice stable for a given set of sessions.
    pub fn find_by_address(&self, src: &SocketAddr) -> Option<Session> {
        self.lock()
            .iter()
            .filter(|(_, s)| s.matches(src))
            .min_by_key(|(key, _)| **key)
            .map(|(_, s)| s.clone())
    }

    /// Moves a session to `state`. Returns `false` if it is gone.
    pub fn set_state(&self, key: SessionKey, state: SessionState) -> bool {
        match self.lock().get_mut(&key) {
            Some(session) => {
                session.state = state;
                true
            }
            None => false,
        }
    }

    /// Records control activity. Returns `false` if the session is gone.
    pub fn touch(&self, key: SessionKey, at: Instant) -> bool {
        match self.lock().get_mut(&key) {
            Some(session) => {
                session.last_activity = at;
                true
            }
            None => false,
        }
    }

    /// Removes every session idle for longer than `ttl` and returns them.
    pub fn sweep_expired(&self, now: Instant, ttl: Duration) -> Vec<Session> {
        let mut sessions = self.lock();
        let expired: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now, ttl))
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| sessions.remove(&key))
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of sessions currently eligible for reflection.
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| s.state == SessionState::Active)
            .count()
    }

    /// Copy of all sessions, ordered by key.
    pub fn snapshot(&self) -> Vec<(SessionKey, Session)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(key, s)| (*key, s.clone()))
            .collect();
        all.sort_by_key(|(key, _)| *key);
        all
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
