//! Station-local pairing cache.
//!
//! Holds the token this station is currently displaying and the identity it
//! observed binding to it. Neither is authoritative: the registry and the
//! accounts table are. Every read applies a TTL check and drops stale entries.

use crate::auth::Identity;
use crate::clock::Clock;
use crate::pairing::IssuedToken;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Identity observed by this station, valid until `active_until`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveIdentity {
    pub identity: Identity,
    /// Pairing token the identity arrived through; `None` after a direct login.
    pub token: Option<String>,
    pub active_until: DateTime<Utc>,
}

/// Result of reading the cached identity.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityState {
    /// Nobody has connected or logged in.
    Absent,
    Active(ActiveIdentity),
    /// An identity was cached but its window elapsed. Cleared by this read.
    Lapsed,
}

#[derive(Debug, Default)]
struct CacheState {
    token: Option<IssuedToken>,
    identity: Option<ActiveIdentity>,
}

pub struct StationCache {
    clock: Arc<dyn Clock>,
    active_ttl: Duration,
    state: Mutex<CacheState>,
}

impl StationCache {
    pub fn new(clock: Arc<dyn Clock>, active_ttl: Duration) -> Self {
        Self {
            clock,
            active_ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// The displayed token, if it is still inside its TTL.
    pub fn cached_token(&self) -> Option<IssuedToken> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state
            .token
            .as_ref()
            .is_some_and(|token| now >= token.expires_at)
        {
            state.token = None;
        }
        state.token.clone()
    }

    /// The displayed token regardless of TTL, for polling and teardown.
    pub fn last_token(&self) -> Option<IssuedToken> {
        self.state.lock().token.clone()
    }

    pub fn store_token(&self, token: IssuedToken) {
        self.state.lock().token = Some(token);
    }

    pub fn clear_token(&self) {
        self.state.lock().token = None;
    }

    /// Cache an identity for this device, starting a fresh activity window.
    pub fn cache_identity(&self, identity: Identity, token: Option<String>) -> ActiveIdentity {
        let active = ActiveIdentity {
            identity,
            token,
            active_until: self.clock.now() + self.active_ttl,
        };
        self.state.lock().identity = Some(active.clone());
        active
    }

    pub fn identity(&self) -> IdentityState {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.identity.clone() {
            Some(active) if now < active.active_until => IdentityState::Active(active),
            Some(_) => {
                state.identity = None;
                IdentityState::Lapsed
            }
            None => IdentityState::Absent,
        }
    }

    /// Replace the cached balance after a deposit or profile refresh.
    pub fn update_balance(&self, balance: f64) {
        if let Some(active) = self.state.lock().identity.as_mut() {
            active.identity.balance = balance;
        }
    }

    /// Extend the activity window of the cached identity.
    pub fn touch(&self) {
        let until = self.clock.now() + self.active_ttl;
        if let Some(active) = self.state.lock().identity.as_mut() {
            active.active_until = until;
        }
    }

    pub fn clear_identity(&self) {
        self.state.lock().identity = None;
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.token = None;
        state.identity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pairing::SessionStatus;

    fn identity() -> Identity {
        Identity {
            id: 7,
            name: "Dewi".into(),
            email: "dewi@example.com".into(),
            balance: 0.0,
        }
    }

    fn issued(clock: &ManualClock) -> IssuedToken {
        IssuedToken {
            token: "tok".into(),
            qr_payload: "trash2cash://session/tok".into(),
            qr_image: String::new(),
            expires_at: clock.now() + Duration::seconds(300),
            status: SessionStatus::Pending,
        }
    }

    #[test]
    fn token_invalidates_at_expiry() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = StationCache::new(clock.clone(), Duration::seconds(900));
        cache.store_token(issued(&clock));

        clock.advance(Duration::seconds(299));
        assert!(cache.cached_token().is_some());
        clock.advance(Duration::seconds(1));
        assert!(cache.cached_token().is_none());
        assert!(cache.last_token().is_none());
    }

    #[test]
    fn identity_lapses_once_then_reads_absent() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = StationCache::new(clock.clone(), Duration::seconds(60));
        cache.cache_identity(identity(), Some("tok".into()));

        assert!(matches!(cache.identity(), IdentityState::Active(_)));
        clock.advance(Duration::seconds(61));
        assert_eq!(cache.identity(), IdentityState::Lapsed);
        assert_eq!(cache.identity(), IdentityState::Absent);
    }

    #[test]
    fn touch_extends_window_and_balance_updates() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = StationCache::new(clock.clone(), Duration::seconds(60));
        cache.cache_identity(identity(), None);

        clock.advance(Duration::seconds(50));
        cache.touch();
        cache.update_balance(12_500.0);
        clock.advance(Duration::seconds(50));

        match cache.identity() {
            IdentityState::Active(active) => assert_eq!(active.identity.balance, 12_500.0),
            other => panic!("expected active identity, got {other:?}"),
        }
    }

    #[test]
    fn clear_drops_everything() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = StationCache::new(clock.clone(), Duration::seconds(60));
        cache.store_token(issued(&clock));
        cache.cache_identity(identity(), None);

        cache.clear();
        assert!(cache.last_token().is_none());
        assert_eq!(cache.identity(), IdentityState::Absent);
    }
}
