//! Station/mobile binding protocol.
//!
//! ## Flow
//!
//! 1. Station calls [`BindingCoordinator::request_token`] and displays the QR
//! 2. Mobile scans; optionally reports [`BindingCoordinator::scan`]
//! 3. Mobile submits credentials: [`BindingCoordinator::authenticate_and_bind`]
//! 4. Station polls [`BindingCoordinator::poll_status`] until it sees
//!    `authenticated` (identity attached) or a terminal `Expired`
//! 5. Station [`BindingCoordinator::acknowledge`]s, consuming the session
//! 6. [`BindingCoordinator::end_session`] tears down remote and local state

use super::qr::QrEncoder;
use super::registry::{token_prefix, Session, SessionRegistry, SessionStatus};
use crate::auth::{AccountStore, Identity};
use crate::station::StationCache;
use crate::{Result, StationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a station receives when it asks for a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub qr_payload: String,
    /// Rendered QR as a `data:` URI.
    pub qr_image: String,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Result of a non-terminal poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPoll {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

impl SessionPoll {
    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated && self.identity.is_some()
    }
}

/// Outcome of [`BindingCoordinator::end_session`]. Local state is always cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Teardown {
    pub remote_cleared: bool,
}

pub struct BindingCoordinator {
    registry: Arc<dyn SessionRegistry>,
    accounts: Arc<AccountStore>,
    qr: Arc<dyn QrEncoder>,
    cache: Option<Arc<StationCache>>,
    reuse_cached_token: bool,
}

impl BindingCoordinator {
    /// Coordinator without a station cache, as used by the gateway.
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        accounts: Arc<AccountStore>,
        qr: Arc<dyn QrEncoder>,
    ) -> Self {
        Self {
            registry,
            accounts,
            qr,
            cache: None,
            reuse_cached_token: false,
        }
    }

    /// Attach the local cache of the station this coordinator runs on.
    pub fn with_station_cache(mut self, cache: Arc<StationCache>, reuse_cached_token: bool) -> Self {
        self.cache = Some(cache);
        self.reuse_cached_token = reuse_cached_token;
        self
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    /// Issue a token for the station to display.
    ///
    /// With a station cache and reuse enabled, a still-valid cached token is
    /// returned instead of minting a new one. The QR image is rendered only
    /// after the session row is stored.
    pub fn request_token(&self) -> Result<IssuedToken> {
        if self.reuse_cached_token {
            if let Some(cached) = self.cache.as_ref().and_then(|c| c.cached_token()) {
                tracing::debug!(token = token_prefix(&cached.token), "Reusing cached token");
                return Ok(cached);
            }
        }

        let session = self.registry.create_session()?;
        let qr_image = match self.qr.data_uri(&session.qr_payload) {
            Ok(image) => image,
            Err(e) => {
                // Never leave a usable token behind without its artifact.
                if let Err(cleanup) = self.registry.consume_session(&session.token) {
                    tracing::warn!(
                        token = token_prefix(&session.token),
                        "Failed to discard session after QR error: {cleanup}"
                    );
                }
                return Err(e);
            }
        };

        let issued = IssuedToken {
            token: session.token,
            qr_payload: session.qr_payload,
            qr_image,
            expires_at: session.expires_at,
            status: session.status,
        };
        if let Some(ref cache) = self.cache {
            cache.store_token(issued.clone());
        }
        Ok(issued)
    }

    /// Station-side read path.
    ///
    /// `Ok` means keep polling (or stop, when the identity is present);
    /// `Err(Expired)` is terminal and the station should request a new token.
    pub fn poll_status(&self, token: &str) -> Result<SessionPoll> {
        if self.registry.expire_if_stale(token)? {
            return Err(StationError::Expired);
        }
        let session = self.registry.get_session(token)?;
        match session.status {
            SessionStatus::Expired => Err(StationError::Expired),
            SessionStatus::Authenticated => {
                let user_id = session
                    .bound_user_id
                    .ok_or_else(StationError::user_not_found)?;
                let identity = self.accounts.identity(user_id)?;
                Ok(SessionPoll {
                    status: SessionStatus::Authenticated,
                    identity: Some(identity),
                })
            }
            status @ (SessionStatus::Pending | SessionStatus::Connected) => Ok(SessionPoll {
                status,
                identity: None,
            }),
        }
    }

    /// Mobile device reports that it scanned the code.
    pub fn scan(&self, token: &str) -> Result<Session> {
        self.registry
            .mark_connected(token)
            .map_err(already_bound_as_used)
    }

    /// Mobile-side entry point: verify credentials and bind them to the session.
    pub fn authenticate_and_bind(&self, token: &str, email: &str, secret: &str) -> Result<Identity> {
        let session = self.registry.get_session(token)?;
        if session.status == SessionStatus::Expired {
            return Err(StationError::Expired);
        }
        if !session.status.is_bindable() {
            return Err(StationError::AlreadyUsed);
        }

        let user = self.accounts.authenticate(email, secret)?;
        self.registry
            .bind_user(token, user.id)
            .map_err(already_bound_as_used)?;

        Ok(Identity::from(user))
    }

    /// Single-actor variant: verify credentials without a pairing session.
    pub fn login(&self, email: &str, secret: &str) -> Result<Identity> {
        let user = self.accounts.authenticate(email, secret)?;
        tracing::info!(user_id = user.id, "User logged in at station");
        Ok(Identity::from(user))
    }

    /// Consume a session whose binding the station has observed.
    /// Failure is logged; the row then simply runs out its TTL.
    pub fn acknowledge(&self, token: &str) {
        if let Err(e) = self.registry.consume_session(token) {
            tracing::warn!(
                token = token_prefix(token),
                "Failed to consume acknowledged session: {e}"
            );
        }
    }

    /// Best-effort teardown. Local station state is cleared even when the
    /// registry call fails.
    pub fn end_session(&self, token: &str) -> Teardown {
        let remote_cleared = match self.registry.consume_session(token) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    token = token_prefix(token),
                    "Failed to end session remotely, clearing locally: {e}"
                );
                false
            }
        };
        if let Some(ref cache) = self.cache {
            cache.clear();
        }
        Teardown { remote_cleared }
    }

    pub fn sweep(&self) -> Result<u64> {
        self.registry.sweep_expired()
    }
}

fn already_bound_as_used(err: StationError) -> StationError {
    match err {
        StationError::AlreadyBound => StationError::AlreadyUsed,
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::accounts::tests::test_accounts;
    use crate::clock::ManualClock;
    use crate::pairing::{RegistrySettings, SqliteSessionRegistry, SvgQrEncoder};
    use crate::store::Store;
    use chrono::Duration;

    pub(crate) struct Harness {
        pub clock: Arc<ManualClock>,
        pub store: Arc<Store>,
        pub registry: Arc<dyn SessionRegistry>,
        pub accounts: Arc<AccountStore>,
    }

    impl Harness {
        pub fn new() -> Self {
            let clock = Arc::new(ManualClock::starting_now());
            let store = Arc::new(Store::open_in_memory().unwrap());
            let registry: Arc<dyn SessionRegistry> = Arc::new(SqliteSessionRegistry::new(
                store.clone(),
                clock.clone(),
                RegistrySettings::default(),
            ));
            let accounts = Arc::new(test_accounts(store.clone()));
            Self {
                clock,
                store,
                registry,
                accounts,
            }
        }

        pub fn coordinator(&self) -> BindingCoordinator {
            BindingCoordinator::new(
                self.registry.clone(),
                self.accounts.clone(),
                Arc::new(SvgQrEncoder::default()),
            )
        }

        pub fn register(&self, email: &str) -> i64 {
            self.accounts
                .register("Rina", email, "recycle-more-123")
                .unwrap()
                .id
        }
    }

    /// Registry whose teardown always fails, as a dropped network call would.
    struct FlakyTeardown(Arc<dyn SessionRegistry>);

    impl SessionRegistry for FlakyTeardown {
        fn create_session(&self) -> Result<Session> {
            self.0.create_session()
        }
        fn get_session(&self, token: &str) -> Result<Session> {
            self.0.get_session(token)
        }
        fn mark_connected(&self, token: &str) -> Result<Session> {
            self.0.mark_connected(token)
        }
        fn bind_user(&self, token: &str, user_id: i64) -> Result<Session> {
            self.0.bind_user(token, user_id)
        }
        fn consume_session(&self, _token: &str) -> Result<()> {
            Err(StationError::Storage(rusqlite::Error::InvalidQuery))
        }
        fn expire_if_stale(&self, token: &str) -> Result<bool> {
            self.0.expire_if_stale(token)
        }
        fn sweep_expired(&self) -> Result<u64> {
            self.0.sweep_expired()
        }
    }

    /// Encoder that always fails, to check no token outlives a missing QR.
    struct BrokenEncoder;

    impl QrEncoder for BrokenEncoder {
        fn content_type(&self) -> &'static str {
            "image/png"
        }
        fn encode(&self, _payload: &str) -> Result<Vec<u8>> {
            Err(StationError::Qr("encoder offline".into()))
        }
    }

    #[test]
    fn request_then_poll_pending() {
        let h = Harness::new();
        let coordinator = h.coordinator();

        let issued = coordinator.request_token().unwrap();
        assert_eq!(issued.status, SessionStatus::Pending);
        assert!(issued.qr_image.starts_with("data:image/svg+xml;base64,"));

        let poll = coordinator.poll_status(&issued.token).unwrap();
        assert_eq!(poll.status, SessionStatus::Pending);
        assert!(poll.identity.is_none());
        assert!(!poll.is_authenticated());
    }

    #[test]
    fn bind_then_poll_returns_identity() {
        let h = Harness::new();
        let user_id = h.register("rina@example.com");
        let coordinator = h.coordinator();
        let issued = coordinator.request_token().unwrap();

        let identity = coordinator
            .authenticate_and_bind(&issued.token, "rina@example.com", "recycle-more-123")
            .unwrap();
        assert_eq!(identity.id, user_id);

        let poll = coordinator.poll_status(&issued.token).unwrap();
        assert!(poll.is_authenticated());
        let polled = poll.identity.unwrap();
        assert_eq!(polled.email, "rina@example.com");
        assert_eq!(polled.balance, 0.0);
    }

    #[test]
    fn second_bind_is_already_used() {
        let h = Harness::new();
        h.register("rina@example.com");
        h.register("other@example.com");
        let coordinator = h.coordinator();
        let issued = coordinator.request_token().unwrap();

        coordinator
            .authenticate_and_bind(&issued.token, "rina@example.com", "recycle-more-123")
            .unwrap();
        let err = coordinator
            .authenticate_and_bind(&issued.token, "other@example.com", "recycle-more-123")
            .unwrap_err();
        assert!(matches!(err, StationError::AlreadyUsed));
    }

    #[test]
    fn bad_credentials_leave_session_pending() {
        let h = Harness::new();
        h.register("rina@example.com");
        let coordinator = h.coordinator();
        let issued = coordinator.request_token().unwrap();

        for (email, secret) in [
            ("rina@example.com", "wrong-secret"),
            ("nobody@example.com", "recycle-more-123"),
        ] {
            let err = coordinator
                .authenticate_and_bind(&issued.token, email, secret)
                .unwrap_err();
            assert!(matches!(err, StationError::InvalidCredentials));
        }
        assert_eq!(
            coordinator.poll_status(&issued.token).unwrap().status,
            SessionStatus::Pending
        );
    }

    #[test]
    fn expired_poll_is_terminal_and_unbindable() {
        let h = Harness::new();
        h.register("rina@example.com");
        let coordinator = h.coordinator();
        let issued = coordinator.request_token().unwrap();

        h.clock.advance(Duration::minutes(5) + Duration::seconds(1));
        assert!(matches!(
            coordinator.poll_status(&issued.token),
            Err(StationError::Expired)
        ));
        // Polling marks the stored row, not just the returned value.
        let stored: String = h
            .store
            .lock()
            .query_row(
                "SELECT status FROM sessions WHERE token = ?1",
                rusqlite::params![issued.token],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stored, "expired");
        assert!(matches!(
            coordinator.authenticate_and_bind(&issued.token, "rina@example.com", "recycle-more-123"),
            Err(StationError::Expired)
        ));
    }

    #[test]
    fn unknown_token_is_not_found() {
        let h = Harness::new();
        let coordinator = h.coordinator();
        assert!(matches!(
            coordinator.poll_status("missing"),
            Err(StationError::NotFound { .. })
        ));
        assert!(matches!(
            coordinator.authenticate_and_bind("missing", "a@example.com", "whatever1"),
            Err(StationError::NotFound { .. })
        ));
    }

    #[test]
    fn concurrent_mobile_binds_have_one_winner() {
        let h = Harness::new();
        for i in 0..8 {
            h.register(&format!("user{i}@example.com"));
        }
        let coordinator = h.coordinator();
        let issued = coordinator.request_token().unwrap();

        let results: Vec<Result<Identity>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let coordinator = &coordinator;
                    let token = issued.token.as_str();
                    scope.spawn(move || {
                        coordinator.authenticate_and_bind(
                            token,
                            &format!("user{i}@example.com"),
                            "recycle-more-123",
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, StationError::AlreadyUsed)));
    }

    #[test]
    fn cached_token_is_reused_until_expiry() {
        let h = Harness::new();
        let cache = Arc::new(StationCache::new(h.clock.clone(), Duration::minutes(15)));
        let coordinator = h.coordinator().with_station_cache(cache, true);

        let first = coordinator.request_token().unwrap();
        let again = coordinator.request_token().unwrap();
        assert_eq!(first.token, again.token);

        h.clock.advance(Duration::minutes(5));
        let fresh = coordinator.request_token().unwrap();
        assert_ne!(first.token, fresh.token);
    }

    #[test]
    fn acknowledge_consumes_the_session() {
        let h = Harness::new();
        h.register("rina@example.com");
        let coordinator = h.coordinator();
        let issued = coordinator.request_token().unwrap();
        coordinator
            .authenticate_and_bind(&issued.token, "rina@example.com", "recycle-more-123")
            .unwrap();

        coordinator.acknowledge(&issued.token);
        assert!(matches!(
            coordinator.poll_status(&issued.token),
            Err(StationError::NotFound { .. })
        ));
    }

    #[test]
    fn end_session_clears_local_state_even_when_teardown_fails() {
        let h = Harness::new();
        let user_id = h.register("rina@example.com");
        let cache = Arc::new(StationCache::new(h.clock.clone(), Duration::minutes(15)));
        let coordinator = BindingCoordinator::new(
            Arc::new(FlakyTeardown(h.registry.clone())),
            h.accounts.clone(),
            Arc::new(SvgQrEncoder::default()),
        )
        .with_station_cache(cache.clone(), true);

        let issued = coordinator.request_token().unwrap();
        cache.cache_identity(h.accounts.identity(user_id).unwrap(), Some(issued.token.clone()));

        let teardown = coordinator.end_session(&issued.token);
        assert!(!teardown.remote_cleared);
        assert!(cache.last_token().is_none());
        assert_eq!(cache.identity(), crate::station::IdentityState::Absent);
    }

    #[test]
    fn qr_failure_discards_the_new_session() {
        let h = Harness::new();
        let coordinator = BindingCoordinator::new(
            h.registry.clone(),
            h.accounts.clone(),
            Arc::new(BrokenEncoder),
        );

        let err = coordinator.request_token().unwrap_err();
        assert!(matches!(err, StationError::Qr(_)));

        let remaining: i64 = h
            .store
            .lock()
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn login_without_session() {
        let h = Harness::new();
        let user_id = h.register("rina@example.com");
        let coordinator = h.coordinator();
        assert_eq!(
            coordinator
                .login("RINA@example.com", "recycle-more-123")
                .unwrap()
                .id,
            user_id
        );
    }
}
