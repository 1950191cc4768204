//! Station-side facade.
//!
//! The thin surface the station UI calls. It composes the binding coordinator
//! and the reward ledger, and keeps a constructor-injected [`StationCache`]
//! holding the identity this device observed. The cache is never the source
//! of truth: every deposit goes through the ledger against the store.

pub mod cache;
pub mod sensor;

pub use cache::{ActiveIdentity, IdentityState, StationCache};
pub use sensor::{FixedSensor, MaterialSensor, SensorReading, SimulatedSensor};

use crate::auth::{AccountStore, Identity, Pbkdf2Verifier};
use crate::clock::Clock;
use crate::config::Config;
use crate::ledger::{DepositReceipt, Material, RewardLedger, Submission};
use crate::pairing::{
    token_prefix, BindingCoordinator, IssuedToken, RegistrySettings, SessionPoll,
    SqliteSessionRegistry, SvgQrEncoder, Teardown,
};
use crate::store::Store;
use crate::{Result, StationError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sensor state reported when a scan starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Detecting,
}

/// A sensor reading with the reward it would earn if confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorPreview {
    pub material: Material,
    pub weight: f64,
    pub reward: f64,
}

pub struct StationFacade {
    coordinator: BindingCoordinator,
    ledger: RewardLedger,
    cache: Arc<StationCache>,
    sensor: Mutex<Box<dyn MaterialSensor>>,
}

impl StationFacade {
    /// `coordinator` should already carry `cache` via
    /// [`BindingCoordinator::with_station_cache`].
    pub fn new(
        coordinator: BindingCoordinator,
        ledger: RewardLedger,
        cache: Arc<StationCache>,
        sensor: Box<dyn MaterialSensor>,
    ) -> Self {
        Self {
            coordinator,
            ledger,
            cache,
            sensor: Mutex::new(sensor),
        }
    }

    /// Wire a station against a SQLite store using configured TTLs and rounds.
    pub fn from_config(
        config: &Config,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        sensor: Box<dyn MaterialSensor>,
    ) -> Self {
        let settings = RegistrySettings::new(config.session_ttl(), config.session.qr_prefix.clone());
        let registry = Arc::new(SqliteSessionRegistry::new(
            store.clone(),
            clock.clone(),
            settings,
        ));
        let accounts = Arc::new(AccountStore::new(
            store.clone(),
            Arc::new(Pbkdf2Verifier::new(config.credentials.iterations)),
            clock.clone(),
        ));
        let cache = Arc::new(StationCache::new(clock.clone(), config.active_ttl()));
        let coordinator = BindingCoordinator::new(registry, accounts, Arc::new(SvgQrEncoder::default()))
            .with_station_cache(cache.clone(), config.session.reuse_cached_token);
        let ledger = RewardLedger::new(store, clock);
        Self::new(coordinator, ledger, cache, sensor)
    }

    pub fn accounts(&self) -> &AccountStore {
        self.coordinator.accounts()
    }

    pub fn ledger(&self) -> &RewardLedger {
        &self.ledger
    }

    /// Token (and QR) for the station screen.
    pub fn request_token(&self) -> Result<IssuedToken> {
        self.coordinator.request_token()
    }

    /// Poll the displayed token.
    ///
    /// On `authenticated` the identity is cached for this device and the
    /// session is consumed. `Expired` and `NotFound` drop the displayed token.
    pub fn check_status(&self) -> Result<SessionPoll> {
        let issued = self
            .cache
            .last_token()
            .ok_or(StationError::NoActiveSession)?;

        match self.coordinator.poll_status(&issued.token) {
            Ok(poll) => {
                if let Some(ref identity) = poll.identity {
                    self.cache
                        .cache_identity(identity.clone(), Some(issued.token.clone()));
                    self.cache.clear_token();
                    self.coordinator.acknowledge(&issued.token);
                    tracing::info!(
                        user_id = identity.id,
                        token = token_prefix(&issued.token),
                        "User connected to station"
                    );
                }
                Ok(poll)
            }
            Err(e @ (StationError::Expired | StationError::NotFound { .. })) => {
                self.cache.clear_token();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Mobile-side bind, for stations that also serve the mobile endpoint.
    pub fn connect(&self, token: &str, email: &str, secret: &str) -> Result<Identity> {
        self.coordinator.authenticate_and_bind(token, email, secret)
    }

    /// Log in directly at the station, without a pairing session.
    pub fn login(&self, email: &str, secret: &str) -> Result<ActiveIdentity> {
        let identity = self.coordinator.login(email, secret)?;
        Ok(self.cache.cache_identity(identity, None))
    }

    /// Profile of the connected user, re-read from the store.
    pub fn current_user(&self) -> Result<Identity> {
        let active = self.require_identity()?;
        let identity = self.accounts().identity(active.identity.id)?;
        self.cache.update_balance(identity.balance);
        Ok(identity)
    }

    /// Record a deposit for the connected user.
    pub fn submit(&self, material: &str, weight: f64) -> Result<DepositReceipt> {
        let active = self.require_identity()?;
        let receipt = self
            .ledger
            .record_deposit(active.identity.id, material, weight)?;
        self.cache.update_balance(receipt.new_balance);
        self.cache.touch();
        Ok(receipt)
    }

    pub fn start_sensor_scan(&self) -> Result<ScanStatus> {
        self.require_identity()?;
        tracing::debug!(sensor = self.sensor.lock().name(), "Sensor scan started");
        Ok(ScanStatus::Detecting)
    }

    /// Sample the sensor and price the reading without recording it.
    pub fn read_sensor(&self) -> Result<SensorPreview> {
        self.require_identity()?;
        let reading = self.sensor.lock().sample()?;
        let reward = self
            .ledger
            .preview(reading.material.as_str(), reading.weight)?;
        Ok(SensorPreview {
            material: reading.material,
            weight: reading.weight,
            reward,
        })
    }

    /// Record a reading the user confirmed on screen.
    pub fn confirm_sensor_submission(&self, material: &str, weight: f64) -> Result<DepositReceipt> {
        self.submit(material, weight)
    }

    pub fn submissions(&self) -> Result<Vec<Submission>> {
        let active = self.require_identity()?;
        self.ledger.list_submissions(active.identity.id)
    }

    /// Forget the connected user and any displayed token. Local only.
    pub fn logout(&self) {
        self.cache.clear();
        tracing::info!("Station logged out");
    }

    /// Tear down the pairing session, remotely if possible, locally always.
    pub fn end_session(&self) -> Teardown {
        let token = self
            .cache
            .last_token()
            .map(|issued| issued.token)
            .or_else(|| match self.cache.identity() {
                IdentityState::Active(active) => active.token,
                _ => None,
            });

        match token {
            Some(token) => self.coordinator.end_session(&token),
            None => {
                self.cache.clear();
                Teardown {
                    remote_cleared: true,
                }
            }
        }
    }

    fn require_identity(&self) -> Result<ActiveIdentity> {
        match self.cache.identity() {
            IdentityState::Active(active) => Ok(active),
            IdentityState::Absent => Err(StationError::NotAuthenticated),
            IdentityState::Lapsed => Err(StationError::NoActiveSession),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pairing::SessionStatus;
    use chrono::Duration;

    const SECRET: &str = "recycle-more-123";

    struct Rig {
        clock: Arc<ManualClock>,
        station: StationFacade,
    }

    fn rig() -> Rig {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut config = Config::default();
        config.credentials.iterations = 16;
        let sensor = FixedSensor(SensorReading {
            material: Material::Metal,
            weight: 2.0,
        });
        let station = StationFacade::from_config(&config, store, clock.clone(), Box::new(sensor));
        station
            .accounts()
            .register("Sari", "sari@example.com", SECRET)
            .unwrap();
        Rig { clock, station }
    }

    #[test]
    fn end_to_end_pairing_and_deposit() {
        let rig = rig();
        let station = &rig.station;

        let issued = station.request_token().unwrap();
        assert_eq!(station.check_status().unwrap().status, SessionStatus::Pending);

        station
            .connect(&issued.token, "sari@example.com", SECRET)
            .unwrap();

        let poll = station.check_status().unwrap();
        assert!(poll.is_authenticated());
        assert_eq!(poll.identity.as_ref().unwrap().email, "sari@example.com");

        station.submit("paper", 1.0).unwrap();
        rig.clock.advance(Duration::seconds(5));
        let receipt = station.submit("plastic", 2.0).unwrap();
        assert_eq!(receipt.reward, 10_000.0);
        assert_eq!(receipt.new_balance, 12_500.0);

        let history = station.submissions().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, receipt.submission_id);
        assert_eq!(history[0].material, Material::Plastic);

        assert_eq!(station.current_user().unwrap().balance, 12_500.0);
    }

    #[test]
    fn submit_without_identity_is_not_authenticated() {
        let rig = rig();
        assert!(matches!(
            rig.station.submit("plastic", 1.0),
            Err(StationError::NotAuthenticated)
        ));
        assert!(matches!(
            rig.station.start_sensor_scan(),
            Err(StationError::NotAuthenticated)
        ));
    }

    #[test]
    fn lapsed_identity_is_no_active_session() {
        let rig = rig();
        rig.station.login("sari@example.com", SECRET).unwrap();
        rig.clock.advance(Duration::minutes(16));
        assert!(matches!(
            rig.station.submit("plastic", 1.0),
            Err(StationError::NoActiveSession)
        ));
    }

    #[test]
    fn check_status_without_token_is_no_active_session() {
        let rig = rig();
        assert!(matches!(
            rig.station.check_status(),
            Err(StationError::NoActiveSession)
        ));
    }

    #[test]
    fn expired_token_stops_polling() {
        let rig = rig();
        rig.station.request_token().unwrap();
        rig.clock.advance(Duration::minutes(6));
        assert!(matches!(
            rig.station.check_status(),
            Err(StationError::Expired)
        ));
        assert!(matches!(
            rig.station.check_status(),
            Err(StationError::NoActiveSession)
        ));
    }

    #[test]
    fn sensor_flow_previews_then_records() {
        let rig = rig();
        rig.station.login("sari@example.com", SECRET).unwrap();

        assert_eq!(rig.station.start_sensor_scan().unwrap(), ScanStatus::Detecting);
        let preview = rig.station.read_sensor().unwrap();
        assert_eq!(preview.material, Material::Metal);
        assert_eq!(preview.reward, 15_000.0);
        assert!(rig.station.submissions().unwrap().is_empty());

        let receipt = rig
            .station
            .confirm_sensor_submission(preview.material.as_str(), preview.weight)
            .unwrap();
        assert_eq!(receipt.reward, preview.reward);
    }

    #[test]
    fn invalid_deposit_is_rejected_before_the_ledger() {
        let rig = rig();
        rig.station.login("sari@example.com", SECRET).unwrap();
        assert!(matches!(
            rig.station.submit("styrofoam", 1.0),
            Err(StationError::InvalidMaterial(_))
        ));
        assert!(matches!(
            rig.station.submit("glass", 0.0),
            Err(StationError::InvalidWeight(_))
        ));
        assert!(rig.station.submissions().unwrap().is_empty());
    }

    #[test]
    fn logout_and_end_session_clear_local_state() {
        let rig = rig();
        rig.station.login("sari@example.com", SECRET).unwrap();
        rig.station.logout();
        assert!(matches!(
            rig.station.current_user(),
            Err(StationError::NotAuthenticated)
        ));

        let issued = rig.station.request_token().unwrap();
        rig.station
            .connect(&issued.token, "sari@example.com", SECRET)
            .unwrap();
        rig.station.check_status().unwrap();

        let teardown = rig.station.end_session();
        assert!(teardown.remote_cleared);
        assert!(matches!(
            rig.station.submit("paper", 1.0),
            Err(StationError::NotAuthenticated)
        ));
    }
}
