//! Recycling station pairing and reward ledger.
//!
//! A station requests a short-lived, single-use session token and shows it as
//! a QR code. A mobile user scans it, authenticates, and binds their identity
//! to the session. The station polls until it observes the binding, then
//! records material deposits as reward-earning submissions against that
//! user's balance.
//!
//! ## Layout
//! - [`store`]: SQLite-backed persistent store (users, sessions, submissions)
//! - [`auth`]: credential digests and user accounts
//! - [`pairing`]: session registry, QR rendering, and the binding protocol
//! - [`ledger`]: material rates and the atomic reward ledger
//! - [`station`]: the station-side facade, local cache, and sensor input
//! - [`gateway`]: JSON HTTP surface for mobile devices and remote stations

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod pairing;
pub mod station;
pub mod store;

pub use error::{ErrorKind, Failure, StationError};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StationError>;
