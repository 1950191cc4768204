//! Reward ledger: material rates, deposit recording, and submission history.
//!
//! ## Design
//! - SQLite-backed append-only submission log
//! - Each deposit is one transaction: insert submission, credit balance, read
//!   balance back. Any failure rolls the whole transaction back
//! - Balance is credited with `balance = balance + ?`, never a cached value,
//!   so concurrent deposits for the same user cannot lose an increment
//! - Input is validated before the database is touched

use crate::clock::{self, Clock};
use crate::store::Store;
use crate::{Result, StationError};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

// ── Materials ────────────────────────────────────────────────────

/// Closed set of materials a station accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Material {
    Plastic,
    Glass,
    Metal,
    Paper,
}

impl Material {
    pub const ALL: [Material; 4] = [Self::Plastic, Self::Glass, Self::Metal, Self::Paper];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plastic => "plastic",
            Self::Glass => "glass",
            Self::Metal => "metal",
            Self::Paper => "paper",
        }
    }

    /// Reward per kilogram.
    pub fn rate(self) -> f64 {
        match self {
            Self::Plastic => 5_000.0,
            Self::Glass => 4_000.0,
            Self::Metal => 7_500.0,
            Self::Paper => 2_500.0,
        }
    }
}

impl FromStr for Material {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| StationError::InvalidMaterial(s.to_string()))
    }
}

impl std::fmt::Display for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kilogram rate for a material name.
pub fn rate_for(material: &str) -> Result<f64> {
    Ok(material.parse::<Material>()?.rate())
}

/// Check a deposit before any persistence is attempted.
pub fn validate_deposit(material: &str, weight: f64) -> Result<Material> {
    let material = material.parse::<Material>()?;
    // A finite weight can still overflow once priced.
    if !weight.is_finite() || weight <= 0.0 || !(weight * material.rate()).is_finite() {
        return Err(StationError::InvalidWeight(weight));
    }
    Ok(material)
}

// ── Records ──────────────────────────────────────────────────────

/// One append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: i64,
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub material: Material,
    /// Kilograms.
    pub weight: f64,
    pub reward: f64,
    pub created_at: DateTime<Utc>,
}

/// Result of a committed deposit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositReceipt {
    pub submission_id: i64,
    pub material: Material,
    pub weight: f64,
    pub reward: f64,
    pub new_balance: f64,
}

// ── Ledger ───────────────────────────────────────────────────────

/// Sole writer of `submissions` and of `users.balance`.
pub struct RewardLedger {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl RewardLedger {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Reward a deposit would earn, without recording anything.
    pub fn preview(&self, material: &str, weight: f64) -> Result<f64> {
        let material = validate_deposit(material, weight)?;
        Ok(weight * material.rate())
    }

    /// Record a deposit and credit its reward atomically.
    ///
    /// Never retries; on `Storage` errors nothing was written.
    pub fn record_deposit(&self, user_id: i64, material: &str, weight: f64) -> Result<DepositReceipt> {
        let material = validate_deposit(material, weight)?;
        let reward = weight * material.rate();
        let now = self.clock.now_secs();

        let mut conn = self.store.lock();
        let tx = conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                rusqlite::params![user_id],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StationError::user_not_found());
        }

        tx.execute(
            "INSERT INTO submissions (user_id, material, weight, reward, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![user_id, material.as_str(), weight, reward, now],
        )?;
        let submission_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE users SET balance = balance + ?1 WHERE id = ?2",
            rusqlite::params![reward, user_id],
        )?;

        let new_balance: f64 = tx.query_row(
            "SELECT balance FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| row.get(0),
        )?;

        tx.commit()?;

        tracing::info!(
            user_id = user_id,
            submission_id = submission_id,
            material = material.as_str(),
            weight = weight,
            reward = reward,
            "Deposit recorded"
        );

        Ok(DepositReceipt {
            submission_id,
            material,
            weight,
            reward,
            new_balance,
        })
    }

    /// Submission history for a user, newest first.
    pub fn list_submissions(&self, user_id: i64) -> Result<Vec<Submission>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, material, weight, reward, created_at
             FROM submissions WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC",
        )?;

        let rows = stmt
            .query_map(rusqlite::params![user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, user_id, material, weight, reward, created_at)| -> Result<Submission> {
                Ok(Submission {
                    id,
                    user_id,
                    material: material.parse()?,
                    weight,
                    reward,
                    created_at: clock::from_secs(created_at),
                })
            })
            .collect()
    }

    pub fn balance(&self, user_id: i64) -> Result<f64> {
        let conn = self.store.lock();
        conn.query_row(
            "SELECT balance FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| row.get::<_, f64>(0),
        )
        .optional()?
        .ok_or_else(StationError::user_not_found)
    }
}
