//! User accounts: registration, lookup, and credential checks.
//!
//! Accounts own every column of `users` except `balance`, which only the
//! reward ledger writes.

use super::credential::CredentialVerifier;
use crate::clock::{self, Clock};
use crate::store::Store;
use crate::{Result, StationError};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_NAME_LEN: usize = 64;
const MAX_EMAIL_LEN: usize = 254;
const MIN_SECRET_LEN: usize = 8;

/// A registered user as stored. The credential digest never leaves this module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub balance: f64,
    pub created_at: DateTime<Utc>,
}

/// The identity payload handed to stations and mobile clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub balance: f64,
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            balance: user.balance,
        }
    }
}

pub struct AccountStore {
    store: Arc<Store>,
    verifier: Arc<dyn CredentialVerifier>,
    clock: Arc<dyn Clock>,
    /// Verified against on unknown emails so a miss costs the same as a mismatch.
    dummy_digest: String,
}

impl AccountStore {
    pub fn new(
        store: Arc<Store>,
        verifier: Arc<dyn CredentialVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dummy_digest = verifier.hash("trash2cash-unknown-account");
        Self {
            store,
            verifier,
            clock,
            dummy_digest,
        }
    }

    /// Register a new user with a zero balance.
    pub fn register(&self, name: &str, email: &str, secret: &str) -> Result<User> {
        let name = name.trim();
        let email = email.trim();
        if name.is_empty() {
            return Err(StationError::InvalidInput("Name cannot be empty".into()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(StationError::InvalidInput(format!(
                "Name too long (max {MAX_NAME_LEN} characters)"
            )));
        }
        if email.len() > MAX_EMAIL_LEN || !looks_like_email(email) {
            return Err(StationError::InvalidInput(format!(
                "'{email}' is not a valid email address"
            )));
        }
        if secret.chars().count() < MIN_SECRET_LEN {
            return Err(StationError::InvalidInput(format!(
                "Password must be at least {MIN_SECRET_LEN} characters"
            )));
        }

        let digest = self.verifier.hash(secret);
        let now = self.clock.now_secs();

        let conn = self.store.lock();
        let result = conn.execute(
            "INSERT INTO users (name, email, credential_digest, balance, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            rusqlite::params![name, email, digest, now],
        );

        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                tracing::info!(user_id = id, "User registered");
                Ok(User {
                    id,
                    name: name.to_string(),
                    email: email.to_string(),
                    balance: 0.0,
                    created_at: clock::from_secs(now),
                })
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StationError::EmailTaken(email.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify an email + secret pair.
    ///
    /// Unknown email and wrong secret both fail with `InvalidCredentials`.
    pub fn authenticate(&self, email: &str, secret: &str) -> Result<User> {
        let row = {
            let conn = self.store.lock();
            conn.query_row(
                "SELECT id, name, email, balance, created_at, credential_digest
                 FROM users WHERE email = ?1 COLLATE NOCASE",
                rusqlite::params![email.trim()],
                |row| Ok((user_from_row(row)?, row.get::<_, String>(5)?)),
            )
            .optional()?
        };

        match row {
            Some((user, digest)) => {
                if self.verifier.verify(secret, &digest) {
                    Ok(user)
                } else {
                    tracing::debug!(user_id = user.id, "Credential mismatch");
                    Err(StationError::InvalidCredentials)
                }
            }
            None => {
                let _ = self.verifier.verify(secret, &self.dummy_digest);
                Err(StationError::InvalidCredentials)
            }
        }
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let conn = self.store.lock();
        let user = conn
            .query_row(
                "SELECT id, name, email, balance, created_at FROM users WHERE id = ?1",
                rusqlite::params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Fresh identity (including current balance) for a user id.
    pub fn identity(&self, user_id: i64) -> Result<Identity> {
        self.get_user(user_id)?
            .map(Identity::from)
            .ok_or_else(StationError::user_not_found)
    }

    pub fn user_count(&self) -> Result<u64> {
        let conn = self.store.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        balance: row.get(3)?,
        created_at: clock::from_secs(row.get(4)?),
    })
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::Pbkdf2Verifier;
    use crate::clock::SystemClock;

    pub(crate) fn test_accounts(store: Arc<Store>) -> AccountStore {
        AccountStore::new(
            store,
            Arc::new(Pbkdf2Verifier::new(16)),
            Arc::new(SystemClock),
        )
    }

    fn accounts() -> AccountStore {
        test_accounts(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn register_and_authenticate() {
        let accounts = accounts();
        let user = accounts
            .register("Budi", "budi@example.com", "securepassword123")
            .unwrap();
        assert_eq!(user.balance, 0.0);

        let authed = accounts
            .authenticate("budi@example.com", "securepassword123")
            .unwrap();
        assert_eq!(authed.id, user.id);
        assert_eq!(authed.name, "Budi");
    }

    #[test]
    fn email_lookup_is_case_insensitive() {
        let accounts = accounts();
        accounts
            .register("Budi", "Budi@Example.com", "securepassword123")
            .unwrap();
        assert!(accounts
            .authenticate("budi@example.com", "securepassword123")
            .is_ok());
    }

    #[test]
    fn duplicate_email_fails() {
        let accounts = accounts();
        accounts
            .register("Budi", "budi@example.com", "password123!")
            .unwrap();
        let err = accounts
            .register("Other", "BUDI@example.com", "password456!")
            .unwrap_err();
        assert!(matches!(err, StationError::EmailTaken(_)));
    }

    #[test]
    fn wrong_secret_and_unknown_email_are_indistinguishable() {
        let accounts = accounts();
        accounts
            .register("Budi", "budi@example.com", "correct_password")
            .unwrap();

        let wrong = accounts
            .authenticate("budi@example.com", "wrong_password")
            .unwrap_err();
        let missing = accounts
            .authenticate("ghost@example.com", "correct_password")
            .unwrap_err();

        assert_eq!(wrong.kind(), missing.kind());
        assert_eq!(wrong.to_string(), missing.to_string());
    }

    #[test]
    fn registration_validation() {
        let accounts = accounts();
        let cases = [
            ("", "a@example.com", "password123"),
            ("Budi", "not-an-email", "password123"),
            ("Budi", "a@@example.com", "password123"),
            ("Budi", "a@example.com", "short"),
        ];
        for (name, email, secret) in cases {
            let err = accounts.register(name, email, secret).unwrap_err();
            assert!(matches!(err, StationError::InvalidInput(_)), "{name} {email}");
        }
        assert_eq!(accounts.user_count().unwrap(), 0);
    }

    #[test]
    fn identity_of_unknown_user_is_not_found() {
        let accounts = accounts();
        let err = accounts.identity(42).unwrap_err();
        assert!(matches!(err, StationError::NotFound { what: "user" }));
    }
}
