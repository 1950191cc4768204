//! User authentication for stations and mobile clients.
//!
//! Provides:
//! - A credential verifier contract with a PBKDF2-HMAC-SHA256 implementation
//! - User registration and email + secret authentication
//! - Identity lookup (id, name, email, current balance)
//!
//! ## Design Decisions
//! - Unknown email and wrong secret produce the same error and cost the same
//!   amount of hashing work, so responses cannot be used to enumerate accounts.
//! - Email uniqueness is enforced case-insensitively by the schema.

pub mod accounts;
pub mod credential;

pub use accounts::{AccountStore, Identity, User};
pub use credential::{CredentialVerifier, Pbkdf2Verifier};
