//! TOML configuration with defaults for every field.
//!
//! ```toml
//! [storage]
//! db_path = "~/.local/share/trash2cash/trash2cash.db"
//!
//! [session]
//! ttl_secs = 300
//! active_ttl_secs = 900
//! qr_prefix = "trash2cash://session/"
//! reuse_cached_token = true
//!
//! [credentials]
//! iterations = 100000
//!
//! [gateway]
//! host = "127.0.0.1"
//! port = 8080
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pairing tokens are valid for five minutes.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 300;

/// How long a station keeps a bound identity active without new activity.
pub const DEFAULT_ACTIVE_TTL_SECS: u64 = 900;

/// Upper bound for either TTL (30 days).
pub const MAX_TTL_SECS: u64 = 30 * 24 * 60 * 60;

pub const DEFAULT_QR_PREFIX: &str = "trash2cash://session/";

pub const DEFAULT_CREDENTIAL_ITERATIONS: u32 = 100_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub credentials: CredentialConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `~` is expanded.
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = directories::ProjectDirs::from("", "", "trash2cash")
            .map(|dirs| dirs.data_dir().join("trash2cash.db"))
            .unwrap_or_else(|| PathBuf::from("trash2cash.db"));
        Self {
            db_path: db_path.to_string_lossy().into_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub active_ttl_secs: u64,
    pub qr_prefix: String,
    /// Hand back a still-valid cached token instead of minting a new one.
    pub reuse_cached_token: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
            active_ttl_secs: DEFAULT_ACTIVE_TTL_SECS,
            qr_prefix: DEFAULT_QR_PREFIX.to_string(),
            reuse_cached_token: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// PBKDF2-HMAC-SHA256 rounds for newly hashed secrets.
    pub iterations: u32,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_CREDENTIAL_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    /// Default location: `<config dir>/trash2cash/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "trash2cash")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from an explicit path, or from the default path when it exists.
    /// A missing default file yields the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("session.ttl_secs", self.session.ttl_secs),
            ("session.active_ttl_secs", self.session.active_ttl_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
            if value > MAX_TTL_SECS {
                bail!("{name} must be at most {MAX_TTL_SECS} seconds, got {value}");
            }
        }
        if self.credentials.iterations == 0 {
            bail!("credentials.iterations must be greater than zero");
        }
        Ok(())
    }

    /// Database path with `~` and environment variables expanded.
    pub fn db_path(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.storage.db_path)
            .with_context(|| format!("Failed to expand db_path '{}'", self.storage.db_path))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    /// Session TTL, clamped to [`MAX_TTL_SECS`] for configs that skipped `validate()`.
    pub fn session_ttl(&self) -> chrono::Duration {
        bounded_secs(self.session.ttl_secs)
    }

    pub fn active_ttl(&self) -> chrono::Duration {
        bounded_secs(self.session.active_ttl_secs)
    }
}

fn bounded_secs(secs: u64) -> chrono::Duration {
    // MAX_TTL_SECS fits in i64 and in chrono's range.
    chrono::Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
}
