//! Credential digests.
//!
//! The rest of the crate only sees the [`CredentialVerifier`] contract:
//! `hash(secret) -> digest` and `verify(secret, digest) -> bool`.
//!
//! The shipped implementation is PBKDF2-HMAC-SHA256 with a per-user salt.
//! Digests are self-describing so the iteration count can be raised later
//! without invalidating existing rows:
//!
//! ```text
//! pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>
//! ```

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

/// Salt byte length for credential hashing.
const SALT_BYTES: usize = 16;

/// Derived key length (one SHA-256 block).
const KEY_BYTES: usize = 32;

const SCHEME: &str = "pbkdf2-sha256";

/// Hashes and verifies user secrets.
pub trait CredentialVerifier: Send + Sync {
    fn hash(&self, secret: &str) -> String;

    /// Never errors: a malformed digest simply does not verify.
    fn verify(&self, secret: &str, digest: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct Pbkdf2Verifier {
    iterations: u32,
}

impl Pbkdf2Verifier {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }
}

impl Default for Pbkdf2Verifier {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CREDENTIAL_ITERATIONS)
    }
}

impl CredentialVerifier for Pbkdf2Verifier {
    fn hash(&self, secret: &str) -> String {
        let mut salt = [0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);
        let key = derive(secret, &salt, self.iterations);
        format!(
            "{SCHEME}${}${}${}",
            self.iterations,
            hex::encode(salt),
            hex::encode(key)
        )
    }

    fn verify(&self, secret: &str, digest: &str) -> bool {
        let Some(parsed) = ParsedDigest::parse(digest) else {
            return false;
        };
        let attempt = derive(secret, &parsed.salt, parsed.iterations);
        constant_time_eq(&attempt, &parsed.key)
    }
}

struct ParsedDigest {
    iterations: u32,
    salt: Vec<u8>,
    key: Vec<u8>,
}

impl ParsedDigest {
    fn parse(digest: &str) -> Option<Self> {
        let mut parts = digest.split('$');
        if parts.next()? != SCHEME {
            return None;
        }
        let iterations: u32 = parts.next()?.parse().ok()?;
        let salt = hex::decode(parts.next()?).ok()?;
        let key = hex::decode(parts.next()?).ok()?;
        if parts.next().is_some() || iterations == 0 || key.len() != KEY_BYTES {
            return None;
        }
        Some(Self {
            iterations,
            salt,
            key,
        })
    }
}

fn derive(secret: &str, salt: &[u8], iterations: u32) -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations, &mut key);
    key
}

/// Constant-time byte comparison to prevent timing attacks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Pbkdf2Verifier {
        Pbkdf2Verifier::new(64)
    }

    #[test]
    fn hash_then_verify() {
        let verifier = fast();
        let digest = verifier.hash("correct horse");
        assert!(digest.starts_with("pbkdf2-sha256$64$"));
        assert!(verifier.verify("correct horse", &digest));
        assert!(!verifier.verify("wrong horse", &digest));
    }

    #[test]
    fn same_secret_gets_distinct_salts() {
        let verifier = fast();
        assert_ne!(verifier.hash("password1"), verifier.hash("password1"));
    }

    #[test]
    fn verify_honours_stored_iteration_count() {
        let digest = Pbkdf2Verifier::new(32).hash("password1");
        assert!(Pbkdf2Verifier::new(1_000).verify("password1", &digest));
    }

    #[test]
    fn malformed_digests_never_verify() {
        let verifier = fast();
        for digest in [
            "",
            "plaintext",
            "pbkdf2-sha256$0$00$00",
            "pbkdf2-sha256$10$zz$00",
            "bcrypt$10$aa$bb",
        ] {
            assert!(!verifier.verify("anything", digest), "{digest}");
        }
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
