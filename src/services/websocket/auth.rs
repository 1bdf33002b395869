//! Shared-secret authentication for client sessions.

use sha2::{Digest, Sha256};
use std::fmt;

/// Digest of the shared secret. The plain secret is never kept.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    digest: [u8; 32],
}

impl Credential {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    /// Hex fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.digest[..4])
    }

    /// Constant-time comparison of the presented token against the secret.
    pub fn verify(&self, token: &str) -> bool {
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        presented
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
