//! Admin token check for inbound requests.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Header carrying the caller's credential.
pub const TOKEN_HEADER: &str = "X-Admin-Token";

/// Holds the SHA-256 of the configured token. Presented tokens are hashed the same way and
/// the digests compared in constant time, so neither token bytes nor token length show up
/// in response timing.
pub struct AuthGate {
    digest: [u8; 32],
}

impl AuthGate {
    pub fn new(token: &str) -> Self {
        Self {
            digest: digest(token.trim()),
        }
    }

    /// True when `presented` matches the configured token. A missing credential never matches.
    pub fn verify(&self, presented: Option<&str>) -> bool {
        let presented = presented.map(str::trim).unwrap_or("");
        let candidate = digest(presented);
        let matches: bool = self.digest[..].ct_eq(&candidate[..]).into();
        matches && !presented.is_empty()
    }
}

fn digest(s: &str) -> [u8; 32] {
    Sha256::digest(s.as_bytes()).into()
}
