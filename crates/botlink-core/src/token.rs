//! Shared-secret token derivation.
//!
//! A token is the lowercase hex SHA-256 of `secret || identifier`. Both sides
//! derive it independently; the server recomputes and compares.

use sha2::{Digest, Sha256};

/// Derive the handshake token for `secret` and `identifier`.
pub fn generate_token(secret: &str, identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(identifier.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check `token` against the one derived from `secret` and `identifier`.
///
/// Plain string equality, not a constant-time comparison.
pub fn is_valid_token(token: &str, secret: &str, identifier: &str) -> bool {
    token == generate_token(secret, identifier)
}
