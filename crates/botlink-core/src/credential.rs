//! The server-side credential and handshake verdicts.

use crate::token::is_valid_token;
use std::fmt;

/// Shared secret plus the identifier a client must present.
///
/// Built once when the server starts and read-only afterwards. The
/// "public key part" is a plaintext identifier, not an asymmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    shared_secret: String,
    expected_identifier: String,
}

impl Credential {
    pub fn new(shared_secret: impl Into<String>, expected_identifier: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            expected_identifier: expected_identifier.into(),
        }
    }

    pub fn expected_identifier(&self) -> &str {
        &self.expected_identifier
    }

    /// Check a client's `auth` fields.
    ///
    /// The identifier is compared first, so a mismatch is rejected whatever
    /// the token says.
    pub fn verify(&self, token: &str, identifier: &str) -> Result<(), AuthError> {
        if identifier != self.expected_identifier {
            return Err(AuthError::InvalidIdentifier);
        }
        if !is_valid_token(token, &self.shared_secret, identifier) {
            return Err(AuthError::InvalidToken);
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("shared_secret", &"<redacted>")
            .field("expected_identifier", &self.expected_identifier)
            .finish()
    }
}

/// Why a handshake was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid message format")]
    InvalidFormat,
    #[error("Invalid public key part")]
    InvalidIdentifier,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Authentication timed out")]
    Timeout,
}

impl AuthError {
    /// Text sent in `auth_result.message` and as the close reason.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
