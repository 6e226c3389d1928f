//! Authentication support for the sync server.
//!
//! Tokens bind a principal to an issue time and are signed with
//! HMAC-SHA256.
//!
//! ## Token Format
//!
//! - 2 bytes: principal length `n` (big-endian)
//! - `n` bytes: principal id (UTF-8)
//! - 8 bytes: issue timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature over everything before it

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{PrincipalId, Timestamp};
use tidesync_store::{Clock, SystemClock};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Token validator for incoming requests.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
}

impl TokenValidator {
    /// Creates a new token validator on the system clock.
    pub fn new(config: AuthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a validator reading time from `clock`.
    pub fn with_clock(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Creates a token for `principal` issued now.
    ///
    /// Meant for tests and operator tooling; production tokens come from the
    /// identity provider sharing the secret.
    pub fn create_token(&self, principal: &PrincipalId) -> ServerResult<Vec<u8>> {
        self.create_token_at(principal, self.clock.now())
    }

    /// Creates a token for `principal` with an explicit issue time.
    pub fn create_token_at(
        &self,
        principal: &PrincipalId,
        issued_at: Timestamp,
    ) -> ServerResult<Vec<u8>> {
        let id = principal.as_str().as_bytes();
        let len = u16::try_from(id.len())
            .map_err(|_| ServerError::InvalidRequest("principal id too long".into()))?;

        let mut token = Vec::with_capacity(2 + id.len() + 8 + SIGNATURE_LEN);
        token.extend_from_slice(&len.to_be_bytes());
        token.extend_from_slice(id);
        token.extend_from_slice(&issued_at.to_be_bytes());

        let signature = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&signature);
        Ok(token)
    }

    /// Validates a token and checks it was issued to `expected`.
    pub fn validate_token(&self, token: &[u8], expected: &PrincipalId) -> ServerResult<()> {
        let invalid = || ServerError::AuthenticationFailed("malformed token".into());

        let (len_bytes, rest) = token.split_first_chunk::<2>().ok_or_else(invalid)?;
        let len = usize::from(u16::from_be_bytes(*len_bytes));
        if rest.len() != len + 8 + SIGNATURE_LEN {
            return Err(invalid());
        }
        let signed_len = 2 + len + 8;
        let (signed, signature) = token.split_at(signed_len);

        self.mac(signed)?
            .verify_slice(signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let principal = std::str::from_utf8(&rest[..len]).map_err(|_| invalid())?;
        if principal != expected.as_str() {
            return Err(ServerError::NotAuthorized(format!(
                "token issued to {principal}, request for {expected}"
            )));
        }

        let issued_bytes: [u8; 8] = rest[len..len + 8].try_into().map_err(|_| invalid())?;
        let issued_at = i64::from_be_bytes(issued_bytes);
        let expiry = i64::try_from(self.config.token_expiry.as_millis()).unwrap_or(i64::MAX);
        if self.clock.now() > issued_at.saturating_add(expiry) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }
        Ok(())
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_store::ManualClock;

    const SECRET: &[u8] = b"test-secret-key-32-bytes-long!!";

    fn validator_at(now: Timestamp) -> (TokenValidator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let config = AuthConfig::new(SECRET.to_vec()).with_expiry(Duration::from_secs(60));
        (TokenValidator::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn create_and_validate_token() {
        let (validator, _) = validator_at(1_000);
        let alice = PrincipalId::new("alice");
        let token = validator.create_token(&alice).unwrap();
        assert_eq!(token.len(), 2 + 5 + 8 + 32);
        assert!(validator.validate_token(&token, &alice).is_ok());
    }

    #[test]
    fn reject_other_principal() {
        let (validator, _) = validator_at(1_000);
        let token = validator.create_token(&PrincipalId::new("alice")).unwrap();
        assert!(matches!(
            validator.validate_token(&token, &PrincipalId::new("bob")),
            Err(ServerError::NotAuthorized(_))
        ));
    }

    #[test]
    fn reject_tampered_token() {
        let (validator, _) = validator_at(1_000);
        let alice = PrincipalId::new("alice");
        let mut token = validator.create_token(&alice).unwrap();
        let last = token.len() - 1;
        token[last] ^= 0xFF;
        assert!(matches!(
            validator.validate_token(&token, &alice),
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn reject_other_secret() {
        let (validator, _) = validator_at(1_000);
        let alice = PrincipalId::new("alice");
        let token = validator.create_token(&alice).unwrap();

        let other = TokenValidator::with_clock(
            AuthConfig::new(b"another-secret".to_vec()),
            Arc::new(ManualClock::new(1_000)),
        );
        assert!(other.validate_token(&token, &alice).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let (validator, clock) = validator_at(1_000);
        let alice = PrincipalId::new("alice");
        let token = validator.create_token(&alice).unwrap();

        clock.advance(60_000);
        assert!(validator.validate_token(&token, &alice).is_ok());
        clock.advance(1);
        assert!(validator.validate_token(&token, &alice).is_err());
    }

    #[test]
    fn reject_garbage() {
        let (validator, _) = validator_at(1_000);
        let alice = PrincipalId::new("alice");
        assert!(validator.validate_token(&[], &alice).is_err());
        assert!(validator.validate_token(&[0, 200, 1, 2], &alice).is_err());
    }
}
