//! Single-use handshake tokens.
//!
//! An authenticated HTTP surface (out of this crate) calls
//! [`TokenAuthRegistry::create_auth_token`] and hands the token to the
//! client, which presents it as the first frame on its realtime transport.
//! Redemption deletes the mapping in the same step as reading it, so a
//! token works exactly once on any instance.

use crate::errors::{AuthTokenError, BoothError};
use crate::store::{keys, StateStore};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Random bytes per token. Hex encoding doubles the length.
pub const TOKEN_BYTES: usize = 64;

/// Encoded token length in characters.
pub const TOKEN_LENGTH: usize = TOKEN_BYTES * 2;

/// Issues and redeems handshake tokens.
#[derive(Clone)]
pub struct TokenAuthRegistry {
    store: Arc<dyn StateStore>,
    ttl: Duration,
    rng: SystemRandom,
}

/// Shape check that runs before any store access.
#[must_use]
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LENGTH && token.bytes().all(|b| b.is_ascii_hexdigit())
}

impl TokenAuthRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            rng: SystemRandom::new(),
        }
    }

    /// Issue a token for `user_id`, valid for the configured TTL.
    ///
    /// # Errors
    ///
    /// `Internal` if the system RNG fails, `Store` if the write fails.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn create_auth_token(&self, user_id: &str) -> Result<String, BoothError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| BoothError::Internal("system RNG unavailable".to_string()))?;
        let token = hex::encode(bytes);

        self.store
            .set(&keys::auth_token(&token), user_id, Some(self.ttl))
            .await?;

        debug!(target: "booth.auth", user_id = %user_id, "Auth token issued");
        Ok(token)
    }

    /// Redeem a token, returning the participant it was issued for.
    ///
    /// # Errors
    ///
    /// - `AuthToken(Malformed)` without touching the store
    /// - `AuthToken(NotFound)` if expired or already redeemed
    #[instrument(skip_all)]
    pub async fn get_token_user(&self, token: &str) -> Result<String, BoothError> {
        if !is_well_formed(token) {
            return Err(AuthTokenError::Malformed.into());
        }

        self.store
            .get_del(&keys::auth_token(token))
            .await?
            .ok_or_else(|| AuthTokenError::NotFound.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(store: &Arc<MemoryStore>) -> TokenAuthRegistry {
        TokenAuthRegistry::new(
            Arc::clone(store) as Arc<dyn StateStore>,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_token_shape() {
        let store = Arc::new(MemoryStore::new());
        let token = registry(&store).create_auth_token("u1").await.unwrap();
        assert_eq!(token.len(), 128);
        assert!(is_well_formed(&token));
    }

    #[tokio::test]
    async fn test_token_redeems_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let auth = registry(&store);
        let token = auth.create_auth_token("u1").await.unwrap();

        assert_eq!(auth.get_token_user(&token).await.unwrap(), "u1");
        assert!(matches!(
            auth.get_token_user(&token).await,
            Err(BoothError::AuthToken(AuthTokenError::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_token_redeemable_from_another_registry() {
        let store = Arc::new(MemoryStore::new());
        let token = registry(&store).create_auth_token("u1").await.unwrap();
        assert_eq!(registry(&store).get_token_user(&token).await.unwrap(), "u1");
    }

    #[tokio::test]
    async fn test_malformed_tokens_rejected_before_lookup() {
        let store = Arc::new(MemoryStore::new());
        let auth = registry(&store);

        // Plant a value under a malformed key; it must never be consulted.
        store
            .set(&keys::auth_token("short"), "u1", None)
            .await
            .unwrap();

        let not_hex = "z".repeat(128);
        let too_short = "a".repeat(127);
        for bad in ["", "short", not_hex.as_str(), too_short.as_str()] {
            assert!(matches!(
                auth.get_token_user(bad).await,
                Err(BoothError::AuthToken(AuthTokenError::Malformed))
            ));
        }
        assert!(store.get(&keys::auth_token("short")).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expires() {
        let store = Arc::new(MemoryStore::new());
        let auth = registry(&store);
        let token = auth.create_auth_token("u1").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            auth.get_token_user(&token).await,
            Err(BoothError::AuthToken(AuthTokenError::NotFound))
        ));
    }
}
