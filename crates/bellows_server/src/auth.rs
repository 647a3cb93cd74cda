//! Connection token validation.
//!
//! Two validators are consulted in order: a stored-token lookup (the token's
//! SHA-256 digest against the persisted hash) and an HS256 signed-token
//! check for user-issued tokens. Stored tokens yield the bound worker id (or
//! the token id when unbound); signed tokens yield `user:<subject>`, later
//! augmented with the hostname at registration.

use bellows_storage::Storage;
use bellows_protocol::WorkerId;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing connection token")]
    Missing,
    #[error("invalid connection token")]
    Invalid,
}

/// Resolved identity of an authenticated connection.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub worker_id: WorkerId,
    /// Present only for user-signed tokens.
    pub user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Compute the persisted digest of a connection token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Authenticator {
    storage: Storage,
    signing_secret: Option<String>,
}

impl Authenticator {
    pub fn new(storage: Storage, signing_secret: Option<String>) -> Self {
        Self {
            storage,
            signing_secret,
        }
    }

    /// Validate a bearer token and resolve the connecting identity.
    pub async fn authenticate(&self, token: &str) -> Result<AuthIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        // Stored tokens: digest lookup, equality on fixed-length hashes.
        match self.storage.get_token_by_hash(&hash_token(token)).await {
            Ok(Some(stored)) => {
                let id = stored.worker_id.clone().unwrap_or_else(|| stored.id.clone());
                return Ok(AuthIdentity {
                    worker_id: WorkerId::new(id),
                    user: None,
                });
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Token lookup failed: {}", e);
            }
        }

        // Signed user tokens.
        if let Some(secret) = &self.signing_secret {
            let validation = Validation::new(Algorithm::HS256);
            if let Ok(data) = decode::<Claims>(
                token,
                &DecodingKey::from_secret(secret.as_bytes()),
                &validation,
            ) {
                let subject = data.claims.sub;
                return Ok(AuthIdentity {
                    worker_id: WorkerId::for_user(&subject),
                    user: Some(subject),
                });
            }
        }

        Err(AuthError::Invalid)
    }

    /// Mint a signed user token. Used by the token-issuing collaborator and
    /// by tests.
    pub fn issue_user_token(&self, subject: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let secret = self.signing_secret.as_ref().ok_or(AuthError::Invalid)?;
        let claims = Claims {
            sub: subject.to_string(),
            exp: (Utc::now().timestamp() + ttl_secs) as usize,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|_| AuthError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bellows_storage::TokenRecord;

    #[test]
    fn token_digest_is_stable_hex() {
        let digest = hash_token("secret-token");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_token("secret-token"));
        assert_ne!(digest, hash_token("secret-tokem"));
    }

    #[tokio::test]
    async fn stored_token_resolves_bound_worker() {
        let storage = Storage::open_memory().await.unwrap();
        storage
            .create_token(&TokenRecord {
                id: "tok-1".to_string(),
                token_hash: hash_token("hunter2"),
                worker_id: Some("builder-1".to_string()),
                description: String::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let auth = Authenticator::new(storage, None);
        let identity = auth.authenticate("hunter2").await.unwrap();
        assert_eq!(identity.worker_id.as_str(), "builder-1");
        assert!(identity.user.is_none());
    }

    #[tokio::test]
    async fn unbound_stored_token_uses_token_id() {
        let storage = Storage::open_memory().await.unwrap();
        storage
            .create_token(&TokenRecord {
                id: "tok-9".to_string(),
                token_hash: hash_token("hunter2"),
                worker_id: None,
                description: String::new(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let auth = Authenticator::new(storage, None);
        let identity = auth.authenticate("hunter2").await.unwrap();
        assert_eq!(identity.worker_id.as_str(), "tok-9");
    }

    #[tokio::test]
    async fn signed_token_resolves_user_identity() {
        let storage = Storage::open_memory().await.unwrap();
        let auth = Authenticator::new(storage, Some("signing-secret".to_string()));

        let token = auth.issue_user_token("alice@example.com", 3600).unwrap();
        let identity = auth.authenticate(&token).await.unwrap();
        assert_eq!(identity.worker_id.as_str(), "user:alice@example.com");
        assert_eq!(identity.user.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn garbage_tokens_are_rejected() {
        let storage = Storage::open_memory().await.unwrap();
        let auth = Authenticator::new(storage, Some("signing-secret".to_string()));

        assert!(matches!(
            auth.authenticate("").await,
            Err(AuthError::Missing)
        ));
        assert!(matches!(
            auth.authenticate("not-a-token").await,
            Err(AuthError::Invalid)
        ));
    }
}
