//! Identity adapter.
//!
//! Two narrow operations the core consumes: resolve a bearer token to a user
//! id for ownership checks, and hand the importer a usable source-forge
//! access token for that user. Token issuance and the OAuth exchange that
//! stores forge tokens live outside this process; forge tokens are read from
//! the `user_credentials` side-table.
//!
//! Session tokens are `<user_uuid>.<expiry_unix>.<hex hmac-sha256>` signed
//! with AUTH_SECRET.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::docstore::DocumentStore;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Validate a bearer token and return the user it belongs to.
    async fn resolve_user(&self, bearer_token: &str) -> AppResult<Uuid>;
    /// A usable source-forge access token for the user; AUTH error when none
    /// is on file.
    async fn forge_token(&self, user_id: Uuid) -> AppResult<String>;
}

pub struct HmacIdentity {
    secret: Vec<u8>,
    store: Arc<dyn DocumentStore>,
}

impl HmacIdentity {
    pub fn new(secret: &str, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            store,
        }
    }

    fn signature(&self, payload: &str) -> AppResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AppError::ConfigInvalid("AUTH_SECRET unusable for HMAC".into()))?;
        mac.update(payload.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Issue a signed token; used by operational tooling and tests. Serving
    /// user logins is the external auth component's job.
    pub fn issue_token(&self, user_id: Uuid, ttl_secs: i64) -> AppResult<String> {
        let expiry = Utc::now().timestamp() + ttl_secs;
        let payload = format!("{user_id}.{expiry}");
        let sig = self.signature(&payload)?;
        Ok(format!("{payload}.{}", hex::encode(sig)))
    }
}

#[async_trait]
impl IdentityProvider for HmacIdentity {
    async fn resolve_user(&self, bearer_token: &str) -> AppResult<Uuid> {
        let mut parts = bearer_token.splitn(3, '.');
        let (user_raw, expiry_raw, sig_raw) = match (parts.next(), parts.next(), parts.next()) {
            (Some(u), Some(e), Some(s)) => (u, e, s),
            _ => return Err(AppError::AuthMissing("malformed session token".into())),
        };

        let user_id: Uuid = user_raw
            .parse()
            .map_err(|_| AppError::AuthMissing("malformed session token".into()))?;
        let expiry: i64 = expiry_raw
            .parse()
            .map_err(|_| AppError::AuthMissing("malformed session token".into()))?;
        if expiry < Utc::now().timestamp() {
            return Err(AppError::AuthMissing("session token expired".into()));
        }

        let sig = hex::decode(sig_raw)
            .map_err(|_| AppError::AuthMissing("malformed session token".into()))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AppError::ConfigInvalid("AUTH_SECRET unusable for HMAC".into()))?;
        mac.update(format!("{user_raw}.{expiry_raw}").as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| AppError::AuthMissing("invalid session token".into()))?;

        Ok(user_id)
    }

    async fn forge_token(&self, user_id: Uuid) -> AppResult<String> {
        self.store
            .get_forge_token(user_id)
            .await?
            .ok_or_else(|| {
                AppError::AuthMissing(format!("no source-forge credential for user {user_id}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;

    fn identity() -> HmacIdentity {
        HmacIdentity::new(
            "0123456789abcdef0123456789abcdef",
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn round_trips_valid_token() {
        let identity = identity();
        let user = Uuid::new_v4();
        let token = identity.issue_token(user, 3600).unwrap();
        assert_eq!(identity.resolve_user(&token).await.unwrap(), user);
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let identity = identity();
        let token = identity.issue_token(Uuid::new_v4(), -10).unwrap();
        assert!(matches!(
            identity.resolve_user(&token).await,
            Err(AppError::AuthMissing(_))
        ));
    }

    #[tokio::test]
    async fn rejects_tampered_signature() {
        let identity = identity();
        let token = identity.issue_token(Uuid::new_v4(), 3600).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('0') { '1' } else { '0' });
        assert!(identity.resolve_user(&tampered).await.is_err());
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let identity = identity();
        assert!(identity.resolve_user("not-a-token").await.is_err());
        assert!(identity.resolve_user("").await.is_err());
    }

    #[tokio::test]
    async fn forge_token_missing_is_auth_error() {
        let identity = identity();
        assert!(matches!(
            identity.forge_token(Uuid::new_v4()).await,
            Err(AppError::AuthMissing(_))
        ));
    }
}
