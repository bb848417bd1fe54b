//! Token checks and identity resolution, as seen by the request handler.

use async_trait::async_trait;

use crate::{
    errors::{StorageError, StorageResult},
    models::Identity,
};

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Fails with Authorization when the token is not acceptable.
    async fn check_token(&self, token: &str) -> StorageResult<()>;
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identity(&self, token: &str) -> StorageResult<Identity>;
}

/// Leaves token validation to the storage backend itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct BackendAuthenticator;

#[async_trait]
impl Authenticator for BackendAuthenticator {
    async fn check_token(&self, _token: &str) -> StorageResult<()> {
        Ok(())
    }
}

/// Treats the token as the user id. For the admin CLI and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustedIdentity;

#[async_trait]
impl Authenticator for TrustedIdentity {
    async fn check_token(&self, token: &str) -> StorageResult<()> {
        if token.trim().is_empty() {
            return Err(StorageError::Authorization("empty token".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for TrustedIdentity {
    async fn identity(&self, token: &str) -> StorageResult<Identity> {
        Ok(Identity {
            user_id: token.to_string(),
            display_name: token.to_string(),
        })
    }
}
