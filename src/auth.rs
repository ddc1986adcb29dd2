//! Per-request authorization
//!
//! Accounts and tokens belong to an external account service. The front-end only asks it
//! one question per protected request: which account does this token belong to?

use crate::error::AuthError;
use async_trait::async_trait;
use hyper::HeaderMap;

/// Header carrying the session token on API requests
pub const TOKEN_HEADER: &str = "token";

/// Identity of an authenticated account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountId(pub String);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Resolve a token to the account that owns it
    async fn authorize(&self, token: &str) -> Result<AccountId, AuthError>;
}

/// Used when no account service is wired in. Every token is refused.
#[derive(Debug, Default)]
pub struct NoAccountService;

#[async_trait]
impl Authorizer for NoAccountService {
    async fn authorize(&self, _token: &str) -> Result<AccountId, AuthError> {
        Err(AuthError::Unavailable)
    }
}

/// Run the authorization check for a request's headers
pub async fn authorize_request(
    authorizer: &dyn Authorizer,
    headers: &HeaderMap,
) -> Result<AccountId, AuthError> {
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;

    authorizer.authorize(token).await
}
