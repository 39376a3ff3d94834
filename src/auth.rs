//! The `AuthProvider` external contract (§2): issues bearer tokens for the
//! HTTP control plane. Credential/token acquisition from the OpenID endpoint
//! itself is explicitly out of scope (§1) — only this trait's contract is used.
//!
//! Grounded on `cc_lib/client/_client.py`'s `self.__auth.getAccessToken()` call
//! sites (construction at `Client.__init__`, use in `__initHub`/`syncHub`):
//! the module only needs that one method's contract, never the `OpenIdClient`
//! construction or refresh logic behind it.

use crate::error::NoTokenError;

/// Supplies bearer tokens to [`crate::cloud::hub::HubController`].
///
/// Implementations are free to cache, refresh, or re-request tokens however
/// they like; the only contract is that a successful call returns a token
/// usable immediately as an `Authorization: Bearer {token}` header value.
pub trait AuthProvider: Send + Sync {
    fn get_access_token(&self) -> Result<String, NoTokenError>;
}

/// An [`AuthProvider`] that always returns the same static token.
///
/// Useful for integrators fronting their own token refresh out-of-band, and
/// for tests.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        StaticToken(token.into())
    }
}

impl AuthProvider for StaticToken {
    fn get_access_token(&self) -> Result<String, NoTokenError> {
        Ok(self.0.clone())
    }
}
