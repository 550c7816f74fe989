//! The identity provider seam

use std::sync::Arc;

use async_trait::async_trait;

use crate::{error::RequestTokenError, Token};

/// A source of access tokens
///
/// Implementations exchange some credential for a fresh [`Token`] each time
/// they are asked. They may cache tokens internally, in which case
/// `force_refresh` asks them to bypass that cache where they are able to.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// A short name identifying the credential flow, used in logs
    fn name(&self) -> &str;

    /// Requests a token from the identity platform
    async fn request_token(&self, force_refresh: bool) -> Result<Token, RequestTokenError>;
}

#[async_trait]
impl<P: IdentityProvider + ?Sized> IdentityProvider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn request_token(&self, force_refresh: bool) -> Result<Token, RequestTokenError> {
        (**self).request_token(force_refresh).await
    }
}

#[async_trait]
impl<P: IdentityProvider + ?Sized> IdentityProvider for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn request_token(&self, force_refresh: bool) -> Result<Token, RequestTokenError> {
        (**self).request_token(force_refresh).await
    }
}
