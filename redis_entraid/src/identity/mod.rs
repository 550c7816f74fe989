//! Identity providers for the supported Entra ID credential flows

use std::{sync::Arc, time::Duration};

use entraid_tokens::{
    clock::{Clock, System, UnixMillis},
    IdentityProvider, RequestTokenError, Token,
};
use reqwest::StatusCode;

use crate::{
    config::{
        DefaultAzureCredentialConfig, IdentityProviderConfig, ManagedIdentityConfig,
        ProcessEnv, ServicePrincipalConfig,
    },
    Error,
};

mod cache;
mod default_chain;
mod dto;
mod managed_identity;
mod service_principal;

pub use default_chain::{AzureCliCredential, ChainedCredential, EnvironmentCredential};
pub use managed_identity::ManagedIdentityCredential;
pub use service_principal::ServicePrincipalCredential;

/// Builds the identity provider described by `config`
pub fn create_identity_provider(
    config: IdentityProviderConfig,
) -> Result<Arc<dyn IdentityProvider>, Error> {
    match config {
        IdentityProviderConfig::ManagedIdentity(c) => create_managed_identity_provider(c),
        IdentityProviderConfig::ServicePrincipal(c) => create_service_principal_provider(c),
        IdentityProviderConfig::DefaultAzureCredential(c) => {
            create_default_azure_credential_provider(c)
        }
    }
}

/// Builds an identity provider for a managed identity
pub fn create_managed_identity_provider(
    config: ManagedIdentityConfig,
) -> Result<Arc<dyn IdentityProvider>, Error> {
    Ok(Arc::new(ManagedIdentityCredential::new(config, &ProcessEnv)?))
}

/// Builds an identity provider for a service principal
pub fn create_service_principal_provider(
    config: ServicePrincipalConfig,
) -> Result<Arc<dyn IdentityProvider>, Error> {
    Ok(Arc::new(ServicePrincipalCredential::new(config)?))
}

/// Builds an identity provider for the default credential chain
pub fn create_default_azure_credential_provider(
    config: DefaultAzureCredentialConfig,
) -> Result<Arc<dyn IdentityProvider>, Error> {
    Ok(Arc::new(ChainedCredential::default_azure_credential(
        config,
        &ProcessEnv,
    )?))
}

fn http_client(builder: reqwest::ClientBuilder) -> Result<reqwest::Client, Error> {
    builder
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(Error::HttpClient)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Sends a token request and interprets the response
///
/// A response carrying an `error` field is treated as a failure whatever its
/// status code, using the platform's description as the message.
#[tracing::instrument(err, skip(request))]
async fn request_token(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<Token, RequestTokenError> {
    tracing::trace!("requesting token from identity platform");

    let resp = request.send().await.map_err(RequestTokenError::transport)?;
    let received_at = System.now();
    let status = resp.status();

    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from identity platform"
    );

    let body = resp.bytes().await.map_err(RequestTokenError::transport)?;

    let error: dto::ErrorResponse = serde_json::from_slice(&body).unwrap_or_default();
    if error.error.is_some() || !status.is_success() {
        let message = match error.description() {
            Some(description) => description.to_owned(),
            None => format!(
                "token request failed with status {}: {}",
                status,
                String::from_utf8_lossy(&body)
            ),
        };

        tracing::warn!(response.status = status.as_u16(), "identity platform returned an error");

        return Err(if is_retryable_status(status) {
            RequestTokenError::service_unavailable(message)
        } else {
            RequestTokenError::platform(message)
        });
    }

    let resp: dto::TokenResponse =
        serde_json::from_slice(&body).map_err(RequestTokenError::malformed)?;

    let reported_expiry = reported_expiry(&resp, received_at);
    Token::from_endpoint(resp.access_token.to_owned(), reported_expiry, received_at)
        .map_err(RequestTokenError::malformed)
}

fn reported_expiry(resp: &dto::TokenResponse, received_at: UnixMillis) -> Option<UnixMillis> {
    match (resp.expires_on, resp.expires_in) {
        (Some(on), _) => Some(UnixMillis::from_secs(on.get())),
        (None, Some(secs)) => Some(received_at + Duration::from_secs(secs.get())),
        (None, None) => None,
    }
}
