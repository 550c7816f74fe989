//! Entry points producing a ready [`CredentialsProvider`] from configuration
//!
//! Each factory validates its configuration, builds a fresh identity provider
//! and token manager, and returns a provider that has not yet requested a
//! token. When no [`RefreshConfig`] is given, [`RefreshConfig::default`] is
//! used.

use std::sync::Arc;

use entraid_tokens::{IdentityProvider, RefreshConfig};

use crate::{
    config::{
        DefaultAzureCredentialConfig, IdentityProviderConfig, ManagedIdentityConfig,
        ServicePrincipalConfig,
    },
    identity, CredentialsProvider, Error,
};

fn build(
    provider: Arc<dyn IdentityProvider>,
    refresh: Option<RefreshConfig>,
) -> Result<CredentialsProvider, Error> {
    let refresh = refresh.unwrap_or_default();
    tracing::debug!(provider = provider.name(), ?refresh, "creating credentials provider");
    Ok(CredentialsProvider::new(provider, refresh)?)
}

/// Creates a credentials provider for a managed identity
pub fn create_from_managed_identity(
    config: ManagedIdentityConfig,
    refresh: Option<RefreshConfig>,
) -> Result<CredentialsProvider, Error> {
    build(identity::create_managed_identity_provider(config)?, refresh)
}

/// Creates a credentials provider for a service principal
pub fn create_from_service_principal(
    config: ServicePrincipalConfig,
    refresh: Option<RefreshConfig>,
) -> Result<CredentialsProvider, Error> {
    build(identity::create_service_principal_provider(config)?, refresh)
}

/// Creates a credentials provider using the default credential chain
pub fn create_from_default_azure_credential(
    config: DefaultAzureCredentialConfig,
    refresh: Option<RefreshConfig>,
) -> Result<CredentialsProvider, Error> {
    build(
        identity::create_default_azure_credential_provider(config)?,
        refresh,
    )
}

/// Creates a credentials provider for whichever identity `config` describes
pub fn create_from_config(
    config: IdentityProviderConfig,
    refresh: Option<RefreshConfig>,
) -> Result<CredentialsProvider, Error> {
    build(identity::create_identity_provider(config)?, refresh)
}
