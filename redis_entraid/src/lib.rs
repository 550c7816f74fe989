//! Microsoft Entra ID credentials for Redis clients
//!
//! This crate lets a Redis client authenticate with short-lived access tokens
//! issued by Entra ID instead of a static password. A [`CredentialsProvider`]
//! acquires a token the first time credentials are requested, then keeps it
//! renewed in the background so that later requests (and reconnections) are
//! served with a token that is still valid.
//!
//! Three ways of obtaining tokens are supported:
//!
//! * a [managed identity](config::ManagedIdentityConfig) assigned to the
//!   hosting VM, container, or App Service;
//! * a [service principal](config::ServicePrincipalConfig) using a client
//!   secret or a signed client assertion;
//! * the [default credential chain](config::DefaultAzureCredentialConfig),
//!   which tries the environment, then a managed identity, then the Azure CLI.
//!
//! ```no_run
//! use redis_entraid::{config::ManagedIdentityConfig, create_from_managed_identity};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = create_from_managed_identity(
//!     ManagedIdentityConfig::system_assigned(redis_entraid::config::REDIS_RESOURCE),
//!     None,
//! )?;
//!
//! provider.on_error(|error| {
//!     tracing::warn!(%error, "unable to renew Redis credentials");
//!     Ok(())
//! });
//!
//! let credentials = provider.get_credentials()?;
//! let parts = credentials.as_parts();
//! // AUTH <username> <token>, or AUTH <token> when no username is known
//! # let _ = parts;
//! # Ok(())
//! # }
//! ```
//!
//! Renewal timing, request timeouts, and retries are controlled by
//! [`RefreshConfig`](entraid_tokens::RefreshConfig).

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod config;
mod credentials;
mod error;
mod factory;
pub mod identity;

pub use credentials::{Credentials, CredentialsProvider};
pub use entraid_tokens;
pub use error::Error;
pub use factory::{
    create_from_config, create_from_default_azure_credential, create_from_managed_identity,
    create_from_service_principal,
};
