//! Facilities for acquiring short-lived access tokens and renewing them in the background
//!
//! This library separates _where_ a token comes from, an [`IdentityProvider`], from _when_
//! it is requested, which is the job of a [`TokenManager`]. Consumers ask the manager for a
//! token when they need one, and may start a background refresh loop which renews the token
//! before it expires and reports each renewal (or failure) to a [`Listener`].
//!
//! # Renewal schedule
//!
//! A token is renewed once a configurable fraction of its lifetime has elapsed, but never
//! later than a configurable bound before it expires. Each renewal request is bounded by a
//! timeout and retried a limited number of times when the failure looks transient. If a
//! renewal cycle fails entirely, the error is reported to the listener and the loop carries
//! on, trying again no later than the point where the last good token expires.
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use entraid_tokens::{
//!     IdentityProvider, Listener, RefreshConfig, RefreshingTokenManager, StartOptions,
//!     TokenManager,
//! };
//!
//! # async fn run(provider: Arc<dyn IdentityProvider>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = RefreshConfig::default()
//!     .with_expiration_refresh_ratio(0.7)
//!     .with_lower_refresh_bound(Duration::from_secs(60));
//!
//! let manager = RefreshingTokenManager::new(provider, config)?;
//! let first = manager.acquire_token(false).await?;
//!
//! tracing::info!(
//!     token = format_args!("{:#?}", first.token().value()),
//!     "first access token"
//! );
//!
//! let listener = Listener::new();
//! listener.set_on_next(|token| {
//!     tracing::info!(expires_at = token.expires_at().0, "token renewed");
//!     Ok(())
//! });
//! listener.set_on_error(|error| {
//!     tracing::warn!(%error, "token renewal failed");
//!     Ok(())
//! });
//!
//! manager.start(listener, StartOptions::skip_initial()).await;
//! # Ok(())
//! # }
//! ```
//!
//! Access tokens, client secrets, and client assertions are wrapped in types whose `Debug`
//! and `Display` implementations redact the value. Use alternate formatting (`{:#?}`) to
//! reveal a short prefix when diagnosing problems.

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

pub mod backoff;
mod braids;
pub mod clock;
mod config;
pub mod error;
mod listener;
mod manager;
mod provider;
mod tokens;

pub use braids::*;
pub use config::{RefreshConfig, RetryPolicy};
pub use error::{
    ConfigurationError, ListenerCallbackError, RefreshError, RequestTokenError,
    RequestTokenErrorKind,
};
pub use listener::{CallbackResult, Listener};
pub use manager::{
    BorrowedToken, RefreshingTokenManager, StartOptions, TokenManager, TokenWatcher,
};
pub use provider::IdentityProvider;
pub use tokens::{Claims, Token, TokenResponse, OBJECT_ID_CLAIM};
