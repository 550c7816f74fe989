use entraid_tokens::{ConfigurationError, RequestTokenError};
use thiserror::Error;

/// An error constructing a credentials provider or obtaining credentials
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration was rejected before any request was made
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// A token could not be obtained from the identity platform
    #[error(transparent)]
    RequestToken(#[from] RequestTokenError),
    /// The HTTP client used to reach the identity platform could not be built
    #[error("unable to construct HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

impl Error {
    /// Whether the error was caused by invalid configuration
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
