//! Errors raised while configuring, requesting, and publishing tokens

use std::{any::Any, error, fmt, time::Duration};

use thiserror::Error;

/// A boxed error as returned from a listener callback
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// An invalid or incomplete configuration, detected before any request is made
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A required field was not provided
    #[error("`{field}` is required {context}")]
    MissingField {
        /// The name of the missing field
        field: &'static str,
        /// When the field is required
        context: &'static str,
    },
    /// A field was provided but its value is not acceptable
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue {
        /// The name of the offending field
        field: &'static str,
        /// Why the value was rejected
        message: String,
    },
}

impl ConfigurationError {
    /// Constructs an error for a missing field
    pub const fn missing(field: &'static str, context: &'static str) -> Self {
        Self::MissingField { field, context }
    }

    /// Constructs an error for a field with an unacceptable value
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// The broad category of a failed token request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestTokenErrorKind {
    /// The request could not be sent or the response could not be read
    Transport,
    /// The request did not complete within the configured timeout
    Timeout,
    /// The platform was reachable but temporarily unable to serve the request
    ServiceUnavailable,
    /// The platform rejected the request with an error payload
    Platform,
    /// The platform responded, but the response could not be understood
    MalformedResponse,
    /// The credential source is not available in this environment
    Unavailable,
    /// The runtime driving a blocking request could not be started
    Runtime,
}

/// A failure to obtain a token from an identity provider
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RequestTokenError {
    kind: RequestTokenErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl RequestTokenError {
    /// Constructs a new error of the given kind
    pub fn new(kind: RequestTokenErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches an underlying cause
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// A transport-level failure
    pub fn transport(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::new(
            RequestTokenErrorKind::Transport,
            format!("error communicating with identity provider: {}", source),
        )
        .with_source(source)
    }

    /// The request exceeded `timeout`
    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            RequestTokenErrorKind::Timeout,
            format!("token request timed out after {}ms", timeout.as_millis()),
        )
    }

    /// An error payload returned by the platform
    ///
    /// The message is the platform's own error description.
    pub fn platform(description: impl Into<String>) -> Self {
        Self::new(RequestTokenErrorKind::Platform, description)
    }

    /// The platform is temporarily unable to issue a token
    pub fn service_unavailable(description: impl Into<String>) -> Self {
        Self::new(RequestTokenErrorKind::ServiceUnavailable, description)
    }

    /// A response that could not be interpreted as a token
    pub fn malformed(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::new(
            RequestTokenErrorKind::MalformedResponse,
            format!("unable to interpret token response: {}", source),
        )
        .with_source(source)
    }

    /// The credential source cannot be used in this environment
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RequestTokenErrorKind::Unavailable, message)
    }

    /// The runtime backing a blocking request could not be built
    pub fn runtime(source: std::io::Error) -> Self {
        Self::new(
            RequestTokenErrorKind::Runtime,
            format!("unable to start token runtime: {}", source),
        )
        .with_source(source)
    }

    /// The category of this failure
    pub fn kind(&self) -> RequestTokenErrorKind {
        self.kind
    }

    /// Whether retrying the same request might succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            RequestTokenErrorKind::Transport
                | RequestTokenErrorKind::Timeout
                | RequestTokenErrorKind::ServiceUnavailable
        )
    }
}

/// An error returned, or a panic raised, by a listener callback
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerCallbackError(BoxError);

impl ListenerCallbackError {
    /// Wraps the error returned by a callback
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(error.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "listener callback panicked".to_owned()
        };

        Self(message.into())
    }

    /// The error produced by the callback
    pub fn get_ref(&self) -> &(dyn error::Error + Send + Sync + 'static) {
        &*self.0
    }

    /// Unwraps the error produced by the callback
    pub fn into_inner(self) -> BoxError {
        self.0
    }
}

/// A failure observed by the background refresh loop
///
/// These errors are never returned to a caller; they are delivered to the
/// listener's error callback.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// Renewing the token failed after exhausting all retries
    #[error(transparent)]
    RequestToken(#[from] RequestTokenError),
    /// The token callback returned an error
    #[error(transparent)]
    Listener(#[from] ListenerCallbackError),
}

impl RefreshError {
    /// Whether the error came from a listener callback rather than the identity provider
    pub fn is_listener_error(&self) -> bool {
        matches!(self, Self::Listener(_))
    }
}

/// An error while interpreting an access token
#[derive(Debug, Error)]
pub enum TokenParseError {
    /// The value is not a well-formed JWT
    #[error("access token is not a well-formed JWT")]
    MalformedJwt(#[source] aliri::error::JwtVerifyError),
    /// The JWT payload is not valid base64url
    #[error("access token payload is not valid base64url")]
    MalformedPayload(#[source] aliri_base64::InvalidBase64Data),
    /// The JWT payload is not a JSON object
    #[error("access token claims are not a JSON object")]
    MalformedClaims(#[source] serde_json::Error),
    /// Neither the token nor the response carried an expiration time
    #[error("unable to determine when the access token expires")]
    MissingExpiry,
}

impl fmt::Display for RequestTokenErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ServiceUnavailable => "service unavailable",
            Self::Platform => "platform",
            Self::MalformedResponse => "malformed response",
            Self::Unavailable => "unavailable",
            Self::Runtime => "runtime",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_error_preserves_callback_message() {
        let err = RefreshError::from(ListenerCallbackError::new("Some exception"));
        assert_eq!(err.to_string(), "Some exception");
        assert!(err.is_listener_error());
    }

    #[test]
    fn panic_payload_becomes_message() {
        let err = ListenerCallbackError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "boom");

        let err = ListenerCallbackError::from_panic(Box::new(String::from("kaboom")));
        assert_eq!(err.to_string(), "kaboom");
    }

    #[test]
    fn only_transport_level_failures_are_transient() {
        assert!(RequestTokenError::timeout(Duration::from_millis(100)).is_transient());
        assert!(RequestTokenError::service_unavailable("busy").is_transient());
        assert!(!RequestTokenError::platform("AADSTS7000215: Invalid client secret").is_transient());
        assert!(!RequestTokenError::unavailable("no managed identity").is_transient());
    }

    #[test]
    fn platform_error_uses_description_as_message() {
        let err = RequestTokenError::platform("AADSTS700016: Application not found");
        assert_eq!(err.to_string(), "AADSTS700016: Application not found");
        assert_eq!(err.kind(), RequestTokenErrorKind::Platform);
    }
}
