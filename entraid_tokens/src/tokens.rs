use std::time::Duration;

use aliri::jwt::{self, BasicHeaders};
use aliri_base64::Base64Url;
use serde_json::Value;

use crate::{clock::UnixMillis, error::TokenParseError, AccessToken, AccessTokenRef};

/// The claims carried by an access token
pub type Claims = serde_json::Map<String, Value>;

/// The claim identifying the object (user or service principal) a token was issued to
pub const OBJECT_ID_CLAIM: &str = "oid";

/// An access token as issued by an identity provider
///
/// Tokens are immutable once constructed. Claims are read from the JWT payload
/// without verifying the signature; they are informational only and must not
/// be used to make trust decisions.
#[derive(Clone, Debug)]
pub struct Token {
    value: AccessToken,
    claims: Claims,
    received_at: UnixMillis,
    expires_at: UnixMillis,
}

impl Token {
    /// Constructs a token from its parts
    pub fn new(
        value: impl Into<AccessToken>,
        claims: Claims,
        received_at: UnixMillis,
        expires_at: UnixMillis,
    ) -> Self {
        Self {
            value: value.into(),
            claims,
            received_at,
            expires_at,
        }
    }

    /// Constructs a token from a JWT, taking its expiration from the `exp` claim
    pub fn from_jwt(
        value: impl Into<AccessToken>,
        received_at: UnixMillis,
    ) -> Result<Self, TokenParseError> {
        let value = value.into();
        let claims = decode_claims(&value)?;
        let expires_at = expiry_claim(&claims).ok_or(TokenParseError::MissingExpiry)?;

        Ok(Self {
            value,
            claims,
            received_at,
            expires_at,
        })
    }

    /// Constructs a token as returned from a token endpoint
    ///
    /// Claims are decoded on a best-effort basis, as some issuers return
    /// opaque access tokens. The `exp` claim is preferred when present;
    /// otherwise `reported_expiry`, as reported alongside the token, is used.
    pub fn from_endpoint(
        value: impl Into<AccessToken>,
        reported_expiry: Option<UnixMillis>,
        received_at: UnixMillis,
    ) -> Result<Self, TokenParseError> {
        let value = value.into();
        let claims = match decode_claims(&value) {
            Ok(claims) => claims,
            Err(error) => {
                tracing::trace!(
                    error = (&error as &dyn std::error::Error),
                    "access token claims unavailable"
                );
                Claims::new()
            }
        };

        let expires_at = expiry_claim(&claims)
            .or(reported_expiry)
            .ok_or(TokenParseError::MissingExpiry)?;

        Ok(Self {
            value,
            claims,
            received_at,
            expires_at,
        })
    }

    /// Gets the raw access token
    #[inline]
    pub fn value(&self) -> &AccessTokenRef {
        &self.value
    }

    /// Gets all claims carried by the token
    #[inline]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Looks up a single claim
    #[inline]
    pub fn try_get(&self, claim: &str) -> Option<&Value> {
        self.claims.get(claim)
    }

    /// Looks up a single claim, if it is a string
    pub fn try_get_str(&self, claim: &str) -> Option<&str> {
        self.try_get(claim).and_then(Value::as_str)
    }

    /// The object ID of the principal the token was issued to, if present
    pub fn object_id(&self) -> Option<&str> {
        self.try_get_str(OBJECT_ID_CLAIM)
    }

    /// Gets the time that the token was received
    #[inline]
    pub fn received_at(&self) -> UnixMillis {
        self.received_at
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expires_at(&self) -> UnixMillis {
        self.expires_at
    }

    /// Gets the token's total usable lifetime, measured from receipt
    #[inline]
    pub fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.received_at)
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, now: UnixMillis) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Whether the token has expired as of the provided time
    #[inline]
    pub fn is_expired_at(&self, now: UnixMillis) -> bool {
        now >= self.expires_at
    }
}

fn decode_claims(value: &AccessTokenRef) -> Result<Claims, TokenParseError> {
    let jwt = jwt::Jwt::from(value.as_str().to_owned());
    let decomposed = jwt
        .decompose::<BasicHeaders>()
        .map_err(TokenParseError::MalformedJwt)?;
    let payload = Base64Url::from_encoded(decomposed.untrusted_payload())
        .map_err(TokenParseError::MalformedPayload)?;

    serde_json::from_slice(payload.as_slice()).map_err(TokenParseError::MalformedClaims)
}

fn expiry_claim(claims: &Claims) -> Option<UnixMillis> {
    claims
        .get("exp")
        .and_then(Value::as_u64)
        .map(UnixMillis::from_secs)
}

/// The result of an immediate token acquisition
#[derive(Clone, Debug)]
pub struct TokenResponse {
    token: std::sync::Arc<Token>,
}

impl TokenResponse {
    pub(crate) fn new(token: std::sync::Arc<Token>) -> Self {
        Self { token }
    }

    /// Gets the acquired token
    #[inline]
    pub fn token(&self) -> &std::sync::Arc<Token> {
        &self.token
    }

    /// Unwraps the acquired token
    #[inline]
    pub fn into_token(self) -> std::sync::Arc<Token> {
        self.token
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use aliri_base64::Base64Url;

    use crate::clock::UnixMillis;

    /// Builds an unsigned JWT carrying the given claims
    pub fn unsigned_jwt(claims: serde_json::Value) -> String {
        let header = Base64Url::from_raw(br#"{"alg":"RS256","typ":"JWT"}"#.to_vec());
        let payload = Base64Url::from_raw(claims.to_string().into_bytes());
        format!("{}.{}.c2lnbmF0dXJl", header, payload)
    }

    pub fn jwt_valid_for(issued_at: UnixMillis, ttl_secs: u64, oid: &str) -> String {
        let iat = issued_at.0 / 1000;
        unsigned_jwt(serde_json::json!({
            "iat": iat,
            "exp": iat + ttl_secs,
            "oid": oid,
        }))
    }
}
