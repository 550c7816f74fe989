use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use entraid_tokens::{ClientId, IdentityProvider, RequestTokenError, Token};
use url::Url;

use super::cache::TokenCache;
use crate::{
    config::{ClientCredential, ServicePrincipalConfig},
    Error,
};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Acquires tokens for an application registration using the client
/// credentials flow
///
/// Tokens are cached in memory and reused until they come within five
/// minutes of expiring. A forced refresh evicts the cache first.
pub struct ServicePrincipalCredential {
    client: reqwest::Client,
    token_url: Url,
    client_id: ClientId,
    credential: ClientCredential,
    scope: String,
    token_params: BTreeMap<String, String>,
    cache: TokenCache,
}

impl fmt::Debug for ServicePrincipalCredential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServicePrincipalCredential")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("credential", &self.credential)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ServicePrincipalCredential {
    /// Validates `config` and builds the credential
    pub fn new(config: ServicePrincipalConfig) -> Result<Self, Error> {
        config.validate()?;

        let scope = config.effective_scopes().join(" ");
        let mut token_url = config.effective_authority()?;
        token_url
            .path_segments_mut()
            .map_err(|()| {
                entraid_tokens::ConfigurationError::invalid("authority", "cannot be a base URL")
            })?
            .pop_if_empty()
            .extend(["oauth2", "v2.0", "token"]);

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: super::http_client(builder)?,
            token_url,
            client_id: config.client_id,
            credential: config.client_credential,
            scope,
            token_params: config.token_params,
            cache: TokenCache::new(),
        })
    }

    /// The endpoint tokens are requested from
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    async fn form(&self) -> Result<Vec<(&str, String)>, RequestTokenError> {
        let mut form = vec![
            ("grant_type", "client_credentials".to_owned()),
            ("client_id", self.client_id.as_str().to_owned()),
            ("scope", self.scope.clone()),
        ];

        match &self.credential {
            ClientCredential::Secret(secret) => {
                form.push(("client_secret", secret.as_str().to_owned()));
            }
            ClientCredential::Assertion(assertion) => {
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_owned()));
                form.push(("client_assertion", assertion.as_str().to_owned()));
            }
            ClientCredential::AssertionFile(path) => {
                let assertion = tokio::fs::read_to_string(path).await.map_err(|e| {
                    RequestTokenError::unavailable(format!(
                        "unable to read client assertion from {}: {}",
                        path.display(),
                        e
                    ))
                    .with_source(e)
                })?;
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_owned()));
                form.push(("client_assertion", assertion.trim().to_owned()));
            }
        }

        form.extend(
            self.token_params
                .iter()
                .map(|(name, value)| (name.as_str(), value.clone())),
        );

        Ok(form)
    }

    async fn fetch(&self) -> Result<Token, RequestTokenError> {
        let form = self.form().await?;
        let request = self.client.post(self.token_url.clone()).form(&form);
        super::request_token(self.name(), request).await
    }
}

#[async_trait]
impl IdentityProvider for ServicePrincipalCredential {
    fn name(&self) -> &str {
        "service_principal"
    }

    async fn request_token(&self, force_refresh: bool) -> Result<Token, RequestTokenError> {
        if force_refresh {
            tracing::debug!(client_id = %self.client_id, "evicting cached token");
            self.cache.evict().await;
        }

        self.cache.get_or_fetch(|| self.fetch()).await
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use entraid_tokens::{ClientAssertion, ClientSecret};

    use super::*;
    use crate::config::REDIS_SCOPE;

    fn form_map(form: Vec<(&str, String)>) -> BTreeMap<String, String> {
        form.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }

    #[test]
    fn token_url_is_derived_from_tenant() -> Result<()> {
        let config = ServicePrincipalConfig::from_secret("client".to_owned(), "secret".to_owned())
            .with_tenant_id("contoso");
        let credential = ServicePrincipalCredential::new(config)?;
        assert_eq!(
            credential.token_url().as_str(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        Ok(())
    }

    #[test]
    fn token_url_tolerates_trailing_slash_on_authority() -> Result<()> {
        let config = ServicePrincipalConfig::from_secret("client".to_owned(), "secret".to_owned())
            .with_authority(Url::parse("https://login.example.com/tenant/")?);
        let credential = ServicePrincipalCredential::new(config)?;
        assert_eq!(
            credential.token_url().as_str(),
            "https://login.example.com/tenant/oauth2/v2.0/token"
        );
        Ok(())
    }

    #[tokio::test]
    async fn secret_form_uses_default_scope() -> Result<()> {
        let config = ServicePrincipalConfig::from_secret("client".to_owned(), "secret".to_owned())
            .with_token_param("claims", "{}");
        let credential = ServicePrincipalCredential::new(config)?;

        let form = form_map(credential.form().await?);

        assert_eq!(form["grant_type"], "client_credentials");
        assert_eq!(form["client_id"], "client");
        assert_eq!(form["client_secret"], "secret");
        assert_eq!(form["scope"], REDIS_SCOPE);
        assert_eq!(form["claims"], "{}");
        Ok(())
    }

    #[tokio::test]
    async fn assertion_form_joins_scopes() -> Result<()> {
        let config = ServicePrincipalConfig::new(
            ClientId::new("client".to_owned()),
            ClientCredential::Assertion(ClientAssertion::new("signed.jwt.value".to_owned())),
        )
        .with_scopes(["api://one/.default", "api://two/.default"]);
        let credential = ServicePrincipalCredential::new(config)?;

        let form = form_map(credential.form().await?);

        assert_eq!(form["client_assertion_type"], CLIENT_ASSERTION_TYPE);
        assert_eq!(form["client_assertion"], "signed.jwt.value");
        assert_eq!(form["scope"], "api://one/.default api://two/.default");
        assert!(!form.contains_key("client_secret"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_assertion_file_is_unavailable() -> Result<()> {
        let config = ServicePrincipalConfig::new(
            ClientId::new("client".to_owned()),
            ClientCredential::AssertionFile("/nonexistent/federated-token".into()),
        );
        let credential = ServicePrincipalCredential::new(config)?;

        let err = credential.form().await.unwrap_err();
        assert_eq!(err.kind(), entraid_tokens::RequestTokenErrorKind::Unavailable);
        Ok(())
    }

    #[test]
    fn empty_secret_is_rejected() {
        let config = ServicePrincipalConfig::new(
            ClientId::new("client".to_owned()),
            ClientCredential::Secret(ClientSecret::new(String::new())),
        );
        assert!(ServicePrincipalCredential::new(config)
            .unwrap_err()
            .is_configuration());
    }
}
