use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use entraid_tokens::{IdentityProvider, RequestTokenError, RequestTokenErrorKind, Token};
use url::Url;

use crate::{
    config::{EnvSource, ManagedIdentityConfig, ManagedIdentityEndpoint, ManagedIdentityIdType},
    Error,
};

const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Connect timeout for managed identity within a credential chain
pub(crate) const CHAINED_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Request timeout for managed identity within a credential chain
pub(crate) const CHAINED_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Acquires tokens for a managed identity from the hosting platform
///
/// The platform caches tokens on its side, so requests always go to the
/// endpoint and `force_refresh` has no effect.
pub struct ManagedIdentityCredential {
    client: reqwest::Client,
    endpoint: ManagedIdentityEndpoint,
    resource: String,
    identity: Option<(ManagedIdentityIdType, String)>,
    extra_params: BTreeMap<String, String>,
    chained: bool,
}

impl fmt::Debug for ManagedIdentityCredential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ManagedIdentityCredential")
            .field("endpoint", &self.endpoint)
            .field("resource", &self.resource)
            .field("identity", &self.identity)
            .field("chained", &self.chained)
            .finish_non_exhaustive()
    }
}

impl ManagedIdentityCredential {
    /// Validates `config` and builds the credential
    ///
    /// When `config` names no endpoint, one is detected from `env`.
    pub fn new(config: ManagedIdentityConfig, env: &dyn EnvSource) -> Result<Self, Error> {
        Self::build(config, env, reqwest::Client::builder(), false)
    }

    /// Builds a credential that gives up quickly when no endpoint answers
    ///
    /// Off Azure the metadata address is usually unroutable, so connections
    /// hang rather than fail. Such a credential reports itself unavailable
    /// once `connect_timeout` or `timeout` passes, letting a credential chain
    /// move on.
    pub(crate) fn chained(
        config: ManagedIdentityConfig,
        env: &dyn EnvSource,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout);
        Self::build(config, env, builder, true)
    }

    fn build(
        config: ManagedIdentityConfig,
        env: &dyn EnvSource,
        builder: reqwest::ClientBuilder,
        chained: bool,
    ) -> Result<Self, Error> {
        config.validate()?;

        let identity = config
            .user_assigned_id()
            .map(|(id_type, value)| (id_type, value.to_owned()));

        let endpoint = match config.endpoint {
            Some(endpoint) => endpoint,
            None => ManagedIdentityEndpoint::detect(env)?,
        };

        Ok(Self {
            client: super::http_client(builder)?,
            endpoint,
            resource: config.resource,
            identity,
            extra_params: config.extra_params,
            chained,
        })
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let (url, api_version, header) = match &self.endpoint {
            ManagedIdentityEndpoint::Imds { url } => (url, IMDS_API_VERSION, None),
            ManagedIdentityEndpoint::AppService { url, header } => {
                (url, APP_SERVICE_API_VERSION, Some(header))
            }
        };

        let mut url: Url = url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api-version", api_version);
            query.append_pair("resource", &self.resource);

            if let Some((id_type, value)) = &self.identity {
                query.append_pair(id_param(*id_type, header.is_some()), value);
            }

            for (name, value) in &self.extra_params {
                query.append_pair(name, value);
            }
        }

        let request = self.client.get(url);
        match header {
            None => request.header("Metadata", "true"),
            Some(secret) => request.header("X-IDENTITY-HEADER", secret.as_str()),
        }
    }
}

/// The query parameter naming a user-assigned identity
///
/// The two endpoints disagree on the names of the object and resource ID
/// parameters.
fn id_param(id_type: ManagedIdentityIdType, app_service: bool) -> &'static str {
    match (id_type, app_service) {
        (ManagedIdentityIdType::ClientId, _) => "client_id",
        (ManagedIdentityIdType::ObjectId, false) => "object_id",
        (ManagedIdentityIdType::ObjectId, true) => "principal_id",
        (ManagedIdentityIdType::ResourceId, false) => "msi_res_id",
        (ManagedIdentityIdType::ResourceId, true) => "mi_res_id",
    }
}

#[async_trait]
impl IdentityProvider for ManagedIdentityCredential {
    fn name(&self) -> &str {
        "managed_identity"
    }

    async fn request_token(&self, _force_refresh: bool) -> Result<Token, RequestTokenError> {
        match super::request_token(self.name(), self.request()).await {
            Err(error) if self.chained && error.kind() == RequestTokenErrorKind::Transport => {
                Err(RequestTokenError::unavailable(format!(
                    "managed identity endpoint did not respond: {}",
                    error
                ))
                .with_source(error))
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use entraid_tokens::ClientSecret;

    use super::*;
    use crate::config::REDIS_RESOURCE;

    fn imds(url: &str) -> Result<ManagedIdentityEndpoint> {
        Ok(ManagedIdentityEndpoint::Imds {
            url: Url::parse(url)?,
        })
    }

    fn no_env() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn imds_request_carries_identity_and_metadata_header() -> Result<()> {
        let config = ManagedIdentityConfig::user_assigned(
            REDIS_RESOURCE,
            ManagedIdentityIdType::ResourceId,
            "/subscriptions/0/rg/identity",
        )
        .with_endpoint(imds("http://127.0.0.1:1/token")?)
        .with_extra_param("extra", "1");

        let credential = ManagedIdentityCredential::new(config, &no_env())?;
        let request = credential.request().build()?;

        let pairs: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("api-version".to_owned(), "2018-02-01".to_owned()),
                ("resource".to_owned(), REDIS_RESOURCE.to_owned()),
                ("msi_res_id".to_owned(), "/subscriptions/0/rg/identity".to_owned()),
                ("extra".to_owned(), "1".to_owned()),
            ]
        );
        assert_eq!(request.headers()["Metadata"], "true");
        Ok(())
    }

    #[test]
    fn app_service_request_uses_identity_header() -> Result<()> {
        let config = ManagedIdentityConfig::user_assigned(
            REDIS_RESOURCE,
            ManagedIdentityIdType::ObjectId,
            "object",
        )
        .with_endpoint(ManagedIdentityEndpoint::AppService {
            url: Url::parse("http://127.0.0.1:1/msi/token")?,
            header: ClientSecret::new("header-secret".to_owned()),
        });

        let credential = ManagedIdentityCredential::new(config, &no_env())?;
        let request = credential.request().build()?;

        assert!(request.url().query().unwrap_or_default().contains("api-version=2019-08-01"));
        assert!(request.url().query().unwrap_or_default().contains("principal_id=object"));
        assert_eq!(request.headers()["X-IDENTITY-HEADER"], "header-secret");
        assert!(request.headers().get("Metadata").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn silent_endpoint_is_unavailable_when_chained() -> Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = ManagedIdentityConfig::system_assigned(REDIS_RESOURCE)
            .with_endpoint(imds(&format!("http://{}/token", addr))?);
        let credential = ManagedIdentityCredential::chained(
            config,
            &no_env(),
            Duration::from_millis(200),
            Duration::from_millis(300),
        )?;

        let err = tokio::time::timeout(Duration::from_secs(5), credential.request_token(false))
            .await?
            .unwrap_err();
        assert_eq!(err.kind(), RequestTokenErrorKind::Unavailable);
        Ok(())
    }

    #[test]
    fn user_assigned_without_identifier_is_rejected() {
        let mut config = ManagedIdentityConfig::system_assigned(REDIS_RESOURCE);
        config.identity_type = crate::config::ManagedIdentityType::UserAssigned;

        let err = ManagedIdentityCredential::new(config, &no_env()).unwrap_err();
        assert!(err.is_configuration());
    }
}
