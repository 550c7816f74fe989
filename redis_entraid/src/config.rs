//! Configuration for the supported Entra ID credential flows
//!
//! Every configuration type can be deserialized with serde. Durations accept
//! human-readable values such as `"5s"`.

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use entraid_tokens::{ClientAssertion, ClientId, ClientSecret, ConfigurationError};
use serde::Deserialize;
use url::Url;

/// The scope requested for Azure Cache for Redis when none is configured
pub const REDIS_SCOPE: &str = "https://redis.azure.com/.default";

/// The resource requested for Azure Cache for Redis by managed identities
pub const REDIS_RESOURCE: &str = "https://redis.azure.com";

/// The public-cloud Entra ID authority host
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// The Azure Instance Metadata Service managed-identity token endpoint
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Environment variable naming the application (client) ID
pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
/// Environment variable holding a client secret
pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
/// Environment variable naming the directory (tenant) ID
pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
/// Environment variable overriding the authority host
pub const AZURE_AUTHORITY_HOST: &str = "AZURE_AUTHORITY_HOST";
/// Environment variable pointing at a workload-identity federated token file
pub const AZURE_FEDERATED_TOKEN_FILE: &str = "AZURE_FEDERATED_TOKEN_FILE";
/// Environment variable set by App Service with its managed-identity endpoint
pub const IDENTITY_ENDPOINT: &str = "IDENTITY_ENDPOINT";
/// Environment variable set by App Service with the secret for its identity endpoint
pub const IDENTITY_HEADER: &str = "IDENTITY_HEADER";

/// A source of environment variables
///
/// The process environment is used by default; tests and embedders may
/// supply their own.
pub trait EnvSource: Send + Sync {
    /// Looks up a variable, treating an empty value as unset
    fn var(&self, name: &str) -> Option<String>;
}

/// The environment of the current process
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).filter(|v| !v.is_empty()).cloned()
    }
}

/// The settings for one of the supported credential flows
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdentityProviderConfig {
    /// A managed identity assigned to the hosting Azure resource
    ManagedIdentity(ManagedIdentityConfig),
    /// An application registration authenticating with its own credential
    ServicePrincipal(ServicePrincipalConfig),
    /// Whichever credential the environment makes available
    DefaultAzureCredential(DefaultAzureCredentialConfig),
}

impl From<ManagedIdentityConfig> for IdentityProviderConfig {
    fn from(config: ManagedIdentityConfig) -> Self {
        Self::ManagedIdentity(config)
    }
}

impl From<ServicePrincipalConfig> for IdentityProviderConfig {
    fn from(config: ServicePrincipalConfig) -> Self {
        Self::ServicePrincipal(config)
    }
}

impl From<DefaultAzureCredentialConfig> for IdentityProviderConfig {
    fn from(config: DefaultAzureCredentialConfig) -> Self {
        Self::DefaultAzureCredential(config)
    }
}

/// Whether the managed identity belongs to the resource or was assigned to it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedIdentityType {
    /// The identity tied to the lifecycle of the hosting resource
    SystemAssigned,
    /// A standalone identity assigned to the hosting resource
    UserAssigned,
}

/// How a user-assigned managed identity is identified
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedIdentityIdType {
    /// The identity's application (client) ID
    ClientId,
    /// The identity's object (principal) ID
    ObjectId,
    /// The identity's full Azure resource ID
    ResourceId,
}

/// Where managed-identity tokens are requested from
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManagedIdentityEndpoint {
    /// The Azure Instance Metadata Service, or a compatible endpoint
    Imds {
        /// The token endpoint
        url: Url,
    },
    /// The App Service (and Functions) identity endpoint
    AppService {
        /// The token endpoint
        url: Url,
        /// The secret sent in the `X-IDENTITY-HEADER` header
        header: ClientSecret,
    },
}

impl ManagedIdentityEndpoint {
    /// Detects the endpoint for the current host
    ///
    /// The App Service endpoint is used when both `IDENTITY_ENDPOINT` and
    /// `IDENTITY_HEADER` are set; otherwise the Instance Metadata Service.
    pub fn detect(env: &dyn EnvSource) -> Result<Self, ConfigurationError> {
        match (env.var(IDENTITY_ENDPOINT), env.var(IDENTITY_HEADER)) {
            (Some(url), Some(header)) => Ok(Self::AppService {
                url: parse_url(IDENTITY_ENDPOINT, &url)?,
                header: ClientSecret::new(header),
            }),
            _ => Ok(Self::Imds {
                url: parse_url("endpoint", IMDS_ENDPOINT)?,
            }),
        }
    }
}

/// Settings for acquiring tokens with a managed identity
#[derive(Clone, Debug, Deserialize)]
pub struct ManagedIdentityConfig {
    /// The kind of managed identity
    pub identity_type: ManagedIdentityType,
    /// The resource a token is requested for
    #[serde(default = "default_resource")]
    pub resource: String,
    /// How a user-assigned identity is identified
    #[serde(default)]
    pub id_type: Option<ManagedIdentityIdType>,
    /// The identifier of a user-assigned identity
    #[serde(default)]
    pub id_value: Option<String>,
    /// The token endpoint, detected from the environment when not set
    #[serde(default)]
    pub endpoint: Option<ManagedIdentityEndpoint>,
    /// Additional query parameters sent with each token request
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

fn default_resource() -> String {
    REDIS_RESOURCE.to_owned()
}

impl ManagedIdentityConfig {
    /// Settings for the hosting resource's system-assigned identity
    pub fn system_assigned(resource: impl Into<String>) -> Self {
        Self {
            identity_type: ManagedIdentityType::SystemAssigned,
            resource: resource.into(),
            id_type: None,
            id_value: None,
            endpoint: None,
            extra_params: BTreeMap::new(),
        }
    }

    /// Settings for a user-assigned identity
    pub fn user_assigned(
        resource: impl Into<String>,
        id_type: ManagedIdentityIdType,
        id_value: impl Into<String>,
    ) -> Self {
        Self {
            identity_type: ManagedIdentityType::UserAssigned,
            id_type: Some(id_type),
            id_value: Some(id_value.into()),
            ..Self::system_assigned(resource)
        }
    }

    /// Requests tokens from the given endpoint instead of detecting one
    pub fn with_endpoint(mut self, endpoint: ManagedIdentityEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Adds a query parameter to each token request
    pub fn with_extra_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(name.into(), value.into());
        self
    }

    /// Checks that the settings identify exactly one managed identity
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.resource.trim().is_empty() {
            return Err(ConfigurationError::missing(
                "resource",
                "for managed identity authentication",
            ));
        }

        if self.identity_type == ManagedIdentityType::UserAssigned {
            if self.id_type.is_none() {
                return Err(ConfigurationError::missing(
                    "id_type",
                    "for user-assigned managed identity",
                ));
            }

            if self.id_value.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigurationError::missing(
                    "id_value",
                    "for user-assigned managed identity",
                ));
            }
        }

        Ok(())
    }

    /// The identifier selecting a user-assigned identity, if any
    pub(crate) fn user_assigned_id(&self) -> Option<(ManagedIdentityIdType, &str)> {
        match self.identity_type {
            ManagedIdentityType::SystemAssigned => None,
            ManagedIdentityType::UserAssigned => self.id_type.zip(self.id_value.as_deref()),
        }
    }
}

/// The credential a service principal presents to the token endpoint
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCredential {
    /// A client secret
    Secret(ClientSecret),
    /// A pre-signed client assertion
    Assertion(ClientAssertion),
    /// A file containing a client assertion, re-read for every request
    AssertionFile(PathBuf),
}

/// Settings for acquiring tokens as a service principal
#[derive(Clone, Debug, Deserialize)]
pub struct ServicePrincipalConfig {
    /// The application (client) ID
    pub client_id: ClientId,
    /// The credential proving the application's identity
    pub client_credential: ClientCredential,
    /// The scopes requested; [`REDIS_SCOPE`] when empty
    #[serde(default)]
    pub scopes: Vec<String>,
    /// A limit on each HTTP request to the token endpoint
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// The directory (tenant) ID
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// The full authority URL, overriding the one derived from the tenant
    #[serde(default)]
    pub authority: Option<Url>,
    /// Additional form fields sent with each token request
    #[serde(default)]
    pub token_params: BTreeMap<String, String>,
}

impl ServicePrincipalConfig {
    /// Settings for a service principal authenticating with a client secret
    pub fn from_secret(client_id: impl Into<ClientId>, secret: impl Into<ClientSecret>) -> Self {
        Self::new(client_id.into(), ClientCredential::Secret(secret.into()))
    }

    /// Settings for a service principal authenticating with the given credential
    pub fn new(client_id: ClientId, client_credential: ClientCredential) -> Self {
        Self {
            client_id,
            client_credential,
            scopes: Vec::new(),
            timeout: None,
            tenant_id: None,
            authority: None,
            token_params: BTreeMap::new(),
        }
    }

    /// Reads the settings from the process environment
    ///
    /// Requires `AZURE_CLIENT_ID`, plus either `AZURE_CLIENT_SECRET` or
    /// `AZURE_FEDERATED_TOKEN_FILE`. `AZURE_TENANT_ID` and
    /// `AZURE_AUTHORITY_HOST` are honored when set.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_env_source(&ProcessEnv)
    }

    /// Reads the settings from the given environment
    pub fn from_env_source(env: &dyn EnvSource) -> Result<Self, ConfigurationError> {
        let client_id = env
            .var(AZURE_CLIENT_ID)
            .ok_or(ConfigurationError::missing(AZURE_CLIENT_ID, "in the environment"))?;

        let client_credential = if let Some(secret) = env.var(AZURE_CLIENT_SECRET) {
            ClientCredential::Secret(ClientSecret::new(secret))
        } else if let Some(file) = env.var(AZURE_FEDERATED_TOKEN_FILE) {
            ClientCredential::AssertionFile(PathBuf::from(file))
        } else {
            return Err(ConfigurationError::missing(
                AZURE_CLIENT_SECRET,
                "in the environment, or `AZURE_FEDERATED_TOKEN_FILE`",
            ));
        };

        let tenant_id = env.var(AZURE_TENANT_ID);
        let authority = match env.var(AZURE_AUTHORITY_HOST) {
            Some(host) => Some(authority_url(&host, tenant_id.as_deref())?),
            None => None,
        };

        Ok(Self {
            tenant_id,
            authority,
            ..Self::new(ClientId::new(client_id), client_credential)
        })
    }

    /// Sets the scopes requested
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the directory (tenant) ID
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the full authority URL
    pub fn with_authority(mut self, authority: Url) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Sets the limit on each HTTP request to the token endpoint
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a form field to each token request
    pub fn with_token_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.token_params.insert(name.into(), value.into());
        self
    }

    /// Checks that the settings are usable
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.client_id.as_str().is_empty() {
            return Err(ConfigurationError::missing(
                "client_id",
                "for service principal authentication",
            ));
        }

        let credential_empty = match &self.client_credential {
            ClientCredential::Secret(s) => s.as_str().is_empty(),
            ClientCredential::Assertion(a) => a.as_str().is_empty(),
            ClientCredential::AssertionFile(p) => p.as_os_str().is_empty(),
        };
        if credential_empty {
            return Err(ConfigurationError::missing(
                "client_credential",
                "for service principal authentication",
            ));
        }

        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigurationError::invalid("timeout", "must be greater than zero"));
        }

        Ok(())
    }

    /// The scopes to request, falling back to [`REDIS_SCOPE`]
    pub fn effective_scopes(&self) -> Vec<String> {
        if self.scopes.is_empty() {
            vec![REDIS_SCOPE.to_owned()]
        } else {
            self.scopes.clone()
        }
    }

    /// The authority tokens are requested from
    ///
    /// Without an explicit authority or tenant, the multi-tenant `common`
    /// authority is used.
    pub fn effective_authority(&self) -> Result<Url, ConfigurationError> {
        match &self.authority {
            Some(authority) => Ok(authority.clone()),
            None => authority_url(DEFAULT_AUTHORITY_HOST, self.tenant_id.as_deref()),
        }
    }
}

/// Settings for the default credential chain
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DefaultAzureCredentialConfig {
    /// The scopes requested; must not be empty
    #[serde(default)]
    pub scopes: Vec<String>,
    /// The directory (tenant) ID
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// The full authority URL used by credentials that contact Entra ID directly
    #[serde(default)]
    pub authority: Option<Url>,
    /// Additional parameters sent with each token request
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

impl DefaultAzureCredentialConfig {
    /// Settings requesting the given scopes
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the directory (tenant) ID
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the full authority URL
    pub fn with_authority(mut self, authority: Url) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Checks that the settings are usable
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.scopes.is_empty() {
            return Err(ConfigurationError::missing(
                "scopes",
                "for the default credential chain",
            ));
        }

        if self.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigurationError::invalid("scopes", "must not contain empty scopes"));
        }

        Ok(())
    }
}

/// Builds `{host}/{tenant}`, using the `common` tenant when none is given
pub(crate) fn authority_url(host: &str, tenant_id: Option<&str>) -> Result<Url, ConfigurationError> {
    let tenant = tenant_id.unwrap_or("common");
    parse_url("authority", &format!("{}/{}", host.trim_end_matches('/'), tenant))
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigurationError> {
    Url::parse(value).map_err(|e| ConfigurationError::invalid(field, e.to_string()))
}
