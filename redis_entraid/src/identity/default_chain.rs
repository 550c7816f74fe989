use std::{
    fmt, io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use entraid_tokens::{
    clock::{Clock, System, UnixMillis},
    ConfigurationError, IdentityProvider, RequestTokenError, Token,
};

use super::{dto, managed_identity, ManagedIdentityCredential, ServicePrincipalCredential};
use crate::{
    config::{
        self, DefaultAzureCredentialConfig, EnvSource, ManagedIdentityConfig,
        ManagedIdentityIdType, ServicePrincipalConfig,
    },
    Error,
};

const NONE_SELECTED: usize = usize::MAX;

/// Tries a sequence of identity providers in order, using the first that
/// produces a token
///
/// Once a provider has succeeded, it is tried first on later requests. The
/// whole sequence is walked again only if it stops working.
pub struct ChainedCredential {
    links: Vec<Arc<dyn IdentityProvider>>,
    selected: AtomicUsize,
}

impl fmt::Debug for ChainedCredential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChainedCredential")
            .field("links", &self.links.iter().map(|l| l.name()).collect::<Vec<_>>())
            .field("selected", &self.selected.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChainedCredential {
    /// Constructs a chain over the given providers
    pub fn new(links: Vec<Arc<dyn IdentityProvider>>) -> Result<Self, ConfigurationError> {
        if links.is_empty() {
            return Err(ConfigurationError::missing(
                "links",
                "for a chained credential",
            ));
        }

        Ok(Self {
            links,
            selected: AtomicUsize::new(NONE_SELECTED),
        })
    }

    /// The default credential chain: environment, then managed identity,
    /// then the Azure CLI
    ///
    /// Environment variables are read from `env` once, at construction.
    pub fn default_azure_credential(
        config: DefaultAzureCredentialConfig,
        env: &dyn EnvSource,
    ) -> Result<Self, Error> {
        config.validate()?;

        let environment = EnvironmentCredential::new(&config, env)?;

        let resource = config.scopes[0]
            .strip_suffix("/.default")
            .unwrap_or(&config.scopes[0])
            .to_owned();
        let mut managed_identity = match env.var(config::AZURE_CLIENT_ID) {
            Some(client_id) => {
                ManagedIdentityConfig::user_assigned(resource, ManagedIdentityIdType::ClientId, client_id)
            }
            None => ManagedIdentityConfig::system_assigned(resource),
        };
        managed_identity.extra_params = config.extra_params.clone();
        let managed_identity = ManagedIdentityCredential::chained(
            managed_identity,
            env,
            managed_identity::CHAINED_CONNECT_TIMEOUT,
            managed_identity::CHAINED_REQUEST_TIMEOUT,
        )?;

        let cli = AzureCliCredential::new(config.scopes.clone(), config.tenant_id.clone());

        let links: Vec<Arc<dyn IdentityProvider>> = vec![
            Arc::new(environment) as Arc<dyn IdentityProvider>,
            Arc::new(managed_identity) as Arc<dyn IdentityProvider>,
            Arc::new(cli) as Arc<dyn IdentityProvider>,
        ];

        Ok(Self::new(links)?)
    }

    /// The name of the provider that last produced a token, if any
    pub fn selected(&self) -> Option<&str> {
        self.links
            .get(self.selected.load(Ordering::Acquire))
            .map(|l| l.name())
    }
}

#[async_trait]
impl IdentityProvider for ChainedCredential {
    fn name(&self) -> &str {
        "default_azure_credential"
    }

    async fn request_token(&self, force_refresh: bool) -> Result<Token, RequestTokenError> {
        let selected = self.selected.load(Ordering::Acquire);
        if let Some(link) = self.links.get(selected) {
            match link.request_token(force_refresh).await {
                Ok(token) => return Ok(token),
                Err(error) => {
                    tracing::warn!(
                        provider = link.name(),
                        error = (&error as &dyn std::error::Error),
                        "previously successful credential failed, walking the chain again"
                    );
                }
            }
        }

        let mut failures = Vec::with_capacity(self.links.len());
        for (idx, link) in self.links.iter().enumerate() {
            match link.request_token(force_refresh).await {
                Ok(token) => {
                    tracing::info!(provider = link.name(), "selected credential from chain");
                    self.selected.store(idx, Ordering::Release);
                    return Ok(token);
                }
                Err(error) => {
                    tracing::debug!(
                        provider = link.name(),
                        error = (&error as &dyn std::error::Error),
                        "credential unavailable, trying next"
                    );
                    failures.push(format!("{}: {}", link.name(), error));
                }
            }
        }

        self.selected.store(NONE_SELECTED, Ordering::Release);
        Err(RequestTokenError::unavailable(format!(
            "no credential in the chain produced a token: {}",
            failures.join("; ")
        )))
    }
}

/// A service principal described by environment variables
///
/// Uses `AZURE_CLIENT_ID` and `AZURE_TENANT_ID` with either
/// `AZURE_CLIENT_SECRET` or a workload-identity `AZURE_FEDERATED_TOKEN_FILE`.
/// Reports itself unavailable when those are not set.
#[derive(Debug)]
pub struct EnvironmentCredential {
    inner: Option<ServicePrincipalCredential>,
}

impl EnvironmentCredential {
    /// Reads the environment, requesting the scopes in `config`
    ///
    /// A tenant or authority given in `config` takes precedence over the
    /// environment.
    pub fn new(config: &DefaultAzureCredentialConfig, env: &dyn EnvSource) -> Result<Self, Error> {
        let Ok(mut sp) = ServicePrincipalConfig::from_env_source(env) else {
            tracing::debug!("environment does not describe a service principal");
            return Ok(Self { inner: None });
        };

        if let Some(tenant_id) = &config.tenant_id {
            sp.tenant_id = Some(tenant_id.clone());
        }

        let Some(tenant_id) = sp.tenant_id.as_deref() else {
            tracing::debug!("environment does not name a tenant");
            return Ok(Self { inner: None });
        };

        sp.authority = match &config.authority {
            Some(authority) => Some(authority.clone()),
            None => {
                let host = env
                    .var(config::AZURE_AUTHORITY_HOST)
                    .unwrap_or_else(|| config::DEFAULT_AUTHORITY_HOST.to_owned());
                Some(config::authority_url(&host, Some(tenant_id))?)
            }
        };
        sp.scopes = config.scopes.clone();
        sp.token_params = config.extra_params.clone();

        Ok(Self {
            inner: Some(ServicePrincipalCredential::new(sp)?),
        })
    }
}

#[async_trait]
impl IdentityProvider for EnvironmentCredential {
    fn name(&self) -> &str {
        "environment"
    }

    async fn request_token(&self, force_refresh: bool) -> Result<Token, RequestTokenError> {
        match &self.inner {
            Some(sp) => sp.request_token(force_refresh).await,
            None => Err(RequestTokenError::unavailable(
                "environment variables are not fully configured",
            )),
        }
    }
}

/// Acquires tokens from a signed-in Azure CLI
///
/// `force_refresh` has no effect; the CLI manages its own cache.
#[derive(Debug)]
pub struct AzureCliCredential {
    program: String,
    scopes: Vec<String>,
    tenant_id: Option<String>,
}

impl AzureCliCredential {
    /// Requests tokens for `scopes` with the `az` on the search path
    pub fn new(scopes: Vec<String>, tenant_id: Option<String>) -> Self {
        Self {
            program: "az".to_owned(),
            scopes,
            tenant_id,
        }
    }

    /// Runs the given executable instead of `az`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self) -> Vec<&str> {
        let mut args = vec!["account", "get-access-token", "--output", "json", "--scope"];
        args.extend(self.scopes.iter().map(String::as_str));
        if let Some(tenant_id) = &self.tenant_id {
            args.extend(["--tenant", tenant_id.as_str()]);
        }
        args
    }
}

#[async_trait]
impl IdentityProvider for AzureCliCredential {
    fn name(&self) -> &str {
        "azure_cli"
    }

    async fn request_token(&self, _force_refresh: bool) -> Result<Token, RequestTokenError> {
        tracing::debug!(program = %self.program, "requesting token from Azure CLI");

        let output = tokio::process::Command::new(&self.program)
            .args(self.args())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                let message = if e.kind() == io::ErrorKind::NotFound {
                    "Azure CLI not found on path".to_owned()
                } else {
                    format!("failed to run Azure CLI: {}", e)
                };
                RequestTokenError::unavailable(message).with_source(e)
            })?;
        let received_at = System.now();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(if stderr.contains("az login") || stderr.contains("az account set") {
                RequestTokenError::unavailable(format!("Azure CLI is not signed in: {}", stderr))
            } else {
                RequestTokenError::platform(stderr.to_owned())
            });
        }

        let resp: dto::CliTokenResponse =
            serde_json::from_slice(&output.stdout).map_err(RequestTokenError::malformed)?;
        let expires_on = resp.expires_on.map(|s| UnixMillis::from_secs(s.get()));

        Token::from_endpoint(resp.access_token, expires_on, received_at)
            .map_err(RequestTokenError::malformed)
    }
}
