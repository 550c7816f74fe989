use clap::Parser;
use entraid_tokens::{RefreshConfig, TokenManager};
use redis_entraid::config::{ManagedIdentityConfig, ManagedIdentityIdType, REDIS_RESOURCE};
use std::time::Duration;

#[derive(Debug, Parser)]
struct Opts {
    /// The resource to request a token for
    #[arg(short, long, env, default_value = REDIS_RESOURCE)]
    resource: String,

    /// The client ID of a user-assigned managed identity
    ///
    /// When omitted, the system-assigned identity is used.
    #[arg(short, long, env = "AZURE_CLIENT_ID")]
    client_id: Option<String>,

    /// The limit on a single token request, in milliseconds
    #[arg(short, long, env, default_value_t = 5000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = match opts.client_id {
        Some(client_id) => {
            ManagedIdentityConfig::user_assigned(opts.resource, ManagedIdentityIdType::ClientId, client_id)
        }
        None => ManagedIdentityConfig::system_assigned(opts.resource),
    };
    let refresh =
        RefreshConfig::default().with_request_timeout(Duration::from_millis(opts.timeout_ms));

    let provider = redis_entraid::create_from_managed_identity(config, Some(refresh))?;
    let response = provider.manager().acquire_token(false).await?;
    let token = response.token();

    tracing::info!(
        token = format_args!("{:#?}", token.value()),
        object_id = token.object_id(),
        expires_at = token.expires_at().0,
        ttl_secs = token.ttl().as_secs(),
        "acquired access token"
    );

    Ok(())
}
