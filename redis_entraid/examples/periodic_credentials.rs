use clap::Parser;
use entraid_tokens::RefreshConfig;
use redis_entraid::config::ServicePrincipalConfig;
use std::time::Duration;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The application (client) ID of the service principal
    #[arg(short, long, env = "AZURE_CLIENT_ID")]
    client_id: String,

    /// The client secret used to identify the service principal
    #[arg(short = 's', long, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    /// The directory (tenant) ID
    #[arg(short, long, env = "AZURE_TENANT_ID")]
    tenant_id: String,

    /// The scopes to request; defaults to the Redis scope
    #[arg(long, env, value_delimiter = ',')]
    scopes: Vec<String>,

    /// The fraction of a token's lifetime after which it is renewed
    #[arg(short, long, env, default_value_t = RefreshConfig::DEFAULT_EXPIRATION_REFRESH_RATIO)]
    ratio: f64,

    /// How often to print the current credentials, in seconds
    #[arg(short, long, env, default_value_t = 30)]
    interval_secs: u64,
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

    let config = ServicePrincipalConfig::from_secret(opts.client_id, opts.client_secret)
        .with_tenant_id(opts.tenant_id)
        .with_scopes(opts.scopes);
    let refresh = RefreshConfig::default()
        .with_expiration_refresh_ratio(opts.ratio)
        .with_request_timeout(Duration::from_secs(5));

    let provider = redis_entraid::create_from_service_principal(config, Some(refresh))?;

    provider.on_next(|token| {
        tracing::info!(
            token = format_args!("{:#?}", token.value()),
            expires_at = token.expires_at().0,
            "renewed access token"
        );
        Ok(())
    });
    provider.on_error(|error| {
        tracing::warn!(error = (&*error as &dyn std::error::Error), "unable to renew access token");
        Ok(())
    });

    let credentials = provider.get_credentials_async().await?;
    tracing::info!(
        username = credentials.username(),
        password = format_args!("{:#?}", credentials.password()),
        "first credentials"
    );

    let mut interval = time::interval(Duration::from_secs(opts.interval_secs));
    loop {
        interval.tick().await;

        let credentials = provider.get_credentials_async().await?;
        tracing::debug!(
            streaming = provider.is_streaming(),
            password = format_args!("{:#?}", credentials.password()),
            "pulled credentials"
        );
    }
}
