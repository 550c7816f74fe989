use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use entraid_tokens::{
    CallbackResult, IdentityProvider, Listener, RefreshingTokenManager, RequestTokenError,
    RequestTokenErrorKind, StartOptions, Token, TokenManager, TokenResponse,
};
use redis_entraid::{
    create_from_service_principal, identity::ServicePrincipalCredential, CredentialsProvider,
};
use serde_json::json;
use tracing_test::traced_test;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

mod common;

/// Delegates to a real manager, counting how often the refresh loop is started
#[derive(Debug)]
struct CountingManager {
    inner: RefreshingTokenManager,
    starts: AtomicUsize,
}

impl CountingManager {
    fn new(server: &MockServer) -> Result<Self> {
        let provider: Arc<dyn IdentityProvider> =
            Arc::new(ServicePrincipalCredential::new(common::service_principal(server))?);
        Ok(Self {
            inner: RefreshingTokenManager::new(provider, common::refresh_config())?,
            starts: AtomicUsize::new(0),
        })
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenManager for CountingManager {
    async fn acquire_token(&self, force_refresh: bool) -> Result<TokenResponse, RequestTokenError> {
        self.inner.acquire_token(force_refresh).await
    }

    fn acquire_token_blocking(
        &self,
        force_refresh: bool,
    ) -> Result<TokenResponse, RequestTokenError> {
        self.inner.acquire_token_blocking(force_refresh)
    }

    async fn start(&self, listener: Listener, options: StartOptions) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.start(listener, options).await
    }

    fn start_blocking(
        &self,
        listener: Listener,
        options: StartOptions,
    ) -> Result<(), RequestTokenError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        self.inner.start_blocking(listener, options)
    }

    fn stop(&self) {
        self.inner.stop()
    }

    fn latest_token(&self) -> Option<Arc<Token>> {
        self.inner.latest_token()
    }
}

fn assert_credentials_shape(parts: &[&str]) {
    assert!(
        (1..=2).contains(&parts.len()),
        "unexpected credential count: {}",
        parts.len()
    );
    assert!(parts.last().map_or(false, |p| !p.is_empty()));
}

/// Starts a mock token endpoint on its own runtime, for tests that block
fn blocking_server() -> Result<(tokio::runtime::Runtime, MockServer)> {
    let rt = tokio::runtime::Runtime::new()?;
    let server = rt.block_on(async {
        let server = MockServer::start().await;
        common::mount_token_endpoint(&server).await;
        server
    });
    Ok((rt, server))
}

#[tokio::test]
#[traced_test]
async fn async_credentials_end_with_token() -> Result<()> {
    let server = MockServer::start().await;
    common::mount_token_endpoint(&server).await;

    let provider =
        create_from_service_principal(common::service_principal(&server), Some(common::refresh_config()))?;
    let credentials = provider.get_credentials_async().await?;

    assert_credentials_shape(&credentials.as_parts());
    assert_eq!(credentials.username(), Some(common::OBJECT_ID));
    Ok(())
}

#[test]
fn blocking_credentials_end_with_token() -> Result<()> {
    let (_rt, server) = blocking_server()?;

    let provider =
        create_from_service_principal(common::service_principal(&server), Some(common::refresh_config()))?;
    let credentials = provider.get_credentials()?;

    assert_credentials_shape(&credentials.as_parts());
    assert_eq!(credentials.into_vec().len(), 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn streaming_starts_once() -> Result<()> {
    let server = MockServer::start().await;
    common::mount_token_endpoint(&server).await;

    let provider = CredentialsProvider::with_manager(CountingManager::new(&server)?);
    assert!(!provider.is_streaming());

    provider.get_credentials_async().await?;
    assert!(provider.is_streaming());

    provider.get_credentials_async().await?;
    assert!(provider.is_streaming());
    assert_eq!(provider.manager().starts(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn concurrent_first_calls_start_streaming_once() -> Result<()> {
    let server = MockServer::start().await;
    common::mount_token_endpoint(&server).await;

    let provider = CredentialsProvider::with_manager(CountingManager::new(&server)?);

    let (a, b) = tokio::join!(
        provider.get_credentials_async(),
        provider.get_credentials_async()
    );
    a?;
    b?;

    assert!(provider.is_streaming());
    assert_eq!(provider.manager().starts(), 1);
    Ok(())
}

#[test]
fn concurrent_blocking_calls_start_streaming_once() -> Result<()> {
    let (_rt, server) = blocking_server()?;

    let provider = CredentialsProvider::with_manager(CountingManager::new(&server)?);

    std::thread::scope(|s| -> Result<()> {
        let first = s.spawn(|| provider.get_credentials());
        let second = s.spawn(|| provider.get_credentials());
        for handle in [first, second] {
            handle
                .join()
                .map_err(|_| eyre!("credential thread panicked"))??;
        }
        Ok(())
    })?;

    assert!(provider.is_streaming());
    assert_eq!(provider.manager().starts(), 1);
    Ok(())
}

#[test]
fn blocking_and_async_calls_share_one_stream() -> Result<()> {
    let (rt, server) = blocking_server()?;

    let provider = CredentialsProvider::with_manager(CountingManager::new(&server)?);

    let blocking = provider.get_credentials()?;
    let from_async = rt.block_on(provider.get_credentials_async())?;

    assert_credentials_shape(&blocking.as_parts());
    assert_credentials_shape(&from_async.as_parts());
    assert!(provider.is_streaming());
    assert_eq!(provider.manager().starts(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn failed_first_call_does_not_start_streaming() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "unauthorized_client",
            "error_description": "AADSTS700016: Application not found in the directory.",
        })))
        .mount(&server)
        .await;

    let provider = CredentialsProvider::with_manager(CountingManager::new(&server)?);
    let err = provider.get_credentials_async().await.unwrap_err();

    assert_eq!(err.kind(), RequestTokenErrorKind::Platform);
    assert!(!provider.is_streaming());
    assert_eq!(provider.manager().starts(), 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn renewed_tokens_reach_on_next() -> Result<()> {
    let server = MockServer::start().await;
    common::mount_token_endpoint(&server).await;

    let refresh = common::refresh_config().with_expiration_refresh_ratio(0.00002);
    let provider = create_from_service_principal(common::service_principal(&server), Some(refresh))?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    provider.on_next(move |token| {
        let _ = tx.send(token);
        Ok(())
    });

    let first = provider.get_credentials_async().await?;
    let renewed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| eyre!("listener dropped"))?;

    assert_ne!(renewed.value(), first.password());
    Ok(())
}

#[test]
fn renewed_tokens_reach_on_next_when_blocking() -> Result<()> {
    let (_rt, server) = blocking_server()?;

    let refresh = common::refresh_config().with_expiration_refresh_ratio(0.00002);
    let provider = create_from_service_principal(common::service_principal(&server), Some(refresh))?;

    let (tx, rx) = mpsc::channel();
    provider.on_next(move |token| {
        let _ = tx.send(token);
        Ok(())
    });

    let first = provider.get_credentials()?;
    let renewed = rx.recv_timeout(Duration::from_secs(5))?;

    assert_ne!(renewed.value(), first.password());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn failing_on_next_is_reported_to_on_error() -> Result<()> {
    let server = MockServer::start().await;
    common::mount_token_endpoint(&server).await;

    let refresh = common::refresh_config().with_expiration_refresh_ratio(0.00002);
    let provider = create_from_service_principal(common::service_principal(&server), Some(refresh))?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    provider.on_next_async(|_| async {
        let result: CallbackResult = Err("listener exploded".into());
        result
    });
    provider.on_error_async(move |error| {
        let tx = tx.clone();
        async move {
            if error.is_listener_error() {
                let _ = tx.send(error.to_string());
            }
            let result: CallbackResult = Ok(());
            result
        }
    });

    provider.get_credentials_async().await?;
    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| eyre!("listener dropped"))?;

    assert_eq!(message, "listener exploded");
    Ok(())
}

#[test]
fn failing_on_next_is_reported_to_on_error_when_blocking() -> Result<()> {
    let (_rt, server) = blocking_server()?;

    let refresh = common::refresh_config().with_expiration_refresh_ratio(0.00002);
    let provider = create_from_service_principal(common::service_principal(&server), Some(refresh))?;

    let (tx, rx) = mpsc::channel();
    provider.on_next(|_| Err("listener exploded".into()));
    provider.on_error(move |error| {
        if error.is_listener_error() {
            let _ = tx.send(error.to_string());
        }
        Ok(())
    });

    provider.get_credentials()?;
    let message = rx.recv_timeout(Duration::from_secs(5))?;

    assert_eq!(message, "listener exploded");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn shutdown_stops_background_refresh() -> Result<()> {
    let server = MockServer::start().await;
    common::mount_token_endpoint(&server).await;

    let provider =
        create_from_service_principal(common::service_principal(&server), Some(common::refresh_config()))?
            .with_block_for_initial(true);

    provider.get_credentials_async().await?;
    assert!(provider.manager().is_running());

    provider.shutdown();
    assert!(!provider.manager().is_running());
    assert!(provider.is_streaming());
    Ok(())
}
