//! The credentials provider handed to a Redis client

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use entraid_tokens::{
    AccessToken, AccessTokenRef, CallbackResult, ConfigurationError, IdentityProvider, Listener,
    RefreshConfig, RefreshError, RefreshingTokenManager, RequestTokenError, StartOptions, Token,
    TokenManager,
};
use tokio::sync::Mutex;

/// The username and password presented to Redis
///
/// The username is the object ID of the identity the token was issued to,
/// when the token names one. The password is always the access token.
#[derive(Clone, Debug)]
pub struct Credentials {
    username: Option<String>,
    password: AccessToken,
}

impl Credentials {
    /// Extracts credentials from a token
    pub fn from_token(token: &Token) -> Self {
        Self {
            username: token.object_id().map(str::to_owned),
            password: token.value().to_owned(),
        }
    }

    /// The username, if the token names an object ID
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The access token
    pub fn password(&self) -> &AccessTokenRef {
        &self.password
    }

    /// The credentials in the order an `AUTH` command takes them
    ///
    /// Contains one or two elements. The access token is always last.
    pub fn as_parts(&self) -> Vec<&str> {
        self.username
            .as_deref()
            .into_iter()
            .chain(Some(self.password.as_str()))
            .collect()
    }

    /// Consumes the credentials, producing the parts in `AUTH` order
    pub fn into_vec(self) -> Vec<String> {
        self.username
            .into_iter()
            .chain(Some(self.password.take()))
            .collect()
    }
}

/// Supplies Redis credentials backed by a token manager
///
/// The first successful request for credentials starts the manager's
/// background refresh loop, which then reports each renewed token to the
/// [`on_next`](Self::on_next) callback and each failure to the
/// [`on_error`](Self::on_error) callback. The loop runs until the provider is
/// shut down or dropped.
///
/// The blocking and asynchronous paths may be mixed on one instance. The
/// blocking methods must not be called from within an asynchronous context.
pub struct CredentialsProvider<M: TokenManager = RefreshingTokenManager> {
    manager: M,
    listener: Listener,
    streaming: AtomicBool,
    start_lock: Mutex<()>,
    initial_delay: Duration,
    block_for_initial: bool,
}

impl<M: TokenManager + fmt::Debug> fmt::Debug for CredentialsProvider<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialsProvider")
            .field("manager", &self.manager)
            .field("streaming", &self.is_streaming())
            .field("initial_delay", &self.initial_delay)
            .field("block_for_initial", &self.block_for_initial)
            .finish_non_exhaustive()
    }
}

impl CredentialsProvider {
    /// Constructs a provider refreshing tokens from `provider` according to
    /// `config`
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        config: RefreshConfig,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self::with_manager(RefreshingTokenManager::new(
            provider, config,
        )?))
    }
}

impl<M: TokenManager> CredentialsProvider<M> {
    /// Constructs a provider over an existing token manager
    pub fn with_manager(manager: M) -> Self {
        Self {
            manager,
            listener: Listener::new(),
            streaming: AtomicBool::new(false),
            start_lock: Mutex::new(()),
            initial_delay: Duration::ZERO,
            block_for_initial: false,
        }
    }

    /// Delays the first background refresh when started from
    /// [`get_credentials_async`](Self::get_credentials_async)
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Makes the first call to
    /// [`get_credentials_async`](Self::get_credentials_async) wait for the
    /// background loop's first cycle
    ///
    /// The loop is started after that call has acquired a token, and its first
    /// cycle schedules the next renewal from that token without a request. The
    /// wait therefore ends once the renewal is scheduled, not after a second
    /// acquisition.
    pub fn with_block_for_initial(mut self, block_for_initial: bool) -> Self {
        self.block_for_initial = block_for_initial;
        self
    }

    /// The token manager backing this provider
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Whether the background refresh loop has been started
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Acquires credentials, blocking the current thread
    ///
    /// Starts background refresh on the first successful call.
    pub fn get_credentials(&self) -> Result<Credentials, RequestTokenError> {
        let response = self.manager.acquire_token_blocking(false)?;

        if !self.is_streaming() {
            let _guard = self.start_lock.blocking_lock();
            if !self.is_streaming() {
                self.manager
                    .start_blocking(self.listener.clone(), StartOptions::skip_initial())?;
                self.streaming.store(true, Ordering::Release);
                tracing::info!("started background credential refresh");
            }
        }

        Ok(Credentials::from_token(response.token()))
    }

    /// Acquires credentials
    ///
    /// Starts background refresh on the first successful call, honouring the
    /// configured initial delay and block-for-initial setting.
    pub async fn get_credentials_async(&self) -> Result<Credentials, RequestTokenError> {
        let response = self.manager.acquire_token(false).await?;

        if !self.is_streaming() {
            let _guard = self.start_lock.lock().await;
            if !self.is_streaming() {
                let options = StartOptions::skip_initial()
                    .with_initial_delay(self.initial_delay)
                    .with_block_for_initial(self.block_for_initial);
                self.manager.start(self.listener.clone(), options).await;
                self.streaming.store(true, Ordering::Release);
                tracing::info!("started background credential refresh");
            }
        }

        Ok(Credentials::from_token(response.token()))
    }

    /// Replaces the callback invoked with each renewed token
    pub fn on_next<F>(&self, callback: F)
    where
        F: Fn(Arc<Token>) -> CallbackResult + Send + Sync + 'static,
    {
        self.listener.set_on_next(callback);
    }

    /// Replaces the callback invoked with each renewed token with an
    /// asynchronous one
    pub fn on_next_async<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Token>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CallbackResult> + Send + 'static,
    {
        self.listener.set_on_next_async(callback);
    }

    /// Replaces the callback invoked with each background refresh failure
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(Arc<RefreshError>) -> CallbackResult + Send + Sync + 'static,
    {
        self.listener.set_on_error(callback);
    }

    /// Replaces the callback invoked with each background refresh failure
    /// with an asynchronous one
    pub fn on_error_async<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<RefreshError>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CallbackResult> + Send + 'static,
    {
        self.listener.set_on_error_async(callback);
    }

    /// Stops the background refresh loop
    ///
    /// Credentials can still be requested afterwards, but background refresh
    /// is not restarted.
    pub fn shutdown(&self) {
        self.manager.stop();
    }
}

impl<M: TokenManager> Drop for CredentialsProvider<M> {
    fn drop(&mut self) {
        self.manager.stop();
    }
}
