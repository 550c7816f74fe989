use std::{
    error, ops,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::{
    runtime::Runtime,
    sync::{oneshot, watch},
    task::{AbortHandle, JoinHandle},
};

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler},
    clock::{Clock, System, UnixMillis},
    error::{ConfigurationError, RequestTokenError},
    IdentityProvider, Listener, RefreshConfig, Token, TokenResponse,
};

/// Options controlling how the background refresh loop begins
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Do not publish the first token to the listener
    ///
    /// When a token is already known, usually because it was just acquired
    /// by the caller, the first renewal is scheduled from it without making
    /// a request. A failure of the first cycle is still reported.
    pub skip_initial: bool,
    /// How long to wait before the first refresh cycle
    pub initial_delay: Duration,
    /// Do not return from `start` until the first refresh cycle has completed,
    /// successfully or not
    ///
    /// Combined with `skip_initial` and an unexpired known token, the first
    /// cycle makes no request, so `start` returns as soon as the renewal is
    /// scheduled.
    pub block_for_initial: bool,
}

impl StartOptions {
    /// Options that skip publishing the first token
    pub fn skip_initial() -> Self {
        Self {
            skip_initial: true,
            ..Self::default()
        }
    }

    /// Sets the delay before the first refresh cycle
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Sets whether `start` waits for the first refresh cycle
    pub fn with_block_for_initial(mut self, block_for_initial: bool) -> Self {
        self.block_for_initial = block_for_initial;
        self
    }
}

/// Acquires tokens on demand and keeps them renewed in the background
///
/// The blocking methods must not be called from within an asynchronous
/// context; they drive the request on a runtime owned by the manager.
#[async_trait]
pub trait TokenManager: Send + Sync {
    /// Requests a token immediately, applying the request timeout and retry policy
    async fn acquire_token(&self, force_refresh: bool) -> Result<TokenResponse, RequestTokenError>;

    /// Requests a token immediately, blocking the current thread
    fn acquire_token_blocking(&self, force_refresh: bool)
        -> Result<TokenResponse, RequestTokenError>;

    /// Starts the background refresh loop on the current runtime, publishing
    /// to `listener`
    ///
    /// Any loop previously started by this manager is stopped first.
    async fn start(&self, listener: Listener, options: StartOptions);

    /// Starts the background refresh loop on the manager's own runtime
    fn start_blocking(
        &self,
        listener: Listener,
        options: StartOptions,
    ) -> Result<(), RequestTokenError>;

    /// Stops the background refresh loop, if running
    fn stop(&self);

    /// The most recently acquired token, if any
    fn latest_token(&self) -> Option<Arc<Token>>;
}

/// A handle for observing the tokens acquired by a [`RefreshingTokenManager`]
#[derive(Clone, Debug)]
pub struct TokenWatcher {
    watcher: watch::Receiver<Option<Arc<Token>>>,
}

/// An outstanding borrow of the latest token
///
/// This borrow should be held for as brief a time as possible, as outstanding
/// token borrows will block updates of a new token.
#[derive(Debug)]
pub struct BorrowedToken<'a> {
    inner: watch::Ref<'a, Option<Arc<Token>>>,
}

impl<'a> ops::Deref for BorrowedToken<'a> {
    type Target = Option<Arc<Token>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl TokenWatcher {
    /// Borrows the latest token
    pub fn token(&self) -> BorrowedToken<'_> {
        BorrowedToken {
            inner: self.watcher.borrow(),
        }
    }

    /// Waits until a new token is acquired and returns it
    ///
    /// Returns `None` once the manager has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<Token>> {
        self.watcher.changed().await.ok()?;
        self.watcher.borrow_and_update().clone()
    }
}

/// The default [`TokenManager`], renewing tokens proactively in a spawned task
#[derive(Debug)]
pub struct RefreshingTokenManager {
    core: Arc<Core>,
    task: Mutex<Option<AbortHandle>>,
    runtime: OnceCell<Runtime>,
}

struct Core {
    provider: Arc<dyn IdentityProvider>,
    config: RefreshConfig,
    backoff: ErrorBackoffConfig,
    clock: Arc<dyn Clock>,
    latest: watch::Sender<Option<Arc<Token>>>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RefreshingTokenManager {
    /// Constructs a manager that requests tokens from `provider`
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        config: RefreshConfig,
    ) -> Result<Self, ConfigurationError> {
        Self::with_clock(provider, config, ErrorBackoffConfig::default(), System)
    }

    /// Constructs a manager using the given backoff configuration and clock
    pub fn with_clock<C>(
        provider: Arc<dyn IdentityProvider>,
        config: RefreshConfig,
        backoff: ErrorBackoffConfig,
        clock: C,
    ) -> Result<Self, ConfigurationError>
    where
        C: Clock + 'static,
    {
        config.validate()?;
        let (latest, _) = watch::channel(None);

        Ok(Self {
            core: Arc::new(Core {
                provider,
                config,
                backoff,
                clock: Arc::new(clock),
                latest,
            }),
            task: Mutex::new(None),
            runtime: OnceCell::new(),
        })
    }

    /// The refresh configuration in use
    pub fn config(&self) -> &RefreshConfig {
        &self.core.config
    }

    /// Subscribes to newly acquired tokens
    pub fn watch(&self) -> TokenWatcher {
        TokenWatcher {
            watcher: self.core.latest.subscribe(),
        }
    }

    /// Whether a background refresh loop is currently running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    fn runtime(&self) -> Result<&Runtime, RequestTokenError> {
        self.runtime
            .get_or_try_init(|| {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("entraid-token-refresh")
                    .enable_all()
                    .build()
            })
            .map_err(RequestTokenError::runtime)
    }

    fn replace_task(&self, task: Option<AbortHandle>) {
        let previous = std::mem::replace(
            &mut *self.task.lock().unwrap_or_else(PoisonError::into_inner),
            task,
        );

        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

#[async_trait]
impl TokenManager for RefreshingTokenManager {
    async fn acquire_token(&self, force_refresh: bool) -> Result<TokenResponse, RequestTokenError> {
        self.core
            .request_with_retry(force_refresh)
            .await
            .map(TokenResponse::new)
    }

    fn acquire_token_blocking(
        &self,
        force_refresh: bool,
    ) -> Result<TokenResponse, RequestTokenError> {
        self.runtime()?.block_on(self.acquire_token(force_refresh))
    }

    async fn start(&self, listener: Listener, options: StartOptions) {
        let (initial_tx, initial_rx) = if options.block_for_initial {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let join = tokio::spawn(Arc::clone(&self.core).refresh_loop(listener, options, initial_tx));
        self.replace_task(Some(join.abort_handle()));
        tokio::spawn(monitor(join));

        if let Some(rx) = initial_rx {
            // Dropped without a signal only if the loop was stopped early
            let _ = rx.await;
        }
    }

    fn start_blocking(
        &self,
        listener: Listener,
        options: StartOptions,
    ) -> Result<(), RequestTokenError> {
        self.runtime()?.block_on(self.start(listener, options));
        Ok(())
    }

    fn stop(&self) {
        if self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            tracing::debug!(provider = self.core.provider.name(), "stopping token refresh");
        }
        self.replace_task(None);
    }

    fn latest_token(&self) -> Option<Arc<Token>> {
        self.core.latest.borrow().clone()
    }
}

impl Drop for RefreshingTokenManager {
    fn drop(&mut self) {
        self.replace_task(None);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn monitor(join: JoinHandle<()>) {
    if let Err(err) = join.await {
        if err.is_panic() {
            tracing::error!("token refresh panicked!")
        } else if err.is_cancelled() {
            tracing::info!("token refresh was cancelled")
        }
    }
}

impl Core {
    async fn request_with_retry(&self, force_refresh: bool) -> Result<Arc<Token>, RequestTokenError> {
        let policy = self.config.retry_policy();
        let timeout = self.config.request_timeout();
        let mut attempt = 1;

        loop {
            tracing::debug!(
                provider = self.provider.name(),
                attempt,
                force_refresh,
                "requesting token"
            );

            let result = match tokio::time::timeout(timeout, self.provider.request_token(force_refresh)).await {
                Ok(result) => result,
                Err(_) => Err(RequestTokenError::timeout(timeout)),
            };

            let result = result.and_then(|token| {
                if token.is_expired_at(self.clock.now()) {
                    Err(RequestTokenError::malformed("identity provider returned an expired token"))
                } else {
                    Ok(token)
                }
            });

            match result {
                Ok(token) => {
                    let token = Arc::new(token);
                    tracing::info!(
                        provider = self.provider.name(),
                        expires_at = token.expires_at().0,
                        "received new token"
                    );
                    self.latest.send_replace(Some(Arc::clone(&token)));
                    return Ok(token);
                }
                Err(error) if error.is_transient() && attempt < policy.max_attempts() => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        attempt,
                        delay_ms = policy.delay().as_millis() as u64,
                        "error requesting token, will retry"
                    );
                    tokio::time::sleep(policy.delay()).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn refresh_loop(
        self: Arc<Self>,
        listener: Listener,
        options: StartOptions,
        initial_tx: Option<oneshot::Sender<()>>,
    ) {
        let mut backoff = ErrorBackoffHandler::new(self.backoff);

        if !options.initial_delay.is_zero() {
            tracing::debug!(
                delay_ms = options.initial_delay.as_millis() as u64,
                "delaying first token refresh"
            );
            tokio::time::sleep(options.initial_delay).await;
        }

        let known = self.latest.borrow().clone();
        let mut last_token = None;
        let first = match (options.skip_initial, known) {
            (true, Some(token)) if !token.is_expired_at(self.clock.now()) => Ok(token),
            (true, _) => self.request_with_retry(false).await,
            (false, _) => self.refresh(&listener).await,
        };

        let mut wake = self
            .schedule(first, &mut last_token, &mut backoff, &listener)
            .await;

        if let Some(tx) = initial_tx {
            let _ = tx.send(());
        }

        loop {
            self.sleep_until(wake).await;
            let outcome = self.refresh(&listener).await;
            wake = self
                .schedule(outcome, &mut last_token, &mut backoff, &listener)
                .await;
        }
    }

    async fn refresh(&self, listener: &Listener) -> Result<Arc<Token>, RequestTokenError> {
        let outcome = self.request_with_retry(true).await;
        if let Ok(token) = &outcome {
            listener.publish_token(Arc::clone(token)).await;
        }
        outcome
    }

    async fn schedule(
        &self,
        outcome: Result<Arc<Token>, RequestTokenError>,
        last_token: &mut Option<Arc<Token>>,
        backoff: &mut ErrorBackoffHandler,
        listener: &Listener,
    ) -> UnixMillis {
        let now = self.clock.now();
        match outcome {
            Ok(token) => {
                backoff.success();
                let renew_at = self.config.renewal_time(&token);
                tracing::debug!(
                    renew_at = renew_at.0,
                    delay_ms = renew_at.saturating_duration_since(now).as_millis() as u64,
                    "waiting for token renewal time"
                );
                *last_token = Some(token);
                renew_at
            }
            Err(error) => {
                let wake = match last_token {
                    Some(token) if !token.is_expired_at(now) => token.expires_at(),
                    _ => now + backoff.error(),
                };

                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    delay_ms = wake.saturating_duration_since(now).as_millis() as u64,
                    "token refresh failed"
                );

                listener.publish_error(error.into()).await;

                wake
            }
        }
    }

    async fn sleep_until(&self, wake: UnixMillis) {
        // Timers do not advance while the host is suspended, so the wall clock
        // is rechecked at least once per heartbeat.
        const HEARTBEAT: Duration = Duration::from_secs(30);
        loop {
            let now = self.clock.now();
            if now >= wake {
                tracing::trace!("token due for renewal");
                break;
            }

            let delay = wake.saturating_duration_since(now).min(HEARTBEAT);
            tracing::trace!(
                delay_ms = delay.as_millis() as u64,
                "token not yet due, sleeping…"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
