use std::{future::Future, sync::Arc, time::Duration};

use entraid_tokens::{
    clock::{Clock, System},
    Token,
};
use tokio::sync::RwLock;

/// Tokens closer than this to expiry are not handed out from the cache
pub(super) const EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// An in-memory cache holding the last token issued to a client
pub(super) struct TokenCache {
    slot: RwLock<Option<Token>>,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    pub(super) fn new() -> Self {
        Self::with_clock(System)
    }

    pub(super) fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            slot: RwLock::new(None),
            clock: Arc::new(clock),
        }
    }

    fn usable(&self, token: &Token) -> bool {
        token.until_expired_at(self.clock.now()) > EXPIRY_MARGIN
    }

    pub(super) async fn evict(&self) {
        *self.slot.write().await = None;
    }

    /// Returns the cached token, or fetches and caches a new one
    ///
    /// Concurrent callers that miss the cache are serialized so that only one
    /// of them fetches.
    pub(super) async fn get_or_fetch<F, Fut, E>(&self, fetch: F) -> Result<Token, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, E>>,
    {
        {
            let cached = self.slot.read().await;
            if let Some(token) = cached.as_ref().filter(|t| self.usable(t)) {
                tracing::trace!("using cached token");
                return Ok(token.clone());
            }
        }

        let mut slot = self.slot.write().await;
        if let Some(token) = slot.as_ref().filter(|t| self.usable(t)) {
            return Ok(token.clone());
        }

        let token = fetch().await?;
        *slot = Some(token.clone());
        Ok(token)
    }
}
