//! Callbacks notified by the background refresh loop

use std::{
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock},
};

use futures::future::{BoxFuture, FutureExt};

use crate::{
    error::{BoxError, ListenerCallbackError, RefreshError},
    Token,
};

/// The result of a listener callback
pub type CallbackResult = Result<(), BoxError>;

enum Callback<T> {
    Blocking(Arc<dyn Fn(T) -> CallbackResult + Send + Sync>),
    Async(Arc<dyn Fn(T) -> BoxFuture<'static, CallbackResult> + Send + Sync>),
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Blocking(f) => Self::Blocking(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<T: Send + 'static> Callback<T> {
    fn noop() -> Self {
        Self::Blocking(Arc::new(|_| Ok(())))
    }

    async fn invoke(&self, value: T) -> Result<(), ListenerCallbackError> {
        let outcome = match self {
            Self::Blocking(f) => panic::catch_unwind(AssertUnwindSafe(|| f(value))),
            Self::Async(f) => AssertUnwindSafe(f(value)).catch_unwind().await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ListenerCallbackError::new(error)),
            Err(payload) => Err(ListenerCallbackError::from_panic(payload)),
        }
    }
}

struct Slot<T>(RwLock<Callback<T>>);

impl<T: Send + 'static> Slot<T> {
    fn new() -> Self {
        Self(RwLock::new(Callback::noop()))
    }

    fn replace(&self, callback: Callback<T>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    fn current(&self) -> Callback<T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// A pair of overwritable callbacks receiving refreshed tokens and refresh errors
///
/// Clones share the same callback slots. Both slots default to doing nothing.
/// Replacing a callback takes effect for the next event; an event being
/// delivered concurrently may observe either the old or the new callback.
///
/// An error returned from (or a panic raised by) the token callback is
/// delivered to the error callback. An error from the error callback itself
/// is logged and dropped.
#[derive(Clone)]
pub struct Listener {
    on_next: Arc<Slot<Arc<Token>>>,
    on_error: Arc<Slot<Arc<RefreshError>>>,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

impl Listener {
    /// Constructs a listener whose callbacks do nothing
    pub fn new() -> Self {
        Self {
            on_next: Arc::new(Slot::new()),
            on_error: Arc::new(Slot::new()),
        }
    }

    /// Replaces the callback invoked with each renewed token
    pub fn set_on_next<F>(&self, callback: F)
    where
        F: Fn(Arc<Token>) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_next.replace(Callback::Blocking(Arc::new(callback)));
    }

    /// Replaces the callback invoked with each renewed token with an
    /// asynchronous one
    pub fn set_on_next_async<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<Token>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.on_next
            .replace(Callback::Async(Arc::new(move |t| callback(t).boxed())));
    }

    /// Replaces the callback invoked with each refresh failure
    pub fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(Arc<RefreshError>) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_error.replace(Callback::Blocking(Arc::new(callback)));
    }

    /// Replaces the callback invoked with each refresh failure with an
    /// asynchronous one
    pub fn set_on_error_async<F, Fut>(&self, callback: F)
    where
        F: Fn(Arc<RefreshError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.on_error
            .replace(Callback::Async(Arc::new(move |e| callback(e).boxed())));
    }

    pub(crate) async fn publish_token(&self, token: Arc<Token>) {
        let callback = self.on_next.current();
        if let Err(error) = callback.invoke(token).await {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "token callback failed, forwarding to error callback"
            );
            self.publish_error(error.into()).await;
        }
    }

    pub(crate) async fn publish_error(&self, error: RefreshError) {
        let callback = self.on_error.current();
        if let Err(callback_error) = callback.invoke(Arc::new(error)).await {
            tracing::warn!(
                error = (&callback_error as &dyn std::error::Error),
                "error callback failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{clock::UnixMillis, tokens::Claims};

    fn token() -> Arc<Token> {
        Arc::new(Token::new(
            "value".to_owned(),
            Claims::new(),
            UnixMillis(0),
            UnixMillis(1_000),
        ))
    }

    fn recording_errors(listener: &Listener) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        listener.set_on_error(move |e| {
            sink.lock().unwrap().push(e.to_string());
            Ok(())
        });
        errors
    }

    #[tokio::test]
    async fn default_listener_accepts_events() {
        let listener = Listener::new();
        listener.publish_token(token()).await;
        listener
            .publish_error(crate::RequestTokenError::platform("nope").into())
            .await;
    }

    #[tokio::test]
    async fn failing_token_callback_is_forwarded_to_error_callback() {
        let listener = Listener::new();
        let errors = recording_errors(&listener);
        listener.set_on_next(|_| Err("Some exception".into()));

        listener.publish_token(token()).await;

        assert_eq!(*errors.lock().unwrap(), vec!["Some exception".to_owned()]);
    }

    #[tokio::test]
    async fn panicking_token_callback_is_forwarded_to_error_callback() {
        let listener = Listener::new();
        let errors = recording_errors(&listener);
        listener.set_on_next(|_| panic!("callback exploded"));

        listener.publish_token(token()).await;

        assert_eq!(*errors.lock().unwrap(), vec!["callback exploded".to_owned()]);
    }

    #[tokio::test]
    async fn async_callbacks_are_awaited() {
        let listener = Listener::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        listener.set_on_next_async(|_| async { Err("async failure".into()) });
        listener.set_on_error_async(move |e| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(e.to_string());
                Ok(())
            }
        });

        listener.publish_token(token()).await;

        assert_eq!(*errors.lock().unwrap(), vec!["async failure".to_owned()]);
    }

    #[tokio::test]
    async fn failing_error_callback_is_not_reentered() {
        let listener = Listener::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        listener.set_on_next(|_| Err("first".into()));
        listener.set_on_error(move |e| {
            *counter.lock().unwrap() += 1;
            Err(e.to_string().into())
        });

        listener.publish_token(token()).await;

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn replacing_a_callback_affects_later_events() {
        let listener = Listener::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        listener.set_on_next(move |_| {
            first.lock().unwrap().push("first");
            Ok(())
        });
        listener.publish_token(token()).await;

        let second = Arc::clone(&seen);
        listener.set_on_next(move |_| {
            second.lock().unwrap().push("second");
            Ok(())
        });
        listener.publish_token(token()).await;

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }
}
