//! Caller-side halves of a registered call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use super::CorrelationId;
use crate::error::{BridgeError, Result};

/// Callback for subscription updates. May fire any number of times.
pub type Subscriber = Arc<dyn Fn(Value) + Send + Sync>;

/// Wrap a closure as a [`Subscriber`].
pub fn subscriber<F>(f: F) -> Subscriber
where
    F: Fn(Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The one-shot completion side held by the registry.
pub(crate) type Responder = oneshot::Sender<Result<Value>>;

enum State {
    Waiting(oneshot::Receiver<Result<Value>>),
    Failed(Option<BridgeError>),
}

/// Future of a dispatched call.
///
/// The handler is already registered by the time this value exists, so
/// awaiting it later never misses a response.
#[must_use = "a pending call does nothing unless awaited"]
pub struct PendingCall {
    id: CorrelationId,
    state: State,
}

impl PendingCall {
    pub(crate) fn channel(id: CorrelationId) -> (Responder, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                id,
                state: State::Waiting(rx),
            },
        )
    }

    /// A call that failed before anything was registered.
    pub(crate) fn failed(id: CorrelationId, err: BridgeError) -> Self {
        Self {
            id,
            state: State::Failed(Some(err)),
        }
    }

    /// Correlation id of this call.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            State::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::ConnectionClosed)),
                Poll::Pending => Poll::Pending,
            },
            State::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(BridgeError::ConnectionClosed)))
            }
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}
