//! Inbound router - resolves frames against the handler registry.
//!
//! Telemetry frames (reserved ids) are intercepted by the bridge before they
//! get here. Everything else is routed by the channel stored with the
//! handler at dispatch time, never by anything in the frame itself:
//!
//! - dapp-facing entry, populated frame → fan out as a [`DappEvent`]; the
//!   entry stays registered
//! - unknown id → unhandled hook, then a warning
//! - `subscription` → subscriber, `error` → reject, otherwise → resolve

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::BridgeError;
use crate::handler::{CorrelationId, HandlerRegistry};
use crate::protocol::{FrameBody, ResponseFrame};

/// Fallback for frames with no handler. Returns whether it consumed the frame.
pub type UnhandledHook = Arc<dyn Fn(&ResponseFrame) -> bool + Send + Sync>;

/// A frame for a dapp-facing call, delivered outside the resolve/reject path.
#[derive(Debug, Clone, PartialEq)]
pub struct DappEvent {
    /// Correlation id of the dapp call.
    pub id: CorrelationId,
    /// The frame as received.
    pub frame: ResponseFrame,
}

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Published on the dapp event bus.
    Dapp,
    /// Passed to a subscriber.
    Subscription,
    /// Completed a call successfully.
    Resolved,
    /// Completed a call with an error.
    Rejected,
    /// No handler; the unhandled hook took it.
    Hooked,
    /// No usable handler; logged and dropped.
    Dropped,
}

/// Routes inbound frames to handlers.
pub struct Router {
    registry: Arc<HandlerRegistry>,
    dapp: broadcast::Sender<DappEvent>,
    unhandled: Option<UnhandledHook>,
}

impl Router {
    /// Create a router over `registry`.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        dapp_capacity: usize,
        unhandled: Option<UnhandledHook>,
    ) -> Self {
        let (dapp, _) = broadcast::channel(dapp_capacity.max(1));
        Self {
            registry,
            dapp,
            unhandled,
        }
    }

    /// Receiver for dapp-facing frames.
    pub fn dapp_events(&self) -> broadcast::Receiver<DappEvent> {
        self.dapp.subscribe()
    }

    /// Route one frame. Never fails; problems are logged.
    pub fn route(&self, frame: ResponseFrame) -> Route {
        let channel = match self.registry.channel_of(&frame.id) {
            Some(channel) => channel,
            None => return self.unhandled(&frame),
        };

        if channel.is_dapp_facing() {
            if frame.body.is_populated() {
                let event = DappEvent {
                    id: CorrelationId::new(frame.id.clone()),
                    frame,
                };
                // No receivers is fine; the dapp side may not be listening yet.
                let _ = self.dapp.send(event);
            }
            return Route::Dapp;
        }

        let id = frame.id;
        let (route, found) = match frame.body {
            FrameBody::Subscription(value) => (
                Route::Subscription,
                self.registry.deliver_subscription(&id, value),
            ),
            FrameBody::Error(message) => (
                Route::Rejected,
                self.registry.reject(&id, BridgeError::App(message)),
            ),
            FrameBody::Response(value) => (Route::Resolved, self.registry.resolve(&id, value)),
            FrameBody::Empty => (
                Route::Resolved,
                self.registry.resolve(&id, serde_json::Value::Null),
            ),
        };

        if found {
            route
        } else {
            // Only reachable for a subscription update on a one-shot call, or if
            // the entry vanished between the lookup and completion.
            tracing::warn!("Dropping {:?} frame for {}: no matching handler", route, id);
            Route::Dropped
        }
    }

    fn unhandled(&self, frame: &ResponseFrame) -> Route {
        if let Some(hook) = &self.unhandled {
            if hook(frame) {
                return Route::Hooked;
            }
        }
        tracing::warn!("Unknown response: {:?}", frame.id);
        Route::Dropped
    }
}
