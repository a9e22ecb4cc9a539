//! Handler registry for correlating responses with outstanding calls.
//!
//! Every call the bridge dispatches gets exactly one [`HandlerEntry`] keyed
//! by its [`CorrelationId`]. Entries leave the registry in one of three ways:
//!
//! - the first response/error of a one-shot call ([`HandlerRegistry::resolve`],
//!   [`HandlerRegistry::reject`]),
//! - explicit removal after cancellation ([`HandlerRegistry::remove`]),
//! - a reload sweep ([`HandlerRegistry::drain_all`]).
//!
//! Subscriptions survive any number of [`HandlerRegistry::deliver_subscription`]
//! calls. Callbacks are always invoked after the map lock is released.
//!
//! # Example
//!
//! ```
//! use runner_bridge::handler::{CorrelationId, HandlerEntry, HandlerRegistry};
//!
//! # tokio_test_block_on(async {
//! let registry = HandlerRegistry::new();
//! let id = CorrelationId::new("A1");
//! let (entry, pending) = HandlerEntry::new(id.clone(), "svc.getBalance", None);
//! registry.register(id, entry).unwrap();
//!
//! assert!(registry.resolve("A1", serde_json::json!({"balance": "100"})));
//! assert_eq!(pending.await.unwrap()["balance"], "100");
//! assert!(registry.is_empty());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use super::pending::{PendingCall, Responder, Subscriber};
use super::CorrelationId;
use crate::error::{BridgeError, Result};
use crate::protocol::{classify, Channel};

/// Pending-call state owned by the registry.
pub struct HandlerEntry {
    /// Fires exactly once; `None` after completion.
    responder: Option<Responder>,
    /// Fires zero or more times.
    subscriber: Option<Subscriber>,
    /// Classified channel of the originating method.
    channel: Channel,
    /// Originating method name.
    method: String,
}

impl HandlerEntry {
    /// Create an entry and the future its caller awaits.
    pub fn new(
        id: CorrelationId,
        method: &str,
        subscriber: Option<Subscriber>,
    ) -> (Self, PendingCall) {
        let (responder, pending) = PendingCall::channel(id);
        let entry = Self {
            responder: Some(responder),
            subscriber,
            channel: classify(method),
            method: method.to_string(),
        };
        (entry, pending)
    }

    /// Whether this entry stays registered after its first response.
    #[inline]
    pub fn is_subscription(&self) -> bool {
        self.subscriber.is_some()
    }

    /// Classified channel.
    #[inline]
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Originating method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether the one-shot half has already fired.
    pub fn is_completed(&self) -> bool {
        self.responder.is_none()
    }

    /// Complete the one-shot half successfully. Later calls are no-ops.
    pub fn resolve(&mut self, value: Value) {
        self.complete(Ok(value));
    }

    /// Complete the one-shot half with an error. Later calls are no-ops.
    pub fn reject(&mut self, err: BridgeError) {
        self.complete(Err(err));
    }

    fn complete(&mut self, result: Result<Value>) {
        if let Some(responder) = self.responder.take() {
            // Receiver gone means the caller stopped waiting; nothing to do.
            let _ = responder.send(result);
        }
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("method", &self.method)
            .field("channel", &self.channel)
            .field("subscription", &self.is_subscription())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Registry of outstanding calls keyed by correlation id.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Mutex<HashMap<CorrelationId, HandlerEntry>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry.
    ///
    /// Fails with [`BridgeError::DuplicateId`] when the id is live. The live
    /// entry is left untouched.
    pub fn register(&self, id: CorrelationId, entry: HandlerEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(BridgeError::DuplicateId(id.into_string()));
        }
        entries.insert(id, entry);
        Ok(())
    }

    /// Complete a call successfully.
    ///
    /// One-shot entries are removed; subscriptions stay registered.
    /// Returns `false` if the id is unknown.
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.complete(id, Ok(value))
    }

    /// Complete a call with an error. Same removal rules as [`resolve`](Self::resolve).
    pub fn reject(&self, id: &str, err: BridgeError) -> bool {
        self.complete(id, Err(err))
    }

    fn complete(&self, id: &str, result: Result<Value>) -> bool {
        let mut entries = self.entries.lock();
        let keep = match entries.get(id) {
            Some(entry) => entry.is_subscription(),
            None => return false,
        };

        if keep {
            if let Some(entry) = entries.get_mut(id) {
                entry.complete(result);
            }
        } else if let Some(mut entry) = entries.remove(id) {
            drop(entries);
            entry.complete(result);
        }
        true
    }

    /// Push an update to a subscription.
    ///
    /// Returns `false` if the id is unknown or the entry has no subscriber.
    pub fn deliver_subscription(&self, id: &str, value: Value) -> bool {
        let subscriber = {
            let entries = self.entries.lock();
            match entries.get(id).and_then(|e| e.subscriber.clone()) {
                Some(s) => s,
                None => return false,
            }
        };

        subscriber(value);
        true
    }

    /// Remove an entry unconditionally.
    pub fn remove(&self, id: &str) -> Option<HandlerEntry> {
        self.entries.lock().remove(id)
    }

    /// Empty the registry and hand back everything that was in it.
    pub fn drain_all(&self) -> Vec<(CorrelationId, HandlerEntry)> {
        self.entries.lock().drain().collect()
    }

    /// Whether the id is live.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Channel of a live entry.
    pub fn channel_of(&self, id: &str) -> Option<Channel> {
        self.entries.lock().get(id).map(|e| e.channel)
    }

    /// Method of a live entry.
    pub fn method_of(&self, id: &str) -> Option<String> {
        self.entries.lock().get(id).map(|e| e.method.clone())
    }

    /// Ids of all live entries.
    pub fn ids(&self) -> Vec<CorrelationId> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no entries are live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
