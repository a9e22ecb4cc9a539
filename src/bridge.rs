//! Bridge builder and runtime.
//!
//! The [`BridgeBuilder`] provides a fluent API for configuring the bridge
//! and binding a transport. The [`Bridge`] owns one runner connection:
//! 1. Register a handler for each outgoing call, then hand the envelope to
//!    the outbox (sent now if the runner is ready, queued otherwise)
//! 2. Read frames in arrival order: telemetry first, then the router
//! 3. Follow the runner's status: flush on ready, probe while ready,
//!    reject everything on reload
//!
//! # Example
//!
//! ```ignore
//! use runner_bridge::{Bridge, transport::channel_transport};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> runner_bridge::Result<()> {
//!     let (transport, inbound, runner) = channel_transport(64);
//!     let bridge = Bridge::builder().transport(transport).build();
//!     bridge.spawn_listener(inbound);
//!
//!     bridge.wait_ready().await?;
//!     let balance = bridge.call("pri(balance.get)", json!({"address": "5F..."})).await?;
//!     println!("{balance}");
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::WireFormat;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handler::{
    CorrelationId, HandlerEntry, HandlerRegistry, IdGenerator, PendingCall, Subscriber,
};
use crate::lifecycle::{LifecycleController, Submitted};
use crate::liveness::{LivenessMonitor, LivenessState, ProbeTarget};
use crate::protocol::{
    classify, Envelope, FrameBody, ResponseFrame, RunnerInfo, RunnerStatus, StatusReport,
    StatusSignal, CONSOLE_FRAME_ID, RUNNER_INFO_ID, STATUS_FRAME_ID,
};
use crate::router::{DappEvent, Router, UnhandledHook};
use crate::transport::Transport;

/// Method the runner exposes for cancelling a subscription by id.
pub const CANCEL_METHOD: &str = "pri(subscription.cancel)";

/// Per-call options for [`Bridge::call_with`].
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Receives every `subscription` frame for this call.
    pub subscriber: Option<Subscriber>,
    /// Use this correlation id instead of generating one.
    pub explicit_id: Option<String>,
    /// Re-send on [`Bridge::restart_all`] while still registered.
    /// Subscriptions are always resumable.
    pub resumable: bool,
}

impl CallOptions {
    /// Options with a subscriber.
    pub fn subscribe(subscriber: Subscriber) -> Self {
        Self {
            subscriber: Some(subscriber),
            ..Self::default()
        }
    }

    /// Set an explicit correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.explicit_id = Some(id.into());
        self
    }

    /// Mark the call resumable.
    pub fn resumable(mut self) -> Self {
        self.resumable = true;
        self
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("subscriber", &self.subscriber.is_some())
            .field("explicit_id", &self.explicit_id)
            .field("resumable", &self.resumable)
            .finish()
    }
}

/// Builder for configuring and creating a [`Bridge`].
pub struct BridgeBuilder {
    config: BridgeConfig,
    transport: Option<Arc<dyn Transport>>,
    unhandled: Option<UnhandledHook>,
    id_seed: Option<u64>,
}

impl BridgeBuilder {
    /// Create a builder with default configuration and no transport.
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            transport: None,
            unhandled: None,
            id_seed: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the interval between liveness probes.
    ///
    /// Default: 18 seconds
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    /// Set how long a probe may go unanswered.
    ///
    /// Default: 16 seconds
    pub fn probe_deadline(mut self, deadline: Duration) -> Self {
        self.config.probe_deadline = deadline;
        self
    }

    /// Set the wire format.
    ///
    /// Default: JSON
    pub fn wire_format(mut self, format: WireFormat) -> Self {
        self.config.wire_format = format;
        self
    }

    /// Set the dapp event bus capacity.
    pub fn dapp_event_capacity(mut self, capacity: usize) -> Self {
        self.config.dapp_event_capacity = capacity;
        self
    }

    /// Set the status event bus capacity.
    pub fn status_event_capacity(mut self, capacity: usize) -> Self {
        self.config.status_event_capacity = capacity;
        self
    }

    /// Set how long the runner may sleep before waking reloads it.
    ///
    /// Default: 1 hour
    pub fn wake_reload_after(mut self, after: Duration) -> Self {
        self.config.wake_reload_after = after;
        self
    }

    /// Bind a transport.
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Install a fallback for frames with no handler.
    ///
    /// Return `true` to mark the frame consumed; otherwise it is logged as unknown.
    pub fn on_unhandled<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ResponseFrame) -> bool + Send + Sync + 'static,
    {
        self.unhandled = Some(Arc::new(hook));
        self
    }

    /// Fix the seed used in generated ids.
    pub fn id_seed(mut self, seed: u64) -> Self {
        self.id_seed = Some(seed);
        self
    }

    /// Build the bridge.
    pub fn build(self) -> Bridge {
        let BridgeBuilder {
            config,
            transport,
            unhandled,
            id_seed,
        } = self;

        let inner = Arc::new_cyclic(|weak: &Weak<BridgeInner>| {
            let registry = Arc::new(HandlerRegistry::new());
            let probe = Arc::new(RunnerProbe {
                bridge: weak.clone(),
            });
            BridgeInner {
                ids: id_seed.map_or_else(IdGenerator::new, IdGenerator::with_seed),
                lifecycle: LifecycleController::new(config.status_event_capacity),
                monitor: LivenessMonitor::new(config.probe_interval, config.probe_deadline, probe),
                router: Router::new(registry.clone(), config.dapp_event_capacity, unhandled),
                registry,
                transport: RwLock::new(transport),
                resumable: Mutex::new(Vec::new()),
                inbound: ReentrantMutex::new(()),
                config,
            }
        });

        Bridge { inner }
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An envelope ready to go, with the id and method it was registered under.
#[derive(Clone)]
struct Outgoing {
    id: CorrelationId,
    method: String,
    frame: Bytes,
}

struct BridgeInner {
    config: BridgeConfig,
    registry: Arc<HandlerRegistry>,
    ids: IdGenerator,
    lifecycle: LifecycleController,
    monitor: LivenessMonitor,
    router: Router,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Envelopes re-sent by `restart_all`, in dispatch order.
    resumable: Mutex<Vec<Outgoing>>,
    /// Serializes inbound processing. Reentrant so a transport may answer
    /// from inside `send` while a frame is being handled.
    inbound: ReentrantMutex<()>,
}

/// Liveness probe that talks to the runner through the bridge.
struct RunnerProbe {
    bridge: Weak<BridgeInner>,
}

impl ProbeTarget for RunnerProbe {
    fn send_probe(&self) -> Result<()> {
        let inner = self.bridge.upgrade().ok_or(BridgeError::ConnectionClosed)?;
        let transport = inner.transport().ok_or(BridgeError::ChannelNotReady)?;
        transport.send(Envelope::ping().encode(inner.config.wire_format)?)
    }

    fn on_dead(&self) {
        if let Some(inner) = self.bridge.upgrade() {
            if let Err(e) = inner.reload() {
                tracing::error!("Reload after missed probe failed: {}", e);
            }
        }
    }
}

/// A connection to one runner.
///
/// Cloning is cheap; all clones share the same registry and status.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Create a new bridge builder.
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Call a method on the runner.
    ///
    /// The handler is registered before this returns, so the response can
    /// never arrive before anyone is waiting for it.
    pub fn call(&self, method: &str, payload: Value) -> PendingCall {
        self.call_with(method, payload, CallOptions::default())
    }

    /// Call a method that answers with a stream of `subscription` frames.
    ///
    /// The returned future completes with the first `response` frame; every
    /// `subscription` frame goes to `subscriber`, in arrival order.
    pub fn subscribe(&self, method: &str, payload: Value, subscriber: Subscriber) -> PendingCall {
        self.call_with(method, payload, CallOptions::subscribe(subscriber))
    }

    /// Call with explicit options.
    pub fn call_with(&self, method: &str, payload: Value, options: CallOptions) -> PendingCall {
        match self.inner.register(method, payload, options) {
            Ok((outgoing, pending)) => {
                self.inner.transmit(outgoing);
                pending
            }
            Err(failed) => failed,
        }
    }

    /// Register a call now and send it later with [`PreparedCall::start`].
    pub fn prepare(&self, method: &str, payload: Value, options: CallOptions) -> PreparedCall {
        match self.inner.register(method, payload, options) {
            Ok((outgoing, pending)) => PreparedCall {
                inner: self.inner.clone(),
                id: outgoing.id.clone(),
                outgoing: Some(outgoing),
                pending: Some(pending),
            },
            Err(failed) => PreparedCall {
                inner: self.inner.clone(),
                id: failed.id().clone(),
                outgoing: None,
                pending: Some(failed),
            },
        }
    }

    /// Ask the runner to cancel a subscription.
    ///
    /// The local handler is removed when the runner confirms.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let confirmed = self
            .call(CANCEL_METHOD, Value::String(id.to_string()))
            .await?
            .as_bool()
            .unwrap_or(false);
        if confirmed {
            self.inner.forget(id);
        }
        Ok(confirmed)
    }

    /// Remove a handler, and for classified channels cancel it on the runner too.
    ///
    /// Unknown ids (and `Unknown`-channel ids) are removed locally and report `true`.
    pub async fn clear_handler(&self, id: &str) -> Result<bool> {
        let channel = match self.inner.registry.channel_of(id) {
            Some(channel) => channel,
            None => return Ok(true),
        };

        self.inner.forget(id);
        if !channel.needs_runner_cancel() {
            return Ok(true);
        }
        self.cancel(id).await
    }

    /// Re-send every resumable call that is still registered.
    ///
    /// Remembered calls whose handler is gone are forgotten. Returns the
    /// number re-sent (or queued, if the runner is not ready).
    pub fn restart_all(&self) -> Result<usize> {
        let transport = self.inner.transport().ok_or(BridgeError::ChannelNotReady)?;

        let batch = {
            let mut remembered = self.inner.resumable.lock();
            remembered.retain(|o| self.inner.registry.contains(o.id.as_str()));
            remembered.clone()
        };

        let mut sent = 0;
        for o in batch {
            // A call still waiting in the outbox goes out once, in its new place.
            self.inner.lifecycle.withdraw(o.id.as_str());
            match self
                .inner
                .lifecycle
                .submit(transport.as_ref(), o.id.clone(), &o.method, o.frame)
            {
                Ok(_) => sent += 1,
                Err(e) => tracing::warn!("Could not restart {} ({}): {}", o.id, o.method, e),
            }
        }
        tracing::debug!("Restarted {} resumable calls", sent);
        Ok(sent)
    }

    /// Feed one raw frame from the runner.
    ///
    /// Frames are processed one at a time, in the order this is called.
    /// A frame fed from inside [`Transport::send`] on the same thread is
    /// handled immediately. Malformed frames are logged and dropped.
    pub fn on_frame(&self, raw: &[u8]) {
        let _gate = self.inner.inbound.lock();

        // Any traffic at all means the runner is alive.
        self.inner.monitor.observe_liveness();

        let frame = match ResponseFrame::decode(raw, self.inner.config.wire_format) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        if frame.is_reserved() {
            self.inner.on_telemetry(frame);
            return;
        }

        let route = self.inner.router.route(frame);
        tracing::trace!("Frame routed: {:?}", route);
    }

    /// Spawn the read loop over inbound frames.
    ///
    /// The loop ends when the sender side closes.
    pub fn spawn_listener(&self, mut inbound: mpsc::Receiver<Bytes>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = inbound.recv().await {
                bridge.on_frame(&raw);
            }
            tracing::debug!("Runner channel closed; listener stopped");
        })
    }

    /// Restart the runner and reject every outstanding call.
    pub fn reload(&self) -> Result<()> {
        self.inner.reload()
    }

    /// Apply a status decided by the host rather than reported by the runner.
    pub fn apply_status(&self, status: RunnerStatus) {
        self.inner.apply_status(status);
    }

    /// Pause: stop probing and enter `Sleeping`.
    pub fn sleep(&self) {
        self.inner.monitor.stop();
        self.inner.lifecycle.sleep(Instant::now());
        tracing::debug!("Runner asleep");
    }

    /// Resume after [`sleep`](Self::sleep).
    ///
    /// Reloads when asleep for longer than `wake_reload_after`. Otherwise the
    /// previous status comes back, and if it was `Ready` the runner is probed
    /// right away. A reload interrupted by sleep resumes as `Booting`, waiting
    /// for the runner to report in. No-op when not asleep.
    pub fn wake(&self) -> Result<()> {
        let Some((since, previous)) = self.inner.lifecycle.asleep_since() else {
            return Ok(());
        };

        let slept = since.elapsed();
        if slept > self.inner.config.wake_reload_after {
            tracing::info!("Runner slept for {:?}; reloading", slept);
            return self.inner.reload();
        }

        let resumed = match previous {
            RunnerStatus::Reloading => RunnerStatus::Booting,
            other => other,
        };
        self.inner.apply_status(resumed);
        if resumed == RunnerStatus::Ready {
            self.inner.monitor.probe_now();
        }
        Ok(())
    }

    /// Replace the bound transport.
    pub fn bind<T: Transport>(&self, transport: T) {
        *self.inner.transport.write() = Some(Arc::new(transport));
        tracing::debug!("Transport bound");
    }

    /// Drop the bound transport. Later calls fail with `ChannelNotReady`.
    pub fn unbind(&self) {
        *self.inner.transport.write() = None;
    }

    /// Whether a transport is bound.
    pub fn is_bound(&self) -> bool {
        self.inner.transport.read().is_some()
    }

    /// Current runner status.
    pub fn status(&self) -> RunnerStatus {
        self.inner.lifecycle.status()
    }

    /// Every status transition, in order.
    pub fn status_events(&self) -> broadcast::Receiver<RunnerStatus> {
        self.inner.lifecycle.subscribe()
    }

    /// Resolve once the runner is ready.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut current = self.inner.lifecycle.watch();
        current
            .wait_for(|status| *status == RunnerStatus::Ready)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    /// Frames for dapp-facing calls.
    pub fn dapp_events(&self) -> broadcast::Receiver<DappEvent> {
        self.inner.router.dapp_events()
    }

    /// Environment the runner last reported.
    pub fn runner_info(&self) -> Option<RunnerInfo> {
        self.inner.lifecycle.info()
    }

    /// Method of a live call.
    pub fn method_of(&self, id: &str) -> Option<String> {
        self.inner.registry.method_of(id)
    }

    /// Whether a call is still registered.
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.registry.contains(id)
    }

    /// Number of registered calls.
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of envelopes waiting for readiness.
    pub fn queued_count(&self) -> usize {
        self.inner.lifecycle.queued()
    }

    /// Liveness monitor state.
    pub fn liveness(&self) -> LivenessState {
        self.inner.monitor.state()
    }
}

impl BridgeInner {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    /// Register a handler and encode its envelope. On failure nothing stays
    /// registered and the returned call is already failed.
    fn register(
        &self,
        method: &str,
        payload: Value,
        options: CallOptions,
    ) -> std::result::Result<(Outgoing, PendingCall), PendingCall> {
        let id = match options.explicit_id {
            Some(id) => CorrelationId::new(id),
            None => self.ids.next_id(classify(method)),
        };

        if self.transport.read().is_none() {
            return Err(PendingCall::failed(id, BridgeError::ChannelNotReady));
        }

        let frame = match Envelope::new(id.as_str(), method, payload).encode(self.config.wire_format)
        {
            Ok(frame) => frame,
            Err(e) => return Err(PendingCall::failed(id, e)),
        };

        let resumable = options.resumable || options.subscriber.is_some();
        let (entry, pending) = HandlerEntry::new(id.clone(), method, options.subscriber);
        if let Err(e) = self.registry.register(id.clone(), entry) {
            return Err(PendingCall::failed(id, e));
        }

        let outgoing = Outgoing {
            id,
            method: method.to_string(),
            frame,
        };
        if resumable {
            self.resumable.lock().push(outgoing.clone());
        }
        Ok((outgoing, pending))
    }

    fn transmit(&self, outgoing: Outgoing) {
        let Outgoing { id, method, frame } = outgoing;
        // Rejected by a reload between registration and now: nothing to send.
        if !self.registry.contains(id.as_str()) {
            tracing::debug!("Not sending {} ({}): no longer registered", id, method);
            return;
        }

        let result = match self.transport() {
            Some(transport) => self
                .lifecycle
                .submit(transport.as_ref(), id.clone(), &method, frame),
            None => Err(BridgeError::ChannelNotReady),
        };

        match result {
            Ok(Submitted::Queued) if !self.registry.contains(id.as_str()) => {
                // Drained while it was being queued.
                self.lifecycle.withdraw(id.as_str());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Send of {} ({}) failed: {}", id, method, e);
                self.fail(id.as_str(), e);
            }
        }
    }

    /// Remove a call and reject it.
    fn fail(&self, id: &str, err: BridgeError) {
        self.forget_resumable(id);
        if let Some(mut entry) = self.registry.remove(id) {
            entry.reject(err);
        }
    }

    /// Remove a call without completing it.
    fn forget(&self, id: &str) {
        self.forget_resumable(id);
        self.lifecycle.withdraw(id);
        self.registry.remove(id);
    }

    fn forget_resumable(&self, id: &str) {
        self.resumable.lock().retain(|o| o.id.as_str() != id);
    }

    fn reload(&self) -> Result<()> {
        let requested = match self.transport() {
            Some(transport) => transport.reload(),
            None => Err(BridgeError::ChannelNotReady),
        };
        self.apply_status(RunnerStatus::Reloading);
        requested
    }

    fn apply_status(&self, next: RunnerStatus) {
        let transport = self.transport();
        let applied = self.lifecycle.apply(next, transport.as_deref());
        for (id, e) in applied.failed {
            self.fail(id.as_str(), e);
        }
        if !applied.discarded.is_empty() {
            tracing::debug!("Discarded {} queued envelopes", applied.discarded.len());
        }

        match next {
            // Left alone if the flush above led to another status.
            RunnerStatus::Ready if self.lifecycle.status() == RunnerStatus::Ready => {
                self.monitor.start()
            }
            RunnerStatus::Ready => {}
            RunnerStatus::Reloading => {
                self.monitor.stop();
                self.reject_all();
            }
            _ => self.monitor.stop(),
        }
    }

    fn reject_all(&self) {
        let drained = self.registry.drain_all();
        self.resumable.lock().clear();
        if drained.is_empty() {
            return;
        }

        tracing::warn!("Runner reloading; rejecting {} pending calls", drained.len());
        for (id, mut entry) in drained {
            // Queued after the outbox was discarded.
            self.lifecycle.withdraw(id.as_str());
            entry.reject(BridgeError::RunnerReloaded);
        }
    }

    fn on_telemetry(&self, frame: ResponseFrame) {
        let body = match frame.body {
            FrameBody::Response(value) | FrameBody::Subscription(value) => value,
            FrameBody::Error(message) => {
                tracing::warn!("Runner reported error on telemetry frame {}: {}", frame.id, message);
                return;
            }
            FrameBody::Empty => return,
        };

        match frame.id.as_str() {
            STATUS_FRAME_ID => self.on_status(body),
            RUNNER_INFO_ID => match serde_json::from_value::<RunnerInfo>(body) {
                Ok(info) => {
                    tracing::debug!(
                        "Runner info: url={} version={:?} userAgent={}",
                        info.url,
                        info.version,
                        info.user_agent
                    );
                    self.lifecycle.set_info(info);
                }
                Err(e) => tracing::warn!("Malformed runner info: {}", e),
            },
            CONSOLE_FRAME_ID => forward_console(&body),
            other => tracing::warn!("Unhandled reserved frame {}", other),
        }
    }

    fn on_status(&self, body: Value) {
        let signal = serde_json::from_value::<StatusReport>(body)
            .map_err(BridgeError::from)
            .and_then(|report| report.signal());

        match signal {
            Ok(StatusSignal::Pong) => tracing::trace!("Pong"),
            Ok(StatusSignal::Transition(status)) => {
                self.apply_status(status);
            }
            Err(e) => tracing::warn!("Malformed status frame: {}", e),
        }
    }
}

/// Re-log `[level, ...args]` from the runner's console.
fn forward_console(body: &Value) {
    let Some(parts) = body.as_array() else {
        tracing::info!(target: "runner_console", "{}", body);
        return;
    };

    let (level, args) = match parts.split_first() {
        Some((Value::String(level), args)) => (level.as_str(), args),
        _ => ("log", parts.as_slice()),
    };
    let line = args
        .iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");

    match level {
        "error" => tracing::error!(target: "runner_console", "{}", line),
        "warn" => tracing::warn!(target: "runner_console", "{}", line),
        "debug" => tracing::debug!(target: "runner_console", "{}", line),
        "trace" => tracing::trace!(target: "runner_console", "{}", line),
        _ => tracing::info!(target: "runner_console", "{}", line),
    }
}

/// A registered call whose envelope has not been sent yet.
///
/// Dropping it without calling [`start`](Self::start) removes the handler.
#[must_use = "a prepared call is removed when dropped"]
pub struct PreparedCall {
    inner: Arc<BridgeInner>,
    id: CorrelationId,
    outgoing: Option<Outgoing>,
    pending: Option<PendingCall>,
}

impl PreparedCall {
    /// Correlation id the call was registered under.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Send the envelope and return the call's future.
    pub fn start(mut self) -> PendingCall {
        if let Some(outgoing) = self.outgoing.take() {
            self.inner.transmit(outgoing);
        }
        let id = self.id.clone();
        self.pending
            .take()
            .unwrap_or_else(|| PendingCall::failed(id, BridgeError::ConnectionClosed))
    }
}

impl Drop for PreparedCall {
    fn drop(&mut self) {
        if let Some(outgoing) = self.outgoing.take() {
            tracing::debug!("Prepared call {} dropped unsent", outgoing.id);
            self.inner.forget(outgoing.id.as_str());
        }
    }
}

impl std::fmt::Debug for PreparedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCall")
            .field("id", &self.id)
            .field("started", &self.outgoing.is_none())
            .finish()
    }
}
