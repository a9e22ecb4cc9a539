//! Lifecycle controller - runner readiness and the outbound gate.
//!
//! Outbound envelopes are submitted here rather than straight to the
//! transport. While the runner is not ready they wait in an outbox, in
//! submission order, and go out when the runner reports ready.
//!
//! The transport is never called with the state lock held, so a transport
//! may answer synchronously (and even report a new status) from inside
//! `send`. While a flush is draining the outbox, new submissions join the
//! back of it instead of going out directly, which keeps them behind
//! everything queued earlier.
//!
//! Every applied status is published on a broadcast channel (all
//! transitions, in order) and a watch channel (latest value).

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::error::BridgeError;
use crate::handler::CorrelationId;
use crate::protocol::{is_restore_method, RunnerInfo, RunnerStatus};
use crate::transport::Transport;

/// An envelope waiting for the runner to become ready.
#[derive(Debug, Clone)]
struct Queued {
    id: CorrelationId,
    method: String,
    frame: Bytes,
}

/// What happened to a submitted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Handed to the transport.
    Sent,
    /// Held until the runner is ready.
    Queued,
}

/// Outcome of applying a status.
#[derive(Debug)]
pub struct Applied {
    /// Status before this one.
    pub previous: RunnerStatus,
    /// Queued envelopes the transport refused during the flush.
    pub failed: Vec<(CorrelationId, BridgeError)>,
    /// Queued envelopes dropped because the runner is reloading.
    pub discarded: Vec<CorrelationId>,
}

struct State {
    status: RunnerStatus,
    outbox: VecDeque<Queued>,
    /// A flush is sending the outbox.
    draining: bool,
    asleep: Option<(Instant, RunnerStatus)>,
}

impl State {
    fn admits(&self, method: &str) -> bool {
        match self.status {
            RunnerStatus::Ready => true,
            RunnerStatus::RequireRestore => is_restore_method(method),
            _ => false,
        }
    }

    /// Remove and return the oldest queued envelope the runner admits now.
    fn next_admitted(&mut self) -> Option<Queued> {
        let position = self.outbox.iter().position(|q| self.admits(&q.method))?;
        self.outbox.remove(position)
    }
}

/// Runner readiness, the outbox, and status fan-out.
pub struct LifecycleController {
    state: Mutex<State>,
    events: broadcast::Sender<RunnerStatus>,
    current: watch::Sender<RunnerStatus>,
    info: Mutex<Option<RunnerInfo>>,
}

impl LifecycleController {
    /// Create a controller in `Uninitialized`.
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (current, _) = watch::channel(RunnerStatus::Uninitialized);
        Self {
            state: Mutex::new(State {
                status: RunnerStatus::Uninitialized,
                outbox: VecDeque::new(),
                draining: false,
                asleep: None,
            }),
            events,
            current,
            info: Mutex::new(None),
        }
    }

    /// Current status.
    pub fn status(&self) -> RunnerStatus {
        self.state.lock().status
    }

    /// Every applied status, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerStatus> {
        self.events.subscribe()
    }

    /// Latest status.
    pub fn watch(&self) -> watch::Receiver<RunnerStatus> {
        self.current.subscribe()
    }

    /// Number of envelopes waiting for readiness.
    pub fn queued(&self) -> usize {
        self.state.lock().outbox.len()
    }

    /// Send now if the runner admits `method`, otherwise queue.
    pub fn submit(
        &self,
        transport: &dyn Transport,
        id: CorrelationId,
        method: &str,
        frame: Bytes,
    ) -> crate::error::Result<Submitted> {
        let mut state = self.state.lock();
        if state.admits(method) && !state.draining {
            drop(state);
            transport.send(frame)?;
            return Ok(Submitted::Sent);
        }

        tracing::debug!("Runner is {}; queueing {} ({})", state.status, id, method);
        state.outbox.push_back(Queued {
            id,
            method: method.to_string(),
            frame,
        });
        Ok(Submitted::Queued)
    }

    /// Drop a queued envelope, e.g. when its call is removed before sending.
    pub fn withdraw(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.outbox.len();
        state.outbox.retain(|q| q.id.as_str() != id);
        state.outbox.len() != before
    }

    /// Apply a status reported by the runner or decided by the host.
    ///
    /// Entering `Ready` flushes the outbox (or, in `RequireRestore`, the
    /// restore methods in it). Entering `Reloading` discards it.
    pub fn apply(&self, next: RunnerStatus, transport: Option<&dyn Transport>) -> Applied {
        let mut applied = Applied {
            previous: next,
            failed: Vec::new(),
            discarded: Vec::new(),
        };

        let flush = {
            let mut state = self.state.lock();
            applied.previous = state.status;
            if !state.status.is_expected_transition(next) && state.status != next {
                tracing::warn!("Unexpected runner transition {} -> {}", state.status, next);
            }
            state.status = next;
            if next != RunnerStatus::Sleeping {
                state.asleep = None;
            }

            let mut flush = false;
            match next {
                // A flush already in progress picks up whatever this status admits.
                RunnerStatus::Ready | RunnerStatus::RequireRestore => {
                    flush = transport.is_some() && !state.draining;
                    state.draining |= flush;
                }
                RunnerStatus::Reloading => {
                    applied.discarded = state.outbox.drain(..).map(|q| q.id).collect();
                }
                _ => {}
            }

            // Publish while still holding the lock so receivers see transitions in order.
            let _ = self.events.send(next);
            self.current.send_replace(next);
            flush
        };

        tracing::debug!("Runner status: {} -> {}", applied.previous, next);
        if let (true, Some(transport)) = (flush, transport) {
            applied.failed = self.flush(transport);
        }
        applied
    }

    /// Send admitted envelopes one at a time until none are left.
    ///
    /// The status is re-checked before every send, so a reload reported from
    /// inside `send` stops the flush.
    fn flush(&self, transport: &dyn Transport) -> Vec<(CorrelationId, BridgeError)> {
        let mut failed = Vec::new();
        loop {
            let queued = {
                let mut state = self.state.lock();
                match state.next_admitted() {
                    Some(queued) => queued,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            if let Err(e) = transport.send(queued.frame) {
                tracing::warn!("Queued send for {} failed: {}", queued.id, e);
                failed.push((queued.id, e));
            }
        }
        failed
    }

    /// Enter `Sleeping`, remembering when and from which status.
    pub fn sleep(&self, now: Instant) -> Applied {
        let previous = self.status();
        let applied = self.apply(RunnerStatus::Sleeping, None);
        if previous != RunnerStatus::Sleeping {
            self.state.lock().asleep = Some((now, previous));
        }
        applied
    }

    /// When sleep started and the status before it, if asleep.
    pub fn asleep_since(&self) -> Option<(Instant, RunnerStatus)> {
        self.state.lock().asleep
    }

    /// Record the runner's environment report.
    pub fn set_info(&self, info: RunnerInfo) {
        *self.info.lock() = Some(info);
    }

    /// Last environment report.
    pub fn info(&self) -> Option<RunnerInfo> {
        self.info.lock().clone()
    }
}
