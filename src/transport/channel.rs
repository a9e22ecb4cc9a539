//! In-process transport over tokio mpsc channels.
//!
//! ```text
//! Bridge ─► ChannelTransport ─► mpsc ─► RunnerPort::recv()
//! Bridge ◄─ listener rx       ◄─ mpsc ◄─ RunnerPort::reply()
//! ```
//!
//! # Example
//!
//! ```ignore
//! use runner_bridge::transport::channel_transport;
//!
//! let (transport, inbound, mut runner) = channel_transport(64);
//! let bridge = Bridge::builder().transport(transport).build();
//! bridge.spawn_listener(inbound);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::Transport;
use crate::codec::WireFormat;
use crate::error::{BridgeError, Result};
use crate::protocol::{Envelope, ResponseFrame};

/// Default capacity of each direction.
pub const DEFAULT_TRANSPORT_CAPACITY: usize = 1024;

/// Bridge-side half: sends envelopes, requests reloads.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
    reloads: Arc<AtomicUsize>,
}

/// Runner-side half: receives envelopes, replies with frames.
pub struct RunnerPort {
    rx: mpsc::Receiver<Bytes>,
    reply_tx: mpsc::Sender<Bytes>,
    reloads: Arc<AtomicUsize>,
    format: WireFormat,
}

/// Create a connected transport pair.
///
/// Returns the transport for the bridge, the receiver to pass to
/// [`Bridge::spawn_listener`](crate::Bridge::spawn_listener), and the runner's port.
pub fn channel_transport(
    capacity: usize,
) -> (ChannelTransport, mpsc::Receiver<Bytes>, RunnerPort) {
    let (tx, rx) = mpsc::channel(capacity);
    let (reply_tx, reply_rx) = mpsc::channel(capacity);
    let reloads = Arc::new(AtomicUsize::new(0));

    let transport = ChannelTransport {
        tx,
        reloads: reloads.clone(),
    };
    let port = RunnerPort {
        rx,
        reply_tx,
        reloads,
        format: WireFormat::Json,
    };

    (transport, reply_rx, port)
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => BridgeError::ConnectionClosed,
        })
    }

    fn reload(&self) -> Result<()> {
        let n = self.reloads.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!("Runner reload requested ({} so far)", n);
        Ok(())
    }
}

impl ChannelTransport {
    /// Number of reloads requested through this transport.
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::Acquire)
    }
}

impl RunnerPort {
    /// Use a different wire format than JSON.
    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Next envelope from the bridge, or `None` once the bridge side is gone.
    pub async fn recv(&mut self) -> Option<Result<Envelope>> {
        let bytes = self.rx.recv().await?;
        Some(self.format.decode(&bytes))
    }

    /// Next envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<Result<Envelope>> {
        let bytes = self.rx.try_recv().ok()?;
        Some(self.format.decode(&bytes))
    }

    /// Send a frame back to the bridge.
    pub async fn reply(&self, frame: &ResponseFrame) -> Result<()> {
        let bytes = frame.encode(self.format)?;
        self.reply_raw(bytes).await
    }

    /// Send raw bytes back to the bridge.
    pub async fn reply_raw(&self, bytes: Bytes) -> Result<()> {
        self.reply_tx
            .send(bytes)
            .await
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    /// Number of reloads the bridge has requested.
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::Acquire)
    }
}
