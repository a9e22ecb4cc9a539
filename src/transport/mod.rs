//! Transport module - the channel to the runner.
//!
//! The bridge needs only two capabilities from whatever hosts the runner:
//! push an encoded envelope in, and reset the runner. Inbound frames are fed
//! to [`Bridge::on_frame`](crate::Bridge::on_frame) or through
//! [`Bridge::spawn_listener`](crate::Bridge::spawn_listener).
//!
//! [`ChannelTransport`] is an in-process implementation over tokio channels,
//! used when the runner is a task in the same process and by the test suite.

mod channel;

pub use channel::{channel_transport, ChannelTransport, RunnerPort, DEFAULT_TRANSPORT_CAPACITY};

use bytes::Bytes;

use crate::error::Result;

/// Outbound half of the runner channel.
///
/// Implementations must not block: `send` is called while the bridge holds
/// its outbox lock, so it should enqueue and return.
pub trait Transport: Send + Sync + 'static {
    /// Hand an encoded envelope to the runner.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Tear down and restart the runner.
    fn reload(&self) -> Result<()>;
}
