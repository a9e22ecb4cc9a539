//! # runner-bridge
//!
//! Host-side bridge to a sandboxed script runner.
//!
//! The host talks to the runner through a single message channel. This crate
//! turns that channel into request/response calls and subscriptions, keyed
//! by correlation ids, and keeps track of whether the runner is alive.
//!
//! ## Architecture
//!
//! - **Calls**: every outgoing envelope gets a handler registered before it
//!   is sent; frames coming back are matched by id
//! - **Telemetry**: reserved ids carry runner status, environment info and
//!   console output, and never reach call handlers
//! - **Lifecycle**: sends are held until the runner is ready; a reload
//!   rejects everything outstanding with [`BridgeError::RunnerReloaded`]
//! - **Liveness**: while ready, the runner is pinged periodically and
//!   reloaded if it stops answering
//!
//! ## Example
//!
//! ```ignore
//! use runner_bridge::{subscriber, transport::channel_transport, Bridge};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> runner_bridge::Result<()> {
//!     let (transport, inbound, _runner) = channel_transport(64);
//!     let bridge = Bridge::builder().transport(transport).build();
//!     bridge.spawn_listener(inbound);
//!     bridge.wait_ready().await?;
//!
//!     let first = bridge
//!         .subscribe(
//!             "pri(balance.subscribe)",
//!             json!({"address": "5F..."}),
//!             subscriber(|update| println!("balance: {update}")),
//!         )
//!         .await?;
//!     println!("initial: {first}");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod liveness;
pub mod protocol;
pub mod router;
pub mod transport;

mod bridge;

pub use bridge::{Bridge, BridgeBuilder, CallOptions, PreparedCall, CANCEL_METHOD};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use handler::{subscriber, CorrelationId, PendingCall, Subscriber};
pub use liveness::LivenessState;
pub use protocol::{Channel, RunnerInfo, RunnerStatus};
pub use router::{DappEvent, UnhandledHook};
