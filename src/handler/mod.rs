//! Handler module - correlation of outstanding calls.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps correlation ids to pending-call state
//! - [`PendingCall`] - the future a caller awaits
//! - [`Subscriber`] - durable callback for push updates
//! - [`IdGenerator`] - unique correlation ids per channel

mod id;
mod pending;
mod registry;

pub use id::{CorrelationId, IdGenerator};
pub use pending::{subscriber, PendingCall, Subscriber};
pub use registry::{HandlerEntry, HandlerRegistry};
