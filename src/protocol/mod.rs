//! Protocol module - wire envelopes, method classification and runner status.
//!
//! - [`Envelope`] / [`ResponseFrame`] - what crosses the channel
//! - [`Channel`] - traffic class derived once from a method name
//! - [`RunnerStatus`] - runner readiness as reported on the status channel

mod channel;
mod envelope;
mod status;

pub use channel::{
    classify, is_restore_method, Channel, CHAIN_PREFIX, INTERNAL_PREFIX, PUBLIC_PREFIX,
    RESTORE_PREFIX,
};
pub use envelope::{
    is_reserved_id, Envelope, FrameBody, ResponseFrame, CONSOLE_FRAME_ID, PING_MESSAGE,
    RUNNER_INFO_ID, STATUS_FRAME_ID,
};
pub use status::{RunnerInfo, RunnerStatus, StatusReport, StatusSignal, PING_STATUS};
