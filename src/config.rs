//! Bridge configuration.

use std::time::Duration;

use crate::codec::WireFormat;

/// Default interval between liveness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(18);

/// Default time a probe may go unanswered before the runner is declared dead.
pub const DEFAULT_PROBE_DEADLINE: Duration = Duration::from_secs(16);

/// Default capacity of the dapp event bus.
pub const DEFAULT_DAPP_EVENT_CAPACITY: usize = 256;

/// Default capacity of the status event bus.
pub const DEFAULT_STATUS_EVENT_CAPACITY: usize = 64;

/// Default sleep duration after which waking reloads the runner.
pub const DEFAULT_WAKE_RELOAD_AFTER: Duration = Duration::from_secs(60 * 60);

/// Configuration for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interval between liveness probes while the runner is ready.
    pub probe_interval: Duration,
    /// Deadline for any sign of life after a probe.
    pub probe_deadline: Duration,
    /// Encoding of envelopes and frames.
    pub wire_format: WireFormat,
    /// Buffered dapp events per lagging receiver.
    pub dapp_event_capacity: usize,
    /// Buffered status transitions per lagging receiver.
    pub status_event_capacity: usize,
    /// Sleeping longer than this reloads the runner on wake.
    pub wake_reload_after: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_deadline: DEFAULT_PROBE_DEADLINE,
            wire_format: WireFormat::default(),
            dapp_event_capacity: DEFAULT_DAPP_EVENT_CAPACITY,
            status_event_capacity: DEFAULT_STATUS_EVENT_CAPACITY,
            wake_reload_after: DEFAULT_WAKE_RELOAD_AFTER,
        }
    }
}
