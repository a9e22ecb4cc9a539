//! Correlation ids.
//!
//! Generated ids look like `pri|5f3a9c1e07d2b4a1.17`: the channel tag, a
//! per-process seed and a monotonically increasing counter. Callers that
//! need an id to survive a reconnect supply their own instead.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::Channel;

/// Opaque id correlating a call with its responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap a caller-supplied id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as sent on the wire.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the wire string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Generator for unique correlation ids.
#[derive(Debug)]
pub struct IdGenerator {
    seed: u64,
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator with a fresh seed.
    pub fn new() -> Self {
        Self::with_seed(seed_u64())
    }

    /// Create a generator with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            next: AtomicU64::new(1),
        }
    }

    /// Next id for the given channel.
    pub fn next_id(&self, channel: Channel) -> CorrelationId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        CorrelationId(format!("{}|{:016x}.{}", channel.tag(), self.seed, n))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Seed mixed from wall-clock time and process id.
fn seed_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let pid = std::process::id() as u64;
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid
}
