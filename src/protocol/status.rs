//! Runner status and telemetry payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Wire value of a pong on the status channel.
pub const PING_STATUS: &str = "ping";

/// Readiness state of the runner as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerStatus {
    /// Nothing heard from the runner yet.
    Uninitialized,
    /// Runner is loading the engine.
    Booting,
    /// Runner waits for storage to be restored; only restore methods go through.
    RequireRestore,
    /// Engine is up; outbound traffic flows.
    Ready,
    /// Runner is being reloaded; in-flight calls are swept.
    Reloading,
    /// Host put the runner to sleep.
    Sleeping,
}

impl RunnerStatus {
    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerStatus::Uninitialized => "init",
            RunnerStatus::Booting => "load",
            RunnerStatus::RequireRestore => "require_restore",
            RunnerStatus::Ready => "crypto_ready",
            RunnerStatus::Reloading => "reloading",
            RunnerStatus::Sleeping => "sleep",
        }
    }

    /// Whether moving from `self` to `next` follows the expected lifecycle.
    ///
    /// Reload and sleep may interrupt anything; reload cycles back to booting
    /// and waking restores whatever was there before. Everything else only
    /// moves forward.
    pub fn is_expected_transition(self, next: RunnerStatus) -> bool {
        use RunnerStatus::*;
        match (self, next) {
            (_, Reloading) | (_, Sleeping) | (Sleeping, _) => true,
            (Reloading, Booting) | (Reloading, Uninitialized) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }

    fn rank(self) -> u8 {
        match self {
            RunnerStatus::Uninitialized => 0,
            RunnerStatus::Booting => 1,
            RunnerStatus::RequireRestore => 2,
            RunnerStatus::Ready => 3,
            RunnerStatus::Reloading => 4,
            RunnerStatus::Sleeping => 5,
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(RunnerStatus::Uninitialized),
            "load" => Ok(RunnerStatus::Booting),
            "require_restore" => Ok(RunnerStatus::RequireRestore),
            "crypto_ready" => Ok(RunnerStatus::Ready),
            "reloading" => Ok(RunnerStatus::Reloading),
            "sleep" => Ok(RunnerStatus::Sleeping),
            other => Err(BridgeError::Protocol(format!(
                "unknown runner status: {}",
                other
            ))),
        }
    }
}

/// Payload of a frame on the status channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusReport {
    /// `ping` for a pong, otherwise a status name.
    pub status: String,
}

/// What a status-channel frame means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    /// Reply to a liveness probe.
    Pong,
    /// Runner changed state.
    Transition(RunnerStatus),
}

impl StatusReport {
    /// Interpret the report.
    pub fn signal(&self) -> crate::error::Result<StatusSignal> {
        if self.status == PING_STATUS {
            return Ok(StatusSignal::Pong);
        }
        self.status.parse().map(StatusSignal::Transition)
    }
}

/// Environment details the runner reports once after loading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInfo {
    /// Page URL the runner loaded.
    #[serde(default)]
    pub url: String,
    /// Engine version, if the runner knows it.
    #[serde(default)]
    pub version: Option<String>,
    /// User agent of the hosting engine.
    #[serde(default)]
    pub user_agent: String,
}
