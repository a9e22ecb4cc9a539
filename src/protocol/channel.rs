//! Method classification by name prefix.
//!
//! Every method name is classified once, at dispatch time. The resulting
//! [`Channel`] is stored with the handler and matched everywhere else, so the
//! prefix rules live only here.

use std::fmt;

/// Method prefix for internal wallet calls.
pub const INTERNAL_PREFIX: &str = "pri(";
/// Method prefix for calls a connected dapp may invoke.
pub const PUBLIC_PREFIX: &str = "pub(";
/// Method prefix for chain-injected (EVM provider) calls.
pub const CHAIN_PREFIX: &str = "evm(";
/// Methods with this prefix may be sent while the runner waits for a restore.
pub const RESTORE_PREFIX: &str = "mobile";

/// Traffic class derived from a method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Internal wallet call (`pri(...)`).
    Internal,
    /// Dapp-facing call (`pub(...)`).
    Public,
    /// Chain-injected call (`evm(...)`).
    Chain,
    /// Anything else.
    Unknown,
}

impl Channel {
    /// Short tag used as correlation id prefix.
    pub fn tag(self) -> &'static str {
        match self {
            Channel::Internal => "pri",
            Channel::Public => "pub",
            Channel::Chain => "evm",
            Channel::Unknown => "unknown",
        }
    }

    /// Dapp-facing frames fan out on the event bus instead of resolving handlers.
    pub fn is_dapp_facing(self) -> bool {
        matches!(self, Channel::Public | Channel::Chain)
    }

    /// Whether a runner-side subscription exists that must be cancelled on teardown.
    pub fn needs_runner_cancel(self) -> bool {
        !matches!(self, Channel::Unknown)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Classify a method name.
pub fn classify(method: &str) -> Channel {
    if method.starts_with(INTERNAL_PREFIX) {
        Channel::Internal
    } else if method.starts_with(PUBLIC_PREFIX) {
        Channel::Public
    } else if method.starts_with(CHAIN_PREFIX) {
        Channel::Chain
    } else {
        Channel::Unknown
    }
}

/// Whether the method may bypass the readiness gate during a restore.
pub fn is_restore_method(method: &str) -> bool {
    method.starts_with(RESTORE_PREFIX)
}
