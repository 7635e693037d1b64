//! Connection status reported by the manager

use std::cmp::Ordering;
use std::fmt;

/// Overall connectivity
///
/// `Disconnected < LinkOnly < FullSession` form a ladder; `Broadcasting`
/// sits outside it and suspends reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    /// Link up, no broker session
    LinkOnly,
    /// Link up and broker session established
    FullSession,
    /// Acting as an access point
    Broadcasting,
}

impl ConnectionStatus {
    /// Status implied by live link and session state
    pub fn from_live(link_up: bool, session_connected: bool) -> Self {
        match (link_up, session_connected) {
            (false, _) => ConnectionStatus::Disconnected,
            (true, false) => ConnectionStatus::LinkOnly,
            (true, true) => ConnectionStatus::FullSession,
        }
    }

    /// Position on the ladder, `None` while broadcasting
    pub fn level(self) -> Option<u8> {
        match self {
            ConnectionStatus::Disconnected => Some(0),
            ConnectionStatus::LinkOnly => Some(1),
            ConnectionStatus::FullSession => Some(2),
            ConnectionStatus::Broadcasting => None,
        }
    }

    /// Whether this status is at or above `target` on the ladder
    pub fn is_at_least(self, target: ConnectionStatus) -> bool {
        self >= target
    }

    /// Whether the radio is usable for update hooks
    pub fn is_link_usable(self) -> bool {
        !matches!(self, ConnectionStatus::Disconnected)
    }
}

/// Ladder order; `Broadcasting` only compares equal to itself
impl PartialOrd for ConnectionStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.level(), other.level()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ if self == other => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::LinkOnly => "link-only",
            ConnectionStatus::FullSession => "full-session",
            ConnectionStatus::Broadcasting => "broadcasting",
        };
        f.write_str(name)
    }
}
