//! Link layer: the station-mode network connection
//!
//! [`Link`] is the capability a radio driver or host network manager
//! provides. [`LinkGate`] adds the policy the manager relies on: joins are
//! fire-and-forget, and teardown waits a bounded time for the link to drop.

use crate::clock::{wait_until, Clock};
use crate::config::NetworkDescriptor;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod nmcli;

pub use nmcli::NmcliLink;

/// Network name joined when a descriptor carries none, keeping station mode active
pub const PLACEHOLDER_NETWORK: &str = "STATIONKEEPER_NO_SSID_SET";

/// Interval between link checks while waiting for teardown
pub const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Current state of the station link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// Join requested, association or addressing still in progress
    Connecting,
    Connected,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Link-layer capability supplied by the platform
///
/// Every method must return promptly; joins and teardowns are requests whose
/// outcome shows up later in [`Link::status`].
pub trait Link {
    /// Request a join to `network_name`, open when `secret` is `None`
    fn connect(&mut self, network_name: &str, secret: Option<&str>) -> bool;

    /// Request the station link to drop
    fn disconnect(&mut self);

    fn status(&self) -> LinkState;

    /// Become an access point at `address`
    fn start_access_point(&mut self, ssid: &str, password: &str, address: Ipv4Addr) -> bool;

    fn stop_access_point(&mut self);

    /// Names of visible networks
    fn scan(&mut self) -> Vec<String>;

    /// Station hardware address, used to build the broker client identifier
    fn hardware_address(&self) -> [u8; 6];
}

/// Policy wrapper around a [`Link`]
pub struct LinkGate {
    link: Box<dyn Link>,
    teardown_timeout: Duration,
}

impl LinkGate {
    pub fn new(link: Box<dyn Link>, teardown_timeout: Duration) -> Self {
        Self {
            link,
            teardown_timeout,
        }
    }

    /// Non-blocking join request for the descriptor's network
    pub fn connect(&mut self, descriptor: &NetworkDescriptor) -> bool {
        let profile = descriptor.profile();
        if !profile.has_network_name {
            warn!("No network name set, joining placeholder network");
            return self.link.connect(PLACEHOLDER_NETWORK, None);
        }

        debug!(
            network = %descriptor.network_name,
            secured = profile.has_secret,
            "Requesting link join"
        );
        self.link.connect(&descriptor.network_name, descriptor.secret())
    }

    pub fn status(&self) -> LinkState {
        self.link.status()
    }

    pub fn is_up(&self) -> bool {
        self.status().is_up()
    }

    /// Tear down access point and station link, waiting at most the teardown timeout
    ///
    /// Returns whether the link was observed down before giving up.
    pub fn disconnect(&mut self, clock: &dyn Clock) -> bool {
        self.link.stop_access_point();
        self.link.disconnect();

        let link = &self.link;
        let dropped = wait_until(clock, self.teardown_timeout, TEARDOWN_POLL_INTERVAL, || {
            link.status() == LinkState::Disconnected
        });
        if dropped {
            debug!("Link torn down");
        } else {
            warn!(
                timeout_ms = self.teardown_timeout.as_millis() as u64,
                "Link did not drop within teardown timeout, continuing"
            );
        }
        dropped
    }

    pub fn start_access_point(&mut self, ssid: &str, password: &str, address: Ipv4Addr) -> bool {
        let started = self.link.start_access_point(ssid, password, address);
        if started {
            info!(ssid, %address, "Access point started");
        } else {
            warn!(ssid, "Access point failed to start");
        }
        started
    }

    pub fn scan(&mut self) -> Vec<String> {
        self.link.scan()
    }

    pub fn hardware_address(&self) -> [u8; 6] {
        self.link.hardware_address()
    }
}

/// Render a hardware address as lowercase hex pairs without padding
///
/// Matches the identifiers older device firmware registered with brokers,
/// so `0a` renders as `a`.
pub fn format_hardware_address(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, MockLink};

    #[test]
    fn test_connect_passes_secret_only_when_set() {
        let link = MockLink::new();
        let mut gate = LinkGate::new(Box::new(link.clone()), Duration::from_secs(2));

        gate.connect(&NetworkDescriptor::link_only("open", Some("")));
        gate.connect(&NetworkDescriptor::link_only("closed", Some("pw")));

        let joins = link.joins();
        assert_eq!(joins[0], ("open".to_string(), None));
        assert_eq!(joins[1], ("closed".to_string(), Some("pw".to_string())));
    }

    #[test]
    fn test_connect_without_name_uses_placeholder() {
        let link = MockLink::new();
        let mut gate = LinkGate::new(Box::new(link.clone()), Duration::from_secs(2));

        gate.connect(&NetworkDescriptor::default());

        assert_eq!(link.joins()[0].0, PLACEHOLDER_NETWORK);
    }

    #[test]
    fn test_disconnect_stops_access_point_first() {
        let link = MockLink::new();
        link.set_state(LinkState::Connected);
        link.set_drop_on_disconnect(true);
        let mut gate = LinkGate::new(Box::new(link.clone()), Duration::from_secs(2));
        let clock = ManualClock::new();

        assert!(gate.disconnect(&clock));
        assert_eq!(link.calls(), vec!["stop_access_point", "disconnect"]);
    }

    #[test]
    fn test_disconnect_gives_up_after_timeout() {
        let link = MockLink::new();
        link.set_state(LinkState::Connected);
        link.set_drop_on_disconnect(false);
        let mut gate = LinkGate::new(Box::new(link.clone()), Duration::from_secs(2));
        let clock = ManualClock::new();
        let start = clock.now();

        assert!(!gate.disconnect(&clock));
        assert_eq!(clock.now().duration_since(start), Duration::from_secs(2));
    }

    #[test]
    fn test_format_hardware_address() {
        let mac = [0x5c, 0xcf, 0x7f, 0x0a, 0x00, 0xff];
        assert_eq!(format_hardware_address(&mac), "5c:cf:7f:a:0:ff");
    }
}
