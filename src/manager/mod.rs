//! Connection lifecycle manager
//!
//! [`ConnectionManager`] owns the link gate, the broker session, the
//! candidate networks and the subscription ledger. The host calls
//! [`ConnectionManager::poll`] from its run loop; every transition happens
//! synchronously inside that call and every wait is bounded.
//!
//! Reconnection runs at most once per reconnect interval. Link failures
//! count towards the hop threshold directly; broker handshake failures count
//! against a smaller budget that rolls over into one link failure when spent.

use crate::broker::{BrokerSession, Handshake, SENTINEL_BROKER_HOST};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigStore, NetworkDescriptor};
use crate::error::{KeeperError, KeeperResult};
use crate::hooks::{HookDriver, UpdateHooks};
use crate::ledger::{SubscriptionLedger, DEFAULT_SUBSCRIPTION_CAPACITY};
use crate::lifecycle_span;
use crate::link::{format_hardware_address, Link, LinkGate};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod retry;
pub mod roster;
pub mod status;

pub use retry::{ReconnectTimer, RetryCounters, RetryDecision, RetryPolicy};
pub use roster::NetworkRoster;
pub use status::ConnectionStatus;

/// Step between checks in the startup connection loop
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Manager tunables
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Minimum spacing between reconnection attempts
    pub reconnect_interval: Duration,
    /// Upper bound on the connection loop inside `begin`
    pub startup_timeout: Duration,
    /// Upper bound on waiting for the link to drop
    pub teardown_timeout: Duration,
    pub retry: RetryPolicy,
    /// Prefix of the broker client identifier
    pub client_prefix: String,
    /// QoS used for ledger subscriptions
    pub subscription_qos: u8,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(500),
            startup_timeout: Duration::from_secs(2),
            teardown_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            client_prefix: "stationkeeper".to_string(),
            subscription_qos: 1,
        }
    }
}

/// Access point settings while broadcasting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastInfo {
    pub ssid: String,
    pub password: String,
    pub address: Ipv4Addr,
}

type LinkHandler = Box<dyn FnMut()>;
type MessageHandler = Box<dyn FnMut(&str, &[u8])>;

/// State machine keeping a device on its network and broker
///
/// `N` is the subscription ledger capacity.
pub struct ConnectionManager<const N: usize = DEFAULT_SUBSCRIPTION_CAPACITY> {
    config: ManagerConfig,
    clock: Box<dyn Clock>,
    link: LinkGate,
    session: Box<dyn BrokerSession>,
    roster: Option<NetworkRoster>,
    hopping_override: Option<bool>,
    ledger: SubscriptionLedger<N>,
    counters: RetryCounters,
    timer: ReconnectTimer,
    status: ConnectionStatus,
    running: bool,
    link_was_up: bool,
    client_id: String,
    broadcast: Option<BroadcastInfo>,
    hooks: HookDriver,
    on_link_established: Option<LinkHandler>,
    on_message: Option<MessageHandler>,
}

impl<const N: usize> ConnectionManager<N> {
    pub fn new(
        link: Box<dyn Link>,
        session: Box<dyn BrokerSession>,
        config: ManagerConfig,
    ) -> Self {
        Self::with_clock(link, session, config, Box::new(SystemClock))
    }

    pub fn with_clock(
        link: Box<dyn Link>,
        session: Box<dyn BrokerSession>,
        config: ManagerConfig,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            link: LinkGate::new(link, config.teardown_timeout),
            timer: ReconnectTimer::new(config.reconnect_interval),
            config,
            clock,
            session,
            roster: None,
            hopping_override: None,
            ledger: SubscriptionLedger::new(),
            counters: RetryCounters::default(),
            status: ConnectionStatus::Disconnected,
            running: false,
            link_was_up: false,
            client_id: String::new(),
            broadcast: None,
            hooks: HookDriver::new(),
            on_link_established: None,
            on_message: None,
        }
    }

    /// Start on a single network
    pub fn begin(&mut self, descriptor: NetworkDescriptor) -> KeeperResult<()> {
        self.begin_with_candidates(vec![descriptor], 0)
    }

    /// Start on `candidates[start_index]`, hopping through the list on failure
    ///
    /// Hopping is enabled when more than one candidate is given, unless
    /// [`ConnectionManager::set_hopping`] said otherwise. Blocks for at most
    /// the startup timeout while trying to reach the target status.
    pub fn begin_with_candidates(
        &mut self,
        candidates: Vec<NetworkDescriptor>,
        start_index: usize,
    ) -> KeeperResult<()> {
        if candidates.is_empty() {
            return Err(KeeperError::NoCandidates);
        }
        if start_index >= candidates.len() {
            return Err(KeeperError::StartIndexOutOfRange {
                index: start_index,
                len: candidates.len(),
            });
        }
        if candidates[start_index].network_name.is_empty() {
            return Err(KeeperError::MissingNetworkName);
        }

        let candidates: Vec<NetworkDescriptor> =
            candidates.into_iter().map(NetworkDescriptor::normalized).collect();
        let hopping = self.hopping_override.unwrap_or(candidates.len() > 1);
        let roster = NetworkRoster::new(candidates, start_index, hopping);

        let span = lifecycle_span!(
            phase = "begin",
            network = %roster.current().network_name,
            candidates = roster.len()
        );
        let _enter = span.enter();

        let mac = self.link.hardware_address();
        self.client_id = format!(
            "{}-{}",
            self.config.client_prefix,
            format_hardware_address(&mac)
        );

        self.link.connect(roster.current());
        configure_session(self.session.as_mut(), roster.current());
        self.roster = Some(roster);

        self.running = true;
        self.status = ConnectionStatus::Disconnected;
        self.link_was_up = false;
        self.broadcast = None;
        self.counters.reset();
        self.timer.reset(self.clock.now());

        info!(client_id = %self.client_id, hopping, "Connection manager started");
        self.run_startup_loop();
        if self.status.is_link_usable() {
            self.hooks.service();
        }
        Ok(())
    }

    /// Load the network from `store` and start on it
    ///
    /// A missing or malformed record falls back to the default descriptor.
    pub fn begin_from_store(&mut self, store: &mut dyn ConfigStore) -> KeeperResult<()> {
        let descriptor = store.load().unwrap_or_else(|e| {
            warn!("Failed to load network record, using defaults: {}", e);
            NetworkDescriptor::default()
        });
        self.begin(descriptor)
    }

    /// Like [`ConnectionManager::begin_from_store`], but a record that names
    /// no network leaves the manager stopped and returns `Ok(false)`
    pub fn try_begin_from_store(&mut self, store: &mut dyn ConfigStore) -> KeeperResult<bool> {
        match self.begin_from_store(store) {
            Ok(()) => Ok(true),
            Err(KeeperError::MissingNetworkName) => {
                debug!("Stored network record names no network yet");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `begin` succeeded and `end` has not been called since
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn run_startup_loop(&mut self) {
        let started = self.clock.now();
        loop {
            self.refresh_status();
            if self.status.is_at_least(self.target_status()) {
                break;
            }
            if self.clock.now().duration_since(started) >= self.config.startup_timeout {
                debug!("Startup connection loop timed out");
                break;
            }
            self.reconnect();
            self.clock.sleep(STARTUP_POLL_INTERVAL);
        }
    }

    /// Drive the state machine once
    ///
    /// Never blocks beyond the bounded waits of a single reconnection
    /// attempt. Returns [`ConnectionStatus::Disconnected`] before a
    /// successful `begin`.
    pub fn poll(&mut self) -> ConnectionStatus {
        if !self.running {
            return ConnectionStatus::Disconnected;
        }

        if self.status != ConnectionStatus::Broadcasting {
            self.refresh_status();
            if !self.status.is_at_least(self.target_status()) {
                self.reconnect();
            }
        }

        if self.status == ConnectionStatus::FullSession {
            self.pump();
        }
        if self.status.is_link_usable() {
            self.hooks.service();
        }
        self.status
    }

    /// Stop update hooks, drop the broker session and tear down the link
    pub fn end(&mut self) {
        let span = lifecycle_span!(phase = "end");
        let _enter = span.enter();

        self.hooks.stop();
        self.session.disconnect();
        self.link.disconnect(self.clock.as_ref());
        self.status = ConnectionStatus::Disconnected;
        self.link_was_up = false;
        self.broadcast = None;
        self.running = false;
        info!("Connection manager stopped");
    }

    fn target_status(&self) -> ConnectionStatus {
        match &self.roster {
            Some(roster) if roster.profile().has_broker => ConnectionStatus::FullSession,
            _ => ConnectionStatus::LinkOnly,
        }
    }

    fn fire_link_established(&mut self) {
        info!("Link established");
        if let Some(handler) = self.on_link_established.as_mut() {
            handler();
        }
    }

    /// Recompute status from live link and session state
    fn refresh_status(&mut self) {
        let link_up = self.link.is_up();
        if link_up && !self.link_was_up {
            self.fire_link_established();
        }
        self.link_was_up = link_up;

        let status = ConnectionStatus::from_live(link_up, self.session.is_connected());
        if status != self.status {
            debug!(from = %self.status, to = %status, "Status changed");
        }
        self.status = status;

        if self.status.is_at_least(self.target_status()) {
            self.counters.reset();
        }
    }

    /// One throttled pass of the reconnection algorithm
    fn reconnect(&mut self) {
        let now = self.clock.now();
        if !self.timer.check(now) {
            return;
        }

        let policy = self.config.retry.clone();

        if !self.link.is_up() {
            self.status = ConnectionStatus::Disconnected;
            self.link_was_up = false;
            let decision = policy.record_link_failure(&mut self.counters);
            debug!(
                link_failures = self.counters.link_failures,
                "Link still down"
            );
            if decision == RetryDecision::Failover {
                self.failover();
                return;
            }
            self.timer.reset(now);
            return;
        }

        if !self.link_was_up {
            self.link_was_up = true;
            self.fire_link_established();
        }
        self.status = ConnectionStatus::LinkOnly;

        let has_broker = self
            .roster
            .as_ref()
            .map(|r| r.profile().has_broker)
            .unwrap_or(false);

        if has_broker && !self.session.is_connected() {
            if policy.can_attempt_broker(&self.counters) {
                self.attempt_handshake(&policy);
            }

            if !self.session.is_connected()
                && policy.roll_over(&mut self.counters) == Some(RetryDecision::Failover)
            {
                self.failover();
                return;
            }
        }

        self.timer.reset(now);
    }

    fn attempt_handshake(&mut self, policy: &RetryPolicy) {
        let handshake = match &self.roster {
            Some(roster) => Handshake::for_descriptor(&self.client_id, roster.current()),
            None => return,
        };

        match self.session.connect(&handshake) {
            Ok(()) => {
                self.status = ConnectionStatus::FullSession;
                self.replay_subscriptions();
                self.counters.reset();
                info!(shape = handshake.shape(), "Broker session established");
            }
            Err(e) => {
                policy.record_broker_failure(&mut self.counters);
                warn!(
                    broker_attempts = self.counters.broker_attempts,
                    "Broker handshake failed: {}",
                    e
                );
            }
        }
    }

    /// Re-subscribe every live ledger entry
    fn replay_subscriptions(&mut self) {
        let qos = self.config.subscription_qos;
        let mut replayed = 0usize;
        for topic in self.ledger.iter() {
            if let Err(e) = self.session.subscribe(topic, qos) {
                warn!(topic, "Replay subscribe failed: {}", e);
            }
            replayed += 1;
            std::thread::yield_now();
        }
        debug!(replayed, "Subscriptions replayed");
    }

    /// Hop to the next candidate network
    fn failover(&mut self) {
        let span = lifecycle_span!(phase = "failover", from = ?self.current_index());
        let _enter = span.enter();

        let next = match self.roster.as_mut().and_then(|r| r.advance()) {
            Some(next) => next.clone(),
            None => {
                debug!("Hop threshold reached but hopping is disabled");
                self.counters.reset();
                self.timer.reset(self.clock.now());
                return;
            }
        };

        info!(network = %next.network_name, "Hopping to next network");
        self.session.disconnect();
        self.link.disconnect(self.clock.as_ref());
        self.link.connect(&next);
        configure_session(self.session.as_mut(), &next);

        self.status = ConnectionStatus::Disconnected;
        self.link_was_up = false;
        self.counters.reset();
        self.timer.reset(self.clock.now());
    }

    fn pump(&mut self) {
        let handler = &mut self.on_message;
        self.session.pump(&mut |topic: &str, payload: &[u8]| {
            if let Some(handler) = handler.as_mut() {
                handler(topic, payload);
            }
        });
    }

    /// Add `topic` to the ledger, subscribing right away when connected
    ///
    /// The entry is kept even if the live subscribe fails; it is retried on
    /// the next reconnect. Returns the ledger slot.
    pub fn add_subscription(&mut self, topic: &str) -> KeeperResult<usize> {
        let slot = self.ledger.insert(topic)?;
        if self.status == ConnectionStatus::FullSession {
            if let Err(e) = self.session.subscribe(topic, self.config.subscription_qos) {
                warn!(topic, "Live subscribe failed, will retry on reconnect: {}", e);
            }
        }
        Ok(slot)
    }

    /// Remove the first ledger entry matching `topic` and unsubscribe
    pub fn remove_subscription(&mut self, topic: &str) -> KeeperResult<usize> {
        let slot = self.ledger.remove(topic)?;
        if self.status == ConnectionStatus::FullSession {
            if let Err(e) = self.session.unsubscribe(topic) {
                warn!(topic, "Live unsubscribe failed: {}", e);
            }
        }
        Ok(slot)
    }

    /// Subscribe once without recording the topic in the ledger
    pub fn subscribe(&mut self, topic: &str, qos: u8) -> KeeperResult<()> {
        if self.status != ConnectionStatus::FullSession {
            return Err(KeeperError::NotConnected);
        }
        self.session.subscribe(topic, qos)?;
        self.pump();
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str) -> KeeperResult<()> {
        if self.status != ConnectionStatus::FullSession {
            return Err(KeeperError::NotConnected);
        }
        self.session.unsubscribe(topic)?;
        Ok(())
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> KeeperResult<()> {
        if self.status != ConnectionStatus::FullSession {
            return Err(KeeperError::NotConnected);
        }
        self.session.publish(topic, payload, retain)?;
        Ok(())
    }

    /// Called once per rising edge of the link
    pub fn on_link_established(&mut self, handler: impl FnMut() + 'static) {
        self.on_link_established = Some(Box::new(handler));
    }

    /// Called for every inbound message while pumping the session
    pub fn on_message(&mut self, handler: impl FnMut(&str, &[u8]) + 'static) {
        self.on_message = Some(Box::new(handler));
    }

    pub fn set_update_hooks(&mut self, hooks: Box<dyn UpdateHooks>) {
        self.hooks.install(hooks);
    }

    /// Switch to access point mode, suspending reconnection
    pub fn enter_broadcast(
        &mut self,
        ssid: &str,
        password: &str,
        address: Ipv4Addr,
    ) -> KeeperResult<()> {
        if !self.running {
            return Err(KeeperError::NotStarted);
        }
        let span = lifecycle_span!(phase = "enter_broadcast", ssid);
        let _enter = span.enter();

        self.session.disconnect();
        self.link.disconnect(self.clock.as_ref());
        self.link.start_access_point(ssid, password, address);
        self.status = ConnectionStatus::Broadcasting;
        self.link_was_up = false;
        self.broadcast = Some(BroadcastInfo {
            ssid: ssid.to_string(),
            password: password.to_string(),
            address,
        });
        self.timer.reset(self.clock.now());
        Ok(())
    }

    /// Leave access point mode and rejoin the current network
    pub fn exit_broadcast(&mut self) -> KeeperResult<()> {
        if !self.running {
            return Err(KeeperError::NotStarted);
        }
        if self.status != ConnectionStatus::Broadcasting {
            return Ok(());
        }
        let span = lifecycle_span!(phase = "exit_broadcast");
        let _enter = span.enter();

        self.link.disconnect(self.clock.as_ref());
        self.status = ConnectionStatus::Disconnected;
        self.link_was_up = false;
        self.broadcast = None;
        if let Some(roster) = &self.roster {
            self.link.connect(roster.current());
            configure_session(self.session.as_mut(), roster.current());
        }
        self.timer.reset(self.clock.now());
        Ok(())
    }

    pub fn set_hopping(&mut self, hopping: bool) {
        self.hopping_override = Some(hopping);
        if let Some(roster) = self.roster.as_mut() {
            roster.set_hopping(hopping);
        }
    }

    pub fn hopping_enabled(&self) -> bool {
        match &self.roster {
            Some(roster) => roster.hopping_enabled(),
            None => self.hopping_override.unwrap_or(false),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn current_descriptor(&self) -> Option<&NetworkDescriptor> {
        self.roster.as_ref().map(NetworkRoster::current)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.roster.as_ref().map(NetworkRoster::index)
    }

    pub fn retry_counters(&self) -> RetryCounters {
        self.counters
    }

    pub fn set_retry_counters(&mut self, counters: RetryCounters) {
        self.counters = counters;
    }

    /// Live ledger topics in slot order
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.ledger.iter()
    }

    pub fn ledger(&self) -> &SubscriptionLedger<N> {
        &self.ledger
    }

    pub fn broadcast_info(&self) -> Option<&BroadcastInfo> {
        self.broadcast.as_ref()
    }

    /// Broker client identifier, set by `begin`
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Visible network names
    pub fn scan(&mut self) -> Vec<String> {
        self.link.scan()
    }
}

/// Point the session at the descriptor's broker, or the sentinel when link-only
fn configure_session(session: &mut dyn BrokerSession, descriptor: &NetworkDescriptor) {
    if descriptor.is_link_only() {
        session.configure(SENTINEL_BROKER_HOST, descriptor.broker_port);
    } else {
        session.configure(&descriptor.broker_host, descriptor.broker_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, PlainSession, TransportKind};
    use crate::testing::{ManualClock, MockBroker, MockLink};

    fn config() -> ManagerConfig {
        ManagerConfig {
            startup_timeout: Duration::ZERO,
            ..ManagerConfig::default()
        }
    }

    fn manager() -> (ConnectionManager<4>, MockLink, MockBroker, ManualClock) {
        let link = MockLink::new();
        let broker = MockBroker::new();
        let clock = ManualClock::new();
        let manager = ConnectionManager::with_clock(
            Box::new(link.clone()),
            Box::new(PlainSession::new(broker.clone())),
            config(),
            Box::new(clock.clone()),
        );
        (manager, link, broker, clock)
    }

    #[test]
    fn test_poll_before_begin_touches_nothing() {
        let (mut manager, link, broker, _clock) = manager();

        assert_eq!(manager.poll(), ConnectionStatus::Disconnected);
        assert!(link.calls().is_empty());
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[test]
    fn test_begin_requires_network_name() {
        let (mut manager, link, _broker, _clock) = manager();

        let result = manager.begin(NetworkDescriptor::default());

        assert!(matches!(result, Err(KeeperError::MissingNetworkName)));
        assert!(link.joins().is_empty());
        assert_eq!(manager.poll(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_begin_rejects_bad_start_index() {
        let (mut manager, _link, _broker, _clock) = manager();
        let result = manager
            .begin_with_candidates(vec![NetworkDescriptor::link_only("a", None)], 1);
        assert!(matches!(
            result,
            Err(KeeperError::StartIndexOutOfRange { index: 1, len: 1 })
        ));
        assert!(matches!(
            manager.begin_with_candidates(Vec::new(), 0),
            Err(KeeperError::NoCandidates)
        ));
    }

    #[test]
    fn test_begin_builds_client_id_from_hardware_address() {
        let (mut manager, link, broker, _clock) = manager();
        link.set_hardware_address([0x5c, 0xcf, 0x7f, 0x0a, 0x00, 0xff]);

        manager
            .begin(NetworkDescriptor::with_broker("home", Some("pw"), "broker.local"))
            .unwrap();

        assert_eq!(manager.client_id(), "stationkeeper-5c:cf:7f:a:0:ff");
        assert_eq!(link.joins(), vec![("home".to_string(), Some("pw".to_string()))]);
        assert_eq!(
            broker.endpoint(),
            Some(("broker.local".to_string(), 1883, TransportKind::Plain))
        );
    }

    #[test]
    fn test_link_only_descriptor_uses_sentinel_broker() {
        let (mut manager, _link, broker, _clock) = manager();

        manager.begin(NetworkDescriptor::link_only("home", None)).unwrap();

        assert_eq!(
            broker.endpoint(),
            Some((SENTINEL_BROKER_HOST.to_string(), 1883, TransportKind::Plain))
        );
    }

    #[test]
    fn test_reconnect_is_throttled() {
        let (mut manager, link, broker, clock) = manager();
        link.set_join_connects(true);
        broker.set_accept_handshakes(false);
        manager
            .begin(NetworkDescriptor::with_broker("home", None, "broker.local"))
            .unwrap();

        // Timer was reset by begin
        assert_eq!(manager.poll(), ConnectionStatus::LinkOnly);
        assert_eq!(broker.connect_attempts(), 0);

        clock.advance(Duration::from_millis(500));
        manager.poll();
        manager.poll();
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(manager.retry_counters().broker_attempts, 1);
    }

    #[test]
    fn test_end_tears_everything_down() {
        let (mut manager, link, broker, clock) = manager();
        link.set_join_connects(true);
        manager
            .begin(NetworkDescriptor::with_broker("home", None, "broker.local"))
            .unwrap();
        clock.advance(Duration::from_millis(500));
        assert_eq!(manager.poll(), ConnectionStatus::FullSession);

        manager.end();

        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(!broker.is_connected());
        assert!(link.calls().contains(&"disconnect"));
        assert_eq!(manager.poll(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_subscribe_requires_full_session() {
        let (mut manager, link, _broker, _clock) = manager();
        link.set_join_connects(true);
        manager.begin(NetworkDescriptor::link_only("home", None)).unwrap();

        assert!(matches!(
            manager.subscribe("t", 1),
            Err(KeeperError::NotConnected)
        ));
        assert!(matches!(
            manager.publish("t", b"x", false),
            Err(KeeperError::NotConnected)
        ));
    }

    #[test]
    fn test_broadcast_requires_begin() {
        let (mut manager, _link, _broker, _clock) = manager();
        assert!(matches!(
            manager.enter_broadcast("setup", "password", Ipv4Addr::new(192, 168, 4, 1)),
            Err(KeeperError::NotStarted)
        ));
    }
}
