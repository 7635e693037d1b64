//! Mock implementations for testing
//!
//! Provides mock Link, BrokerClient, Clock, UpdateHooks and ConfigStore
//! implementations. Each mock is a cheap handle over shared state: keep one
//! clone in the test and hand another to the manager, then inspect what the
//! manager did.

use crate::broker::{BrokerClient, Handshake, TransportKind};
use crate::clock::Clock;
use crate::config::{ConfigError, ConfigStore, NetworkDescriptor};
use crate::hooks::UpdateHooks;
use crate::link::{Link, LinkState};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type JoinRequest = (String, Option<String>);
pub type PublishedMessage = (String, Vec<u8>, bool);

#[derive(Debug)]
struct LinkMockState {
    state: LinkState,
    join_connects: bool,
    drop_on_disconnect: bool,
    joins: Vec<JoinRequest>,
    calls: Vec<&'static str>,
    access_point: Option<(String, String, Ipv4Addr)>,
    scan_results: Vec<String>,
    hardware_address: [u8; 6],
}

/// Mock link; joins succeed instantly only when `join_connects` is set
#[derive(Debug, Clone)]
pub struct MockLink {
    inner: Rc<RefCell<LinkMockState>>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(LinkMockState {
                state: LinkState::Disconnected,
                join_connects: false,
                drop_on_disconnect: true,
                joins: Vec::new(),
                calls: Vec::new(),
                access_point: None,
                scan_results: Vec::new(),
                hardware_address: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            })),
        }
    }

    /// Link that comes up as soon as a join is requested
    pub fn connecting() -> Self {
        let link = Self::new();
        link.set_join_connects(true);
        link
    }

    pub fn set_state(&self, state: LinkState) {
        self.inner.borrow_mut().state = state;
    }

    pub fn set_join_connects(&self, connects: bool) {
        self.inner.borrow_mut().join_connects = connects;
    }

    pub fn set_drop_on_disconnect(&self, drops: bool) {
        self.inner.borrow_mut().drop_on_disconnect = drops;
    }

    pub fn set_scan_results(&self, names: Vec<String>) {
        self.inner.borrow_mut().scan_results = names;
    }

    pub fn set_hardware_address(&self, mac: [u8; 6]) {
        self.inner.borrow_mut().hardware_address = mac;
    }

    pub fn joins(&self) -> Vec<JoinRequest> {
        self.inner.borrow().joins.clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.borrow().calls.clone()
    }

    pub fn access_point(&self) -> Option<(String, String, Ipv4Addr)> {
        self.inner.borrow().access_point.clone()
    }

    pub fn clear_history(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.joins.clear();
        inner.calls.clear();
    }
}

impl Link for MockLink {
    fn connect(&mut self, network_name: &str, secret: Option<&str>) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push("connect");
        inner
            .joins
            .push((network_name.to_string(), secret.map(str::to_string)));
        inner.state = if inner.join_connects {
            LinkState::Connected
        } else {
            LinkState::Connecting
        };
        true
    }

    fn disconnect(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push("disconnect");
        if inner.drop_on_disconnect {
            inner.state = LinkState::Disconnected;
        }
    }

    fn status(&self) -> LinkState {
        self.inner.borrow().state
    }

    fn start_access_point(&mut self, ssid: &str, password: &str, address: Ipv4Addr) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push("start_access_point");
        inner.access_point = Some((ssid.to_string(), password.to_string(), address));
        true
    }

    fn stop_access_point(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push("stop_access_point");
        inner.access_point = None;
    }

    fn scan(&mut self) -> Vec<String> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push("scan");
        inner.scan_results.clone()
    }

    fn hardware_address(&self) -> [u8; 6] {
        self.inner.borrow().hardware_address
    }
}

#[derive(Debug)]
struct BrokerMockState {
    endpoint: Option<(String, u16, TransportKind)>,
    connected: bool,
    accept_handshakes: bool,
    fingerprint_matches: bool,
    subscribe_succeeds: bool,
    handshakes: Vec<Handshake>,
    subscribes: Vec<(String, u8)>,
    unsubscribes: Vec<String>,
    published: Vec<PublishedMessage>,
    inbound: VecDeque<(String, Vec<u8>)>,
    pumps: usize,
    disconnects: usize,
}

/// Mock broker client accepting every handshake unless told otherwise
#[derive(Debug, Clone)]
pub struct MockBroker {
    inner: Rc<RefCell<BrokerMockState>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(BrokerMockState {
                endpoint: None,
                connected: false,
                accept_handshakes: true,
                fingerprint_matches: true,
                subscribe_succeeds: true,
                handshakes: Vec::new(),
                subscribes: Vec::new(),
                unsubscribes: Vec::new(),
                published: Vec::new(),
                inbound: VecDeque::new(),
                pumps: 0,
                disconnects: 0,
            })),
        }
    }

    pub fn set_accept_handshakes(&self, accept: bool) {
        self.inner.borrow_mut().accept_handshakes = accept;
    }

    pub fn set_fingerprint_matches(&self, matches: bool) {
        self.inner.borrow_mut().fingerprint_matches = matches;
    }

    pub fn set_subscribe_succeeds(&self, succeeds: bool) {
        self.inner.borrow_mut().subscribe_succeeds = succeeds;
    }

    /// Simulate the broker dropping the session
    pub fn drop_session(&self) {
        self.inner.borrow_mut().connected = false;
    }

    /// Queue an inbound message for the next pump
    pub fn push_message(&self, topic: &str, payload: &[u8]) {
        self.inner
            .borrow_mut()
            .inbound
            .push_back((topic.to_string(), payload.to_vec()));
    }

    pub fn endpoint(&self) -> Option<(String, u16, TransportKind)> {
        self.inner.borrow().endpoint.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.borrow().handshakes.len()
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.inner.borrow().handshakes.clone()
    }

    pub fn subscribes(&self) -> Vec<(String, u8)> {
        self.inner.borrow().subscribes.clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner
            .borrow()
            .subscribes
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn unsubscribes(&self) -> Vec<String> {
        self.inner.borrow().unsubscribes.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.borrow().published.clone()
    }

    pub fn pump_count(&self) -> usize {
        self.inner.borrow().pumps
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.borrow().disconnects
    }

    pub fn clear_history(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.handshakes.clear();
        inner.subscribes.clear();
        inner.unsubscribes.clear();
        inner.published.clear();
    }
}

impl BrokerClient for MockBroker {
    fn configure(&mut self, host: &str, port: u16, transport: TransportKind) {
        self.inner.borrow_mut().endpoint = Some((host.to_string(), port, transport));
    }

    fn connect(&mut self, handshake: &Handshake) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.handshakes.push(handshake.clone());
        inner.connected = inner.accept_handshakes;
        inner.connected
    }

    fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected {
            return false;
        }
        inner
            .published
            .push((topic.to_string(), payload.to_vec(), retain));
        true
    }

    fn subscribe(&mut self, topic: &str, qos: u8) -> bool {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected || !inner.subscribe_succeeds {
            return false;
        }
        inner.subscribes.push((topic.to_string(), qos));
        true
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected {
            return false;
        }
        inner.unsubscribes.push(topic.to_string());
        true
    }

    fn pump(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        let pending: Vec<(String, Vec<u8>)> = {
            let mut inner = self.inner.borrow_mut();
            inner.pumps += 1;
            inner.inbound.drain(..).collect()
        };
        for (topic, payload) in pending {
            on_message(&topic, &payload);
        }
    }

    fn disconnect(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.connected = false;
        inner.disconnects += 1;
    }

    fn verify_fingerprint(&self, _host: &str, _expected: &str) -> bool {
        self.inner.borrow().fingerprint_matches
    }
}

/// Hand-driven clock; `sleep` advances time instantly
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn now(&self) -> Instant {
        self.now.get()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Update hooks that record every call
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    events: Rc<RefCell<Vec<&'static str>>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.borrow().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.borrow().iter().filter(|e| **e == event).count()
    }
}

impl UpdateHooks for RecordingHooks {
    fn start(&mut self) {
        self.events.borrow_mut().push("start");
    }

    fn stop(&mut self) {
        self.events.borrow_mut().push("stop");
    }

    fn poll(&mut self) {
        self.events.borrow_mut().push("poll");
    }
}

/// In-memory config store
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    record: Rc<RefCell<Option<NetworkDescriptor>>>,
    saves: Rc<Cell<usize>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(descriptor: NetworkDescriptor) -> Self {
        let store = Self::default();
        *store.record.borrow_mut() = Some(descriptor);
        store
    }

    pub fn record(&self) -> Option<NetworkDescriptor> {
        self.record.borrow().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.get()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self) -> Result<NetworkDescriptor, ConfigError> {
        self.record
            .borrow()
            .clone()
            .ok_or_else(|| ConfigError::InvalidConfig("no stored network record".to_string()))
    }

    fn save(&mut self, descriptor: &NetworkDescriptor) -> Result<(), ConfigError> {
        *self.record.borrow_mut() = Some(descriptor.clone());
        self.saves.set(self.saves.get() + 1);
        Ok(())
    }
}
