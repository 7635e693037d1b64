//! stationkeeper - connection lifecycle manager for unattended devices
//!
//! Keeps a device joined to a wireless network and connected to an MQTT
//! broker, recovering from either layer dropping and hopping across a list
//! of candidate networks when one stays unreachable.
//!
//! # Overview
//!
//! - [`ConnectionManager`]: the state machine, driven by `poll` from the host loop
//! - [`link`]: the link capability and its teardown policy
//! - [`broker`]: the broker capability with plain and fingerprint-pinned sessions
//! - [`SubscriptionLedger`]: topics replayed after every reconnect
//! - [`config`]: network descriptors, the persisted record and the binary's TOML file
//!
//! # Quick Start
//!
//! ```rust
//! use stationkeeper::testing::{MockBroker, MockLink};
//! use stationkeeper::{ConnectionManager, ConnectionStatus, ManagerConfig, NetworkDescriptor, PlainSession};
//!
//! let link = MockLink::connecting();
//! let broker = MockBroker::new();
//! let mut manager: ConnectionManager = ConnectionManager::new(
//!     Box::new(link),
//!     Box::new(PlainSession::new(broker)),
//!     ManagerConfig::default(),
//! );
//!
//! manager.add_subscription("devices/kitchen/set").unwrap();
//! manager
//!     .begin(NetworkDescriptor::with_broker("home", Some("hunter22"), "broker.local"))
//!     .unwrap();
//!
//! // The startup loop connects within its bounded wait
//! assert_eq!(manager.poll(), ConnectionStatus::FullSession);
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod link;
pub mod manager;
pub mod observability;
pub mod testing;

pub use broker::{
    BrokerClient, BrokerSession, Handshake, PinnedSession, PlainSession, SessionError,
    TransportKind,
};
pub use clock::{Clock, SystemClock};
pub use config::{
    ConfigError, ConfigStore, FileConfigStore, KeeperConfig, LastWill, NetworkDescriptor,
};
pub use error::{KeeperError, KeeperResult};
pub use hooks::UpdateHooks;
pub use ledger::{LedgerError, SubscriptionLedger};
pub use link::{Link, LinkGate, LinkState};
pub use manager::{
    BroadcastInfo, ConnectionManager, ConnectionStatus, ManagerConfig, RetryCounters, RetryPolicy,
};
