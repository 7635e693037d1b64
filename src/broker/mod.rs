//! Broker session layer
//!
//! [`BrokerClient`] is the raw publish/subscribe capability (an MQTT client
//! library behind an adapter). [`BrokerSession`] is the policy the manager
//! talks to, with two variants chosen once when the manager is built:
//!
//! - [`PlainSession`]: unencrypted transport
//! - [`PinnedSession`]: encrypted transport whose broker must present the
//!   expected certificate fingerprint before the session counts as connected

use crate::broker_span;
use crate::config::{LastWill, NetworkDescriptor};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod rumqtt;

pub use rumqtt::{RumqttClient, RumqttSettings};

/// Host configured when the descriptor has no broker, so the client never
/// points at a stale broker. 192.0.2.0/24 is reserved for documentation.
pub const SENTINEL_BROKER_HOST: &str = "192.0.2.0";

/// Highest QoS level the protocol defines
pub const MAX_QOS: u8 = 2;

/// Clamp a QoS level into the protocol's 0..=2 range
pub fn clamp_qos(qos: u8) -> u8 {
    qos.min(MAX_QOS)
}

/// Transport the client should use for the configured endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Encrypted,
}

/// Broker login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// One of the four connect shapes, chosen from the descriptor's presence flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    CredentialsAndWill {
        client_id: String,
        credentials: Credentials,
        will: LastWill,
    },
    WillOnly {
        client_id: String,
        will: LastWill,
    },
    CredentialsOnly {
        client_id: String,
        credentials: Credentials,
    },
    Anonymous {
        client_id: String,
    },
}

impl Handshake {
    /// Pick the richest shape the descriptor supports
    ///
    /// Credentials count only with a non-empty username; the will only with
    /// both topic and message. Will QoS is clamped to 2.
    pub fn for_descriptor(client_id: &str, descriptor: &NetworkDescriptor) -> Self {
        let client_id = client_id.to_string();
        let credentials = descriptor.username().map(|username| Credentials {
            username: username.to_string(),
            password: descriptor.password().map(str::to_string),
        });
        let will = descriptor.will().map(|w| {
            let mut will = w.clone();
            will.qos = clamp_qos(will.qos);
            will
        });

        match (credentials, will) {
            (Some(credentials), Some(will)) => Handshake::CredentialsAndWill {
                client_id,
                credentials,
                will,
            },
            (None, Some(will)) => Handshake::WillOnly { client_id, will },
            (Some(credentials), None) => Handshake::CredentialsOnly {
                client_id,
                credentials,
            },
            (None, None) => Handshake::Anonymous { client_id },
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            Handshake::CredentialsAndWill { client_id, .. }
            | Handshake::WillOnly { client_id, .. }
            | Handshake::CredentialsOnly { client_id, .. }
            | Handshake::Anonymous { client_id } => client_id,
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            Handshake::CredentialsAndWill { credentials, .. }
            | Handshake::CredentialsOnly { credentials, .. } => Some(credentials),
            _ => None,
        }
    }

    pub fn will(&self) -> Option<&LastWill> {
        match self {
            Handshake::CredentialsAndWill { will, .. } | Handshake::WillOnly { will, .. } => {
                Some(will)
            }
            _ => None,
        }
    }

    /// Short name for logs
    pub fn shape(&self) -> &'static str {
        match self {
            Handshake::CredentialsAndWill { .. } => "credentials+will",
            Handshake::WillOnly { .. } => "will",
            Handshake::CredentialsOnly { .. } => "credentials",
            Handshake::Anonymous { .. } => "anonymous",
        }
    }
}

/// Raw publish/subscribe capability
///
/// Implementations must bound every call: `connect` by a handshake timeout,
/// `pump` by an event budget.
pub trait BrokerClient {
    /// Point the client at a broker; takes effect on the next `connect`
    fn configure(&mut self, host: &str, port: u16, transport: TransportKind);

    /// Perform one handshake, returning whether the broker accepted it
    fn connect(&mut self, handshake: &Handshake) -> bool;

    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool;

    fn subscribe(&mut self, topic: &str, qos: u8) -> bool;

    fn unsubscribe(&mut self, topic: &str) -> bool;

    /// Process pending network traffic, delivering inbound messages
    fn pump(&mut self, on_message: &mut dyn FnMut(&str, &[u8]));

    fn disconnect(&mut self);

    /// Compare the connected broker's certificate fingerprint with `expected`
    fn verify_fingerprint(&self, host: &str, expected: &str) -> bool;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Broker session is not connected")]
    NotConnected,
    #[error("Broker at {host}:{port} rejected the {shape} handshake")]
    HandshakeRejected {
        host: String,
        port: u16,
        shape: &'static str,
    },
    #[error("Broker at {host} presented an unexpected certificate fingerprint")]
    FingerprintMismatch { host: String },
    #[error("Publish to {0} failed")]
    PublishFailed(String),
    #[error("Subscribe to {0} failed")]
    SubscribeFailed(String),
    #[error("Unsubscribe from {0} failed")]
    UnsubscribeFailed(String),
}

/// Session policy the manager drives
pub trait BrokerSession {
    /// Set the broker endpoint; the variant supplies the transport kind
    fn configure(&mut self, host: &str, port: u16);

    fn connect(&mut self, handshake: &Handshake) -> Result<(), SessionError>;

    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), SessionError>;

    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), SessionError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), SessionError>;

    fn pump(&mut self, on_message: &mut dyn FnMut(&str, &[u8]));

    fn disconnect(&mut self);

    fn transport(&self) -> TransportKind;
}

/// Unencrypted session
pub struct PlainSession<C: BrokerClient> {
    client: C,
    transport: TransportKind,
    host: String,
    port: u16,
}

impl<C: BrokerClient> PlainSession<C> {
    pub fn new(client: C) -> Self {
        Self::with_transport(client, TransportKind::Plain)
    }

    fn with_transport(client: C, transport: TransportKind) -> Self {
        Self {
            client,
            transport,
            host: SENTINEL_BROKER_HOST.to_string(),
            port: crate::config::DEFAULT_BROKER_PORT,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn endpoint(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl<C: BrokerClient> BrokerSession for PlainSession<C> {
    fn configure(&mut self, host: &str, port: u16) {
        debug!(host, port, transport = ?self.transport, "Configuring broker endpoint");
        self.host = host.to_string();
        self.port = port;
        self.client.configure(host, port, self.transport);
    }

    fn connect(&mut self, handshake: &Handshake) -> Result<(), SessionError> {
        let span = broker_span!(
            host = %self.host,
            port = self.port,
            shape = handshake.shape()
        );
        let _enter = span.enter();

        if self.client.connect(handshake) {
            info!(client_id = handshake.client_id(), "Broker handshake accepted");
            Ok(())
        } else {
            warn!("Broker handshake failed");
            Err(SessionError::HandshakeRejected {
                host: self.host.clone(),
                port: self.port,
                shape: handshake.shape(),
            })
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if self.client.publish(topic, payload, retain) {
            Ok(())
        } else {
            Err(SessionError::PublishFailed(topic.to_string()))
        }
    }

    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if self.client.subscribe(topic, clamp_qos(qos)) {
            debug!(topic, "Subscribed");
            Ok(())
        } else {
            Err(SessionError::SubscribeFailed(topic.to_string()))
        }
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if self.client.unsubscribe(topic) {
            debug!(topic, "Unsubscribed");
            Ok(())
        } else {
            Err(SessionError::UnsubscribeFailed(topic.to_string()))
        }
    }

    fn pump(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        self.client.pump(on_message);
    }

    fn disconnect(&mut self) {
        self.client.disconnect();
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }
}

/// Encrypted session with certificate fingerprint pinning
///
/// A handshake only counts once the fingerprint matches; until then
/// [`BrokerSession::is_connected`] reports false even if the client is up.
pub struct PinnedSession<C: BrokerClient> {
    inner: PlainSession<C>,
    fingerprint: String,
    verified: bool,
}

impl<C: BrokerClient> PinnedSession<C> {
    pub fn new(client: C, fingerprint: impl Into<String>) -> Self {
        Self {
            inner: PlainSession::with_transport(client, TransportKind::Encrypted),
            fingerprint: fingerprint.into(),
            verified: false,
        }
    }

    pub fn client(&self) -> &C {
        self.inner.client()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl<C: BrokerClient> BrokerSession for PinnedSession<C> {
    fn configure(&mut self, host: &str, port: u16) {
        self.verified = false;
        self.inner.configure(host, port);
    }

    fn connect(&mut self, handshake: &Handshake) -> Result<(), SessionError> {
        self.verified = false;
        self.inner.connect(handshake)?;

        let (host, _) = self.inner.endpoint();
        if self.inner.client.verify_fingerprint(host, &self.fingerprint) {
            debug!(host, "Broker fingerprint verified");
            self.verified = true;
            Ok(())
        } else {
            let host = host.to_string();
            warn!(host = %host, "Broker fingerprint mismatch, dropping session");
            self.inner.client.disconnect();
            Err(SessionError::FingerprintMismatch { host })
        }
    }

    fn is_connected(&self) -> bool {
        self.verified && self.inner.is_connected()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), SessionError> {
        if !self.verified {
            return Err(SessionError::NotConnected);
        }
        self.inner.publish(topic, payload, retain)
    }

    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), SessionError> {
        if !self.verified {
            return Err(SessionError::NotConnected);
        }
        self.inner.subscribe(topic, qos)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        if !self.verified {
            return Err(SessionError::NotConnected);
        }
        self.inner.unsubscribe(topic)
    }

    fn pump(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        if self.verified {
            self.inner.pump(on_message);
        }
    }

    fn disconnect(&mut self) {
        self.verified = false;
        self.inner.disconnect();
    }

    fn transport(&self) -> TransportKind {
        self.inner.transport()
    }
}
