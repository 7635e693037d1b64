//! [`BrokerClient`] over `rumqttc` (MQTT v5)
//!
//! rumqttc is async; the adapter owns a current-thread tokio runtime and
//! blocks on it for each call, with a timeout on every wait so the manager's
//! `poll` stays bounded.
//!
//! The encrypted transport trusts the broker by certificate fingerprint, not
//! by CA chain. The TLS verifier keeps the end-entity certificate of the last
//! handshake so [`BrokerClient::verify_fingerprint`] can hash it.

use super::{clamp_qos, BrokerClient, Handshake, TransportKind};
use ring::digest;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// DER of the broker certificate seen in the most recent TLS handshake
type CertificateSlot = Arc<Mutex<Option<Vec<u8>>>>;

/// Timing and sizing for the adapter
#[derive(Debug, Clone)]
pub struct RumqttSettings {
    /// Upper bound on a single handshake
    pub handshake_timeout: Duration,
    /// How long one pump step waits for the next event
    pub pump_wait: Duration,
    /// Events processed per pump before returning
    pub max_events_per_pump: usize,
    pub keep_alive: Duration,
    /// Request channel capacity between client and event loop
    pub channel_capacity: usize,
    /// When set, TLS handshakes with any other certificate are aborted
    /// before credentials are sent
    pub pinned_fingerprint: Option<String>,
}

impl Default for RumqttSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(3),
            pump_wait: Duration::from_millis(5),
            max_events_per_pump: 32,
            keep_alive: Duration::from_secs(60),
            channel_capacity: 64,
            pinned_fingerprint: None,
        }
    }
}

/// Map a numeric QoS level to rumqttc's enum, clamping above 2
pub fn qos(level: u8) -> QoS {
    match clamp_qos(level) {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).and_then(|d| u8::try_from(d).ok())
}

/// Decode a hex fingerprint, ignoring `:`, `-` and whitespace separators
pub fn parse_fingerprint(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !matches!(b, b':' | b'-') && !b.is_ascii_whitespace())
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| Some((hex_value(pair[0])? << 4) | hex_value(pair[1])?))
        .collect()
}

/// Whether `certificate` hashes to `expected`
///
/// A 20-byte fingerprint is compared against the SHA-1 digest, a 32-byte
/// one against SHA-256. Anything else never matches.
pub fn fingerprint_matches(certificate: &[u8], expected: &str) -> bool {
    let Some(expected) = parse_fingerprint(expected) else {
        return false;
    };
    let algorithm = match expected.len() {
        20 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
        32 => &digest::SHA256,
        _ => return false,
    };
    digest::digest(algorithm, certificate).as_ref() == expected.as_slice()
}

/// Accepts the broker certificate on fingerprint alone and records it
#[derive(Debug)]
struct PinningVerifier {
    seen: CertificateSlot,
    pinned: Option<String>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinningVerifier {
    fn new(seen: CertificateSlot, pinned: Option<String>) -> Self {
        Self {
            seen,
            pinned,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let der = end_entity.as_ref().to_vec();
        match self.seen.lock() {
            Ok(mut slot) => *slot = Some(der),
            Err(poisoned) => *poisoned.into_inner() = Some(der),
        }
        match &self.pinned {
            Some(expected) if !fingerprint_matches(end_entity.as_ref(), expected) => {
                warn!(server = ?server_name, "Broker certificate does not match pinned fingerprint");
                Err(rustls::Error::General(
                    "certificate fingerprint mismatch".to_string(),
                ))
            }
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// rustls client configuration that pins by fingerprint and fills `seen`
pub fn pinning_tls_config(
    seen: Arc<Mutex<Option<Vec<u8>>>>,
    pinned: Option<String>,
) -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinningVerifier::new(seen, pinned)))
        .with_no_client_auth();
    Arc::new(config)
}

/// Build connect options for one handshake against `host:port`
///
/// `tls` is only used for the encrypted transport.
pub fn mqtt_options(
    host: &str,
    port: u16,
    transport: TransportKind,
    tls: &Arc<ClientConfig>,
    handshake: &Handshake,
    keep_alive: Duration,
) -> MqttOptions {
    let mut options = MqttOptions::new(handshake.client_id(), host, port);
    options.set_keep_alive(keep_alive);

    if transport == TransportKind::Encrypted {
        options.set_transport(RumqttcTransport::tls_with_config(TlsConfiguration::Rustls(
            Arc::clone(tls),
        )));
    }

    if let Some(credentials) = handshake.credentials() {
        let password = credentials.password.clone().unwrap_or_default();
        options.set_credentials(credentials.username.clone(), password);
    }

    if let Some(will) = handshake.will() {
        // MQTT v5 LastWill takes 5 parameters: topic, payload, qos, retain, properties
        let lwt = LastWill::new(
            will.topic.clone(),
            will.message.clone(),
            qos(will.qos),
            will.retain,
            None,
        );
        options.set_last_will(lwt);
    }

    options
}

pub struct RumqttClient {
    runtime: Runtime,
    settings: RumqttSettings,
    host: String,
    port: u16,
    transport: TransportKind,
    tls: Arc<ClientConfig>,
    peer_certificate: CertificateSlot,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
    connected: bool,
}

impl RumqttClient {
    pub fn new(settings: RumqttSettings) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let peer_certificate = CertificateSlot::default();
        let tls = pinning_tls_config(
            Arc::clone(&peer_certificate),
            settings.pinned_fingerprint.clone(),
        );
        Ok(Self {
            runtime,
            settings,
            host: super::SENTINEL_BROKER_HOST.to_string(),
            port: crate::config::DEFAULT_BROKER_PORT,
            transport: TransportKind::Plain,
            tls,
            peer_certificate,
            client: None,
            eventloop: None,
            connected: false,
        })
    }

    pub fn settings(&self) -> &RumqttSettings {
        &self.settings
    }

    fn drop_connection(&mut self) {
        self.client = None;
        self.eventloop = None;
        self.connected = false;
    }

    fn captured_certificate(&self) -> Option<Vec<u8>> {
        match self.peer_certificate.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn clear_captured_certificate(&self) {
        match self.peer_certificate.lock() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> bool {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return ack.code == ConnectReturnCode::Success;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("MQTT connection error during handshake: {}", e);
                return false;
            }
        }
    }
}

impl BrokerClient for RumqttClient {
    fn configure(&mut self, host: &str, port: u16, transport: TransportKind) {
        self.host = host.to_string();
        self.port = port;
        self.transport = transport;
    }

    fn connect(&mut self, handshake: &Handshake) -> bool {
        self.drop_connection();
        self.clear_captured_certificate();

        let options = mqtt_options(
            &self.host,
            self.port,
            self.transport,
            &self.tls,
            handshake,
            self.settings.keep_alive,
        );
        let (client, mut eventloop) = AsyncClient::new(options, self.settings.channel_capacity);

        let limit = self.settings.handshake_timeout;
        let accepted = self
            .runtime
            .block_on(async { tokio::time::timeout(limit, wait_for_connack(&mut eventloop)).await })
            .unwrap_or_else(|_| {
                debug!(timeout_ms = limit.as_millis() as u64, "MQTT handshake timed out");
                false
            });

        if accepted {
            self.client = Some(client);
            self.eventloop = Some(eventloop);
            self.connected = true;
        }
        accepted
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        match self.client.as_ref() {
            Some(client) if self.connected => client
                .try_publish(topic.to_string(), QoS::AtMostOnce, retain, payload.to_vec())
                .map_err(|e| warn!(topic, "MQTT publish failed: {}", e))
                .is_ok(),
            _ => false,
        }
    }

    fn subscribe(&mut self, topic: &str, level: u8) -> bool {
        match self.client.as_ref() {
            Some(client) if self.connected => client
                .try_subscribe(topic.to_string(), qos(level))
                .map_err(|e| warn!(topic, "MQTT subscribe failed: {}", e))
                .is_ok(),
            _ => false,
        }
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        match self.client.as_ref() {
            Some(client) if self.connected => client
                .try_unsubscribe(topic.to_string())
                .map_err(|e| warn!(topic, "MQTT unsubscribe failed: {}", e))
                .is_ok(),
            _ => false,
        }
    }

    fn pump(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        let Self {
            runtime,
            settings,
            eventloop,
            connected,
            ..
        } = self;

        let eventloop = match eventloop.as_mut() {
            Some(eventloop) if *connected => eventloop,
            _ => return,
        };

        for _ in 0..settings.max_events_per_pump {
            let next = runtime.block_on(tokio::time::timeout(settings.pump_wait, eventloop.poll()));
            match next {
                // Nothing pending
                Err(_) => break,
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let topic = String::from_utf8_lossy(&publish.topic);
                    on_message(&topic, &publish.payload);
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect(_)))) => {
                    warn!("Broker sent disconnect");
                    *connected = false;
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("MQTT connection lost: {}", e);
                    *connected = false;
                    break;
                }
            }
        }
    }

    fn disconnect(&mut self) {
        if let (Some(client), Some(eventloop)) = (self.client.as_ref(), self.eventloop.as_mut()) {
            if client.try_disconnect().is_ok() {
                // One poll flushes the disconnect packet
                let _ = self
                    .runtime
                    .block_on(tokio::time::timeout(self.settings.pump_wait, eventloop.poll()));
            }
        }
        self.drop_connection();
    }

    fn verify_fingerprint(&self, host: &str, expected: &str) -> bool {
        let Some(certificate) = self.captured_certificate() else {
            warn!(host, "No broker certificate from the last handshake, treating as mismatch");
            return false;
        };
        let matches = fingerprint_matches(&certificate, expected);
        if !matches {
            warn!(host, "Broker certificate fingerprint mismatch");
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LastWill as WillConfig, NetworkDescriptor};

    #[test]
    fn test_qos_mapping_clamps() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
        assert_eq!(qos(9), QoS::ExactlyOnce);
    }

    #[test]
    fn test_mqtt_options_from_handshake() {
        let descriptor = NetworkDescriptor::with_broker("home", None, "broker.local")
            .with_credentials("dev", "pw")
            .with_last_will(WillConfig::new("devices/a/status", "offline"));
        let handshake = Handshake::for_descriptor("stationkeeper-a:b:c:d:e:f", &descriptor);

        let tls = pinning_tls_config(CertificateSlot::default(), None);
        let options = mqtt_options(
            "broker.local",
            1884,
            TransportKind::Plain,
            &tls,
            &handshake,
            Duration::from_secs(60),
        );

        assert_eq!(options.client_id(), "stationkeeper-a:b:c:d:e:f");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_new_client_starts_disconnected() {
        let mut client = RumqttClient::new(RumqttSettings::default()).unwrap();

        assert!(!client.is_connected());
        assert!(!client.publish("t", b"x", false));
        assert!(!client.subscribe("t", 1));

        let mut delivered = 0;
        client.pump(&mut |_, _| delivered += 1);
        assert_eq!(delivered, 0);
    }

    /// SHA-1 and SHA-256 of the bytes `abc`
    const ABC_SHA1: &str = "A9:99:3E:36:47:06:81:6A:BA:3E:25:71:78:50:C2:6C:9C:D0:D8:9D";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_parse_fingerprint_formats() {
        assert_eq!(parse_fingerprint("AA:bb:0c"), Some(vec![0xaa, 0xbb, 0x0c]));
        assert_eq!(parse_fingerprint("aa-bb 0c"), Some(vec![0xaa, 0xbb, 0x0c]));
        assert_eq!(parse_fingerprint("aab"), None);
        assert_eq!(parse_fingerprint("zz"), None);
        assert_eq!(parse_fingerprint("+f"), None);
        assert_eq!(parse_fingerprint(""), None);
    }

    #[test]
    fn test_fingerprint_digest_comparison() {
        assert!(fingerprint_matches(b"abc", ABC_SHA1));
        assert!(fingerprint_matches(b"abc", ABC_SHA256));
        assert!(fingerprint_matches(b"abc", &ABC_SHA256.to_uppercase()));
        assert!(!fingerprint_matches(b"abd", ABC_SHA256));
        assert!(!fingerprint_matches(b"abc", "AA:BB"), "unknown digest length");
    }

    #[test]
    fn test_verifier_records_certificate_and_enforces_pin() {
        let seen = CertificateSlot::default();
        let name = ServerName::try_from("broker.local").unwrap();
        let certificate = CertificateDer::from(b"abc".to_vec());

        let open = PinningVerifier::new(Arc::clone(&seen), None);
        assert!(open
            .verify_server_cert(&certificate, &[], &name, &[], UnixTime::now())
            .is_ok());
        assert_eq!(seen.lock().unwrap().as_deref(), Some(&b"abc"[..]));

        let pinned = PinningVerifier::new(Arc::clone(&seen), Some(ABC_SHA256.to_string()));
        assert!(pinned
            .verify_server_cert(&certificate, &[], &name, &[], UnixTime::now())
            .is_ok());

        let other = CertificateDer::from(b"abd".to_vec());
        assert!(pinned
            .verify_server_cert(&other, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn test_fingerprint_checked_against_captured_certificate() {
        let client = RumqttClient::new(RumqttSettings::default()).unwrap();
        assert!(
            !client.verify_fingerprint("broker.local", ABC_SHA256),
            "nothing captured before a handshake"
        );

        *client.peer_certificate.lock().unwrap() = Some(b"abc".to_vec());

        assert!(client.verify_fingerprint("broker.local", ABC_SHA256));
        assert!(client.verify_fingerprint("broker.local", ABC_SHA1));
        assert!(!client.verify_fingerprint(
            "broker.local",
            "00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00"
        ));
    }

    #[test]
    fn test_connect_to_closed_port_fails_within_timeout() {
        let settings = RumqttSettings {
            handshake_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let mut client = RumqttClient::new(settings).unwrap();
        client.configure("127.0.0.1", 1, TransportKind::Plain);

        let started = std::time::Instant::now();
        let accepted = client.connect(&Handshake::Anonymous {
            client_id: "test".to_string(),
        });

        assert!(!accepted);
        assert!(!client.is_connected());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
