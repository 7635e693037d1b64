//! JSON network record in the layout device firmware writes
//!
//! Firmware stores every value as a JSON string and reads numbers back with
//! C `atoi` semantics, so `"mqttPORT": "1883"` and `"willRetain": "1"` are
//! the normal shape. Numbers, booleans and `null` are accepted as well.

use super::{LastWill, NetworkDescriptor};
use serde::{Deserialize, Serialize};

/// Key that marks a JSON record as firmware-shaped
pub(super) const MARKER_KEY: &str = "ssid";

/// A single loosely-typed record value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub(super) enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Text(s) => s,
            Scalar::Integer(n) => n.to_string(),
            Scalar::Float(n) => n.to_string(),
            Scalar::Flag(b) => b.to_string(),
        }
    }

    fn to_integer(&self) -> i64 {
        match self {
            Scalar::Text(s) => leading_integer(s),
            Scalar::Integer(n) => *n,
            Scalar::Float(n) => *n as i64,
            Scalar::Flag(b) => i64::from(*b),
        }
    }

    fn to_flag(&self) -> bool {
        match self {
            Scalar::Text(s) if s.trim().eq_ignore_ascii_case("true") => true,
            Scalar::Flag(b) => *b,
            other => other.to_integer() != 0,
        }
    }
}

/// Integer prefix of `text`, 0 when there is none
pub(super) fn leading_integer(text: &str) -> i64 {
    let text = text.trim_start();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| {
            acc.saturating_mul(10).saturating_add(i64::from(d - b'0'))
        });
    if negative {
        -value
    } else {
        value
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(super) struct FirmwareRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    ssid: Option<Scalar>,
    #[serde(rename = "networkPass", skip_serializing_if = "Option::is_none")]
    network_pass: Option<Scalar>,
    #[serde(rename = "mqttIP", skip_serializing_if = "Option::is_none")]
    mqtt_ip: Option<Scalar>,
    #[serde(rename = "mqttPORT", skip_serializing_if = "Option::is_none")]
    mqtt_port: Option<Scalar>,
    #[serde(rename = "mqttUSER", skip_serializing_if = "Option::is_none")]
    mqtt_user: Option<Scalar>,
    #[serde(rename = "mqttPASS", skip_serializing_if = "Option::is_none")]
    mqtt_pass: Option<Scalar>,
    #[serde(rename = "willTopic", skip_serializing_if = "Option::is_none")]
    will_topic: Option<Scalar>,
    #[serde(rename = "willMessage", skip_serializing_if = "Option::is_none")]
    will_message: Option<Scalar>,
    #[serde(rename = "willQoS", skip_serializing_if = "Option::is_none")]
    will_qos: Option<Scalar>,
    #[serde(rename = "willRetain", skip_serializing_if = "Option::is_none")]
    will_retain: Option<Scalar>,
}

fn text(value: Option<Scalar>) -> String {
    value.map(Scalar::into_text).unwrap_or_default()
}

fn optional_text(value: Option<Scalar>) -> Option<String> {
    Some(text(value)).filter(|s| !s.is_empty())
}

fn quoted(value: impl ToString) -> Option<Scalar> {
    Some(Scalar::Text(value.to_string()))
}

impl From<FirmwareRecord> for NetworkDescriptor {
    fn from(record: FirmwareRecord) -> Self {
        let port = record.mqtt_port.as_ref().map_or(0, Scalar::to_integer);
        let qos = record.will_qos.as_ref().map_or(0, Scalar::to_integer);
        let will = LastWill {
            topic: text(record.will_topic),
            message: text(record.will_message),
            qos: qos.clamp(0, i64::from(u8::MAX)) as u8,
            retain: record.will_retain.as_ref().is_some_and(Scalar::to_flag),
        };
        NetworkDescriptor {
            network_name: text(record.ssid),
            network_secret: optional_text(record.network_pass),
            broker_host: text(record.mqtt_ip),
            broker_port: u16::try_from(port).unwrap_or(0),
            broker_username: optional_text(record.mqtt_user),
            broker_secret: optional_text(record.mqtt_pass),
            last_will: Some(will).filter(LastWill::is_set),
        }
        .normalized()
    }
}

impl From<&NetworkDescriptor> for FirmwareRecord {
    fn from(descriptor: &NetworkDescriptor) -> Self {
        let will = descriptor.last_will.clone().unwrap_or_else(|| LastWill::new("", ""));
        FirmwareRecord {
            ssid: quoted(&descriptor.network_name),
            network_pass: quoted(descriptor.secret().unwrap_or_default()),
            mqtt_ip: quoted(&descriptor.broker_host),
            mqtt_port: quoted(descriptor.broker_port),
            mqtt_user: quoted(descriptor.username().unwrap_or_default()),
            mqtt_pass: quoted(descriptor.password().unwrap_or_default()),
            will_topic: quoted(&will.topic),
            will_message: quoted(&will.message),
            will_qos: quoted(will.qos),
            will_retain: quoted(u8::from(will.retain)),
        }
    }
}
