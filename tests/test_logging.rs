//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that turn LOG_LEVEL,
//! LOG_FORMAT and LOG_SPANS values into subscriber settings.

use stationkeeper::observability::logging::{
    init_logging, parse_level, parse_spans_flag, LogFormat,
};
use tracing::Level;

#[test]
fn test_log_format_parse_json() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Json"), LogFormat::Json);
}

#[test]
fn test_log_format_parse_pretty_and_compact() {
    assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Unknown formats fall back to JSON for unattended devices
    assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
    assert_eq!(LogFormat::parse(""), LogFormat::Json);
    assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    assert_eq!(LogFormat::parse(" compact "), LogFormat::Json);
}

#[test]
fn test_parse_level() {
    let cases = [
        ("ERROR", Level::ERROR),
        ("warn", Level::WARN),
        ("Info", Level::INFO),
        ("debug", Level::DEBUG),
        ("TRACE", Level::TRACE),
        ("verbose", Level::INFO),
        ("", Level::INFO),
    ];

    for (input, expected) in cases {
        assert_eq!(parse_level(input), expected, "Failed for input: {input}");
    }
}

#[test]
fn test_log_spans_parsing() {
    let cases = [
        ("true", true),
        ("TRUE", true),
        ("True", true),
        ("false", false),
        ("", false),
        ("yes", false),
        ("1", false),
    ];

    for (input, expected) in cases {
        assert_eq!(parse_spans_flag(input), expected, "Failed for input: {input}");
    }
}

#[test]
fn test_init_logging_twice_is_harmless() {
    init_logging(Level::DEBUG, LogFormat::Compact, false);
    init_logging(Level::TRACE, LogFormat::Json, true);

    tracing::info!("still logging after a second init");
}
