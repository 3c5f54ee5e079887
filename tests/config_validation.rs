//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use packet_channel::config::{
    ClientConfig, LoggingConfig, NetworkConfig, ServerConfig, TransportConfig, FRAME_HEADER_SIZE,
};
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_idle_timeout_bounds() {
    let mut config = ServerConfig {
        idle_timeout: Duration::from_millis(10),
        ..ServerConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Idle timeout too short")));

    config.idle_timeout = Duration::ZERO;
    assert!(config.validate().is_empty(), "zero disables the sweep");
}

#[test]
fn test_zero_send_queue_depth() {
    let mut config = NetworkConfig::default();
    config.transport.send_queue_depth = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Send queue depth must be greater than 0")));
}

#[test]
fn test_zero_pending_message_limit() {
    let transport = TransportConfig {
        max_pending_messages: 0,
        ..TransportConfig::default()
    };
    assert!(transport
        .validate()
        .iter()
        .any(|e| e.contains("Max pending messages must be greater than 0")));
}

#[test]
fn test_read_buffer_smaller_than_header() {
    let transport = TransportConfig {
        read_buffer_size: FRAME_HEADER_SIZE - 1,
        ..TransportConfig::default()
    };
    assert!(transport
        .validate()
        .iter()
        .any(|e| e.contains("Read buffer size too small")));
}

#[test]
fn test_client_retry_settings() {
    let client = ClientConfig {
        max_reconnect_attempts: 0,
        reconnect_delay: Duration::from_millis(1),
        ..ClientConfig::default()
    };
    let errors = client.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max reconnect attempts must be greater than 0")));
    assert!(errors.iter().any(|e| e.contains("Reconnect delay too short")));
}

#[test]
fn test_heartbeat_interval_bounds() {
    let mut client = ClientConfig {
        heartbeat_interval: Duration::from_millis(5),
        ..ClientConfig::default()
    };
    assert!(client
        .validate()
        .iter()
        .any(|e| e.contains("Heartbeat interval too short")));

    client.heartbeat_interval = Duration::ZERO;
    assert!(client.validate().is_empty());
}

#[test]
fn test_logging_requires_an_output() {
    let logging = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));

    let missing_path = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(missing_path
        .validate()
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_validate_strict_reports_all_errors() {
    let config = NetworkConfig::default_with_overrides(|cfg| {
        cfg.server.address = String::new();
        cfg.transport.send_queue_depth = 0;
    });
    let err = config.validate_strict().expect_err("invalid config");
    let message = err.to_string();
    assert!(message.contains("Server address cannot be empty"));
    assert!(message.contains("Send queue depth"));
}

#[test]
fn test_toml_roundtrip_through_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("packet-channel.toml");

    let config = NetworkConfig::default_with_overrides(|cfg| {
        cfg.server.max_connections = 42;
        cfg.client.reconnect_delay = Duration::from_millis(750);
        cfg.transport.send_queue_depth = 8;
        cfg.logging.log_level = Level::DEBUG;
    });
    config.save_to_file(&path).expect("save");

    let loaded = NetworkConfig::from_file(&path).expect("load");
    assert_eq!(loaded.server.max_connections, 42);
    assert_eq!(loaded.client.reconnect_delay, Duration::from_millis(750));
    assert_eq!(loaded.transport.send_queue_depth, 8);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).expect("example parses");
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_malformed_toml_is_config_error() {
    let err = NetworkConfig::from_toml("server = 12").expect_err("malformed");
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
fn test_env_overrides() {
    std::env::set_var("PACKET_CHANNEL_MAX_CONNECTIONS", "17");
    std::env::set_var("PACKET_CHANNEL_HEARTBEAT_INTERVAL_MS", "2500");
    let config = NetworkConfig::from_env().expect("env config");
    std::env::remove_var("PACKET_CHANNEL_MAX_CONNECTIONS");
    std::env::remove_var("PACKET_CHANNEL_HEARTBEAT_INTERVAL_MS");

    assert_eq!(config.server.max_connections, 17);
    assert_eq!(config.client.heartbeat_interval, Duration::from_millis(2500));
}
