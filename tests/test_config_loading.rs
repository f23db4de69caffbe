//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use hermes::config::{ConfigError, HermesConfig};
use hermes::types::{AckMode, ClientIdentity, Qos};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[app]
id = "com.example.gateway"

[store]
path = "/var/lib/hermes"

[reconnect]
backoff_pattern = [100, 500]
sustained_delay = 1000

[[clients]]
broker_url = "tcp://localhost:1883"
client_id = "sensor-1"
ack = "manual"
clean_session = true
keep_alive_secs = 30
subscriptions = ["sensors/#", "alerts/+"]
subscription_qos = "exactly_once"

[clients.buffer]
capacity = 100
delete_oldest = true

[[clients]]
broker_url = "ssl://broker.example.com:8883"
client_id = "uplink"
"#,
    );

    let config = HermesConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.app.id, "com.example.gateway");
    assert_eq!(config.store.path, Some(PathBuf::from("/var/lib/hermes")));
    assert_eq!(config.reconnect.backoff_pattern, vec![100, 500]);
    assert_eq!(config.reconnect.sustained_delay, 1000);
    assert_eq!(config.clients.len(), 2);

    let sensor = &config.clients[0];
    assert_eq!(sensor.ack, AckMode::Manual);
    assert!(sensor.clean_session);
    assert_eq!(sensor.subscriptions, vec!["sensors/#", "alerts/+"]);
    assert_eq!(sensor.subscription_qos, Qos::ExactlyOnce);
    assert_eq!(sensor.buffer.capacity, 100);
    assert!(sensor.buffer.delete_oldest);
    assert!(sensor.buffer.enabled);

    let uplink = &config.clients[1];
    assert_eq!(uplink.ack, AckMode::Auto);
    assert!(uplink.auto_reconnect);
}

#[test]
fn test_connect_options_follow_client_section() {
    let temp_file = write_config(
        r#"
[app]
id = "com.example.gateway"

[[clients]]
broker_url = "tcp://localhost:1883"
client_id = "sensor-1"
auto_reconnect = false
keep_alive_secs = 15
connection_timeout_secs = 5
"#,
    );

    let config = HermesConfig::load_from_file(temp_file.path()).unwrap();
    let options = config.clients[0].connect_options().unwrap();

    assert!(!options.automatic_reconnect);
    assert_eq!(options.keep_alive, Duration::from_secs(15));
    assert_eq!(options.connection_timeout, Duration::from_secs(5));
    assert!(options.credentials.is_none());
}

#[test]
fn test_credentials_read_from_environment() {
    std::env::set_var("HERMES_IT_USER", "gateway");
    std::env::set_var("HERMES_IT_PASS", "s3cret");
    let temp_file = write_config(
        r#"
[app]
id = "com.example.gateway"

[[clients]]
broker_url = "tcp://localhost:1883"
client_id = "sensor-1"
username_env = "HERMES_IT_USER"
password_env = "HERMES_IT_PASS"
"#,
    );

    let config = HermesConfig::load_from_file(temp_file.path()).unwrap();
    let credentials = config.clients[0].connect_options().unwrap().credentials.unwrap();

    assert_eq!(credentials.username, "gateway");
    assert_eq!(credentials.password, "s3cret");
}

#[test]
fn test_config_identities_in_file_order() {
    let temp_file = write_config(
        r#"
[app]
id = "com.example.gateway"

[[clients]]
broker_url = "tcp://b:1883"
client_id = "second"

[[clients]]
broker_url = "tcp://a:1883"
client_id = "first"
"#,
    );

    let config = HermesConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(
        config.identities(),
        vec![
            ClientIdentity::new("tcp://b:1883", "second", "com.example.gateway"),
            ClientIdentity::new("tcp://a:1883", "first", "com.example.gateway"),
        ]
    );
}

#[test]
fn test_config_fails_when_file_does_not_exist() {
    let result = HermesConfig::load_from_file(std::path::Path::new("/nonexistent/hermes.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_fails_with_malformed_toml() {
    let temp_file = write_config("[app\nid = ");
    let result = HermesConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_fails_without_app_section() {
    let temp_file = write_config(
        r#"
[[clients]]
broker_url = "tcp://localhost:1883"
client_id = "orphan"
"#,
    );
    let result = HermesConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_unknown_ack_mode() {
    let temp_file = write_config(
        r#"
[app]
id = "com.example.gateway"

[[clients]]
broker_url = "tcp://localhost:1883"
client_id = "sensor-1"
ack = "sometimes"
"#,
    );
    let result = HermesConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_unsupported_scheme() {
    let temp_file = write_config(
        r#"
[app]
id = "com.example.gateway"

[[clients]]
broker_url = "ws://localhost:9001"
client_id = "sensor-1"
"#,
    );
    let result = HermesConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_empty_client_id() {
    let temp_file = write_config(
        r#"
[app]
id = "com.example.gateway"

[[clients]]
broker_url = "tcp://localhost:1883"
client_id = "  "
"#,
    );
    let result = HermesConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_keep_alive_below_broker_minimum() {
    for secs in [1, 4] {
        let temp_file = write_config(&format!(
            r#"
[app]
id = "com.example.gateway"

[[clients]]
broker_url = "tcp://localhost:1883"
client_id = "sensor-1"
keep_alive_secs = {secs}
"#
        ));
        let result = HermesConfig::load_from_file(temp_file.path());
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(ref msg)) if msg.contains("keep_alive_secs")),
            "keep_alive_secs = {secs} accepted"
        );
    }
}

#[test]
fn test_config_accepts_disabled_and_minimum_keep_alive() {
    for secs in [0u64, 5] {
        let temp_file = write_config(&format!(
            "[app]\nid = \"com.example.gateway\"\n\n[[clients]]\nbroker_url = \"tcp://localhost:1883\"\nclient_id = \"sensor-1\"\nkeep_alive_secs = {secs}\n"
        ));
        let config = HermesConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.clients[0].keep_alive_secs, secs);
    }
}

#[test]
fn test_config_without_clients_is_valid() {
    let temp_file = write_config("[app]\nid = \"idle-app\"\n");
    let config = HermesConfig::load_from_file(temp_file.path()).unwrap();
    assert!(config.clients.is_empty());
    assert!(config.identities().is_empty());
}
