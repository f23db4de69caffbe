//! Configuration for the `hermes` binary
//!
//! A TOML file names the host application, where the message store lives,
//! the reconnect backoff and one `[[clients]]` entry per broker connection.
//! Credentials are never stored in the file; entries name environment
//! variables that are read when the client is connected.

use crate::transport::mqtt::connection::{parse_broker_uri, MIN_KEEP_ALIVE};
use crate::transport::mqtt::{HealthMonitor, ReconnectConfig};
use crate::types::{AckMode, BufferOptions, ClientIdentity, ConnectOptions, Credentials, Qos};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HermesConfig {
    pub app: AppSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSection {
    /// Host application id (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    /// sled directory; messages are kept in memory only when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Broker URI, e.g. `tcp://localhost:1883` or `ssl://broker:8883`
    pub broker_url: String,
    pub client_id: String,
    #[serde(default)]
    pub ack: AckMode,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Topic filters subscribed after the first connect
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub subscription_qos: Qos,
    #[serde(default)]
    pub buffer: BufferOptions,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connection_timeout_secs() -> u64 {
    30
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid app ID format: {0}")]
    InvalidAppId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HermesConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HermesConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_app_id(&self.app.id)?;
        HealthMonitor::validate_reconnect_config(&self.reconnect)
            .map_err(|e| ConfigError::InvalidConfig(format!("[reconnect] {e}")))?;

        let mut seen = HashSet::new();
        for client in &self.clients {
            client.validate()?;
            if !seen.insert((client.broker_url.as_str(), client.client_id.as_str())) {
                return Err(ConfigError::InvalidConfig(format!(
                    "client '{}' is configured twice for {}",
                    client.client_id, client.broker_url
                )));
            }
        }
        Ok(())
    }

    /// Identities of every configured client, in file order
    pub fn identities(&self) -> Vec<ClientIdentity> {
        self.clients
            .iter()
            .map(|client| client.identity(&self.app.id))
            .collect()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client_id must not be empty".to_string(),
            ));
        }
        parse_broker_uri(&self.broker_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("client '{}': {e}", self.client_id))
        })?;
        if self.username_env.is_some() != self.password_env.is_some() {
            return Err(ConfigError::InvalidConfig(format!(
                "client '{}': username_env and password_env must be set together",
                self.client_id
            )));
        }
        if self.keep_alive_secs != 0 && self.keep_alive_secs < MIN_KEEP_ALIVE.as_secs() {
            return Err(ConfigError::InvalidConfig(format!(
                "client '{}': keep_alive_secs must be 0 or at least {}",
                self.client_id,
                MIN_KEEP_ALIVE.as_secs()
            )));
        }
        if self.subscriptions.iter().any(|t| t.is_empty()) {
            return Err(ConfigError::InvalidConfig(format!(
                "client '{}': empty subscription filter",
                self.client_id
            )));
        }
        Ok(())
    }

    pub fn identity(&self, app_id: &str) -> ClientIdentity {
        ClientIdentity::new(&self.broker_url, &self.client_id, app_id)
    }

    /// Build connect options, reading credentials from the environment
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        Ok(ConnectOptions {
            automatic_reconnect: self.auto_reconnect,
            clean_session: self.clean_session,
            credentials: self.credentials()?,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            buffer: self.buffer,
        })
    }

    fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        match (&self.username_env, &self.password_env) {
            (Some(username_env), Some(password_env)) => Ok(Some(Credentials {
                username: get_env_var_required(username_env)?,
                password: get_env_var_required(password_env)?,
            })),
            _ => Ok(None),
        }
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

fn validate_app_id(app_id: &str) -> Result<(), ConfigError> {
    let valid_chars = app_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if app_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAppId(format!(
            "App ID '{app_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[app]
id = "com.example.gateway"

[[clients]]
broker_url = "tcp://localhost:1883"
client_id = "sensor-1"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = HermesConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.store.path, None);
        assert_eq!(config.reconnect, ReconnectConfig::default());

        let client = &config.clients[0];
        assert_eq!(client.ack, AckMode::Auto);
        assert!(client.auto_reconnect);
        assert!(!client.clean_session);
        assert_eq!(client.keep_alive_secs, 60);
        assert_eq!(client.buffer, BufferOptions::default());
        assert_eq!(client.subscription_qos, Qos::AtLeastOnce);
    }

    #[test]
    fn test_identity_uses_app_id() {
        let config = HermesConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(
            config.identities(),
            vec![ClientIdentity::new(
                "tcp://localhost:1883",
                "sensor-1",
                "com.example.gateway"
            )]
        );
    }

    #[test]
    fn test_invalid_app_id() {
        let toml = MINIMAL.replace("com.example.gateway", "bad id!");
        assert!(matches!(
            HermesConfig::from_toml_str(&toml),
            Err(ConfigError::InvalidAppId(_))
        ));
    }

    #[test]
    fn test_invalid_broker_url() {
        let toml = MINIMAL.replace("tcp://localhost:1883", "http://localhost");
        assert!(matches!(
            HermesConfig::from_toml_str(&toml),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_duplicate_clients_rejected() {
        let toml = format!(
            "{MINIMAL}\n[[clients]]\nbroker_url = \"tcp://localhost:1883\"\nclient_id = \"sensor-1\"\n"
        );
        assert!(matches!(
            HermesConfig::from_toml_str(&toml),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_half_configured_credentials_rejected() {
        let toml = format!("{MINIMAL}username_env = \"ONLY_USER\"\n");
        assert!(matches!(
            HermesConfig::from_toml_str(&toml),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_credential_env_var() {
        let toml = format!(
            "{MINIMAL}username_env = \"HERMES_TEST_MISSING_USER\"\npassword_env = \"HERMES_TEST_MISSING_PASS\"\n"
        );
        let config = HermesConfig::from_toml_str(&toml).unwrap();
        assert!(matches!(
            config.clients[0].connect_options(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "HERMES_TEST_MISSING_USER"
        ));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let toml = format!("{MINIMAL}\n[reconnect]\nmax_attempts = 0\n");
        assert!(HermesConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = HermesConfig::from_toml_str(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(HermesConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
