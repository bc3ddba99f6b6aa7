//! Broker configuration, loaded from a YAML file and mirroring the
//! `amqp.*` / `web.*` namespaces a deployment's config management expects.

use std::fmt;
use std::path::Path;

use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpExchangeConfig {
    pub broadcast: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpConfig {
    pub endpoint: String,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub exchange: AmqpExchangeConfig,
    #[serde(default)]
    pub send_status_messages: bool,
}

fn default_ping_interval() -> u64 {
    20
}

fn default_conn_shed_rate() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Base64-encoded in the config file, decoded into raw bytes on load.
    pub mac_secret: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    pub admin_auth: String,
    #[serde(default = "default_conn_shed_rate")]
    pub conn_shed_rate: u32,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub amqp: AmqpConfig,
    pub web: WebConfig,
}

#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    Parse(serde_yaml::Error),
    BadMacSecret(base64::DecodeError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(err) => write!(f, "failed to read config file: {err}"),
            ConfigError::Parse(err) => write!(f, "failed to parse config file: {err}"),
            ConfigError::BadMacSecret(err) => write!(f, "web.mac_secret is not valid base64: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        let config: Config = serde_yaml::from_str(&raw).map_err(ConfigError::Parse)?;
        Ok(config)
    }

    /// Decodes `web.mac_secret` from base64, matching the upstream service's
    /// `config.Base64` field parser.
    pub fn mac_secret_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.web.mac_secret)
            .map_err(ConfigError::BadMacSecret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
amqp:
  endpoint: "127.0.0.1:5672"
  vhost: "/"
  username: "guest"
  password: "guest"
  exchange:
    broadcast: "broadcast.fanout"
    status: "broadcast.status"
  send_status_messages: true
web:
  mac_secret: "c2VjcmV0"
  admin_auth: "hunter2"
  ping_interval: 20
  conn_shed_rate: 5
"#;

    #[test]
    fn parses_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.amqp.exchange.broadcast, "broadcast.fanout");
        assert_eq!(config.web.ping_interval, 20);
        assert_eq!(config.web.conn_shed_rate, 5);
        assert_eq!(config.mac_secret_bytes().unwrap(), b"secret");
    }

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let minimal = r#"
amqp:
  endpoint: "127.0.0.1:5672"
  vhost: "/"
  username: "guest"
  password: "guest"
  exchange:
    broadcast: "broadcast.fanout"
    status: "broadcast.status"
web:
  mac_secret: "c2VjcmV0"
  admin_auth: "hunter2"
"#;
        let config: Config = serde_yaml::from_str(minimal).unwrap();
        assert_eq!(config.web.ping_interval, 20);
        assert_eq!(config.web.conn_shed_rate, 1);
        assert_eq!(config.web.bind, "0.0.0.0:8080");
        assert!(!config.amqp.send_status_messages);
    }

    #[test]
    fn rejects_malformed_mac_secret() {
        let config = Config {
            amqp: AmqpConfig {
                endpoint: "x".into(),
                vhost: "/".into(),
                username: "g".into(),
                password: "g".into(),
                exchange: AmqpExchangeConfig {
                    broadcast: "b".into(),
                    status: "s".into(),
                },
                send_status_messages: false,
            },
            web: WebConfig {
                mac_secret: "not base64!!".into(),
                ping_interval: 20,
                admin_auth: "a".into(),
                conn_shed_rate: 1,
                bind: default_bind(),
            },
        };
        assert!(config.mac_secret_bytes().is_err());
    }
}
