//! Bridge configuration from plain key/value data.
//!
//! Values come from the add-on options file when it exists; otherwise from an optional
//! `.env` file overlaid by the process environment.

use crate::broker::BrokerOptions;
use crate::error::ConfigError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_OPTIONS_PATH: &str = "/data/options.json";
pub const DEFAULT_ENV_FILE: &str = ".env";
/// Environment variables that relocate the configuration sources.
pub const OPTIONS_PATH_VAR: &str = "BRIDGE_OPTIONS_PATH";
pub const ENV_FILE_VAR: &str = "BRIDGE_ENV_FILE";

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_BITRATE: u32 = 250_000;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Port values that mean "use the default".
const PORT_SENTINELS: [&str; 5] = ["", "None", "null", "Null", "NULL"];

#[derive(Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_password: String,
    /// Topic frames read from the bus are published to.
    pub rx_topic: String,
    /// Topic whose messages are transmitted on the bus.
    pub tx_topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub bitrate: u32,
    pub can_backend: String,
}

/// Where a configuration was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    OptionsFile(PathBuf),
    Environment { env_file: Option<PathBuf> },
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::OptionsFile(p) => write!(f, "options file {}", p.display()),
            ConfigSource::Environment { env_file: Some(p) } => {
                write!(f, "environment with {}", p.display())
            }
            ConfigSource::Environment { env_file: None } => f.write_str("environment"),
        }
    }
}

impl BridgeConfig {
    /// Resolve the configuration sources from the process environment and load.
    pub fn load() -> Result<(Self, ConfigSource), ConfigError> {
        let options_path = std::env::var(OPTIONS_PATH_VAR)
            .unwrap_or_else(|_| DEFAULT_OPTIONS_PATH.to_string());
        let env_file =
            std::env::var(ENV_FILE_VAR).unwrap_or_else(|_| DEFAULT_ENV_FILE.to_string());
        Self::load_from(
            Path::new(&options_path),
            Path::new(&env_file),
            std::env::vars(),
        )
    }

    pub fn load_from(
        options_path: &Path,
        env_file: &Path,
        process_env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        match read_options_file(options_path) {
            Ok(values) => {
                let cfg = Self::from_values(&values)?;
                return Ok((cfg, ConfigSource::OptionsFile(options_path.to_path_buf())));
            }
            Err(e) => debug!(error = %e, "options file unavailable, using environment"),
        }

        let mut values = HashMap::new();
        let env_file = if env_file.is_file() {
            values.extend(read_env_file(env_file)?);
            Some(env_file.to_path_buf())
        } else {
            None
        };
        values.extend(process_env);
        Ok((Self::from_values(&values)?, ConfigSource::Environment { env_file }))
    }

    pub fn from_values(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str, default: &str| {
            values
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let mqtt_port = match values.get("MQTT_PORT").map(|s| s.trim()) {
            None => DEFAULT_PORT,
            Some(s) if PORT_SENTINELS.contains(&s) => DEFAULT_PORT,
            Some(s) => parse_value("MQTT_PORT", s)?,
        };
        let keep_alive_secs: u64 = match values.get("MQTT_KEEPALIVE") {
            None => DEFAULT_KEEP_ALIVE_SECS,
            Some(s) => parse_value("MQTT_KEEPALIVE", s.trim())?,
        };
        if keep_alive_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "MQTT_KEEPALIVE",
                value: "0".to_string(),
            });
        }
        let bitrate = match values.get("CAN_BITRATE") {
            None => DEFAULT_BITRATE,
            Some(s) => parse_value("CAN_BITRATE", s.trim())?,
        };
        let client_id = match values.get("MQTT_CLIENT_ID") {
            Some(id) if !id.is_empty() => id.clone(),
            _ => default_client_id(),
        };

        Ok(Self {
            mqtt_host: get("MQTT_HOST", "localhost"),
            mqtt_port,
            mqtt_user: get("MQTT_USER", "mqtt"),
            mqtt_password: get("MQTT_PASSWORD", "mqtt"),
            rx_topic: get("MQTT_RX_TOPIC", "can/rx"),
            tx_topic: get("MQTT_TX_TOPIC", "can/tx"),
            client_id,
            keep_alive: Duration::from_secs(keep_alive_secs),
            bitrate,
            can_backend: get("CAN_BACKEND", default_backend()).to_ascii_lowercase(),
        })
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_user.clone(),
            password: self.mqtt_password.clone(),
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: DEFAULT_PORT,
            mqtt_user: "mqtt".to_string(),
            mqtt_password: "mqtt".to_string(),
            rx_topic: "can/rx".to_string(),
            tx_topic: "can/tx".to_string(),
            client_id: default_client_id(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            bitrate: DEFAULT_BITRATE,
            can_backend: default_backend().to_string(),
        }
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("mqtt_host", &self.mqtt_host)
            .field("mqtt_port", &self.mqtt_port)
            .field("mqtt_user", &self.mqtt_user)
            .field("mqtt_password", &"<redacted>")
            .field("rx_topic", &self.rx_topic)
            .field("tx_topic", &self.tx_topic)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("bitrate", &self.bitrate)
            .field("can_backend", &self.can_backend)
            .finish()
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

fn default_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("can-bridge-{}", &id[..8])
}

fn default_backend() -> &'static str {
    if cfg!(feature = "slcan") {
        "slcan"
    } else {
        "mock"
    }
}

/// Read a flat JSON object. Scalars become strings; `null` entries are treated as unset.
pub fn read_options_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let source = |reason: String| ConfigError::Source {
        path: path.display().to_string(),
        reason,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| source(e.to_string()))?;
    let doc: HashMap<String, Value> =
        serde_json::from_str(&raw).map_err(|e| source(e.to_string()))?;
    Ok(doc
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(s) => Some((k, s)),
            other => Some((k, other.to_string())),
        })
        .collect())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let source = |reason: String| ConfigError::Source {
        path: path.display().to_string(),
        reason,
    };
    let mut values = HashMap::new();
    for item in dotenv::from_path_iter(path).map_err(|e| source(e.to_string()))? {
        let (key, value) = item.map_err(|e| source(e.to_string()))?;
        values.insert(key, value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let cfg = BridgeConfig::from_values(&HashMap::new()).unwrap();
        assert_eq!(cfg.mqtt_host, "localhost");
        assert_eq!(cfg.mqtt_port, 1883);
        assert_eq!(cfg.mqtt_user, "mqtt");
        assert_eq!(cfg.mqtt_password, "mqtt");
        assert_eq!(cfg.rx_topic, "can/rx");
        assert_eq!(cfg.tx_topic, "can/tx");
        assert_eq!(cfg.bitrate, 250_000);
        assert_eq!(cfg.keep_alive, Duration::from_secs(60));
        assert!(cfg.client_id.starts_with("can-bridge-"));
    }

    #[test]
    fn test_port_sentinels_map_to_default() {
        for sentinel in ["", "None", "null", "Null", "NULL"] {
            let cfg = BridgeConfig::from_values(&values(&[("MQTT_PORT", sentinel)])).unwrap();
            assert_eq!(cfg.mqtt_port, 1883, "sentinel {sentinel:?}");
        }
        let cfg = BridgeConfig::from_values(&values(&[("MQTT_PORT", "8883")])).unwrap();
        assert_eq!(cfg.mqtt_port, 8883);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            BridgeConfig::from_values(&values(&[("MQTT_PORT", "abc")])),
            Err(ConfigError::Invalid { key: "MQTT_PORT", .. })
        ));
        assert!(BridgeConfig::from_values(&values(&[("CAN_BITRATE", "fast")])).is_err());
        assert!(BridgeConfig::from_values(&values(&[("MQTT_KEEPALIVE", "0")])).is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let cfg =
            BridgeConfig::from_values(&values(&[("MQTT_PASSWORD", "hunter2")])).unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter2"));
        assert_eq!(cfg.broker_options().password, "hunter2");
    }

    #[test]
    fn test_options_file_wins_and_accepts_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let options = dir.path().join("options.json");
        std::fs::write(
            &options,
            r#"{"MQTT_HOST": "broker.lan", "MQTT_PORT": 1884, "MQTT_USER": null}"#,
        )
        .unwrap();
        let env = vec![("MQTT_HOST".to_string(), "ignored".to_string())];
        let (cfg, source) =
            BridgeConfig::load_from(&options, &dir.path().join(".env"), env).unwrap();
        assert_eq!(source, ConfigSource::OptionsFile(options));
        assert_eq!(cfg.mqtt_host, "broker.lan");
        assert_eq!(cfg.mqtt_port, 1884);
        assert_eq!(cfg.mqtt_user, "mqtt");
    }

    #[test]
    fn test_env_file_overlaid_by_process_env() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join(".env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "# local debugging").unwrap();
        writeln!(f, "MQTT_HOST=from-file").unwrap();
        writeln!(f, "MQTT_TX_TOPIC=bus/tx").unwrap();
        drop(f);
        let env = vec![("MQTT_HOST".to_string(), "from-env".to_string())];
        let (cfg, source) =
            BridgeConfig::load_from(&dir.path().join("missing.json"), &env_path, env).unwrap();
        assert_eq!(
            source,
            ConfigSource::Environment {
                env_file: Some(env_path)
            }
        );
        assert_eq!(cfg.mqtt_host, "from-env");
        assert_eq!(cfg.tx_topic, "bus/tx");
    }

    #[test]
    fn test_malformed_options_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let options = dir.path().join("options.json");
        std::fs::write(&options, "{not json").unwrap();
        let (cfg, source) =
            BridgeConfig::load_from(&options, &dir.path().join(".env"), Vec::new()).unwrap();
        assert_eq!(source, ConfigSource::Environment { env_file: None });
        assert_eq!(cfg.mqtt_host, "localhost");
    }
}
