//! Configuration for relevance model synchronization

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::types::validate_model_name;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Message dispatcher settings
    pub dispatcher: DispatcherConfig,

    /// Durable model store settings
    pub store: StoreConfig,

    /// Reconciliation settings
    pub sync: ReconcileConfig,

    /// Admin HTTP API settings
    pub http: HttpConfig,

    /// Models injected into the preloaded tier at startup, name -> definition
    pub preloaded: BTreeMap<String, serde_json::Value>,
}

impl SyncConfig {
    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the runtime can not work with
    pub fn validate(&self) -> Result<()> {
        let notification = normalized(&self.dispatcher.notification_path);
        let root = normalized(&self.store.root_path);

        if notification == "/" || root == "/" {
            return Err(invalid("notification_path and root_path must not be the root"));
        }

        if notification == root
            || notification.starts_with(&format!("{}/", root))
            || root.starts_with(&format!("{}/", notification))
        {
            return Err(invalid(format!(
                "notification_path {} and root_path {} overlap",
                notification, root
            )));
        }

        if self.store.compression_level > 9 {
            return Err(invalid(format!(
                "compression_level must be 0-9, got {}",
                self.store.compression_level
            )));
        }

        if self.dispatcher.rearm_backoff.is_zero() {
            return Err(invalid("rearm_backoff must be positive"));
        }

        if matches!(self.sync.reconcile_interval, Some(i) if i.is_zero()) {
            return Err(invalid("reconcile_interval must be positive"));
        }

        for name in self.preloaded.keys() {
            validate_model_name(name)?;
        }

        Ok(())
    }
}

fn normalized(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        message: message.into(),
    }
}

/// Message dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Path of the notification node
    pub notification_path: String,

    /// Host identity used for the sender id (defaults to `HOSTNAME`)
    pub host_id: Option<String>,

    /// Initial delay before retrying a failed watch re-arm
    #[serde(with = "humantime_serde")]
    pub rearm_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            notification_path: "/senseiMsg".to_string(),
            host_id: None,
            rearm_backoff: Duration::from_millis(100),
        }
    }
}

/// Durable model store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root node holding one child per model
    pub root_path: String,

    /// zlib compression level (0-9)
    pub compression_level: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_path: "/relevanceStore".to_string(),
            compression_level: 6,
        }
    }
}

/// Periodic reconciliation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// How often to force a full reload from the durable store
    #[serde(with = "option_humantime_serde")]
    pub reconcile_interval: Option<Duration>,
}

/// Admin HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to bind the admin API to
    pub bind_address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8089".to_string(),
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.dispatcher.notification_path, "/senseiMsg");
        assert_eq!(config.store.root_path, "/relevanceStore");
        assert!(config.sync.reconcile_interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = SyncConfig::default();
        config.sync.reconcile_interval = Some(Duration::from_secs(60));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sync.reconcile_interval, Some(Duration::from_secs(60)));
        assert_eq!(parsed.dispatcher.rearm_backoff, config.dispatcher.rearm_backoff);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: SyncConfig =
            serde_json::from_str(r#"{"store": {"root_path": "models"}}"#).unwrap();
        assert_eq!(parsed.store.root_path, "models");
        assert_eq!(parsed.store.compression_level, 6);
        assert_eq!(parsed.dispatcher.notification_path, "/senseiMsg");
    }

    #[test]
    fn test_overlapping_paths_rejected() {
        let mut config = SyncConfig::default();
        config.dispatcher.notification_path = "relevanceStore/msg".to_string();
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = SyncConfig::default();
        config.store.compression_level = 12;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config
            .preloaded
            .insert("bad:name".to_string(), serde_json::json!({"function": "x"}));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_section_rejected() {
        // settings the node can not act on must not be dropped silently
        let result = serde_json::from_str::<SyncConfig>(
            r#"{"coordination": {"connect_string": "zk1:2181"}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"preloaded": {{"boost": {{"function": "return 1;"}}}}}}"#
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert!(config.preloaded.contains_key("boost"));
    }
}
