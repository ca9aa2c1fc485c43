//! Core type definitions shared by the dispatcher, store and orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::{Error, Result};

/// Separator between the structural fields of a notification
pub const MSG_SEPARATOR: &str = ":";

/// Longest accepted model name in bytes
pub const MAX_MODEL_NAME_LEN: usize = 255;

static MODEL_NAME_PATTERN: OnceLock<regex::Regex> = OnceLock::new();

fn model_name_pattern() -> &'static regex::Regex {
    MODEL_NAME_PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[a-zA-Z0-9_\-\.]+$").expect("model name pattern is valid")
    })
}

/// Validate a model name so it can be used both as a child node name
/// and as the leading field of an ADD/UPDATE payload
pub fn validate_model_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidModelName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }

    if name.len() > MAX_MODEL_NAME_LEN {
        return Err(invalid("name is too long"));
    }

    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }

    if !model_name_pattern().is_match(name) {
        return Err(invalid(
            "only alphanumerics, '_', '-' and '.' are allowed",
        ));
    }

    Ok(())
}

/// Notification message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Idle value of the notification node, never actioned
    None,

    /// A model was added
    Add,

    /// A model was overwritten
    Update,

    /// A model was deleted
    Del,

    /// All models were removed
    Empty,
}

impl MessageType {
    /// Wire literal for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::None => "none",
            MessageType::Add => "add",
            MessageType::Update => "update",
            MessageType::Del => "del",
            MessageType::Empty => "empty",
        }
    }

    /// Returns true if messages of this type may be broadcast
    pub fn is_broadcastable(&self) -> bool {
        !matches!(self, MessageType::None)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(MessageType::None),
            "add" => Ok(MessageType::Add),
            "update" => Ok(MessageType::Update),
            "del" => Ok(MessageType::Del),
            "empty" => Ok(MessageType::Empty),
            other => Err(Error::UnknownMessageType {
                msg_type: other.to_string(),
            }),
        }
    }
}

static SENDER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity a dispatcher stamps on every message it sends
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(String);

impl SenderId {
    /// Generate a fresh identity for this host
    ///
    /// The id is `{host}-{counter}-{nonce}`; the counter is process-wide and
    /// the nonce separates processes that share a host name.
    pub fn generate(host: &str) -> Self {
        let counter = SENDER_COUNTER.fetch_add(1, Ordering::SeqCst);
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let host: String = host
            .chars()
            .map(|c| if c == ':' || c.is_whitespace() { '_' } else { c })
            .collect();
        Self(format!("{}-{}-{}", host, counter, &nonce[..8]))
    }

    /// Host identity from the environment
    pub fn local_host() -> String {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Wrap an id decoded from the wire
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
