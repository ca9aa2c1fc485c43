//! Notification wire format
//!
//! A notification is the UTF-8 string `type:senderId:payload`. Only the first
//! two separators are structural: the payload may contain the separator
//! itself (model definitions usually do). The node's idle value is the bare
//! literal `none`.

use bytes::Bytes;
use relevance_core::{Error, MessageType, Result, SenderId, MSG_SEPARATOR};

/// One decoded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub sender: SenderId,
    pub payload: String,
}

impl Message {
    pub fn new(msg_type: MessageType, sender: SenderId, payload: impl Into<String>) -> Self {
        Self {
            msg_type,
            sender,
            payload: payload.into(),
        }
    }

    /// Initial value of the notification node
    pub fn idle_value() -> Bytes {
        Bytes::from_static(MessageType::None.as_str().as_bytes())
    }

    /// Encode for writing to the notification node
    pub fn encode(&self) -> Result<Bytes> {
        if self.sender.as_str().contains(MSG_SEPARATOR) {
            return Err(Error::InvalidMessage {
                message: format!("sender id {:?} contains the separator", self.sender.as_str()),
            });
        }
        if self.msg_type.as_str().contains(MSG_SEPARATOR) {
            return Err(Error::InvalidMessage {
                message: format!("type {:?} contains the separator", self.msg_type.as_str()),
            });
        }

        let raw = format!(
            "{}{sep}{}{sep}{}",
            self.msg_type.as_str(),
            self.sender.as_str(),
            self.payload,
            sep = MSG_SEPARATOR
        );
        Ok(Bytes::from(raw))
    }

    /// Decode the raw value of the notification node
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let raw = std::str::from_utf8(raw).map_err(|e| Error::InvalidMessage {
            message: format!("notification is not UTF-8: {}", e),
        })?;

        if raw == MessageType::None.as_str() {
            return Ok(Self::new(MessageType::None, SenderId::from_raw(""), ""));
        }

        let mut parts = raw.splitn(3, MSG_SEPARATOR);
        let (msg_type, sender, payload) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(id), Some(payload)) => (t, id, payload),
            _ => {
                return Err(Error::InvalidMessage {
                    message: format!("expected type{0}id{0}payload, got {1:?}", MSG_SEPARATOR, raw),
                })
            }
        };

        Ok(Self::new(msg_type.parse()?, SenderId::from_raw(sender), payload))
    }
}

/// Payload of an ADD/UPDATE notification
pub fn model_payload(name: &str, definition: &str) -> String {
    format!("{}{}{}", name, MSG_SEPARATOR, definition)
}

/// Split an ADD/UPDATE payload into name and definition
pub fn split_model_payload(payload: &str) -> Result<(&str, &str)> {
    payload
        .split_once(MSG_SEPARATOR)
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| Error::InvalidMessage {
            message: format!("model payload has no name{}definition split", MSG_SEPARATOR),
        })
}
