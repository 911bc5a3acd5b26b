use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::PublicKey;
use crate::feed::FeedMessage;
use crate::transport::TransportError;

/// Length of the per-process seller id
pub const SELLER_ID_SIZE: usize = 32;

/// Every frame exchanged on a session
///
/// JSON payloads travel as strings: bincode cannot carry a self-describing
/// `serde_json::Value` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Seller -> buyer: key of the feed this buyer should replicate
    OneTimeFeed(PublicKey),
    /// Seller -> buyer: random id of the seller process
    SellerId([u8; SELLER_ID_SIZE]),
    /// Either direction: the sender considers the subscription valid
    Valid(String),
    /// Either direction: the sender considers the subscription invalid
    Invalid { error: String },
    /// Application message routed to a named handler
    UserMessage { name: String, message: String },
    /// Content log replication
    Feed(FeedMessage),
    /// The sender is closing the session
    Close { reason: String },
}

/// Channel a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    OneTimeFeed,
    SellerId,
    Valid,
    Invalid,
    UserMessage,
    Feed,
    Close,
}

impl Message {
    pub fn channel(&self) -> Channel {
        match self {
            Message::OneTimeFeed(_) => Channel::OneTimeFeed,
            Message::SellerId(_) => Channel::SellerId,
            Message::Valid(_) => Channel::Valid,
            Message::Invalid { .. } => Channel::Invalid,
            Message::UserMessage { .. } => Channel::UserMessage,
            Message::Feed(_) => Channel::Feed,
            Message::Close { .. } => Channel::Close,
        }
    }

    pub fn valid(info: &Value) -> Self {
        Message::Valid(info.to_string())
    }

    pub fn user(name: &str, message: &Value) -> Self {
        Message::UserMessage {
            name: name.to_string(),
            message: message.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serialize(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        bincode::deserialize(frame).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

/// Parse a JSON payload carried as a string
pub fn parse_json(raw: &str) -> Result<Value, TransportError> {
    serde_json::from_str(raw).map_err(|e| TransportError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use serde_json::json;

    #[test]
    fn test_json_payloads_survive_framing() {
        let msg = Message::valid(&json!({"quota": 10, "plan": ["a", null]}));
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        let Message::Valid(raw) = decoded else {
            panic!("expected valid message");
        };
        assert_eq!(parse_json(&raw).unwrap(), json!({"quota": 10, "plan": ["a", null]}));
    }

    #[test]
    fn test_channels() {
        let key = SecretKey::generate().public();
        assert_eq!(Message::OneTimeFeed(key).channel(), Channel::OneTimeFeed);
        assert_eq!(
            Message::user("chat", &json!("hi")).channel(),
            Channel::UserMessage
        );
        assert!(Message::decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
