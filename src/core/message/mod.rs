//! Messages, their properties and the per-queue message store.
//!
//! Durable messages are appended to a per-queue log as
//! `[u64 little-endian length][StoredMessage]`. Acknowledging a durable message
//! rewrites its record in place with the validity flag cleared; the log is
//! compacted once most of it is tombstoned.

mod log;
mod manager;

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

pub use log::{LogEntry, MessageLog};
pub use manager::{MessageManager, QueueMessages};

/// Validity flag values carried by every log record. Both are one byte so a
/// tombstone rewrite never changes the record length.
pub const VALID: &str = "1";
pub const TOMBSTONE: &str = "0";

/// Whether a message survives a broker restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMode {
    #[default]
    Undurable,
    Durable,
}

impl DeliveryMode {
    pub fn code(self) -> i32 {
        match self {
            DeliveryMode::Undurable => 1,
            DeliveryMode::Durable => 2,
        }
    }

    /// Unknown codes decode as [`DeliveryMode::Undurable`].
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => DeliveryMode::Durable,
            _ => DeliveryMode::Undurable,
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Undurable => f.write_str("undurable"),
            DeliveryMode::Durable => f.write_str("durable"),
        }
    }
}

/// Publisher-supplied message attributes. An empty `id` asks the store to
/// generate one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BasicProperties {
    pub id: String,
    pub delivery_mode: DeliveryMode,
    pub routing_key: String,
}

impl BasicProperties {
    pub fn new(routing_key: impl Into<String>, delivery_mode: DeliveryMode) -> Self {
        Self {
            id: String::new(),
            delivery_mode,
            routing_key: routing_key.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// A message owned by one queue's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub properties: BasicProperties,
    pub body: Bytes,
    pub valid: bool,
    /// Payload offset in the queue log. Meaningful for durable messages only.
    pub offset: u64,
    /// Payload length in the queue log. Meaningful for durable messages only.
    pub length: u64,
}

impl Message {
    pub fn new(mut properties: BasicProperties, body: Bytes) -> Self {
        if properties.id.is_empty() {
            properties.id = Uuid::new_v4().to_string();
        }
        Self {
            properties,
            body,
            valid: true,
            offset: 0,
            length: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.properties.id
    }

    pub fn routing_key(&self) -> &str {
        &self.properties.routing_key
    }

    pub fn is_durable(&self) -> bool {
        self.properties.delivery_mode == DeliveryMode::Durable
    }

    /// Encodes the log payload for this message with the given validity flag.
    pub(crate) fn to_stored(&self, valid: &str) -> StoredMessage {
        StoredMessage {
            properties: Some(StoredProperties {
                id: self.properties.id.clone(),
                delivery_mode: self.properties.delivery_mode.code(),
                routing_key: self.properties.routing_key.clone(),
            }),
            body: self.body.clone(),
            valid: valid.to_string(),
        }
    }

    pub(crate) fn from_entry(entry: LogEntry) -> Self {
        let LogEntry {
            record,
            offset,
            length,
        } = entry;
        let props = record.properties.unwrap_or_default();
        Self {
            properties: BasicProperties {
                id: props.id,
                delivery_mode: DeliveryMode::from_code(props.delivery_mode),
                routing_key: props.routing_key,
            },
            body: record.body,
            valid: record.valid == VALID,
            offset,
            length,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredProperties {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(int32, tag = "2")]
    pub delivery_mode: i32,
    #[prost(string, tag = "3")]
    pub routing_key: String,
}

/// Log payload of one message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredMessage {
    #[prost(message, optional, tag = "1")]
    pub properties: Option<StoredProperties>,
    #[prost(bytes = "bytes", tag = "2")]
    pub body: Bytes,
    #[prost(string, tag = "3")]
    pub valid: String,
}

impl StoredMessage {
    pub fn is_valid(&self) -> bool {
        self.valid == VALID
    }

    pub fn id(&self) -> &str {
        self.properties.as_ref().map(|p| p.id.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at offset {offset} in {path}: {source}")]
    Decode {
        path: PathBuf,
        offset: u64,
        #[source]
        source: prost::DecodeError,
    },

    #[error(
        "tombstone for record at offset {offset} in {path} is {actual} bytes, expected {expected}"
    )]
    LengthMismatch {
        path: PathBuf,
        offset: u64,
        expected: u64,
        actual: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn missing_id_is_generated() {
        let a = Message::new(BasicProperties::default(), Bytes::from_static(b"x"));
        let b = Message::new(BasicProperties::default(), Bytes::from_static(b"x"));
        assert!(!a.id().is_empty());
        assert_ne!(a.id(), b.id());

        let c = Message::new(
            BasicProperties::default().with_id("given"),
            Bytes::new(),
        );
        assert_eq!(c.id(), "given");
    }

    #[test]
    fn tombstone_keeps_encoded_length() {
        let msg = Message::new(
            BasicProperties::new("news.sport", DeliveryMode::Durable),
            Bytes::from_static(b"hello"),
        );
        let live = msg.to_stored(VALID).encode_to_vec();
        let dead = msg.to_stored(TOMBSTONE).encode_to_vec();
        assert_eq!(live.len(), dead.len());
        assert_ne!(live, dead);

        let decoded = StoredMessage::decode(dead.as_slice()).unwrap();
        assert!(!decoded.is_valid());
        assert_eq!(decoded.id(), msg.id());
    }

    #[test]
    fn delivery_mode_codes() {
        assert_eq!(DeliveryMode::from_code(DeliveryMode::Durable.code()), DeliveryMode::Durable);
        assert_eq!(DeliveryMode::from_code(DeliveryMode::Undurable.code()), DeliveryMode::Undurable);
        assert_eq!(DeliveryMode::from_code(42), DeliveryMode::Undurable);
    }
}
