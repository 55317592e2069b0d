//! Message and offset types shared by the receive and send paths.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Broker annotation carrying a message's partition offset.
pub const OFFSET_ANNOTATION: &str = "x-opt-offset";

/// Opaque, broker-assigned position marker within one partition. Ordering is
/// the broker's business; clients only compare for equality or hand the
/// value back verbatim inside a selector filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(String);

impl Offset {
    pub fn new(value: impl Into<String>) -> Self {
        Offset(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Offset {
    fn from(value: &str) -> Self {
        Offset(value.to_string())
    }
}

impl From<String> for Offset {
    fn from(value: String) -> Self {
        Offset(value)
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message delivered by the broker on one partition's receive link.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Partition the broker stamped on the message. Sessions drop messages
    /// whose stamp does not match their own partition.
    pub partition_id: String,
    pub payload: Bytes,
    pub annotations: HashMap<String, String>,
}

impl InboundMessage {
    /// The broker-assigned offset annotation, when present.
    pub fn offset(&self) -> Option<Offset> {
        self.annotations
            .get(OFFSET_ANNOTATION)
            .map(|value| Offset::new(value.clone()))
    }
}

/// Message handed to the transport's send path.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Bytes,
    /// Server-side routing key. Only meaningful for hub-level sends; pinned
    /// partition sends reject it.
    pub partition_key: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        OutboundMessage {
            body: body.into(),
            partition_key: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

/// Event yielded by a receive stream after the owning session has recorded
/// the message's offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub partition_id: String,
    pub payload: Bytes,
    pub offset: Option<Offset>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_annotation_extraction() {
        let message = InboundMessage {
            partition_id: "1".to_string(),
            payload: Bytes::from_static(b"{}"),
            annotations: HashMap::from([(OFFSET_ANNOTATION.to_string(), "42".to_string())]),
        };
        assert_eq!(message.offset(), Some(Offset::from("42")));

        let bare = InboundMessage {
            partition_id: "1".to_string(),
            payload: Bytes::new(),
            annotations: HashMap::new(),
        };
        assert_eq!(bare.offset(), None);
    }

    #[test]
    fn test_outbound_partition_key() {
        let message = OutboundMessage::new("payload").with_partition_key("device-7");
        assert_eq!(message.partition_key.as_deref(), Some("device-7"));
    }
}
