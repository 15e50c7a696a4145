//! Message envelope carried by every bus message
//!
//! The envelope is a fixed-schema document: a header block (system, version,
//! protocol, source, correlation ids) and a single payload element. The body
//! travels as JSON; transport properties (reply-to, time-to-live, deadletter
//! origin) travel beside the body the way broker message properties do.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{error::DispatchError, payload::Payload};

/// System identifier written into every header
pub const SYSTEM_NAME: &str = "DISPATCH";
/// Header schema version
pub const HEADER_VERSION: &str = "1.0.0";

/// Reply status reported by a service for a successful call
pub const STATUS_OK: &str = "OK";
/// Reply status for a request the service failed to handle
pub const STATUS_ERROR: &str = "ERROR";
/// Reply status for a request the service could not decode
pub const STATUS_INVALID_MESSAGE: &str = "INVALID_MESSAGE";

/// The protocol a message speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    EventMessage,
    CommandMessage,
    RequestMessage,
    ReplyMessage
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::EventMessage => "EventMessage",
            MessageKind::CommandMessage => "CommandMessage",
            MessageKind::RequestMessage => "RequestMessage",
            MessageKind::ReplyMessage => "ReplyMessage"
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub name:    MessageKind,
    pub version: String
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name:      String,
    pub user:      String,
    pub uuid:      String,
    pub timestamp: DateTime<Utc>,
    pub summary:   String
}

/// Correlation ids tying a message back to scheduling entities
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CorrelationIds {
    #[serde(rename = "mom-id")]
    pub mom_id: Option<String>,
    #[serde(rename = "sas-id")]
    pub sas_id: Option<String>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub system:   String,
    pub version:  String,
    pub protocol: Protocol,
    pub source:   Source,
    pub ids:      CorrelationIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status:   Option<String>
}

/// Transport-level properties, not part of the serialized body
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageProperties {
    /// Destination the receiver should answer on
    pub reply_to:          Option<String>,
    /// Time-to-live; the broker drops the message once it expires
    pub ttl:               Option<Duration>,
    /// Address the message was originally sent to, set on deadletters
    pub deadletter_origin: Option<String>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header:     Header,
    #[serde(default)]
    pub payload:    Option<Payload>,
    #[serde(skip)]
    pub properties: MessageProperties
}

impl Message {
    pub fn new(kind: MessageKind, payload: Option<Payload>) -> Self {
        Self {
            header: Header {
                system:   SYSTEM_NAME.to_string(),
                version:  HEADER_VERSION.to_string(),
                protocol: Protocol { name: kind, version: HEADER_VERSION.to_string() },
                source:   Source {
                    name:      default_source_name(),
                    user:      whoami::username(),
                    uuid:      Uuid::new_v4().to_string(),
                    timestamp: Utc::now(),
                    summary:   String::new()
                },
                ids:      CorrelationIds::default(),
                status:   None
            },
            payload,
            properties: MessageProperties::default()
        }
    }

    pub fn event(payload: Payload) -> Self {
        Self::new(MessageKind::EventMessage, Some(payload))
    }

    pub fn command(payload: Payload) -> Self {
        Self::new(MessageKind::CommandMessage, Some(payload))
    }

    /// Build a request; the summary names the service being called
    pub fn request(service: &str, payload: Option<Payload>) -> Self {
        Self::new(MessageKind::RequestMessage, payload).with_summary(service)
    }

    pub fn reply(status: &str, content: Option<Payload>) -> Self {
        let mut message = Self::new(MessageKind::ReplyMessage, content);
        message.header.status = Some(status.to_string());
        message
    }

    pub fn kind(&self) -> MessageKind {
        self.header.protocol.name
    }

    pub fn id(&self) -> &str {
        &self.header.source.uuid
    }

    pub fn summary(&self) -> &str {
        &self.header.source.summary
    }

    pub fn status(&self) -> Option<&str> {
        self.header.status.as_deref()
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.header.source.summary = summary.into();
        self
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.header.source.summary = summary.into();
    }

    pub fn set_source_name(&mut self, name: impl Into<String>) {
        self.header.source.name = name.into();
    }

    pub fn set_mom_id(&mut self, mom_id: impl Into<String>) {
        self.header.ids.mom_id = Some(mom_id.into());
    }

    pub fn set_sas_id(&mut self, sas_id: impl Into<String>) {
        self.header.ids.sas_id = Some(sas_id.into());
    }

    pub fn set_reply_to(&mut self, address: impl Into<String>) {
        self.properties.reply_to = Some(address.into());
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.properties.ttl = Some(ttl);
    }

    /// Fetch a field by dotted path, e.g. `header.source.summary`
    pub fn field(&self, path: &str) -> Option<serde_json::Value> {
        let document = serde_json::to_value(self).ok()?;
        path.split('.').try_fold(document, |node, key| match node {
            serde_json::Value::Object(mut map) => map.remove(key),
            serde_json::Value::Array(mut items) => {
                let index: usize = key.parse().ok()?;
                (index < items.len()).then(|| items.swap_remove(index))
            }
            _ => None
        })
    }

    /// Serialize the body for the wire
    pub fn encode(&self) -> Result<Vec<u8>, DispatchError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Rebuild a message from its wire body and transport properties
    pub fn decode(body: &[u8], properties: MessageProperties) -> Result<Self, DispatchError> {
        let mut message: Message = serde_json::from_slice(body)
            .map_err(|e| DispatchError::Serialization(format!("malformed message body: {}", e)))?;
        message.properties = properties;
        Ok(message)
    }
}

fn default_source_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "dispatch".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_fills_header() {
        let message = Message::event(Payload::Int(1));
        assert_eq!(message.header.system, SYSTEM_NAME);
        assert_eq!(message.kind(), MessageKind::EventMessage);
        assert!(Uuid::parse_str(message.id()).is_ok());
        assert!(message.header.ids.mom_id.is_none());
    }

    #[test]
    fn test_dotted_field_access() {
        let mut message = Message::request("resource.estimate", Some(Payload::Int(5)));
        message.set_mom_id("2001");

        assert_eq!(message.field("header.source.summary"), Some(serde_json::json!("resource.estimate")));
        assert_eq!(message.field("header.protocol.name"), Some(serde_json::json!("RequestMessage")));
        assert_eq!(message.field("header.ids.mom-id"), Some(serde_json::json!("2001")));
        assert_eq!(message.field("payload"), Some(serde_json::json!(5)));
        assert_eq!(message.field("header.nope"), None);
    }

    #[test]
    fn test_wire_body_excludes_properties() {
        let mut message = Message::reply(STATUS_OK, Some(Payload::str("done")));
        message.set_reply_to("reply.abc");
        message.set_ttl(Duration::from_secs(3));

        let body = message.encode().unwrap();
        let decoded = Message::decode(&body, MessageProperties::default()).unwrap();
        assert_eq!(decoded.header, message.header);
        assert_eq!(decoded.payload, message.payload);
        assert!(decoded.properties.reply_to.is_none());

        let restored = Message::decode(&body, message.properties.clone()).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn test_malformed_body_is_serialization_error() {
        let err = Message::decode(b"{not json", MessageProperties::default()).unwrap_err();
        assert!(matches!(err, DispatchError::Serialization(_)));
    }
}
