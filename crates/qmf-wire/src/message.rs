//! Transport-boundary message envelopes.
//!
//! These are the structures the agent exchanges with its broker adapter.
//! Bodies stay structured ([`MessageBody`]); the adapter owns the
//! MAP/LIST byte codec, so the agent never sees encoded bytes except for
//! legacy v1 frames, which are opaque [`MessageBody::Raw`] payloads.

use bytes::Bytes;

use crate::value::{ValueList, ValueMap};

/// A message body crossing the transport port.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Map-encoded QMFv2 body.
    Map(ValueMap),
    /// List-encoded QMFv2 body (`amqp/list` content type).
    List(ValueList),
    /// Uninterpreted bytes: QMFv1 frames and schema blobs.
    Raw(Bytes),
}

impl MessageBody {
    pub fn empty_list() -> Self {
        MessageBody::List(ValueList::new())
    }
}

/// A message as delivered by the broker to the agent's queue.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// `app_id` message property, when present.
    pub app_id: Option<String>,
    /// Correlation id to echo on responses.
    pub correlation_id: Option<String>,
    /// Routing key of the sender's reply-to address.
    pub reply_to: Option<String>,
    /// Application headers.
    pub headers: ValueMap,
    pub body: MessageBody,
}

impl InboundMessage {
    /// Header lookup as a string, the common case for `qmf.*` headers.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.as_str().ok())
    }
}

/// A message the agent hands to the broker for transfer.
///
/// The supervisor fills in `reply_to` (the agent's own queue) and the
/// `app_id`/`qmf.agent` stamps at the send boundary; emitters only supply
/// what varies per message.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    /// `(exchange, routing key)` the receiver should respond to.
    pub reply_to: Option<(String, String)>,
    pub app_id: Option<String>,
    pub headers: ValueMap,
    pub body: MessageBody,
}

impl OutboundMessage {
    pub fn new(exchange: &str, routing_key: &str, body: MessageBody) -> Self {
        OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            correlation_id: None,
            content_type: None,
            reply_to: None,
            app_id: None,
            headers: ValueMap::new(),
            body,
        }
    }

    pub fn with_correlation_id(mut self, cid: &str) -> Self {
        if !cid.is_empty() {
            self.correlation_id = Some(cid.to_string());
        }
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_headers(mut self, headers: ValueMap) -> Self {
        self.headers = headers;
        self
    }
}
