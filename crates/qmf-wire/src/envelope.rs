//! Well-known QMFv2 envelope vocabulary.
//!
//! Header keys, opcodes, exchange and routing-key names, and the
//! `_schema_id` builder shared by every outbound envelope. Keeping these
//! in one place is what makes the emitters in the agent auditable against
//! the protocol: the strings appear here once and nowhere else.

use uuid::Uuid;

use crate::value::{Value, ValueMap};

/// Application id stamped on every QMFv2 message.
pub const APP_ID: &str = "qmf2";

/// Message header keys.
pub mod header {
    /// "indication" or "response".
    pub const METHOD: &str = "method";
    /// The QMFv2 opcode, one of [`super::opcode`].
    pub const QMF_OPCODE: &str = "qmf.opcode";
    /// Content discriminator for `_data_indication`: `_data` or `_event`.
    pub const QMF_CONTENT: &str = "qmf.content";
    /// The agent's human-readable address.
    pub const QMF_AGENT: &str = "qmf.agent";
    /// Present (value ignored) on all but the last message of a
    /// query-response stream.
    pub const PARTIAL: &str = "partial";

    pub const METHOD_INDICATION: &str = "indication";
    pub const METHOD_RESPONSE: &str = "response";
}

/// QMFv2 opcodes carried in the `qmf.opcode` header.
pub mod opcode {
    pub const AGENT_HEARTBEAT_INDICATION: &str = "_agent_heartbeat_indication";
    pub const AGENT_LOCATE_REQUEST: &str = "_agent_locate_request";
    pub const AGENT_LOCATE_RESPONSE: &str = "_agent_locate_response";
    pub const DATA_INDICATION: &str = "_data_indication";
    pub const QUERY_REQUEST: &str = "_query_request";
    pub const QUERY_RESPONSE: &str = "_query_response";
    pub const METHOD_REQUEST: &str = "_method_request";
    pub const METHOD_RESPONSE: &str = "_method_response";
    pub const EXCEPTION: &str = "_exception";
}

/// `qmf.content` discriminators.
pub mod content {
    pub const DATA: &str = "_data";
    pub const EVENT: &str = "_event";
}

/// AMQP exchanges the agent talks to.
pub mod exchange {
    pub const DIRECT: &str = "amq.direct";
    pub const QMF_DIRECT: &str = "qmf.default.direct";
    pub const QMF_TOPIC: &str = "qmf.default.topic";
    pub const MANAGEMENT: &str = "qpid.management";
}

/// Fixed routing keys.
pub mod routing {
    pub const HEARTBEAT: &str = "agent.ind.heartbeat";
    pub const DATA: &str = "agent.ind.data";
    pub const CONSOLE_WILDCARD: &str = "console.#";
    pub const SCHEMA_PACKAGE: &str = "schema.package";
}

/// Content type of list-encoded bodies.
pub const CONTENT_TYPE_LIST: &str = "amqp/list";

/// Body keys common to QMFv2 envelopes.
pub mod body {
    pub const VALUES: &str = "_values";
    pub const SCHEMA_ID: &str = "_schema_id";
    pub const OBJECT_ID: &str = "_object_id";
    pub const ARGUMENTS: &str = "_arguments";
    pub const TIMESTAMP: &str = "_timestamp";
    pub const SEVERITY: &str = "_severity";
    pub const WHAT: &str = "_what";
    pub const METHOD_NAME: &str = "_method_name";
    pub const STATUS_CODE: &str = "_status_code";
    pub const STATUS_TEXT: &str = "_status_text";
    pub const PACKAGE_NAME: &str = "_package_name";
    pub const CLASS_NAME: &str = "_class_name";
    pub const HASH: &str = "_hash";
}

/// Build the `_schema_id` map identifying a schema:
/// `{_package_name, _class_name, _hash}` with the 16-byte digest wrapped
/// as a UUID-typed value.
pub fn schema_id(package: &str, class: &str, hash: &[u8; 16]) -> ValueMap {
    let mut map = ValueMap::new();
    map.insert(body::PACKAGE_NAME.to_string(), Value::from(package));
    map.insert(body::CLASS_NAME.to_string(), Value::from(class));
    map.insert(body::HASH.to_string(), Value::Uuid(Uuid::from_bytes(*hash)));
    map
}
