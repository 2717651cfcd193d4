//! Inbound message classification and request handling.

use bytes::{BufMut, Bytes, BytesMut};
use qmf_wire::{
    envelope, framing, InboundMessage, MessageBody, OutboundMessage, V1Opcode, Value, ValueMap,
};
use tracing::{trace, warn};

use crate::domain::{ObjectId, SchemaClassKey};
use crate::ports::inbound::MessageListener;
use crate::service::core::{v2_headers, AgentInner};

impl MessageListener for AgentInner {
    fn received(&self, message: InboundMessage) {
        let reply_to = message.reply_to.clone().unwrap_or_default();
        let cid = message.correlation_id.clone().unwrap_or_default();

        if message.app_id.as_deref() == Some(envelope::APP_ID) {
            let opcode = message
                .header_str(envelope::header::QMF_OPCODE)
                .unwrap_or_default()
                .to_string();
            match opcode.as_str() {
                envelope::opcode::AGENT_LOCATE_REQUEST => {
                    self.handle_locate_request(&cid, &reply_to)
                }
                envelope::opcode::METHOD_REQUEST => {
                    match message.body {
                        MessageBody::Map(body) => self.handle_method_request(body, &cid, &reply_to),
                        _ => self.send_exception(&reply_to, &cid, "method request body is not a map"),
                    }
                }
                envelope::opcode::QUERY_REQUEST => match message.body {
                    MessageBody::Map(body) => self.handle_get_query(&body, &cid, &reply_to),
                    _ => self.send_exception(&reply_to, &cid, "query body is not a map"),
                },
                other => warn!(opcode = other, "Unsupported QMFv2 opcode"),
            }
            return;
        }

        // Legacy binary frame.
        let MessageBody::Raw(frame) = message.body else {
            warn!("Non-QMFv2 message without a binary body, ignoring");
            return;
        };
        let mut buf = frame;
        let Some(header) = framing::check_header(&mut buf) else {
            trace!("Binary frame failed the header check, ignoring");
            return;
        };
        match V1Opcode::from_byte(header.opcode) {
            Some(V1Opcode::SchemaRequest) => {
                self.handle_schema_request(&mut buf, header.sequence, &reply_to)
            }
            Some(V1Opcode::ConsoleAdded) => self.handle_console_added(),
            _ => warn!(
                opcode = %(header.opcode as char),
                "Ignoring old-format request"
            ),
        }
    }
}

impl AgentInner {
    /// Answer a locate request with the agent's attributes and remember
    /// that a console appeared.
    fn handle_locate_request(&self, cid: &str, reply_to: &str) {
        trace!("Received agent locate request");
        let body = {
            let state = self.state.lock();
            let mut body = ValueMap::new();
            body.insert(
                envelope::body::VALUES.to_string(),
                Value::Map(self.advertised_values(&state)),
            );
            body
        };
        let headers = v2_headers(
            envelope::header::METHOD_INDICATION,
            envelope::opcode::AGENT_LOCATE_RESPONSE,
        );
        self.supervisor.send(
            OutboundMessage::new(envelope::exchange::QMF_DIRECT, reply_to, MessageBody::Map(body))
                .with_correlation_id(cid)
                .with_headers(headers),
        );
        trace!(reply_to, "Sent agent locate response");

        self.state.lock().client_was_added = true;
    }

    fn handle_console_added(&self) {
        self.state.lock().client_was_added = true;
        trace!("Received console-added indication");
    }

    /// Serve a schema request: `'s'` indication with the schema blob, or
    /// silence when the key is unknown.
    fn handle_schema_request(&self, buf: &mut Bytes, sequence: u32, reply_to: &str) {
        let state = self.state.lock();
        let (Some(package), Some(class), Some(hash)) = (
            framing::get_short_string(buf),
            framing::get_short_string(buf),
            framing::get_bin128(buf),
        ) else {
            trace!("Malformed schema request, ignoring");
            return;
        };
        trace!(%package, %class, "Received schema request");

        let key = SchemaClassKey::new(class, hash);
        let Some(schema) = state.schemas.find(&package, &key) else {
            trace!(%package, class = %key.class_name, "Schema not registered, ignoring");
            return;
        };

        let mut frame = BytesMut::new();
        framing::encode_header(&mut frame, V1Opcode::SchemaIndication as u8, sequence);
        frame.put_slice(&(schema.write_schema)());
        self.supervisor.send(OutboundMessage::new(
            envelope::exchange::DIRECT,
            reply_to,
            MessageBody::Raw(frame.freeze()),
        ));
        trace!(%package, class = %key.class_name, "Sent schema indication");
    }

    /// `_exception` with a descriptive text, direct to the caller.
    pub(crate) fn send_exception(&self, reply_to: &str, cid: &str, text: &str) {
        let mut values = ValueMap::new();
        values.insert("error_code".to_string(), Value::from(1u64));
        values.insert("error_text".to_string(), Value::from(text));
        let mut body = ValueMap::new();
        body.insert(envelope::body::VALUES.to_string(), Value::Map(values));

        let headers = v2_headers(
            envelope::header::METHOD_INDICATION,
            envelope::opcode::EXCEPTION,
        );
        self.supervisor.send(
            OutboundMessage::new(envelope::exchange::QMF_DIRECT, reply_to, MessageBody::Map(body))
                .with_correlation_id(cid)
                .with_headers(headers),
        );
        trace!(text, "Sent exception");
    }

    /// Object queries: by id (single non-partial answer, no terminator
    /// when found) or by class (one partial message per match, then the
    /// empty non-partial end-of-stream marker).
    fn handle_get_query(&self, query: &ValueMap, cid: &str, reply_to: &str) {
        let mut state = self.state.lock();
        self.move_staged_into_live(&mut state);
        trace!(cid, "Received object query");

        let what = match query.get(envelope::body::WHAT) {
            None => {
                drop(state);
                self.send_exception(reply_to, cid, "_what element missing in query");
                return;
            }
            Some(value) => match value.as_str() {
                Ok(s) => s,
                Err(_) => {
                    drop(state);
                    self.send_exception(reply_to, cid, "_what element is not a string");
                    return;
                }
            },
        };
        if what != "OBJECT" {
            let text = format!("query for _what => '{}' not supported", what);
            drop(state);
            self.send_exception(reply_to, cid, &text);
            return;
        }

        let mut class_name = String::new();
        let mut package_name = String::new();
        if let Some(Value::Map(schema_id)) = query.get(envelope::body::SCHEMA_ID) {
            if let Some(Ok(name)) = schema_id.get(envelope::body::CLASS_NAME).map(Value::as_str) {
                class_name = name.to_string();
            }
            if let Some(Ok(name)) = schema_id.get(envelope::body::PACKAGE_NAME).map(Value::as_str)
            {
                package_name = name.to_string();
            }
        }

        let partial_headers = || {
            let mut headers = v2_headers(
                envelope::header::METHOD_RESPONSE,
                envelope::opcode::QUERY_RESPONSE,
            );
            headers.insert(
                envelope::header::QMF_CONTENT.to_string(),
                Value::from(envelope::content::DATA),
            );
            headers.insert(envelope::header::PARTIAL.to_string(), Value::Bool(true));
            headers
        };
        let final_headers = || {
            let mut headers = partial_headers();
            headers.remove(envelope::header::PARTIAL);
            headers
        };

        let now = self.now();
        if let Some(Value::Map(id_map)) = query.get(envelope::body::OBJECT_ID) {
            let id = match ObjectId::from_map(id_map) {
                Ok(id) => id,
                Err(e) => {
                    drop(state);
                    self.send_exception(reply_to, cid, &e.to_string());
                    return;
                }
            };
            if let Some(object) = state.objects.get(&id).cloned() {
                if object.config_changed() || object.inst_changed() {
                    object.set_update_time(now);
                }
                let entry = encode_query_entry(&id, object.as_ref());
                self.supervisor.send(
                    OutboundMessage::new(
                        envelope::exchange::QMF_DIRECT,
                        reply_to,
                        MessageBody::List(vec![Value::Map(entry)]),
                    )
                    .with_correlation_id(cid)
                    .with_content_type(envelope::CONTENT_TYPE_LIST)
                    .with_headers(final_headers()),
                );
                trace!(reply_to, "Sent query response (by object id)");
                // The single-object answer carries no end-of-stream
                // marker; consoles treat the non-partial message itself
                // as completion.
                return;
            }
        } else {
            for (id, object) in &state.objects {
                if object.class_name() != class_name
                    || (!package_name.is_empty() && object.package_name() != package_name)
                {
                    continue;
                }
                if object.config_changed() || object.inst_changed() {
                    object.set_update_time(now);
                }
                let entry = encode_query_entry(id, object.as_ref());
                self.supervisor.send(
                    OutboundMessage::new(
                        envelope::exchange::QMF_DIRECT,
                        reply_to,
                        MessageBody::List(vec![Value::Map(entry)]),
                    )
                    .with_correlation_id(cid)
                    .with_content_type(envelope::CONTENT_TYPE_LIST)
                    .with_headers(partial_headers()),
                );
                trace!(reply_to, id = %id, "Sent query response (by class)");
            }
        }

        // Empty non-partial list: the command-complete marker.
        self.supervisor.send(
            OutboundMessage::new(
                envelope::exchange::QMF_DIRECT,
                reply_to,
                MessageBody::empty_list(),
            )
            .with_correlation_id(cid)
            .with_content_type(envelope::CONTENT_TYPE_LIST)
            .with_headers(final_headers()),
        );
        trace!(reply_to, "Sent query completion");
    }
}

/// One query-response list element: id, schema id, timestamps, and both
/// property and statistic values.
fn encode_query_entry(
    id: &ObjectId,
    object: &dyn crate::ports::outbound::ManagementObject,
) -> ValueMap {
    let mut entry = ValueMap::new();
    entry.insert(
        envelope::body::OBJECT_ID.to_string(),
        Value::Map(id.map_encode()),
    );
    entry.insert(
        envelope::body::SCHEMA_ID.to_string(),
        Value::Map(envelope::schema_id(
            &object.package_name(),
            &object.class_name(),
            &object.schema_hash(),
        )),
    );
    object.write_timestamps(&mut entry);
    let mut values = ValueMap::new();
    object.map_encode_values(&mut values, true, true);
    entry.insert(envelope::body::VALUES.to_string(), Value::Map(values));
    entry
}
