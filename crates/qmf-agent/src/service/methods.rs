//! Method invocation and the external-thread bridge.

use qmf_wire::{envelope, ConversionError, MessageBody, MethodStatus, OutboundMessage, Value, ValueMap};
use tracing::{error, trace};

use crate::domain::ObjectId;
use crate::service::core::{v2_headers, AgentInner, QueuedMethod};

/// How a method invocation resolved.
enum MethodOutcome {
    /// The host method returned `_status_code == 0`; carries the call's
    /// full output map.
    Ok(ValueMap),
    /// Any failure: status pair for the `_exception` envelope.
    Fail(u32, String),
}

impl AgentInner {
    /// Route an inbound method request: queue it for a host thread in
    /// external-thread mode (signaling outside the main lock), invoke
    /// inline otherwise.
    pub(crate) fn handle_method_request(&self, body: ValueMap, cid: &str, reply_to: &str) {
        trace!(cid, "Received method request");
        let mut state = self.state.lock();
        if !state.external_thread() {
            drop(state);
            self.invoke_method_request(&body, cid, reply_to);
            return;
        }

        state.method_queue.push_back(QueuedMethod {
            correlation_id: cid.to_string(),
            reply_to: reply_to.to_string(),
            body,
        });

        if let Some(pipe) = &state.pipe {
            pipe.signal();
        } else if let Some(notifiable) = state.notifiable.clone() {
            state.in_callback = true;
            drop(state);
            notifiable.notify();
            self.state.lock().in_callback = false;
        } else if let Some(callback) = state.callback.clone() {
            state.in_callback = true;
            drop(state);
            callback();
            self.state.lock().in_callback = false;
        }
    }

    /// Drain queued method requests on the calling host thread.
    pub(crate) fn poll_callbacks_impl(&self, limit: u32) -> u32 {
        let mut state = self.state.lock();
        if state.in_callback {
            error!("poll_callbacks invoked from within a signal callback");
            return 0;
        }

        let mut handled = 0u32;
        while limit == 0 || handled < limit {
            let Some(item) = state.method_queue.pop_front() else {
                break;
            };
            // The invocation itself runs with the main lock released;
            // the in_callback flag stops re-entrant polling meanwhile.
            state.in_callback = true;
            drop(state);
            self.invoke_method_request(&item.body, &item.correlation_id, &item.reply_to);
            state = self.state.lock();
            state.in_callback = false;
            handled += 1;
        }

        if let Some(pipe) = &state.pipe {
            pipe.drain();
        }
        state.method_queue.len() as u32
    }

    /// Decode, dispatch, and answer one method request.
    pub(crate) fn invoke_method_request(&self, body: &ValueMap, cid: &str, reply_to: &str) {
        let outcome = self.run_method(body);

        let mut out = ValueMap::new();
        let opcode = match outcome {
            MethodOutcome::Ok(call_map) => {
                let mut arguments = ValueMap::new();
                for (key, value) in call_map {
                    if key != envelope::body::STATUS_CODE && key != envelope::body::STATUS_TEXT {
                        arguments.insert(key, value);
                    }
                }
                out.insert(envelope::body::ARGUMENTS.to_string(), Value::Map(arguments));
                envelope::opcode::METHOD_RESPONSE
            }
            MethodOutcome::Fail(code, text) => {
                let mut values = ValueMap::new();
                values.insert(envelope::body::STATUS_CODE.to_string(), Value::from(code));
                values.insert(envelope::body::STATUS_TEXT.to_string(), Value::from(text));
                out.insert(envelope::body::VALUES.to_string(), Value::Map(values));
                envelope::opcode::EXCEPTION
            }
        };

        trace!(cid, opcode, "Sending method reply");
        let headers = v2_headers(envelope::header::METHOD_RESPONSE, opcode);
        self.supervisor.send(
            OutboundMessage::new(envelope::exchange::QMF_DIRECT, reply_to, MessageBody::Map(out))
                .with_correlation_id(cid)
                .with_headers(headers),
        );
    }

    fn run_method(&self, body: &ValueMap) -> MethodOutcome {
        let (Some(id_value), Some(name_value)) = (
            body.get(envelope::body::OBJECT_ID),
            body.get(envelope::body::METHOD_NAME),
        ) else {
            return MethodOutcome::Fail(
                MethodStatus::ParameterInvalid.code(),
                MethodStatus::ParameterInvalid.text().to_string(),
            );
        };

        let decoded: Result<(ObjectId, String, ValueMap), ConversionError> = (|| {
            let id = ObjectId::from_map(id_value.as_map()?)?;
            let name = name_value.as_str()?.to_string();
            let args = match body.get(envelope::body::ARGUMENTS) {
                Some(value) => value.as_map()?.clone(),
                None => ValueMap::new(),
            };
            Ok((id, name, args))
        })();
        let (id, name, args) = match decoded {
            Ok(parts) => parts,
            Err(e) => return MethodOutcome::Fail(MethodStatus::Exception.code(), e.to_string()),
        };

        let object = self.state.lock().objects.get(&id).cloned();
        let object = match object {
            Some(object) if !object.is_deleted() => object,
            _ => {
                return MethodOutcome::Fail(
                    MethodStatus::UnknownObject.code(),
                    MethodStatus::UnknownObject.text().to_string(),
                )
            }
        };

        // Host code runs without the main lock held.
        let mut call_map = ValueMap::new();
        object.do_method(&name, &args, &mut call_map);

        let status = match call_map.get(envelope::body::STATUS_CODE) {
            Some(value) => match value.as_u32() {
                Ok(code) => code,
                Err(e) => {
                    return MethodOutcome::Fail(MethodStatus::Exception.code(), e.to_string())
                }
            },
            None => {
                return MethodOutcome::Fail(
                    MethodStatus::Exception.code(),
                    "method set no _status_code".to_string(),
                )
            }
        };

        if status == MethodStatus::Ok.code() {
            MethodOutcome::Ok(call_map)
        } else {
            let text = call_map
                .get(envelope::body::STATUS_TEXT)
                .and_then(|v| v.as_str().ok())
                .unwrap_or_default()
                .to_string();
            MethodOutcome::Fail(status, text)
        }
    }
}
