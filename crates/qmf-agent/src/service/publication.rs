//! Periodic publication: data indications, reaping, heartbeats.

use std::time::Duration;

use qmf_wire::{envelope, MessageBody, OutboundMessage, Value, ValueList, ValueMap};
use tracing::trace;

use crate::domain::ObjectId;
use crate::service::core::{v2_headers, AgentInner, AgentState};

/// Publisher thread body: one pass, then nap in 1-second steps.
pub(crate) fn publisher_loop(inner: &AgentInner, interval_secs: u16) {
    while !inner.is_shut_down() {
        inner.periodic_processing();
        let mut slept = 0u16;
        while slept < interval_secs && !inner.is_shut_down() {
            std::thread::sleep(Duration::from_secs(1));
            slept += 1;
        }
    }
}

impl AgentInner {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::Acquire)
    }

    /// One publication pass over the live registry.
    ///
    /// Groups changed objects by class in id order, emits one data
    /// indication per non-empty group, reaps deleted objects at pass
    /// end, and finishes with a heartbeat.
    pub(crate) fn periodic_processing(&self) {
        let now = self.now();
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        self.move_staged_into_live(&mut state);

        let force_all = state.client_was_added;
        for object in state.objects.values() {
            object.set_flags(0);
            if force_all {
                object.set_force_publish(true);
            }
        }
        state.client_was_added = false;

        let ids: Vec<ObjectId> = state.objects.keys().cloned().collect();
        let mut reap: Vec<ObjectId> = Vec::new();

        for base_index in 0..ids.len() {
            let base = state.objects[&ids[base_index]].clone();
            if base.flags() != 0 {
                continue;
            }
            if !(base.config_changed()
                || base.inst_changed()
                || base.force_publish()
                || base.is_deleted())
            {
                continue;
            }

            let mut group = ValueList::new();
            for id in &ids[base_index..] {
                let object = state.objects[id].clone();
                if !base.is_same_class(object.as_ref()) || object.flags() != 0 {
                    continue;
                }
                object.set_flags(1);
                if object.config_changed() || object.inst_changed() {
                    object.set_update_time(now);
                }

                let send_props =
                    object.config_changed() || object.force_publish() || object.is_deleted();
                let send_stats =
                    object.has_inst() && (object.inst_changed() || object.force_publish());

                if send_props || send_stats {
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
                    object.map_encode_values(&mut values, send_props, send_stats);
                    entry.insert(envelope::body::VALUES.to_string(), Value::Map(values));
                    group.push(Value::Map(entry));
                }

                if object.is_deleted() {
                    reap.push(id.clone());
                }
                object.set_force_publish(false);
            }

            if !group.is_empty() {
                let mut headers = v2_headers(
                    envelope::header::METHOD_INDICATION,
                    envelope::opcode::DATA_INDICATION,
                );
                headers.insert(
                    envelope::header::QMF_CONTENT.to_string(),
                    Value::from(envelope::content::DATA),
                );
                trace!(
                    class = %base.class_name(),
                    count = group.len(),
                    "Publishing data indication"
                );
                self.supervisor.send(
                    OutboundMessage::new(
                        envelope::exchange::QMF_TOPIC,
                        envelope::routing::DATA,
                        MessageBody::List(group),
                    )
                    .with_content_type(envelope::CONTENT_TYPE_LIST)
                    .with_headers(headers),
                );
            }
        }

        for id in reap {
            state.objects.remove(&id);
        }

        self.send_heartbeat_locked(&state);
    }

    /// Heartbeat with the agent's attributes, interval, and epoch.
    pub(crate) fn send_heartbeat_locked(&self, state: &AgentState) {
        let mut body = ValueMap::new();
        body.insert(
            envelope::body::VALUES.to_string(),
            Value::Map(self.advertised_values(state)),
        );
        let headers = v2_headers(
            envelope::header::METHOD_INDICATION,
            envelope::opcode::AGENT_HEARTBEAT_INDICATION,
        );
        self.supervisor.send(
            OutboundMessage::new(
                envelope::exchange::QMF_TOPIC,
                envelope::routing::HEARTBEAT,
                MessageBody::Map(body),
            )
            .with_headers(headers),
        );
        trace!(address = %state.name.address(), "Sent agent heartbeat");
    }

    /// Transition into the operational state after a successful
    /// subscribe: mark connected, restore any bank binding, announce.
    pub(crate) fn on_connected(&self, supervisor: &super::supervisor::ConnectionSupervisor) {
        let banks = {
            let mut state = self.state.lock();
            state.connected = true;
            (
                state.identity.assigned_broker_bank,
                state.identity.assigned_agent_bank,
            )
        };
        if banks != (0, 0) {
            supervisor.bind_to_bank(banks.0, banks.1);
        }
        let state = self.state.lock();
        self.send_heartbeat_locked(&state);
    }

    pub(crate) fn on_disconnected(&self) {
        self.state.lock().connected = false;
    }
}
