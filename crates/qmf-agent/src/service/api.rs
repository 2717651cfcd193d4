//! The management API offered to the host.

use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use qmf_wire::{envelope, framing, MessageBody, OutboundMessage, V1Opcode, Value, ValueMap};
use tracing::{error, trace};

use crate::adapters::SignalPipe;
use crate::domain::{ObjectId, SchemaClassKey, SchemaKind, SchemaWriter, Severity};
use crate::ports::inbound::ManagementAgentApi;
use crate::ports::outbound::{ManagementEvent, ManagementObject, Notifiable};
use crate::service::core::{v2_headers, ManagementAgent};

impl ManagementAgent {
    /// Shared by class and event registration: idempotent insert, with a
    /// package indication when a package first appears while connected.
    fn register_schema(
        &self,
        package: &str,
        name: &str,
        hash: [u8; 16],
        kind: SchemaKind,
        write_schema: SchemaWriter,
    ) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let new_package =
            state
                .schemas
                .register(package, SchemaClassKey::new(name, hash), kind, write_schema);
        if new_package && state.connected {
            let mut frame = BytesMut::new();
            framing::encode_header(&mut frame, V1Opcode::PackageIndication as u8, 0);
            framing::put_short_string(&mut frame, package);
            self.inner.supervisor.send(OutboundMessage::new(
                envelope::exchange::MANAGEMENT,
                envelope::routing::SCHEMA_PACKAGE,
                MessageBody::Raw(frame.freeze()),
            ));
            trace!(package, "Sent package indication");
        }
    }
}

impl ManagementAgentApi for ManagementAgent {
    fn register_class(
        &self,
        package: &str,
        class: &str,
        hash: [u8; 16],
        write_schema: SchemaWriter,
    ) {
        self.register_schema(package, class, hash, SchemaKind::Table, write_schema);
    }

    fn register_event(
        &self,
        package: &str,
        event: &str,
        hash: [u8; 16],
        write_schema: SchemaWriter,
    ) {
        self.register_schema(package, event, hash, SchemaKind::Event, write_schema);
    }

    fn add_object(
        &self,
        object: Arc<dyn ManagementObject>,
        key: &str,
        persistent: bool,
    ) -> ObjectId {
        let mut staged = self.inner.staged.lock();

        let epoch = if persistent {
            0
        } else {
            self.inner.boot_epoch.load(Ordering::Acquire)
        };
        let key = if key.is_empty() {
            object.v2_key()
        } else {
            key.to_string()
        };

        let id = ObjectId::new(epoch, key);
        object.set_object_id(id.clone());
        staged.insert(id.clone(), object);
        id
    }

    fn raise_event(&self, event: &dyn ManagementEvent, severity: Option<Severity>) {
        let state = self.inner.state.lock();
        let level = severity.unwrap_or_else(|| event.severity()).level();
        let key = format!(
            "console.event.{}.{}.{}.{}",
            state.identity.assigned_broker_bank,
            state.identity.assigned_agent_bank,
            event.package_name(),
            event.event_name()
        );

        let mut body = ValueMap::new();
        body.insert(
            envelope::body::SCHEMA_ID.to_string(),
            Value::Map(envelope::schema_id(
                &event.package_name(),
                &event.event_name(),
                &event.schema_hash(),
            )),
        );
        let mut values = ValueMap::new();
        event.map_encode(&mut values);
        body.insert(envelope::body::VALUES.to_string(), Value::Map(values));
        body.insert(
            envelope::body::TIMESTAMP.to_string(),
            Value::from(self.inner.now()),
        );
        body.insert(
            envelope::body::SEVERITY.to_string(),
            Value::U64(u64::from(level)),
        );

        let mut headers = v2_headers(
            envelope::header::METHOD_INDICATION,
            envelope::opcode::DATA_INDICATION,
        );
        headers.insert(
            envelope::header::QMF_CONTENT.to_string(),
            Value::from(envelope::content::EVENT),
        );
        self.inner.supervisor.send(
            OutboundMessage::new(envelope::exchange::QMF_TOPIC, &key, MessageBody::Map(body))
                .with_headers(headers),
        );
        trace!(event = %event.event_name(), severity = level, "Raised event");
    }

    fn poll_callbacks(&self, limit: u32) -> u32 {
        self.inner.poll_callbacks_impl(limit)
    }

    fn signal_fd(&self) -> Option<RawFd> {
        let mut state = self.inner.state.lock();
        if !state.external_thread() {
            return None;
        }
        if state.pipe.is_none() {
            match SignalPipe::new() {
                Ok(pipe) => state.pipe = Some(pipe),
                Err(e) => {
                    error!(error = %e, "Failed to create signal pipe");
                    return None;
                }
            }
        }
        state.pipe.as_ref().map(SignalPipe::read_fd)
    }

    fn set_signal_notifiable(&self, notifiable: Arc<dyn Notifiable>) {
        self.inner.state.lock().notifiable = Some(notifiable);
    }

    fn set_signal_callback(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.inner.state.lock().callback = Some(callback);
    }

    fn shutdown(&self) {
        self.shutdown_impl();
    }
}
