//! Deterministic test doubles.
//!
//! Collected here so unit tests, the integration suite, and host crates
//! embedding the agent all script against the same fixtures: a pinned
//! clock, an in-memory recording broker, and a fully scriptable managed
//! object.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use qmf_wire::{InboundMessage, MessageBody, OutboundMessage, Value, ValueMap};

use crate::domain::{ConnectionSettings, ObjectId, Severity, Timestamp};
use crate::ports::inbound::MessageListener;
use crate::ports::outbound::{
    BrokerSession, BrokerTransport, ManagementEvent, ManagementObject, QueueOptions, Subscription,
    TimeSource, TransportError,
};

/// A time source pinned to one instant.
#[derive(Debug, Clone)]
pub struct FixedTimeSource {
    nanos: u64,
}

impl FixedTimeSource {
    pub fn new(nanos: u64) -> Self {
        FixedTimeSource { nanos }
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.nanos)
    }
}

#[derive(Default)]
struct BrokerShared {
    sent: Vec<OutboundMessage>,
    inbox: VecDeque<InboundMessage>,
    binds: Vec<(String, String, String)>,
    declared_queues: Vec<String>,
    stop_requested: bool,
    fail_connects: u32,
    fail_transfers: u32,
}

struct BrokerCore {
    shared: Mutex<BrokerShared>,
    activity: Condvar,
    connects: AtomicU32,
    subscription_runs: AtomicU32,
}

/// An in-memory broker: records everything the agent sends, lets tests
/// inject inbound messages, and can be scripted to fail connects or
/// transfers.
pub struct RecordingBroker {
    core: Arc<BrokerCore>,
}

impl Clone for RecordingBroker {
    fn clone(&self) -> Self {
        RecordingBroker {
            core: Arc::clone(&self.core),
        }
    }
}

impl RecordingBroker {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        RecordingBroker {
            core: Arc::new(BrokerCore {
                shared: Mutex::new(BrokerShared::default()),
                activity: Condvar::new(),
                connects: AtomicU32::new(0),
                subscription_runs: AtomicU32::new(0),
            }),
        }
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.core.shared.lock().fail_connects = n;
    }

    /// Fail the next `n` message transfers (each failure bounces the
    /// agent's connection).
    pub fn fail_next_transfers(&self, n: u32) {
        self.core.shared.lock().fail_transfers = n;
    }

    pub fn connect_count(&self) -> u32 {
        self.core.connects.load(Ordering::Acquire)
    }

    pub fn subscription_run_count(&self) -> u32 {
        self.core.subscription_runs.load(Ordering::Acquire)
    }

    /// Deliver a message to the agent's queue.
    pub fn inject(&self, message: InboundMessage) {
        let mut shared = self.core.shared.lock();
        shared.inbox.push_back(message);
        self.core.activity.notify_all();
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.core.shared.lock().sent.clone()
    }

    /// Drain the sent log, so later assertions start from a clean slate.
    pub fn take_sent(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.core.shared.lock().sent)
    }

    pub fn binds(&self) -> Vec<(String, String, String)> {
        self.core.shared.lock().binds.clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.core.shared.lock().declared_queues.clone()
    }

    /// Block until a sent message matches `pred`, returning it.
    pub fn wait_for_message<F>(&self, timeout: Duration, pred: F) -> Option<OutboundMessage>
    where
        F: Fn(&OutboundMessage) -> bool,
    {
        let deadline = std::time::Instant::now() + timeout;
        let mut shared = self.core.shared.lock();
        loop {
            if let Some(found) = shared.sent.iter().find(|m| pred(m)) {
                return Some(found.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            self.core.activity.wait_for(&mut shared, deadline - now);
        }
    }

    /// Block until at least `count` messages matching `pred` were sent.
    pub fn wait_for_count<F>(&self, timeout: Duration, count: usize, pred: F) -> bool
    where
        F: Fn(&OutboundMessage) -> bool,
    {
        let deadline = std::time::Instant::now() + timeout;
        let mut shared = self.core.shared.lock();
        loop {
            if shared.sent.iter().filter(|m| pred(m)).count() >= count {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            self.core.activity.wait_for(&mut shared, deadline - now);
        }
    }
}

impl BrokerTransport for RecordingBroker {
    fn connect(
        &self,
        _settings: &ConnectionSettings,
        _session_name: &str,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        self.core.connects.fetch_add(1, Ordering::AcqRel);
        let mut shared = self.core.shared.lock();
        if shared.fail_connects > 0 {
            shared.fail_connects -= 1;
            return Err(TransportError::ConnectFailed(
                "scripted connect failure".to_string(),
            ));
        }
        Ok(Box::new(RecordingSession {
            core: Arc::clone(&self.core),
        }))
    }
}

struct RecordingSession {
    core: Arc<BrokerCore>,
}

impl BrokerSession for RecordingSession {
    fn queue_declare(&self, queue: &str, _options: &QueueOptions) -> Result<(), TransportError> {
        self.core.shared.lock().declared_queues.push(queue.to_string());
        Ok(())
    }

    fn exchange_bind(
        &self,
        exchange: &str,
        queue: &str,
        binding_key: &str,
    ) -> Result<(), TransportError> {
        self.core.shared.lock().binds.push((
            exchange.to_string(),
            queue.to_string(),
            binding_key.to_string(),
        ));
        Ok(())
    }

    fn transfer(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let mut shared = self.core.shared.lock();
        if shared.fail_transfers > 0 {
            shared.fail_transfers -= 1;
            return Err(TransportError::TransferFailed(
                "scripted transfer failure".to_string(),
            ));
        }
        shared.sent.push(message);
        self.core.activity.notify_all();
        Ok(())
    }

    fn subscribe(&self, _queue: &str) -> Result<Box<dyn Subscription>, TransportError> {
        Ok(Box::new(RecordingSubscription {
            core: Arc::clone(&self.core),
        }))
    }

    fn close(&self) {}
}

struct RecordingSubscription {
    core: Arc<BrokerCore>,
}

impl Subscription for RecordingSubscription {
    fn run(&self, listener: &dyn MessageListener) -> Result<(), TransportError> {
        self.core.subscription_runs.fetch_add(1, Ordering::AcqRel);
        {
            // A stop aimed at a previous run must not end this one.
            self.core.shared.lock().stop_requested = false;
        }
        loop {
            let message = {
                let mut shared = self.core.shared.lock();
                loop {
                    if shared.stop_requested {
                        shared.stop_requested = false;
                        return Ok(());
                    }
                    if let Some(message) = shared.inbox.pop_front() {
                        break message;
                    }
                    self.core.activity.wait(&mut shared);
                }
            };
            listener.received(message);
        }
    }

    fn stop(&self) {
        let mut shared = self.core.shared.lock();
        shared.stop_requested = true;
        self.core.activity.notify_all();
    }
}

/// A scriptable managed object.
///
/// Dirty bits, flags, and force-publish all live in atomics so the agent
/// can drive them through `&self`; encoding properties or statistics
/// clears the corresponding dirty bit, as real generated objects do.
pub struct TestObject {
    package: String,
    class: String,
    hash: [u8; 16],
    auto_key: String,
    has_inst: bool,
    id: Mutex<Option<ObjectId>>,
    properties: Mutex<ValueMap>,
    statistics: Mutex<ValueMap>,
    config_changed: AtomicBool,
    inst_changed: AtomicBool,
    deleted: AtomicBool,
    flags: AtomicU8,
    force: AtomicBool,
    update_time: Mutex<Timestamp>,
    #[allow(clippy::type_complexity)]
    method_handler: Mutex<Option<Arc<dyn Fn(&str, &ValueMap, &mut ValueMap) + Send + Sync>>>,
}

impl TestObject {
    fn build(package: &str, class: &str, hash: [u8; 16], has_inst: bool) -> Arc<Self> {
        Arc::new(TestObject {
            package: package.to_string(),
            class: class.to_string(),
            hash,
            auto_key: format!("{}:{}", package, class),
            has_inst,
            id: Mutex::new(None),
            properties: Mutex::new(ValueMap::new()),
            statistics: Mutex::new(ValueMap::new()),
            // Fresh objects carry unpublished properties.
            config_changed: AtomicBool::new(true),
            inst_changed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            flags: AtomicU8::new(0),
            force: AtomicBool::new(false),
            update_time: Mutex::new(Timestamp::default()),
            method_handler: Mutex::new(None),
        })
    }

    pub fn new(package: &str, class: &str, hash: [u8; 16]) -> Arc<Self> {
        Self::build(package, class, hash, false)
    }

    /// Same as [`new`](Self::new) but carrying statistics.
    pub fn with_statistics(package: &str, class: &str, hash: [u8; 16]) -> Arc<Self> {
        Self::build(package, class, hash, true)
    }

    pub fn set_property(&self, key: &str, value: Value) {
        self.properties.lock().insert(key.to_string(), value);
        self.config_changed.store(true, Ordering::Release);
    }

    pub fn set_statistic(&self, key: &str, value: Value) {
        self.statistics.lock().insert(key.to_string(), value);
        self.inst_changed.store(true, Ordering::Release);
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn on_method<F>(&self, handler: F)
    where
        F: Fn(&str, &ValueMap, &mut ValueMap) + Send + Sync + 'static,
    {
        *self.method_handler.lock() = Some(Arc::new(handler));
    }

    pub fn update_time(&self) -> Timestamp {
        *self.update_time.lock()
    }
}

impl ManagementObject for TestObject {
    fn package_name(&self) -> String {
        self.package.clone()
    }

    fn class_name(&self) -> String {
        self.class.clone()
    }

    fn schema_hash(&self) -> [u8; 16] {
        self.hash
    }

    fn object_id(&self) -> Option<ObjectId> {
        self.id.lock().clone()
    }

    fn set_object_id(&self, id: ObjectId) {
        *self.id.lock() = Some(id);
    }

    fn v2_key(&self) -> String {
        self.auto_key.clone()
    }

    fn config_changed(&self) -> bool {
        self.config_changed.load(Ordering::Acquire)
    }

    fn inst_changed(&self) -> bool {
        self.inst_changed.load(Ordering::Acquire)
    }

    fn has_inst(&self) -> bool {
        self.has_inst
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn set_update_time(&self, at: Timestamp) {
        *self.update_time.lock() = at;
    }

    fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    fn set_flags(&self, flags: u8) {
        self.flags.store(flags, Ordering::Release);
    }

    fn force_publish(&self) -> bool {
        self.force.load(Ordering::Acquire)
    }

    fn set_force_publish(&self, force: bool) {
        self.force.store(force, Ordering::Release);
    }

    fn map_encode_values(&self, out: &mut ValueMap, props: bool, stats: bool) {
        if props {
            for (key, value) in self.properties.lock().iter() {
                out.insert(key.clone(), value.clone());
            }
            self.config_changed.store(false, Ordering::Release);
        }
        if stats {
            for (key, value) in self.statistics.lock().iter() {
                out.insert(key.clone(), value.clone());
            }
            self.inst_changed.store(false, Ordering::Release);
        }
    }

    fn write_timestamps(&self, out: &mut ValueMap) {
        out.insert(
            "_update_ts".to_string(),
            Value::from(*self.update_time.lock()),
        );
    }

    fn do_method(&self, name: &str, in_args: &ValueMap, out: &mut ValueMap) {
        let handler = self.method_handler.lock().clone();
        match handler {
            Some(handler) => handler(name, in_args, out),
            None => {
                out.insert(
                    "_status_code".to_string(),
                    Value::from(qmf_wire::MethodStatus::UnknownMethod.code()),
                );
                out.insert(
                    "_status_text".to_string(),
                    Value::from(qmf_wire::MethodStatus::UnknownMethod.text()),
                );
            }
        }
    }
}

/// A scriptable management event.
pub struct TestEvent {
    pub package: String,
    pub name: String,
    pub hash: [u8; 16],
    pub severity: Severity,
    pub values: ValueMap,
}

impl ManagementEvent for TestEvent {
    fn package_name(&self) -> String {
        self.package.clone()
    }

    fn event_name(&self) -> String {
        self.name.clone()
    }

    fn schema_hash(&self) -> [u8; 16] {
        self.hash
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn map_encode(&self, out: &mut ValueMap) {
        for (key, value) in &self.values {
            out.insert(key.clone(), value.clone());
        }
    }
}

/// Build a QMFv2 request as the broker would deliver it.
pub fn v2_request(opcode: &str, body: ValueMap, cid: &str, reply_to: &str) -> InboundMessage {
    let mut headers = ValueMap::new();
    headers.insert("qmf.opcode".to_string(), Value::from(opcode));
    InboundMessage {
        app_id: Some("qmf2".to_string()),
        correlation_id: if cid.is_empty() {
            None
        } else {
            Some(cid.to_string())
        },
        reply_to: Some(reply_to.to_string()),
        headers,
        body: MessageBody::Map(body),
    }
}

/// Build a legacy binary frame as the broker would deliver it.
pub fn v1_frame(frame: bytes::Bytes, reply_to: &str) -> InboundMessage {
    InboundMessage {
        app_id: None,
        correlation_id: None,
        reply_to: Some(reply_to.to_string()),
        headers: ValueMap::new(),
        body: MessageBody::Raw(frame),
    }
}
