//! Service-level tests driven through the recording broker, with
//! publication passes invoked directly for determinism.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use qmf_wire::{envelope, framing, MessageBody, OutboundMessage, Value, ValueList, ValueMap};

use crate::domain::{AgentConfig, AgentName, ConnectionSettings};
use crate::ports::inbound::{ManagementAgentApi, MessageListener};
use crate::ports::outbound::{ManagementObject, Notifiable};
use crate::service::ManagementAgent;
use crate::testing::{v1_frame, v2_request, FixedTimeSource, RecordingBroker, TestEvent, TestObject};

const NOW: u64 = 1_700_000_000_000_000_000;
const EPOCH: u16 = 6;

fn harness(external_thread: bool) -> (Arc<ManagementAgent>, RecordingBroker) {
    let broker = RecordingBroker::new();
    let agent = Arc::new(ManagementAgent::with_time_source(
        Arc::new(broker.clone()),
        Arc::new(FixedTimeSource::new(NOW)),
    ));
    {
        let mut state = agent.inner.state.lock();
        let mut config = AgentConfig::for_testing();
        config.external_thread = external_thread;
        state.name = AgentName::new("test-vendor", "test-product", "test-instance");
        state.identity.boot_sequence = EPOCH;
        state.config = Some(config);
        state.connected = true;
        state.client_was_added = false;
    }
    agent
        .inner
        .boot_epoch
        .store(EPOCH, Ordering::Release);
    agent
        .inner
        .supervisor
        .connect_for_tests(&agent.inner, &ConnectionSettings::default());
    (agent, broker)
}

fn opcode_of(message: &OutboundMessage) -> &str {
    message
        .headers
        .get(envelope::header::QMF_OPCODE)
        .and_then(|v| v.as_str().ok())
        .unwrap_or_default()
}

fn map_body(message: &OutboundMessage) -> &ValueMap {
    match &message.body {
        MessageBody::Map(map) => map,
        other => panic!("expected map body, got {:?}", other),
    }
}

fn list_body(message: &OutboundMessage) -> &ValueList {
    match &message.body {
        MessageBody::List(list) => list,
        other => panic!("expected list body, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Publication
// ---------------------------------------------------------------------------

#[test]
fn test_staged_object_lands_in_live_exactly_once() {
    let (agent, broker) = harness(false);
    let object = TestObject::new("pkg", "C", [1; 16]);
    let id = agent.add_object(object, "k1", false);

    assert_eq!(agent.inner.state.lock().objects.len(), 0);
    agent.inner.periodic_processing();

    let state = agent.inner.state.lock();
    assert_eq!(state.objects.len(), 1);
    assert!(state.objects.contains_key(&id));
    drop(state);

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::DATA_INDICATION);
    assert_eq!(sent[0].exchange, envelope::exchange::QMF_TOPIC);
    assert_eq!(sent[0].routing_key, envelope::routing::DATA);
    assert_eq!(
        sent[0].content_type.as_deref(),
        Some(envelope::CONTENT_TYPE_LIST)
    );
    let entries = list_body(&sent[0]);
    assert_eq!(entries.len(), 1);
    let entry = entries[0].as_map().unwrap();
    assert_eq!(
        entry[envelope::body::OBJECT_ID].as_map().unwrap()["_object_name"],
        Value::from("k1")
    );
    assert_eq!(
        entry[envelope::body::OBJECT_ID].as_map().unwrap()["_agent_epoch"],
        Value::from(u64::from(EPOCH))
    );

    // A quiescent second pass publishes nothing but still heartbeats.
    agent.inner.periodic_processing();
    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        opcode_of(&sent[0]),
        envelope::opcode::AGENT_HEARTBEAT_INDICATION
    );
}

#[test]
fn test_epoch_zero_iff_persistent() {
    let (agent, _broker) = harness(false);
    let persistent = agent.add_object(TestObject::new("pkg", "C", [1; 16]), "p", true);
    let transient = agent.add_object(TestObject::new("pkg", "C", [1; 16]), "t", false);
    assert_eq!(persistent.agent_epoch(), 0);
    assert_eq!(transient.agent_epoch(), EPOCH);
}

#[test]
fn test_empty_key_uses_object_derived_key() {
    let (agent, _broker) = harness(false);
    let object = TestObject::new("pkg", "C", [1; 16]);
    let id = agent.add_object(Arc::clone(&object) as _, "", false);
    assert_eq!(id.object_name(), "pkg:C");
    // The id is stored back into the object.
    assert_eq!(object.object_id(), Some(id));
}

#[test]
fn test_deleted_object_gets_final_indication_then_reaped() {
    let (agent, broker) = harness(false);
    let object = TestObject::new("pkg", "C", [1; 16]);
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    object.mark_deleted();
    agent.inner.periodic_processing();

    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::DATA_INDICATION);
    assert_eq!(list_body(&sent[0]).len(), 1);
    assert!(!agent.inner.state.lock().objects.contains_key(&id));

    // Reaped for good: the next pass has nothing left to say.
    agent.inner.periodic_processing();
    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        opcode_of(&sent[0]),
        envelope::opcode::AGENT_HEARTBEAT_INDICATION
    );
}

#[test]
fn test_publication_groups_by_class() {
    let (agent, broker) = harness(false);
    agent.add_object(TestObject::new("pkg", "A", [1; 16]), "a1", false);
    agent.add_object(TestObject::new("pkg", "A", [1; 16]), "a2", false);
    agent.add_object(TestObject::new("pkg", "B", [2; 16]), "b1", false);

    agent.inner.periodic_processing();
    let sent = broker.take_sent();

    let indications: Vec<_> = sent
        .iter()
        .filter(|m| opcode_of(m) == envelope::opcode::DATA_INDICATION)
        .collect();
    assert_eq!(indications.len(), 2);
    assert_eq!(list_body(indications[0]).len(), 2);
    assert_eq!(list_body(indications[1]).len(), 1);
}

#[test]
fn test_unchanged_objects_are_not_published() {
    let (agent, broker) = harness(false);
    let quiet = TestObject::new("pkg", "A", [1; 16]);
    let noisy = TestObject::new("pkg", "A", [1; 16]);
    agent.add_object(Arc::clone(&quiet) as _, "quiet", false);
    agent.add_object(Arc::clone(&noisy) as _, "noisy", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    noisy.set_property("count", Value::from(3u64));
    agent.inner.periodic_processing();

    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::DATA_INDICATION);
    let entries = list_body(&sent[0]);
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].as_map().unwrap()[envelope::body::VALUES].as_map().unwrap()["count"],
        Value::from(3u64)
    );
}

#[test]
fn test_statistics_only_update_emits_stats() {
    let (agent, broker) = harness(false);
    let object = TestObject::with_statistics("pkg", "A", [1; 16]);
    agent.add_object(Arc::clone(&object) as _, "s1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    object.set_statistic("rate", Value::from(99u64));
    agent.inner.periodic_processing();

    let sent = broker.take_sent();
    let entries = list_body(&sent[0]);
    let values = entries[0].as_map().unwrap()[envelope::body::VALUES]
        .as_map()
        .unwrap();
    assert_eq!(values["rate"], Value::from(99u64));
    // Update time was stamped with the pinned clock.
    assert_eq!(object.update_time().as_nanos(), NOW);
}

#[test]
fn test_heartbeat_carries_attributes_interval_and_epoch() {
    let (agent, broker) = harness(false);
    agent.inner.periodic_processing();

    let sent = broker.take_sent();
    assert_eq!(
        opcode_of(&sent[0]),
        envelope::opcode::AGENT_HEARTBEAT_INDICATION
    );
    assert_eq!(sent[0].exchange, envelope::exchange::QMF_TOPIC);
    assert_eq!(sent[0].routing_key, envelope::routing::HEARTBEAT);
    let values = map_body(&sent[0])[envelope::body::VALUES].as_map().unwrap();
    assert_eq!(values["_name"], Value::from("test-vendor:test-product:test-instance"));
    assert_eq!(values["heartbeat_interval"], Value::from(1u64));
    assert_eq!(values["epoch"], Value::from(u64::from(EPOCH)));
    assert_eq!(values["timestamp"], Value::U64(NOW));
}

#[test]
fn test_no_publication_while_disconnected() {
    let (agent, broker) = harness(false);
    agent.add_object(TestObject::new("pkg", "C", [1; 16]), "k1", false);
    agent.inner.state.lock().connected = false;

    agent.inner.periodic_processing();
    assert!(broker.take_sent().is_empty());
    // Staged objects stay staged until a pass or query runs connected.
    assert_eq!(agent.inner.staged.lock().len(), 1);
}

#[test]
fn test_locate_request_forces_full_republish() {
    let (agent, broker) = harness(false);
    let object = TestObject::new("pkg", "C", [1; 16]);
    agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    let mut body = ValueMap::new();
    body.insert("_what".to_string(), Value::from("OBJECT"));
    agent.inner.received(v2_request(
        envelope::opcode::AGENT_LOCATE_REQUEST,
        body,
        "cid-locate",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::AGENT_LOCATE_RESPONSE);
    assert_eq!(sent[0].exchange, envelope::exchange::QMF_DIRECT);
    assert_eq!(sent[0].routing_key, "console-reply");
    assert_eq!(sent[0].correlation_id.as_deref(), Some("cid-locate"));

    // The otherwise-quiescent object is republished on the next pass.
    agent.inner.periodic_processing();
    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::DATA_INDICATION);
    assert_eq!(list_body(&sent[0]).len(), 1);
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn object_query(id_map: Option<ValueMap>, class: Option<&str>) -> ValueMap {
    let mut body = ValueMap::new();
    body.insert("_what".to_string(), Value::from("OBJECT"));
    if let Some(id_map) = id_map {
        body.insert("_object_id".to_string(), Value::Map(id_map));
    }
    if let Some(class) = class {
        let mut schema_id = ValueMap::new();
        schema_id.insert("_class_name".to_string(), Value::from(class));
        body.insert("_schema_id".to_string(), Value::Map(schema_id));
    }
    body
}

#[test]
fn test_query_by_object_id_sends_single_response_and_no_terminator() {
    let (agent, broker) = harness(false);
    let id = agent.add_object(TestObject::new("pkg", "C", [1; 16]), "k1", false);

    agent.inner.received(v2_request(
        envelope::opcode::QUERY_REQUEST,
        object_query(Some(id.map_encode()), None),
        "cid-1",
        "console-reply",
    ));

    let sent = broker.take_sent();
    // The found-by-id path answers once, non-partial, with no
    // command-complete marker afterward.
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::QUERY_RESPONSE);
    assert!(!sent[0].headers.contains_key(envelope::header::PARTIAL));
    assert_eq!(list_body(&sent[0]).len(), 1);
    assert_eq!(sent[0].correlation_id.as_deref(), Some("cid-1"));
}

#[test]
fn test_query_by_unknown_id_sends_bare_terminator() {
    let (agent, broker) = harness(false);
    agent.add_object(TestObject::new("pkg", "C", [1; 16]), "k1", false);

    let mut unknown = ValueMap::new();
    unknown.insert("_object_name".to_string(), Value::from("nope"));
    unknown.insert("_agent_epoch".to_string(), Value::from(u64::from(EPOCH)));
    agent.inner.received(v2_request(
        envelope::opcode::QUERY_REQUEST,
        object_query(Some(unknown), None),
        "cid-2",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::QUERY_RESPONSE);
    assert!(!sent[0].headers.contains_key(envelope::header::PARTIAL));
    assert!(list_body(&sent[0]).is_empty());
}

#[test]
fn test_query_by_class_streams_partials_then_terminates() {
    let (agent, broker) = harness(false);
    agent.add_object(TestObject::new("pkg", "C", [1; 16]), "k1", false);
    agent.add_object(TestObject::new("pkg", "C", [1; 16]), "k2", false);
    agent.add_object(TestObject::new("pkg", "D", [2; 16]), "other", false);

    agent.inner.received(v2_request(
        envelope::opcode::QUERY_REQUEST,
        object_query(None, Some("C")),
        "cid-3",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 3);
    for partial in &sent[..2] {
        assert!(partial.headers.contains_key(envelope::header::PARTIAL));
        assert_eq!(list_body(partial).len(), 1);
    }
    let terminator = &sent[2];
    assert!(!terminator.headers.contains_key(envelope::header::PARTIAL));
    assert!(list_body(terminator).is_empty());
}

#[test]
fn test_query_merges_staged_objects_first() {
    let (agent, broker) = harness(false);
    agent.add_object(TestObject::new("pkg", "C", [1; 16]), "k1", false);

    // No publication pass has run, yet the query sees the object.
    agent.inner.received(v2_request(
        envelope::opcode::QUERY_REQUEST,
        object_query(None, Some("C")),
        "cid-4",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(list_body(&sent[0]).len(), 1);
    assert_eq!(agent.inner.state.lock().objects.len(), 1);
}

#[test]
fn test_query_for_unsupported_what_is_an_exception() {
    let (agent, broker) = harness(false);
    let mut body = ValueMap::new();
    body.insert("_what".to_string(), Value::from("SCHEMA"));
    agent.inner.received(v2_request(
        envelope::opcode::QUERY_REQUEST,
        body,
        "cid-5",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::EXCEPTION);
    let values = map_body(&sent[0])[envelope::body::VALUES].as_map().unwrap();
    assert!(values["error_text"]
        .as_str()
        .unwrap()
        .contains("'SCHEMA' not supported"));
}

#[test]
fn test_query_with_missing_what_is_an_exception() {
    let (agent, broker) = harness(false);
    agent.inner.received(v2_request(
        envelope::opcode::QUERY_REQUEST,
        ValueMap::new(),
        "cid-6",
        "console-reply",
    ));
    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::EXCEPTION);
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

fn method_request(id: &crate::domain::ObjectId, method: &str, args: Option<ValueMap>) -> ValueMap {
    let mut body = ValueMap::new();
    body.insert("_object_id".to_string(), Value::Map(id.map_encode()));
    body.insert("_method_name".to_string(), Value::from(method));
    if let Some(args) = args {
        body.insert("_arguments".to_string(), Value::Map(args));
    }
    body
}

#[test]
fn test_method_success_returns_arguments() {
    let (agent, broker) = harness(false);
    let object = TestObject::new("pkg", "C", [1; 16]);
    object.on_method(|name, _args, out| {
        assert_eq!(name, "ping");
        out.insert("_status_code".to_string(), Value::from(0u64));
        out.insert("echo".to_string(), Value::from("pong"));
    });
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&id, "ping", Some(ValueMap::new())),
        "cid-m1",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::METHOD_RESPONSE);
    assert_eq!(sent[0].correlation_id.as_deref(), Some("cid-m1"));
    let args = map_body(&sent[0])[envelope::body::ARGUMENTS].as_map().unwrap();
    assert_eq!(args["echo"], Value::from("pong"));
    assert!(!args.contains_key("_status_code"));
}

#[test]
fn test_method_on_unknown_object_is_unknown_object_exception() {
    let (agent, broker) = harness(false);
    let ghost = crate::domain::ObjectId::new(EPOCH, "ghost");
    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&ghost, "ping", None),
        "cid-m2",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::EXCEPTION);
    let values = map_body(&sent[0])[envelope::body::VALUES].as_map().unwrap();
    assert_eq!(values["_status_code"], Value::from(1u64));
    assert_eq!(values["_status_text"], Value::from("UnknownObject"));
}

#[test]
fn test_method_on_deleted_object_is_unknown_object() {
    let (agent, broker) = harness(false);
    let object = TestObject::new("pkg", "C", [1; 16]);
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();
    object.mark_deleted();

    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&id, "ping", None),
        "cid-m3",
        "console-reply",
    ));
    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::EXCEPTION);
    let values = map_body(&sent[0])[envelope::body::VALUES].as_map().unwrap();
    assert_eq!(values["_status_code"], Value::from(1u64));
}

#[test]
fn test_method_with_missing_keys_is_parameter_invalid() {
    let (agent, broker) = harness(false);
    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        ValueMap::new(),
        "cid-m4",
        "console-reply",
    ));
    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::EXCEPTION);
    let values = map_body(&sent[0])[envelope::body::VALUES].as_map().unwrap();
    assert_eq!(values["_status_code"], Value::from(4u64));
}

#[test]
fn test_method_with_malformed_object_id_is_exception() {
    let (agent, broker) = harness(false);
    let mut body = ValueMap::new();
    body.insert("_object_id".to_string(), Value::from("not-a-map"));
    body.insert("_method_name".to_string(), Value::from("ping"));
    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        body,
        "cid-m5",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::EXCEPTION);
    let values = map_body(&sent[0])[envelope::body::VALUES].as_map().unwrap();
    assert_eq!(values["_status_code"], Value::from(7u64));
    assert!(values["_status_text"].as_str().unwrap().contains("expected map"));
}

#[test]
fn test_method_failure_status_copies_into_values() {
    let (agent, broker) = harness(false);
    let object = TestObject::new("pkg", "C", [1; 16]);
    object.on_method(|_, _, out| {
        out.insert("_status_code".to_string(), Value::from(6u64));
        out.insert("_status_text".to_string(), Value::from("Forbidden"));
    });
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&id, "stop", None),
        "cid-m6",
        "console-reply",
    ));
    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::EXCEPTION);
    let values = map_body(&sent[0])[envelope::body::VALUES].as_map().unwrap();
    assert_eq!(values["_status_code"], Value::from(6u64));
    assert_eq!(values["_status_text"], Value::from("Forbidden"));
}

// ---------------------------------------------------------------------------
// External-thread bridge
// ---------------------------------------------------------------------------

#[test]
fn test_external_thread_queues_and_poll_invokes() {
    let (agent, broker) = harness(true);
    let object = TestObject::new("pkg", "C", [1; 16]);
    object.on_method(|_, _, out| {
        out.insert("_status_code".to_string(), Value::from(0u64));
    });
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&id, "ping", None),
        "cid-x1",
        "console-reply",
    ));

    // Queued, not invoked.
    assert!(broker.take_sent().is_empty());
    assert_eq!(agent.inner.state.lock().method_queue.len(), 1);

    let remaining = agent.poll_callbacks(0);
    assert_eq!(remaining, 0);
    let sent = broker.take_sent();
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::METHOD_RESPONSE);
}

#[test]
fn test_poll_limit_leaves_the_rest_queued() {
    let (agent, broker) = harness(true);
    let object = TestObject::new("pkg", "C", [1; 16]);
    object.on_method(|_, _, out| {
        out.insert("_status_code".to_string(), Value::from(0u64));
    });
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    for n in 0..3 {
        agent.inner.received(v2_request(
            envelope::opcode::METHOD_REQUEST,
            method_request(&id, "ping", None),
            &format!("cid-{}", n),
            "console-reply",
        ));
    }

    assert_eq!(agent.poll_callbacks(2), 1);
    assert_eq!(broker.take_sent().len(), 2);
    assert_eq!(agent.poll_callbacks(0), 0);
    assert_eq!(broker.take_sent().len(), 1);
}

#[test]
fn test_signal_fd_gets_one_byte_per_request_and_poll_drains() {
    let (agent, broker) = harness(true);
    let fd = agent.signal_fd().expect("external-thread mode has a signal fd");
    let object = TestObject::new("pkg", "C", [1; 16]);
    object.on_method(|_, _, out| {
        out.insert("_status_code".to_string(), Value::from(0u64));
    });
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&id, "ping", None),
        "cid-fd",
        "console-reply",
    ));

    let mut buf = [0u8; 16];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(n, 1);
    assert_eq!(buf[0], b'X');

    agent.poll_callbacks(0);
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    // Nothing pending; the read end is non-blocking.
    assert!(n <= 0);
}

#[test]
fn test_signal_fd_requires_external_thread_mode() {
    let (agent, _broker) = harness(false);
    assert!(agent.signal_fd().is_none());
}

#[test]
fn test_notifiable_is_called_per_queued_request() {
    struct CountingNotifiable(AtomicU32);
    impl Notifiable for CountingNotifiable {
        fn notify(&self) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    let (agent, broker) = harness(true);
    let notifiable = Arc::new(CountingNotifiable(AtomicU32::new(0)));
    agent.set_signal_notifiable(Arc::clone(&notifiable) as _);

    let object = TestObject::new("pkg", "C", [1; 16]);
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&id, "ping", None),
        "cid-n1",
        "console-reply",
    ));
    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&id, "ping", None),
        "cid-n2",
        "console-reply",
    ));

    assert_eq!(notifiable.0.load(Ordering::Acquire), 2);
    assert!(!agent.inner.state.lock().in_callback);
}

#[test]
fn test_signal_callback_runs_outside_the_lock() {
    let (agent, broker) = harness(true);
    let calls = Arc::new(AtomicU32::new(0));
    let agent_for_callback = Arc::clone(&agent);
    let calls_in_callback = Arc::clone(&calls);
    agent.set_signal_callback(Arc::new(move || {
        calls_in_callback.fetch_add(1, Ordering::AcqRel);
        // Re-entrant polling from the signal callback is refused.
        assert_eq!(agent_for_callback.poll_callbacks(0), 0);
    }));

    let object = TestObject::new("pkg", "C", [1; 16]);
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    agent.inner.received(v2_request(
        envelope::opcode::METHOD_REQUEST,
        method_request(&id, "ping", None),
        "cid-cb",
        "console-reply",
    ));

    assert_eq!(calls.load(Ordering::Acquire), 1);
    // The refused poll left the request queued.
    assert_eq!(agent.inner.state.lock().method_queue.len(), 1);
}

#[test]
fn test_poll_callbacks_refuses_reentry_from_method_dispatch() {
    let (agent, broker) = harness(true);
    let inner_results: Arc<parking_lot::Mutex<Vec<u32>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    let object = TestObject::new("pkg", "C", [1; 16]);
    let agent_for_method = Arc::clone(&agent);
    let results = Arc::clone(&inner_results);
    object.on_method(move |_, _, out| {
        results.lock().push(agent_for_method.poll_callbacks(0));
        out.insert("_status_code".to_string(), Value::from(0u64));
    });
    let id = agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();
    broker.take_sent();

    for n in 0..2 {
        agent.inner.received(v2_request(
            envelope::opcode::METHOD_REQUEST,
            method_request(&id, "ping", None),
            &format!("cid-r{}", n),
            "console-reply",
        ));
    }

    let remaining = agent.poll_callbacks(0);
    assert_eq!(remaining, 0);
    // Each dispatched method saw its re-entrant poll refused with 0 and
    // an unchanged queue, and the outer poll still drained both.
    assert_eq!(*inner_results.lock(), vec![0, 0]);
    assert_eq!(broker.take_sent().len(), 2);
}

// ---------------------------------------------------------------------------
// Schemas and v1 frames
// ---------------------------------------------------------------------------

#[test]
fn test_new_package_while_connected_sends_package_indication() {
    let (agent, broker) = harness(false);
    agent.register_class("org.acme", "widget", [1; 16], Arc::new(|| b"blob".to_vec()));

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].exchange, envelope::exchange::MANAGEMENT);
    assert_eq!(sent[0].routing_key, envelope::routing::SCHEMA_PACKAGE);
    let MessageBody::Raw(frame) = &sent[0].body else {
        panic!("package indication must be a binary frame");
    };
    let mut frame = frame.clone();
    let header = framing::check_header(&mut frame).unwrap();
    assert_eq!(header.opcode, b'p');
    assert_eq!(framing::get_short_string(&mut frame).unwrap(), "org.acme");

    // Same package again: no further indication.
    agent.register_class("org.acme", "gadget", [2; 16], Arc::new(|| b"blob2".to_vec()));
    assert!(broker.take_sent().is_empty());
}

#[test]
fn test_schema_reregistration_is_idempotent() {
    let (agent, _broker) = harness(false);
    let writer: crate::domain::SchemaWriter = Arc::new(|| b"one".to_vec());
    agent.register_class("pkg", "C", [1; 16], Arc::clone(&writer));
    agent.register_class("pkg", "C", [1; 16], Arc::new(|| b"two".to_vec()));

    let state = agent.inner.state.lock();
    assert_eq!(state.schemas.class_count("pkg"), 1);
    let key = crate::domain::SchemaClassKey::new("C", [1; 16]);
    assert_eq!((state.schemas.find("pkg", &key).unwrap().write_schema)(), b"one");
}

fn schema_request_frame(package: &str, class: &str, hash: [u8; 16], sequence: u32) -> bytes::Bytes {
    let mut frame = bytes::BytesMut::new();
    framing::encode_header(&mut frame, b'S', sequence);
    framing::put_short_string(&mut frame, package);
    framing::put_short_string(&mut frame, class);
    framing::put_bin128(&mut frame, &hash);
    frame.freeze()
}

#[test]
fn test_schema_request_answers_with_schema_indication() {
    let (agent, broker) = harness(false);
    agent.register_class("pkg", "C", [7; 16], Arc::new(|| b"the-schema".to_vec()));
    broker.take_sent();

    agent.inner.received(v1_frame(
        schema_request_frame("pkg", "C", [7; 16], 42),
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].exchange, envelope::exchange::DIRECT);
    assert_eq!(sent[0].routing_key, "console-reply");
    let MessageBody::Raw(frame) = &sent[0].body else {
        panic!("schema indication must be a binary frame");
    };
    let mut frame = frame.clone();
    let header = framing::check_header(&mut frame).unwrap();
    assert_eq!(header.opcode, b's');
    assert_eq!(header.sequence, 42);
    assert_eq!(&frame[..], b"the-schema");
}

#[test]
fn test_unknown_schema_request_is_silently_ignored() {
    let (agent, broker) = harness(false);
    agent.inner.received(v1_frame(
        schema_request_frame("pkg", "missing", [0; 16], 1),
        "console-reply",
    ));
    assert!(broker.take_sent().is_empty());
}

#[test]
fn test_console_added_indication_sets_client_was_added() {
    let (agent, _broker) = harness(false);
    let mut frame = bytes::BytesMut::new();
    framing::encode_header(&mut frame, b'x', 0);
    agent.inner.received(v1_frame(frame.freeze(), ""));
    assert!(agent.inner.state.lock().client_was_added);
}

#[test]
fn test_bad_magic_and_unknown_opcodes_are_ignored() {
    let (agent, broker) = harness(false);
    agent
        .inner
        .received(v1_frame(bytes::Bytes::from_static(b"XY"), ""));
    agent
        .inner
        .received(v1_frame(bytes::Bytes::from_static(b"XYZW\x00\x00\x00\x01"), ""));

    let mut unknown = bytes::BytesMut::new();
    framing::encode_header(&mut unknown, b'Q', 3);
    agent.inner.received(v1_frame(unknown.freeze(), ""));

    agent.inner.received(v2_request(
        "_mystery_opcode",
        ValueMap::new(),
        "cid",
        "console-reply",
    ));

    assert!(broker.take_sent().is_empty());
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[test]
fn test_raise_event_publishes_to_console_event_topic() {
    let (agent, broker) = harness(false);
    let mut values = ValueMap::new();
    values.insert("queue".to_string(), Value::from("work"));
    let event = TestEvent {
        package: "org.acme".to_string(),
        name: "queueDepth".to_string(),
        hash: [9; 16],
        severity: crate::domain::Severity::Warning,
        values,
    };

    agent.raise_event(&event, None);

    let sent = broker.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].exchange, envelope::exchange::QMF_TOPIC);
    assert_eq!(sent[0].routing_key, "console.event.0.0.org.acme.queueDepth");
    assert_eq!(opcode_of(&sent[0]), envelope::opcode::DATA_INDICATION);
    assert_eq!(
        sent[0].headers[envelope::header::QMF_CONTENT],
        Value::from(envelope::content::EVENT)
    );
    let body = map_body(&sent[0]);
    assert_eq!(body[envelope::body::SEVERITY], Value::from(4u64));
    assert_eq!(body[envelope::body::TIMESTAMP], Value::U64(NOW));
    assert_eq!(
        body[envelope::body::VALUES].as_map().unwrap()["queue"],
        Value::from("work")
    );
}

#[test]
fn test_raise_event_severity_override() {
    let (agent, broker) = harness(false);
    let event = TestEvent {
        package: "p".to_string(),
        name: "e".to_string(),
        hash: [0; 16],
        severity: crate::domain::Severity::Debug,
        values: ValueMap::new(),
    };
    agent.raise_event(&event, Some(crate::domain::Severity::Critical));

    let sent = broker.take_sent();
    assert_eq!(map_body(&sent[0])[envelope::body::SEVERITY], Value::from(2u64));
}

#[test]
fn test_outbound_envelopes_round_trip_through_the_codec() {
    let (agent, broker) = harness(false);
    let object = TestObject::with_statistics("pkg", "C", [5; 16]);
    object.set_statistic("depth", Value::from(12u64));
    agent.add_object(Arc::clone(&object) as _, "k1", false);
    agent.inner.periodic_processing();

    let mut body = ValueMap::new();
    body.insert("_what".to_string(), Value::from("OBJECT"));
    agent.inner.received(v2_request(
        envelope::opcode::AGENT_LOCATE_REQUEST,
        body,
        "cid-rt",
        "console-reply",
    ));

    let sent = broker.take_sent();
    assert!(!sent.is_empty());
    for message in &sent {
        match &message.body {
            MessageBody::Map(map) => {
                let encoded = serde_json::to_string(map).unwrap();
                let decoded: ValueMap = serde_json::from_str(&encoded).unwrap();
                assert_eq!(&decoded, map);
            }
            MessageBody::List(list) => {
                let encoded = serde_json::to_string(list).unwrap();
                let decoded: ValueList = serde_json::from_str(&encoded).unwrap();
                assert_eq!(&decoded, list);
            }
            MessageBody::Raw(_) => {}
        }
        let encoded = serde_json::to_string(&message.headers).unwrap();
        let decoded: ValueMap = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message.headers);
    }
}

// ---------------------------------------------------------------------------
// Supervisor send gating
// ---------------------------------------------------------------------------

#[test]
fn test_sends_are_dropped_until_operational() {
    let broker = RecordingBroker::new();
    let agent = ManagementAgent::with_time_source(
        Arc::new(broker.clone()),
        Arc::new(FixedTimeSource::new(NOW)),
    );
    {
        let mut state = agent.inner.state.lock();
        state.config = Some(AgentConfig::for_testing());
        state.connected = true;
        state.client_was_added = false;
    }
    agent.add_object(TestObject::new("pkg", "C", [1; 16]), "k1", false);

    // Supervisor never connected: the pass runs but nothing leaves.
    agent.inner.periodic_processing();
    assert!(broker.take_sent().is_empty());
    assert_eq!(agent.inner.state.lock().objects.len(), 1);
}

#[test]
fn test_failed_transfer_stops_the_subscription() {
    let (agent, broker) = harness(false);
    broker.fail_next_transfers(1);

    agent.inner.periodic_processing();

    // The heartbeat transfer failed; the supervisor asked the
    // subscription to stop so the connection gets bounced.
    let sent = broker.take_sent();
    assert!(sent.is_empty());
}
