//! Agent construction, shared state, and lifecycle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use qmf_wire::{envelope, Value, ValueMap};
use thiserror::Error;
use tracing::info;

use crate::adapters::{FileIdentityStore, NoopIdentityStore, SignalPipe, SystemTimeSource};
use crate::domain::{
    AgentConfig, AgentIdentity, AgentName, ObjectId, SchemaRegistry, Timestamp,
};
use crate::ports::outbound::{
    BrokerTransport, IdentityStore, ManagementObject, Notifiable, TimeSource,
};
use crate::service::supervisor::ConnectionSupervisor;

/// Errors the management API can return to the host.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already initialized")]
    AlreadyInitialized,

    #[error("failed to spawn agent thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// A method request parked for a host thread.
#[derive(Debug, Clone)]
pub(crate) struct QueuedMethod {
    pub correlation_id: String,
    pub reply_to: String,
    pub body: ValueMap,
}

/// Everything guarded by the main agent lock.
pub(crate) struct AgentState {
    /// Set once by `init`; its presence is the "initialized" flag.
    pub config: Option<AgentConfig>,
    pub name: AgentName,
    pub identity: AgentIdentity,
    pub identity_store: Box<dyn IdentityStore>,
    pub schemas: SchemaRegistry,
    /// The live registry, keyed and iterated in id order.
    pub objects: BTreeMap<ObjectId, Arc<dyn ManagementObject>>,
    pub method_queue: VecDeque<QueuedMethod>,
    pub client_was_added: bool,
    pub connected: bool,
    pub in_callback: bool,
    pub pipe: Option<SignalPipe>,
    pub notifiable: Option<Arc<dyn Notifiable>>,
    pub callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl AgentState {
    fn new() -> Self {
        AgentState {
            config: None,
            name: AgentName::default(),
            identity: AgentIdentity::default(),
            identity_store: Box::new(NoopIdentityStore),
            schemas: SchemaRegistry::new(),
            objects: BTreeMap::new(),
            method_queue: VecDeque::new(),
            // Force-publish everything on the first pass after connect.
            client_was_added: true,
            connected: false,
            in_callback: false,
            pipe: None,
            notifiable: None,
            callback: None,
        }
    }

    pub fn interval_secs(&self) -> u16 {
        self.config.as_ref().map_or(10, |c| c.interval_secs)
    }

    pub fn external_thread(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.external_thread)
    }
}

/// Shared core of the agent; the two agent threads and the host all hold
/// this through an `Arc`.
pub(crate) struct AgentInner {
    pub transport: Arc<dyn BrokerTransport>,
    pub time: Arc<dyn TimeSource>,
    /// The main agent lock.
    pub state: Mutex<AgentState>,
    /// Staged inserts, guarded separately so `add_object` never waits on
    /// the publishing or connection thread.
    pub staged: Mutex<BTreeMap<ObjectId, Arc<dyn ManagementObject>>>,
    pub supervisor: ConnectionSupervisor,
    /// Epoch stamped onto non-persistent object ids; mirrors the
    /// identity's boot sequence so `add_object` stays off the main lock.
    pub boot_epoch: AtomicU16,
    pub shutdown: AtomicBool,
}

impl AgentInner {
    /// Merge staged objects into the live registry. Caller holds the
    /// main lock; the staged lock nests inside, never the reverse.
    pub fn move_staged_into_live(&self, state: &mut AgentState) {
        let mut staged = self.staged.lock();
        while let Some((id, object)) = staged.pop_first() {
            state.objects.insert(id, object);
        }
    }

    pub fn now(&self) -> Timestamp {
        self.time.now()
    }

    /// The `_values` advertised in heartbeats and locate responses.
    pub fn advertised_values(&self, state: &AgentState) -> ValueMap {
        let mut values = state.name.attributes();
        values.insert("timestamp".to_string(), Value::from(self.now()));
        values.insert(
            "heartbeat_interval".to_string(),
            Value::from(state.interval_secs()),
        );
        values.insert("epoch".to_string(), Value::from(state.identity.boot_sequence));
        values
    }
}

/// Headers common to every QMFv2 envelope the agent emits; `qmf.agent`
/// and `app_id` are stamped by the supervisor at the send boundary.
pub(crate) fn v2_headers(method: &str, opcode: &str) -> ValueMap {
    let mut headers = ValueMap::new();
    headers.insert(envelope::header::METHOD.to_string(), Value::from(method));
    headers.insert(envelope::header::QMF_OPCODE.to_string(), Value::from(opcode));
    headers
}

/// The embedded management agent.
///
/// Create with a broker transport, then [`init`](Self::init) to restore
/// identity and start the connection and publisher threads. All
/// management operations live on the [`ManagementAgentApi`] impl.
///
/// [`ManagementAgentApi`]: crate::ports::inbound::ManagementAgentApi
pub struct ManagementAgent {
    pub(crate) inner: Arc<AgentInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagementAgent {
    /// Build an agent over `transport` with the wall clock.
    pub fn new(transport: Arc<dyn BrokerTransport>) -> Self {
        Self::with_time_source(transport, Arc::new(SystemTimeSource))
    }

    /// Build an agent with an injected clock (tests pin time with this).
    pub fn with_time_source(
        transport: Arc<dyn BrokerTransport>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        ManagementAgent {
            inner: Arc::new(AgentInner {
                transport,
                time,
                state: Mutex::new(AgentState::new()),
                staged: Mutex::new(BTreeMap::new()),
                supervisor: ConnectionSupervisor::new(),
                boot_epoch: AtomicU16::new(0),
                shutdown: AtomicBool::new(false),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Restore identity, advance the boot sequence, persist it, and
    /// start the connection and publisher threads.
    pub fn init(&self, config: AgentConfig) -> Result<(), AgentError> {
        let (settings, interval) = {
            let mut state = self.inner.state.lock();
            if state.config.is_some() {
                return Err(AgentError::AlreadyInitialized);
            }

            state.identity_store = match &config.store_file {
                Some(path) => Box::new(FileIdentityStore::new(path)),
                None => Box::new(NoopIdentityStore),
            };
            state.identity = AgentIdentity::from_stored(state.identity_store.load());
            state.identity.advance_boot_sequence();
            state.identity_store.save(&state.identity.to_stored());
            self.inner
                .boot_epoch
                .store(state.identity.boot_sequence, Ordering::Release);

            state.name = config.name.clone();
            info!(
                broker = %format!("{}:{}", config.connection.host, config.connection.port),
                interval = config.interval_secs,
                address = %state.name.address(),
                boot_sequence = state.identity.boot_sequence,
                "Management agent initialized"
            );

            let settings = config.connection.clone();
            let interval = config.interval_secs;
            state.config = Some(config);
            (settings, interval)
        };

        let mut threads = self.threads.lock();
        let conn_inner = Arc::clone(&self.inner);
        threads.push(
            std::thread::Builder::new()
                .name("qmf-agent-conn".to_string())
                .spawn(move || conn_inner.supervisor.run(&conn_inner, settings))?,
        );
        let pub_inner = Arc::clone(&self.inner);
        threads.push(
            std::thread::Builder::new()
                .name("qmf-agent-pub".to_string())
                .spawn(move || crate::service::publication::publisher_loop(&pub_inner, interval))?,
        );
        Ok(())
    }

    /// Stop both threads and release every managed object exactly once.
    pub(crate) fn shutdown_impl(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.supervisor.close();

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }

        let mut state = self.inner.state.lock();
        self.inner.move_staged_into_live(&mut state);
        state.objects.clear();
        state.pipe = None;
        info!("Management agent stopped");
    }
}

impl Drop for ManagementAgent {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}
