//! Driven ports: the interfaces the host and transport must supply.

use std::fmt;

use qmf_wire::{OutboundMessage, ValueMap};
use thiserror::Error;

use crate::domain::{ConnectionSettings, ObjectId, Severity, Timestamp};
use crate::ports::inbound::MessageListener;

/// A host-supplied unit of manageable state.
///
/// All methods take `&self`: implementations carry their own interior
/// mutability because host threads mutate statistics concurrently with
/// agent reads, and because the agent releases its main lock around
/// `do_method`. The agent holds these behind `Arc` and drops each
/// object exactly once, when a publication pass reaps it or at teardown.
pub trait ManagementObject: Send + Sync {
    fn package_name(&self) -> String;
    fn class_name(&self) -> String;
    /// 16-byte schema digest identifying this object's class version.
    fn schema_hash(&self) -> [u8; 16];

    fn object_id(&self) -> Option<ObjectId>;
    /// Called once at registration with the assigned id.
    fn set_object_id(&self, id: ObjectId);

    /// Key derived from the object's own fields, used when the
    /// registrant supplies none.
    fn v2_key(&self) -> String;

    /// Properties changed since last publication.
    fn config_changed(&self) -> bool;
    /// Statistics changed since last publication.
    fn inst_changed(&self) -> bool;
    /// Whether the object carries statistics at all.
    fn has_inst(&self) -> bool;
    fn is_deleted(&self) -> bool;

    fn set_update_time(&self, at: Timestamp);

    /// Scratch byte the publication pass uses to mark visited objects.
    fn flags(&self) -> u8;
    fn set_flags(&self, flags: u8);

    fn force_publish(&self) -> bool;
    fn set_force_publish(&self, force: bool);

    /// Same package, class, and schema hash.
    fn is_same_class(&self, other: &dyn ManagementObject) -> bool {
        self.package_name() == other.package_name()
            && self.class_name() == other.class_name()
            && self.schema_hash() == other.schema_hash()
    }

    /// Append property and/or statistic values to `out`.
    fn map_encode_values(&self, out: &mut ValueMap, props: bool, stats: bool);

    /// Append create/update/delete timestamps to `out`.
    fn write_timestamps(&self, out: &mut ValueMap);

    /// Invoke a management method. Implementations set `_status_code`
    /// (and `_status_text` on failure) in `out`, plus any output
    /// arguments.
    fn do_method(&self, name: &str, in_args: &ValueMap, out: &mut ValueMap);
}

/// A host-supplied event to raise onto the fabric.
pub trait ManagementEvent: Send + Sync {
    fn package_name(&self) -> String;
    fn event_name(&self) -> String;
    fn schema_hash(&self) -> [u8; 16];
    /// The event's own severity, used when the raiser does not override.
    fn severity(&self) -> Severity;
    fn map_encode(&self, out: &mut ValueMap);
}

/// Host object notified when a method request is queued
/// (external-thread mode).
pub trait Notifiable: Send + Sync {
    fn notify(&self);
}

/// Clock abstraction; tests inject fixed time.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Persistence for the tiny identity record.
pub trait IdentityStore: Send + Sync {
    /// `None` means no prior state (missing file, bad magic, unreadable).
    fn load(&self) -> Option<crate::domain::StoredIdentity>;
    /// Best-effort write; failures are logged by the implementation.
    fn save(&self, identity: &crate::domain::StoredIdentity);
}

/// Errors surfaced by the broker client.
///
/// Never crosses the agent's API boundary upward: the supervisor turns
/// every one of these into a log entry plus a reconnect.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("session operation failed: {0}")]
    SessionFailed(String),

    #[error("message transfer failed: {0}")]
    TransferFailed(String),

    #[error("subscription terminated: {0}")]
    SubscriptionLost(String),
}

/// Options for the agent's self-queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl fmt::Display for QueueOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "auto_delete={} exclusive={}",
            self.auto_delete, self.exclusive
        )
    }
}

/// Factory for broker sessions: one successful `connect` per supervisor
/// attempt.
pub trait BrokerTransport: Send + Sync {
    fn connect(
        &self,
        settings: &ConnectionSettings,
        session_name: &str,
    ) -> Result<Box<dyn BrokerSession>, TransportError>;
}

/// An open session on the broker.
///
/// Implementations are `Sync`: the publisher thread transfers messages
/// while the connection thread sits in the subscription run loop.
pub trait BrokerSession: Send + Sync {
    fn queue_declare(&self, queue: &str, options: &QueueOptions) -> Result<(), TransportError>;

    fn exchange_bind(
        &self,
        exchange: &str,
        queue: &str,
        binding_key: &str,
    ) -> Result<(), TransportError>;

    fn transfer(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Begin consuming from `queue`. The returned handle outlives the
    /// session borrow so another thread can stop it.
    fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, TransportError>;

    /// Close the underlying connection. Idempotent.
    fn close(&self);
}

/// A running consumer on the agent's queue.
pub trait Subscription: Send + Sync {
    /// Deliver messages to `listener` until `stop` or failure. A clean
    /// stop returns `Ok`.
    fn run(&self, listener: &dyn MessageListener) -> Result<(), TransportError>;

    /// Break a concurrent `run`. Callable from any thread, repeatedly.
    fn stop(&self);
}
