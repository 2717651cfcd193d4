//! Driving ports: the API the agent offers.

use std::os::fd::RawFd;
use std::sync::Arc;

use qmf_wire::InboundMessage;

use crate::domain::{ObjectId, SchemaWriter, Severity};
use crate::ports::outbound::{ManagementEvent, ManagementObject, Notifiable};

/// The management API hosts program against.
///
/// Registration and `add_object` may be called from any host thread at
/// any time; none of them block on network I/O.
pub trait ManagementAgentApi: Send + Sync {
    /// Register an object-class schema. Idempotent on
    /// `(package, name, hash)`.
    fn register_class(
        &self,
        package: &str,
        class: &str,
        hash: [u8; 16],
        write_schema: SchemaWriter,
    );

    /// Register an event schema. Idempotent on `(package, name, hash)`.
    fn register_event(
        &self,
        package: &str,
        event: &str,
        hash: [u8; 16],
        write_schema: SchemaWriter,
    );

    /// Stage a managed object for publication and return its id.
    ///
    /// An empty `key` lets the object derive its own; `persistent`
    /// pins the id's epoch to zero so it survives restarts.
    fn add_object(
        &self,
        object: Arc<dyn ManagementObject>,
        key: &str,
        persistent: bool,
    ) -> ObjectId;

    /// Publish an event indication; `severity` overrides the event's own
    /// level when supplied.
    fn raise_event(&self, event: &dyn ManagementEvent, severity: Option<Severity>);

    /// Drain up to `limit` queued method requests (0 = all) on the
    /// calling thread. Returns the number still queued. Re-entrant
    /// calls from inside a dispatched callback return 0 untouched.
    fn poll_callbacks(&self, limit: u32) -> u32;

    /// Read end of the self-pipe signaled on each queued method, created
    /// lazily. `None` unless external-thread mode is configured.
    fn signal_fd(&self) -> Option<RawFd>;

    /// Have `notifiable.notify()` called for each queued method.
    fn set_signal_notifiable(&self, notifiable: Arc<dyn Notifiable>);

    /// Have `callback` invoked for each queued method.
    fn set_signal_callback(&self, callback: Arc<dyn Fn() + Send + Sync>);

    /// Stop both agent threads and release every managed object.
    fn shutdown(&self);
}

/// Delivery hook the transport drives: one call per message arriving on
/// the agent's queue, on the connection thread.
pub trait MessageListener: Send + Sync {
    fn received(&self, message: InboundMessage);
}
