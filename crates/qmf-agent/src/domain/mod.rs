//! Domain layer: the agent's pure state and rules.
//!
//! Nothing here touches the broker, the clock, or the filesystem; those
//! live behind the ports and adapters.

mod backoff;
mod config;
mod identity;
mod object_id;
mod schema;
mod value_objects;

pub use backoff::ReconnectBackoff;
pub use config::{AgentConfig, ConnectionSettings};
pub use identity::{AgentIdentity, StoredIdentity, STORE_MAGIC};
pub use object_id::ObjectId;
pub use schema::{ClassMap, SchemaClass, SchemaClassKey, SchemaKind, SchemaRegistry, SchemaWriter};
pub use value_objects::{AgentName, Severity, Timestamp};
