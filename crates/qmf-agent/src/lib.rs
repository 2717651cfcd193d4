//! # QMF Management Agent
//!
//! An embedded management agent for processes on an AMQP fabric. The
//! agent publishes the host's manageable state to remote consoles over
//! QMFv2 (map-encoded bodies) while still answering legacy QMFv1 binary
//! requests, and dispatches console-invoked methods back into
//! host-supplied objects.
//!
//! ## Architecture
//!
//! The crate follows a hexagonal layout:
//! - **Domain:** object identity, schema and identity records, backoff
//!   policy, configuration
//! - **Ports:** the management API the agent offers, and the capability
//!   contracts it requires (manageable objects, the broker client, time,
//!   identity persistence)
//! - **Adapters:** identity file store, self-pipe signal, system clock
//! - **Service:** the agent itself: connection supervision with bounded
//!   reconnect backoff, the periodic publication pass, inbound request
//!   dispatch, and method invocation
//!
//! ## Threads
//!
//! Two agent-owned OS threads run after [`ManagementAgent::init`]: the
//! connection thread (owns the broker session, receives every inbound
//! message, performs every outbound send) and the publisher thread
//! (wakes each interval for a publication pass). Host threads register
//! schemas and objects, raise events, and, in external-thread mode,
//! drain queued method requests through
//! [`ManagementAgentApi::poll_callbacks`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use qmf_agent::{AgentConfig, ManagementAgent, ManagementAgentApi};
//!
//! let agent = ManagementAgent::new(Arc::new(MyBrokerTransport::new()));
//! agent.init(AgentConfig::default())?;
//!
//! agent.register_class("org.example", "widget", schema_hash, write_schema);
//! let id = agent.add_object(Arc::new(widget), "widget-1", false);
//! ```
//!
//! [`ManagementAgentApi::poll_callbacks`]: crate::ports::inbound::ManagementAgentApi::poll_callbacks

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;
pub mod singleton;
pub mod testing;

// Re-export the working set hosts program against.
pub use domain::{
    AgentConfig, AgentName, ConnectionSettings, ObjectId, SchemaWriter, Severity, Timestamp,
};
pub use ports::inbound::{ManagementAgentApi, MessageListener};
pub use ports::outbound::{
    BrokerSession, BrokerTransport, ManagementEvent, ManagementObject, Notifiable, Subscription,
    TimeSource, TransportError,
};
pub use service::{AgentError, ManagementAgent};
pub use singleton::Singleton;
