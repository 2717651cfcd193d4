//! Port traits at the agent's boundaries.
//!
//! Inbound ports are what the agent offers (the management API, the
//! message-delivery hook the transport drives); outbound ports are what
//! it requires (manageable objects, the broker client, time, identity
//! persistence, host notification).

pub mod inbound;
pub mod outbound;

pub use inbound::{ManagementAgentApi, MessageListener};
pub use outbound::{
    BrokerSession, BrokerTransport, IdentityStore, ManagementEvent, ManagementObject, Notifiable,
    QueueOptions, Subscription, TimeSource, TransportError,
};
