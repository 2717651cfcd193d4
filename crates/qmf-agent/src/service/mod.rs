//! The agent service: lifecycle, publication, dispatch, and method
//! invocation wired over the shared registries.

mod api;
mod core;
mod dispatch;
mod methods;
mod publication;
mod supervisor;

pub use self::core::{AgentError, ManagementAgent};

#[cfg(test)]
mod tests;
