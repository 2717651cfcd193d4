//! Process-wide agent instance.
//!
//! Hosts that want one agent per process acquire it here instead of
//! threading an `Arc` everywhere. The management-disabled decision is
//! immutable once any handle exists; the agent itself is created on the
//! first acquisition and torn down when the last handle drops.

use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::warn;

use crate::service::ManagementAgent;

#[derive(Default)]
struct SingletonState {
    disabled: bool,
    ref_count: usize,
    agent: Option<Arc<ManagementAgent>>,
}

lazy_static! {
    static ref SINGLETON: Mutex<SingletonState> = Mutex::new(SingletonState::default());
}

/// A handle on the process-wide agent. RAII: dropping the last handle
/// shuts the agent down.
pub struct Singleton {
    _private: (),
}

impl Singleton {
    /// Acquire a handle, creating the agent via `make` if this is the
    /// first acquisition and management is not disabled.
    ///
    /// Passing `disable_management = true` on the first acquisition pins
    /// the process to "no agent"; once any handle exists the decision
    /// cannot change.
    pub fn acquire<F>(disable_management: bool, make: F) -> Singleton
    where
        F: FnOnce() -> ManagementAgent,
    {
        let mut state = SINGLETON.lock();
        if disable_management && !state.disabled {
            if state.ref_count == 0 {
                state.disabled = true;
            } else {
                warn!("Cannot disable management after the agent exists");
            }
        }
        if state.ref_count == 0 && !state.disabled {
            state.agent = Some(Arc::new(make()));
        }
        state.ref_count += 1;
        Singleton { _private: () }
    }

    /// The process-wide agent, if one exists and management is enabled.
    pub fn instance() -> Option<Arc<ManagementAgent>> {
        SINGLETON.lock().agent.clone()
    }
}

impl Drop for Singleton {
    fn drop(&mut self) {
        let agent = {
            let mut state = SINGLETON.lock();
            state.ref_count -= 1;
            if state.ref_count == 0 {
                state.agent.take()
            } else {
                None
            }
        };
        // Shutdown (via Drop) happens outside the singleton lock.
        drop(agent);
    }
}
