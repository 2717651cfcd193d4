//! Connection supervision: open, bind, subscribe, reconnect.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use qmf_wire::{envelope, OutboundMessage, Value};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::domain::{ConnectionSettings, ReconnectBackoff};
use crate::ports::outbound::{BrokerSession, QueueOptions, Subscription, TransportError};
use crate::service::core::AgentInner;

/// State guarded by the connection lock.
struct ConnShared {
    operational: bool,
    shutdown: bool,
    agent_address: String,
    session: Option<Arc<dyn BrokerSession>>,
    subscription: Option<Arc<dyn Subscription>>,
}

/// Owns the connection thread's loop and serializes every outbound send.
pub(crate) struct ConnectionSupervisor {
    conn: Mutex<ConnShared>,
    queue_name: String,
}

enum Attempt {
    /// The subscription ran and then ended; backoff resets.
    Ran,
    /// Nothing ran; backoff grows.
    Failed(TransportError),
    Shutdown,
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        ConnectionSupervisor {
            conn: Mutex::new(ConnShared {
                operational: false,
                shutdown: false,
                agent_address: String::new(),
                session: None,
                subscription: None,
            }),
            queue_name: format!("qmfagent-{}", Uuid::new_v4()),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.conn.lock().shutdown
    }

    /// Connection thread body: attempt, run, back off, repeat.
    pub fn run(&self, agent: &AgentInner, settings: ConnectionSettings) {
        {
            let mut conn = self.conn.lock();
            conn.agent_address = agent.state.lock().name.address();
        }
        let mut backoff = ReconnectBackoff::new();

        loop {
            match self.attempt(agent, &settings) {
                Attempt::Shutdown => return,
                Attempt::Ran => backoff.reset(),
                Attempt::Failed(e) => debug!(error = %e, "Connection attempt failed"),
            }

            // Sleep the current delay in 1-second naps so shutdown is
            // observed promptly.
            let delay = backoff.next_delay();
            if self.is_shutdown() {
                return;
            }
            let mut slept = Duration::ZERO;
            while slept < delay && !self.is_shutdown() {
                std::thread::sleep(Duration::from_secs(1));
                slept += Duration::from_secs(1);
            }
            if self.is_shutdown() {
                return;
            }
        }
    }

    fn open_session(
        &self,
        agent: &AgentInner,
        settings: &ConnectionSettings,
        address: &str,
    ) -> Result<(Arc<dyn BrokerSession>, Arc<dyn Subscription>), TransportError> {
        let session: Arc<dyn BrokerSession> =
            Arc::from(agent.transport.connect(settings, &self.queue_name)?);

        let bound = (|| {
            session.queue_declare(
                &self.queue_name,
                &QueueOptions {
                    auto_delete: true,
                    exclusive: true,
                },
            )?;
            session.exchange_bind(envelope::exchange::DIRECT, &self.queue_name, &self.queue_name)?;
            session.exchange_bind(envelope::exchange::QMF_DIRECT, &self.queue_name, address)?;
            session.exchange_bind(
                envelope::exchange::QMF_TOPIC,
                &self.queue_name,
                envelope::routing::CONSOLE_WILDCARD,
            )?;
            session.subscribe(&self.queue_name)
        })();

        match bound {
            Ok(subscription) => Ok((session, Arc::from(subscription))),
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }

    fn attempt(&self, agent: &AgentInner, settings: &ConnectionSettings) -> Attempt {
        if self.is_shutdown() {
            return Attempt::Shutdown;
        }
        debug!("Attempting to connect to the broker");
        let address = self.conn.lock().agent_address.clone();

        let (session, subscription) = match self.open_session(agent, settings, &address) {
            Ok(pair) => pair,
            Err(e) => return Attempt::Failed(e),
        };
        info!("Connection established with broker");

        {
            let mut conn = self.conn.lock();
            if conn.shutdown {
                drop(conn);
                session.close();
                return Attempt::Shutdown;
            }
            conn.operational = true;
            conn.session = Some(Arc::clone(&session));
            conn.subscription = Some(Arc::clone(&subscription));
        }

        agent.on_connected(self);

        if let Err(e) = subscription.run(agent) {
            debug!(error = %e, "Subscription loop terminated");
        }
        warn!("Connection to the broker has been lost");

        {
            let mut conn = self.conn.lock();
            conn.operational = false;
            conn.session = None;
            conn.subscription = None;
        }
        agent.on_disconnected();
        session.close();
        Attempt::Ran
    }

    /// Bind the self-queue to the management exchange under the
    /// broker-assigned bank pair.
    pub fn bind_to_bank(&self, broker_bank: u32, agent_bank: u32) {
        let session = {
            let conn = self.conn.lock();
            match &conn.session {
                Some(s) => Arc::clone(s),
                None => return,
            }
        };
        let key = format!("agent.{}.{}", broker_bank, agent_bank);
        if let Err(e) = session.exchange_bind(envelope::exchange::MANAGEMENT, &self.queue_name, &key)
        {
            warn!(error = %e, key = %key, "Bank binding failed");
        }
    }

    /// Transfer a message, stamping the reply-to, app id, and agent
    /// header. Dropped silently when not operational; a failed transfer
    /// bounces the connection by stopping the subscription.
    pub fn send(&self, mut message: OutboundMessage) {
        let (session, subscription, address) = {
            let conn = self.conn.lock();
            if !conn.operational {
                trace!(
                    exchange = %message.exchange,
                    key = %message.routing_key,
                    "Not operational, dropping outbound message"
                );
                return;
            }
            match (&conn.session, &conn.subscription) {
                (Some(session), Some(subscription)) => (
                    Arc::clone(session),
                    Arc::clone(subscription),
                    conn.agent_address.clone(),
                ),
                _ => return,
            }
        };

        message.reply_to = Some((
            envelope::exchange::DIRECT.to_string(),
            self.queue_name.clone(),
        ));
        message.app_id = Some(envelope::APP_ID.to_string());
        message.headers.insert(
            envelope::header::QMF_AGENT.to_string(),
            Value::from(address),
        );

        if let Err(e) = session.transfer(message) {
            error!(error = %e, "Message transfer failed, bouncing the connection");
            subscription.stop();
        }
    }

    /// Open one session and mark the supervisor operational without
    /// running the subscription loop, so tests drive passes directly.
    #[cfg(test)]
    pub(crate) fn connect_for_tests(&self, agent: &AgentInner, settings: &ConnectionSettings) {
        let address = agent.state.lock().name.address();
        self.conn.lock().agent_address = address.clone();
        let (session, subscription) = self
            .open_session(agent, settings, &address)
            .expect("test transport refused to connect");
        let mut conn = self.conn.lock();
        conn.operational = true;
        conn.session = Some(session);
        conn.subscription = Some(subscription);
    }

    /// Begin shutdown: mark it and break any running subscription.
    pub fn close(&self) {
        let subscription = {
            let mut conn = self.conn.lock();
            conn.shutdown = true;
            conn.subscription.clone()
        };
        if let Some(subscription) = subscription {
            subscription.stop();
        }
    }
}
