// session.rs

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use log::*;
use tokio::sync::{watch, RwLock};

use crate::*;

/// Payload of the last-will advertised on the outbound topic.
pub const WILL_MESSAGE: &str = "connected";

/// Largest inbound message the receive path accepts.
pub const INBOUND_CAPACITY: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    SubscribePending,
    Active,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::SubscribePending => "subscribe pending",
            SessionState::Active => "active",
            SessionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Callback run for every message on a subscribed topic, with the topic
/// name and the id the gateway assigned to it.
pub type Handler = Box<dyn Fn(&str, u16, &[u8]) -> Result<(), InboundError> + Send + Sync>;

struct Subscription {
    topic: String,
    topic_id: u16,
    handler: Handler,
}

/// The pub/sub session with the broker.
///
/// The state machine lives here and nowhere else: the sampling loop only
/// calls [`MessagingSession::publish`], the receive task only feeds
/// deliveries in, and everyone else observes the state through
/// [`MessagingSession::watch_state`].
pub struct MessagingSession<T> {
    transport: Arc<T>,
    config: SessionConfig,
    keep_alive: Duration,
    state: watch::Sender<SessionState>,
    topic_ids: RwLock<HashMap<String, u16>>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl<T: Transport> MessagingSession<T> {
    pub fn new(transport: Arc<T>, config: SessionConfig, keep_alive: Duration) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            transport,
            config,
            keep_alive,
            state,
            topic_ids: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!("Session {from} -> {to}");
        }
    }

    fn fault(&self) {
        self.transition(SessionState::Faulted);
    }

    /// Leave [`SessionState::Faulted`] so the session can be set up again.
    /// Cached topic ids and subscriptions belong to the old session and are
    /// dropped. Returns false if the session was not faulted.
    pub async fn reset(&self) -> bool {
        if self.state() != SessionState::Faulted {
            return false;
        }
        self.topic_ids.write().await.clear();
        self.subscriptions.write().await.clear();
        self.transition(SessionState::Disconnected);
        true
    }

    pub fn gateway(&self) -> Result<SocketAddr, AddressParseError> {
        let ip = self
            .config
            .broker_addr
            .parse::<IpAddr>()
            .map_err(|_| AddressParseError(self.config.broker_addr.clone()))?;
        Ok(SocketAddr::new(ip, self.config.broker_port))
    }

    /// Open the session, advertising the last-will on the outbound topic.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let state = self.state();
        if state != SessionState::Disconnected {
            return Err(ConnectError::InvalidState(state));
        }
        self.transition(SessionState::Connecting);

        let gateway = match self.gateway() {
            Ok(g) => g,
            Err(e) => {
                self.fault();
                return Err(e.into());
            }
        };

        info!(
            "Connecting to MQTT-SN broker {} port {}.",
            self.config.broker_addr, self.config.broker_port
        );
        let will = Will {
            topic: &self.config.topic_out,
            message: WILL_MESSAGE.as_bytes(),
        };
        match self
            .transport
            .connect(gateway, self.config.device_id.as_str(), Some(will), self.keep_alive)
            .await
        {
            Ok(()) => {
                info!("Successfully connected to gateway at {gateway}");
                self.transition(SessionState::Connected);
                Ok(())
            }
            Err(source) => {
                self.fault();
                Err(ConnectError::Transport {
                    addr: self.config.broker_addr.clone(),
                    port: self.config.broker_port,
                    source,
                })
            }
        }
    }

    /// Subscribe at most-once to `topic`. A second subscription to the same
    /// topic replaces the handler.
    pub async fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), SubscribeError> {
        let state = self.state();
        if !matches!(state, SessionState::Connected | SessionState::Active) {
            return Err(SubscribeError::NotConnected(state));
        }
        self.transition(SessionState::SubscribePending);

        let topic_id = match self.transport.subscribe(topic, QoS::AtMostOnce).await {
            Ok(id) => id,
            Err(source) => {
                self.fault();
                return Err(SubscribeError::Transport {
                    topic: topic.to_string(),
                    source,
                });
            }
        };

        {
            let mut subs = self.subscriptions.write().await;
            subs.retain(|s| s.topic != topic);
            subs.push(Subscription {
                topic: topic.to_string(),
                topic_id,
                handler,
            });
        }
        info!("Now subscribed to {topic}");
        self.transition(SessionState::Active);
        Ok(())
    }

    /// Connect, then subscribe the inbound control topic.
    pub async fn setup(&self, handler: Handler) -> Result<(), SetupError> {
        info!("Dev_id: {}", self.config.device_id);
        self.connect().await?;
        self.subscribe(&self.config.inbound_topic(), handler).await?;
        Ok(())
    }

    async fn topic_id(&self, topic: &str) -> Result<u16, TransportError> {
        if let Some(id) = self.topic_ids.read().await.get(topic) {
            return Ok(*id);
        }
        let id = self.transport.register(topic).await?;
        self.topic_ids.write().await.insert(topic.to_string(), id);
        Ok(id)
    }

    /// Publish on `topic`. Any failure faults the session; a faulted or
    /// not yet active session refuses without touching the transport.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), PublishError> {
        let state = self.state();
        if state != SessionState::Active {
            error!("PUB ERROR: session is {state}");
            return Err(PublishError::NotActive(state));
        }

        let topic_id = match self.topic_id(topic).await {
            Ok(id) => id,
            Err(source) => {
                error!("PUB ERROR: Unable to obtain Topic ID");
                self.fault();
                return Err(PublishError::TopicRegistration {
                    topic: topic.to_string(),
                    source,
                });
            }
        };

        if let Err(source) = self.transport.publish(topic_id, payload, qos).await {
            error!("PUB ERROR: unable to publish data to topic '{topic} [{topic_id}]'");
            self.fault();
            return Err(PublishError::Transport {
                topic: topic.to_string(),
                topic_id,
                source,
            });
        }

        info!(
            "PUB SUCCESS: Published {} on topic {topic}",
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }

    /// Hand one inbound message to the handler of its topic.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<(), InboundError> {
        let subs = self.subscriptions.read().await;
        match subs.iter().find(|s| s.topic_id == delivery.topic_id) {
            Some(sub) => (sub.handler)(&sub.topic, sub.topic_id, &delivery.payload),
            None => {
                warn!("Message on unknown topic id {}, ignored", delivery.topic_id);
                Ok(())
            }
        }
    }

    /// Feed deliveries to their handlers until the session faults.
    pub async fn receive_until_fault(&self) {
        let mut state = self.watch_state();
        loop {
            tokio::select! {
                res = self.transport.recv() => match res {
                    Ok(delivery) => {
                        if let Err(e) = self.handle_delivery(&delivery).await {
                            error!("Inbound message dropped: {e}");
                        }
                    }
                    Err(e) => {
                        error!("MQTT receive failed: {e}");
                        self.fault();
                        return;
                    }
                },
                _ = state.wait_for(|s| *s == SessionState::Faulted) => return,
            }
        }
    }
}

/// The control handler: copy the message into a bounded buffer, log it
/// and keep its head in the status slot.
pub fn status_handler(state: Arc<NodeState>) -> Handler {
    Box::new(move |topic: &str, topic_id: u16, data: &[u8]| -> Result<(), InboundError> {
        let mut command = heapless::Vec::<u8, INBOUND_CAPACITY>::new();
        command
            .extend_from_slice(data)
            .map_err(|_| InboundError::BufferOverflow {
                len: data.len(),
                capacity: INBOUND_CAPACITY,
            })?;
        info!("### got publication for topic '{topic}' [{topic_id}] ###");
        info!("{}", String::from_utf8_lossy(&command));
        state.status.write(&command);
        Ok(())
    })
}


// EOF
