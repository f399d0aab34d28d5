// testutil.rs
//
// Scriptable in-memory transport for exercising the session and the tasks
// built on it.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::*;

#[derive(Default)]
pub(crate) struct Script {
    pub fail_connect: bool,
    pub fail_subscribe: bool,
    pub fail_register: bool,
    pub fail_publish: bool,
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    pub script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded calls that start with `verb`.
    pub fn count(&self, verb: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.starts_with(verb)).count()
    }

    fn log(&self, s: String) {
        self.calls.lock().unwrap().push(s);
    }
}

impl Transport for FakeTransport {
    async fn connect(
        &self,
        gateway: SocketAddr,
        client_id: &str,
        will: Option<Will<'_>>,
        _keep_alive: Duration,
    ) -> Result<(), TransportError> {
        let will = will.map(|w| (w.topic.to_string(), String::from_utf8_lossy(w.message).into_owned()));
        self.log(format!("connect {gateway} {client_id} {will:?}"));
        if self.script.lock().unwrap().fail_connect {
            return Err(TransportError::Timeout);
        }
        Ok(())
    }

    async fn register(&self, topic: &str) -> Result<u16, TransportError> {
        self.log(format!("register {topic}"));
        if self.script.lock().unwrap().fail_register {
            return Err(TransportError::Rejected(2));
        }
        Ok(5)
    }

    async fn publish(&self, topic_id: u16, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        self.log(format!("publish {topic_id} {} {qos}", String::from_utf8_lossy(payload)));
        if self.script.lock().unwrap().fail_publish {
            return Err(TransportError::Timeout);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<u16, TransportError> {
        self.log(format!("subscribe {topic} {qos}"));
        if self.script.lock().unwrap().fail_subscribe {
            return Err(TransportError::Rejected(3));
        }
        Ok(9)
    }

    async fn recv(&self) -> Result<Delivery, TransportError> {
        std::future::pending().await
    }
}

/// A node state with the given config and a session over a fake transport.
pub(crate) fn fake_node(
    config: NodeConfig,
    script: Script,
) -> (Arc<NodeState>, Arc<MessagingSession<FakeTransport>>, Arc<FakeTransport>) {
    let t = FakeTransport::new(script);
    let state = Arc::new(NodeState::new(config));
    let session = Arc::new(MessagingSession::new(
        t.clone(),
        state.config.session.clone(),
        state.config.keep_alive(),
    ));
    (state, session, t)
}

// EOF
