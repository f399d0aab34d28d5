// transport.rs

use std::{fmt, net::SocketAddr, time::Duration};

use crate::TransportError;

/// Delivery guarantee for a publish or subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Numeric level as used on the shell and in the device API.
    /// Anything unrecognized falls back to at-most-once.
    pub fn from_level(level: i32) -> Self {
        match level {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", self.level())
    }
}

/// Last-will advertised when the session is opened.
#[derive(Clone, Copy, Debug)]
pub struct Will<'a> {
    pub topic: &'a str,
    pub message: &'a [u8],
}

/// One inbound message handed over by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub topic_id: u16,
    pub payload: Vec<u8>,
}

/// Publish/subscribe primitives of the network stack.
///
/// Every call blocks the caller until the gateway answers or the
/// transport gives up. Inbound messages are pulled with [`Transport::recv`]
/// by whichever task runs the receive path.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn connect(
        &self,
        gateway: SocketAddr,
        client_id: &str,
        will: Option<Will<'_>>,
        keep_alive: Duration,
    ) -> Result<(), TransportError>;

    /// Obtain the numeric id the gateway uses for `topic`.
    async fn register(&self, topic: &str) -> Result<u16, TransportError>;

    async fn publish(&self, topic_id: u16, payload: &[u8], qos: QoS) -> Result<(), TransportError>;

    /// Subscribe by topic name, returning the topic id deliveries will carry.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<u16, TransportError>;

    async fn recv(&self) -> Result<Delivery, TransportError>;
}


// EOF
