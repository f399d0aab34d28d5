// error.rs

use thiserror::Error;

use crate::SessionState;

/// Failures reported by the transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no response from gateway")]
    Timeout,
    #[error("gateway rejected request, return code {0:#04x}")]
    Rejected(u8),
    #[error("transport is not connected to a gateway")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("packet does not fit a datagram ({0} bytes)")]
    TooLarge(usize),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
#[error("cannot parse broker address {0:?}")]
pub struct AddressParseError(pub String);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Address(#[from] AddressParseError),
    #[error("cannot connect from state {0}")]
    InvalidState(SessionState),
    #[error("unable to connect to [{addr}]:{port}: {source}")]
    Transport {
        addr: String,
        port: u16,
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("cannot subscribe from state {0}")]
    NotConnected(SessionState),
    #[error("unable to subscribe to {topic}: {source}")]
    Transport {
        topic: String,
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("session is {0}, not publishing")]
    NotActive(SessionState),
    #[error("unable to obtain topic id for {topic}: {source}")]
    TopicRegistration {
        topic: String,
        source: TransportError,
    },
    #[error("unable to publish data to topic {topic} [{topic_id}]: {source}")]
    Transport {
        topic: String,
        topic_id: u16,
        source: TransportError,
    },
}

/// Connect and subscribe failures during messaging setup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SensorReadError {
    #[error("temperature read failed")]
    Temperature,
    #[error("pressure read failed")]
    Pressure,
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum InboundError {
    #[error("inbound message of {len} bytes exceeds buffer of {capacity}")]
    BufferOverflow { len: usize, capacity: usize },
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("device id must be 1..={max} bytes, got {len}")]
    DeviceIdLength { len: usize, max: usize },
    #[error("device id contains a character not allowed in payloads: {0:?}")]
    DeviceIdCharacter(char),
}

// EOF
