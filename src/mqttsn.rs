// mqttsn.rs
//! MQTT-SN v1.2 client over UDP.
//!
//! One task runs [`MqttSnClient::run`], which owns the receive side of the
//! socket. Acks are routed to the single request in flight, inbound
//! PUBLISH packets are queued for [`Transport::recv`], and gateway
//! housekeeping (REGISTER, PINGREQ, QoS 1/2 acks) is answered in place.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};

use log::*;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex, Notify, OnceCell, RwLock},
    time::{sleep_until, timeout_at, Instant},
};

use crate::{Delivery, QoS, Transport, TransportError, Will};

pub const MAX_PACKET: usize = 512;
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(15);
pub const RETRIES: usize = 3;

const PROTOCOL_ID: u8 = 0x01;
const DELIVERY_QUEUE: usize = 8;
const RESPONSE_QUEUE: usize = 8;
const IDLE_PING: Duration = Duration::from_secs(3600);
const MIN_PING: Duration = Duration::from_secs(1);

pub const FLAG_DUP: u8 = 0x80;
pub const FLAG_RETAIN: u8 = 0x10;
pub const FLAG_WILL: u8 = 0x08;
pub const FLAG_CLEAN: u8 = 0x04;
const FLAG_QOS_MASK: u8 = 0x60;

pub const RC_ACCEPTED: u8 = 0x00;

mod msg_type {
    pub const CONNECT: u8 = 0x04;
    pub const CONNACK: u8 = 0x05;
    pub const WILLTOPICREQ: u8 = 0x06;
    pub const WILLTOPIC: u8 = 0x07;
    pub const WILLMSGREQ: u8 = 0x08;
    pub const WILLMSG: u8 = 0x09;
    pub const REGISTER: u8 = 0x0a;
    pub const REGACK: u8 = 0x0b;
    pub const PUBLISH: u8 = 0x0c;
    pub const PUBACK: u8 = 0x0d;
    pub const PUBCOMP: u8 = 0x0e;
    pub const PUBREC: u8 = 0x0f;
    pub const PUBREL: u8 = 0x10;
    pub const SUBSCRIBE: u8 = 0x12;
    pub const SUBACK: u8 = 0x13;
    pub const PINGREQ: u8 = 0x16;
    pub const PINGRESP: u8 = 0x17;
    pub const DISCONNECT: u8 = 0x18;
}

pub fn qos_flags(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0x00,
        QoS::AtLeastOnce => 0x20,
        QoS::ExactlyOnce => 0x40,
    }
}

pub fn flags_qos(flags: u8) -> QoS {
    match flags & FLAG_QOS_MASK {
        0x20 => QoS::AtLeastOnce,
        0x40 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Connect { flags: u8, duration: u16, client_id: String },
    ConnAck { rc: u8 },
    WillTopicReq,
    WillTopic { flags: u8, topic: String },
    WillMsgReq,
    WillMsg { msg: Vec<u8> },
    Register { topic_id: u16, msg_id: u16, topic: String },
    RegAck { topic_id: u16, msg_id: u16, rc: u8 },
    Publish { flags: u8, topic_id: u16, msg_id: u16, data: Vec<u8> },
    PubAck { topic_id: u16, msg_id: u16, rc: u8 },
    PubRec { msg_id: u16 },
    PubRel { msg_id: u16 },
    PubComp { msg_id: u16 },
    Subscribe { flags: u8, msg_id: u16, topic: String },
    SubAck { flags: u8, topic_id: u16, msg_id: u16, rc: u8 },
    PingReq,
    PingResp,
    Disconnect,
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, TransportError> {
        let (&b, rest) = self.0.split_first().ok_or(TransportError::Malformed("truncated"))?;
        self.0 = rest;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, TransportError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn rest(self) -> &'a [u8] {
        self.0
    }

    fn string(self) -> Result<String, TransportError> {
        String::from_utf8(self.0.to_vec()).map_err(|_| TransportError::Malformed("topic is not utf-8"))
    }
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        use msg_type::*;

        let mut body = Vec::with_capacity(16);
        match self {
            Packet::Connect { flags, duration, client_id } => {
                body.extend([CONNECT, *flags, PROTOCOL_ID]);
                body.extend(duration.to_be_bytes());
                body.extend(client_id.as_bytes());
            }
            Packet::ConnAck { rc } => body.extend([CONNACK, *rc]),
            Packet::WillTopicReq => body.push(WILLTOPICREQ),
            Packet::WillTopic { flags, topic } => {
                body.extend([WILLTOPIC, *flags]);
                body.extend(topic.as_bytes());
            }
            Packet::WillMsgReq => body.push(WILLMSGREQ),
            Packet::WillMsg { msg } => {
                body.push(WILLMSG);
                body.extend(msg);
            }
            Packet::Register { topic_id, msg_id, topic } => {
                body.push(REGISTER);
                body.extend(topic_id.to_be_bytes());
                body.extend(msg_id.to_be_bytes());
                body.extend(topic.as_bytes());
            }
            Packet::RegAck { topic_id, msg_id, rc } => {
                body.push(REGACK);
                body.extend(topic_id.to_be_bytes());
                body.extend(msg_id.to_be_bytes());
                body.push(*rc);
            }
            Packet::Publish { flags, topic_id, msg_id, data } => {
                body.extend([PUBLISH, *flags]);
                body.extend(topic_id.to_be_bytes());
                body.extend(msg_id.to_be_bytes());
                body.extend(data);
            }
            Packet::PubAck { topic_id, msg_id, rc } => {
                body.push(PUBACK);
                body.extend(topic_id.to_be_bytes());
                body.extend(msg_id.to_be_bytes());
                body.push(*rc);
            }
            Packet::PubRec { msg_id } => {
                body.push(PUBREC);
                body.extend(msg_id.to_be_bytes());
            }
            Packet::PubRel { msg_id } => {
                body.push(PUBREL);
                body.extend(msg_id.to_be_bytes());
            }
            Packet::PubComp { msg_id } => {
                body.push(PUBCOMP);
                body.extend(msg_id.to_be_bytes());
            }
            Packet::Subscribe { flags, msg_id, topic } => {
                body.extend([SUBSCRIBE, *flags]);
                body.extend(msg_id.to_be_bytes());
                body.extend(topic.as_bytes());
            }
            Packet::SubAck { flags, topic_id, msg_id, rc } => {
                body.extend([SUBACK, *flags]);
                body.extend(topic_id.to_be_bytes());
                body.extend(msg_id.to_be_bytes());
                body.push(*rc);
            }
            Packet::PingReq => body.push(PINGREQ),
            Packet::PingResp => body.push(PINGRESP),
            Packet::Disconnect => body.push(DISCONNECT),
        }

        let mut out = Vec::with_capacity(body.len() + 3);
        if body.len() < 0xff {
            out.push((body.len() + 1) as u8);
        } else {
            let len = u16::try_from(body.len() + 3).map_err(|_| TransportError::TooLarge(body.len() + 3))?;
            out.push(0x01);
            out.extend(len.to_be_bytes());
        }
        out.extend(body);
        if out.len() > MAX_PACKET {
            return Err(TransportError::TooLarge(out.len()));
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Packet, TransportError> {
        use msg_type::*;

        let (len, hdr) = match buf {
            [0x01, hi, lo, ..] => (u16::from_be_bytes([*hi, *lo]) as usize, 3),
            [len, ..] => (*len as usize, 1),
            [] => return Err(TransportError::Malformed("empty datagram")),
        };
        if len <= hdr || len > buf.len() {
            return Err(TransportError::Malformed("bad length"));
        }
        let mut r = Reader(&buf[hdr..len]);

        let packet = match r.u8()? {
            CONNECT => {
                let flags = r.u8()?;
                if r.u8()? != PROTOCOL_ID {
                    return Err(TransportError::Malformed("unknown protocol id"));
                }
                let duration = r.u16()?;
                Packet::Connect { flags, duration, client_id: r.string()? }
            }
            CONNACK => Packet::ConnAck { rc: r.u8()? },
            WILLTOPICREQ => Packet::WillTopicReq,
            WILLTOPIC => {
                let flags = r.u8()?;
                Packet::WillTopic { flags, topic: r.string()? }
            }
            WILLMSGREQ => Packet::WillMsgReq,
            WILLMSG => Packet::WillMsg { msg: r.rest().to_vec() },
            REGISTER => {
                let topic_id = r.u16()?;
                let msg_id = r.u16()?;
                Packet::Register { topic_id, msg_id, topic: r.string()? }
            }
            REGACK => Packet::RegAck { topic_id: r.u16()?, msg_id: r.u16()?, rc: r.u8()? },
            PUBLISH => {
                let flags = r.u8()?;
                let topic_id = r.u16()?;
                let msg_id = r.u16()?;
                Packet::Publish { flags, topic_id, msg_id, data: r.rest().to_vec() }
            }
            PUBACK => Packet::PubAck { topic_id: r.u16()?, msg_id: r.u16()?, rc: r.u8()? },
            PUBREC => Packet::PubRec { msg_id: r.u16()? },
            PUBREL => Packet::PubRel { msg_id: r.u16()? },
            PUBCOMP => Packet::PubComp { msg_id: r.u16()? },
            SUBSCRIBE => {
                let flags = r.u8()?;
                let msg_id = r.u16()?;
                Packet::Subscribe { flags, msg_id, topic: r.string()? }
            }
            SUBACK => Packet::SubAck {
                flags: r.u8()?,
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                rc: r.u8()?,
            },
            // optional client id / duration trailers are ignored
            PINGREQ => Packet::PingReq,
            PINGRESP => Packet::PingResp,
            DISCONNECT => Packet::Disconnect,
            _ => return Err(TransportError::Malformed("unknown message type")),
        };
        Ok(packet)
    }
}

#[derive(Clone, Copy, Debug)]
struct Link {
    gateway: SocketAddr,
    keep_alive: Duration,
    connected: bool,
}

pub struct MqttSnClient {
    socket: OnceCell<UdpSocket>,
    ready: Notify,
    // raised by connect once the gateway accepted us
    linked: Notify,
    link: RwLock<Option<Link>>,
    // holding this lock is what makes a request the one in flight
    responses: Mutex<mpsc::Receiver<Packet>>,
    responses_tx: mpsc::Sender<Packet>,
    deliveries: Mutex<mpsc::Receiver<Delivery>>,
    deliveries_tx: mpsc::Sender<Delivery>,
    msg_id: AtomicU16,
    retry_timeout: Duration,
    retries: usize,
}

impl MqttSnClient {
    pub fn new() -> Self {
        Self::with_retry(RETRY_TIMEOUT, RETRIES)
    }

    pub fn with_retry(retry_timeout: Duration, retries: usize) -> Self {
        let (responses_tx, responses) = mpsc::channel(RESPONSE_QUEUE);
        let (deliveries_tx, deliveries) = mpsc::channel(DELIVERY_QUEUE);
        Self {
            socket: OnceCell::new(),
            ready: Notify::new(),
            linked: Notify::new(),
            link: RwLock::new(None),
            responses: Mutex::new(responses),
            responses_tx,
            deliveries: Mutex::new(deliveries),
            deliveries_tx,
            msg_id: AtomicU16::new(1),
            retry_timeout,
            retries: retries.max(1),
        }
    }

    /// Drive the receive side of the socket. Never returns unless the
    /// socket fails.
    pub async fn run(&self) -> Result<(), TransportError> {
        let socket = loop {
            if let Some(s) = self.socket.get() {
                break s;
            }
            self.ready.notified().await;
        };
        info!("MQTT-SN receiver running on {}", socket.local_addr()?);

        let mut buf = [0u8; MAX_PACKET];
        let mut next_ping = self.next_ping().await;
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => {
                    let (n, from) = res?;
                    self.dispatch(&buf[..n], from).await;
                }
                _ = self.linked.notified() => {
                    next_ping = self.next_ping().await;
                }
                _ = sleep_until(next_ping) => {
                    if self.ensure_connected().await.is_ok() {
                        debug!("MQTT-SN keep-alive ping");
                        if let Err(e) = self.send(&Packet::PingReq).await {
                            warn!("MQTT-SN ping failed: {e}");
                        }
                    }
                    next_ping = self.next_ping().await;
                }
            }
        }
    }

    /// When the next PINGREQ is due: half the keep-alive while connected.
    async fn next_ping(&self) -> Instant {
        let interval = match *self.link.read().await {
            Some(l) if l.connected => (l.keep_alive / 2).max(MIN_PING),
            _ => IDLE_PING,
        };
        Instant::now() + interval
    }

    async fn dispatch(&self, data: &[u8], from: SocketAddr) {
        let link = *self.link.read().await;
        if link.map(|l| l.gateway) != Some(from) {
            debug!("MQTT-SN dropping datagram from {from}");
            return;
        }
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("MQTT-SN bad packet from {from}: {e}");
                return;
            }
        };

        let reply = match packet {
            Packet::Publish { flags, topic_id, msg_id, data } => {
                let delivery = Delivery {
                    topic_id,
                    payload: data,
                };
                if self.deliveries_tx.try_send(delivery).is_err() {
                    warn!("MQTT-SN delivery queue full, dropping message on topic id {topic_id}");
                }
                match flags_qos(flags) {
                    QoS::AtMostOnce => None,
                    QoS::AtLeastOnce => Some(Packet::PubAck {
                        topic_id,
                        msg_id,
                        rc: RC_ACCEPTED,
                    }),
                    QoS::ExactlyOnce => Some(Packet::PubRec { msg_id }),
                }
            }
            Packet::PubRel { msg_id } => Some(Packet::PubComp { msg_id }),
            Packet::Register { topic_id, msg_id, .. } => Some(Packet::RegAck {
                topic_id,
                msg_id,
                rc: RC_ACCEPTED,
            }),
            Packet::PingReq => Some(Packet::PingResp),
            Packet::PingResp => None,
            other => {
                if other == Packet::Disconnect {
                    warn!("MQTT-SN gateway closed the session");
                    if let Some(l) = self.link.write().await.as_mut() {
                        l.connected = false;
                    }
                }
                if self.responses_tx.try_send(other).is_err() {
                    debug!("MQTT-SN no room for response, dropped");
                }
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = self.send(&reply).await {
                warn!("MQTT-SN cannot answer gateway: {e}");
            }
        }
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let data = packet.encode()?;
        self.send_raw(&data).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<(), TransportError> {
        let gateway = self.link.read().await.map(|l| l.gateway).ok_or(TransportError::NotConnected)?;
        let socket = self.socket.get().ok_or(TransportError::NotConnected)?;
        socket.send_to(data, gateway).await?;
        Ok(())
    }

    /// Send `packet` and wait for a response accepted by `want`,
    /// retransmitting on timeout.
    async fn request(
        &self,
        rx: &mut mpsc::Receiver<Packet>,
        packet: &Packet,
        want: impl Fn(&Packet) -> bool,
    ) -> Result<Packet, TransportError> {
        let data = packet.encode()?;
        for attempt in 1..=self.retries {
            self.send_raw(&data).await?;
            let deadline = Instant::now() + self.retry_timeout;
            loop {
                match timeout_at(deadline, rx.recv()).await {
                    Err(_) => break,
                    Ok(None) => return Err(TransportError::Closed),
                    Ok(Some(Packet::Disconnect)) => return Err(TransportError::NotConnected),
                    Ok(Some(p)) if want(&p) => return Ok(p),
                    Ok(Some(p)) => debug!("MQTT-SN ignoring stray {p:?}"),
                }
            }
            warn!("MQTT-SN no answer to attempt {attempt}/{}", self.retries);
        }
        Err(TransportError::Timeout)
    }

    fn next_msg_id(&self) -> u16 {
        loop {
            let id = self.msg_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        match *self.link.read().await {
            Some(l) if l.connected => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn bind(&self, gateway: SocketAddr) -> Result<(), TransportError> {
        let local = match gateway.ip() {
            IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            IpAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        };
        self.socket.get_or_try_init(|| UdpSocket::bind(local)).await?;
        self.ready.notify_one();
        Ok(())
    }
}

impl Default for MqttSnClient {
    fn default() -> Self {
        Self::new()
    }
}

fn accepted(rc: u8) -> Result<(), TransportError> {
    match rc {
        RC_ACCEPTED => Ok(()),
        rc => Err(TransportError::Rejected(rc)),
    }
}

impl Transport for MqttSnClient {
    async fn connect(
        &self,
        gateway: SocketAddr,
        client_id: &str,
        will: Option<Will<'_>>,
        keep_alive: Duration,
    ) -> Result<(), TransportError> {
        self.bind(gateway).await?;
        *self.link.write().await = Some(Link {
            gateway,
            keep_alive,
            connected: false,
        });

        let mut rx = self.responses.lock().await;
        while rx.try_recv().is_ok() {}

        let mut flags = FLAG_CLEAN;
        if will.is_some() {
            flags |= FLAG_WILL;
        }
        let mut next = Packet::Connect {
            flags,
            duration: u16::try_from(keep_alive.as_secs()).unwrap_or(u16::MAX),
            client_id: client_id.to_string(),
        };
        loop {
            let reply = self
                .request(&mut rx, &next, |p| {
                    matches!(p, Packet::ConnAck { .. } | Packet::WillTopicReq | Packet::WillMsgReq)
                })
                .await?;
            next = match (reply, will) {
                (Packet::WillTopicReq, Some(w)) => Packet::WillTopic {
                    flags: 0,
                    topic: w.topic.to_string(),
                },
                (Packet::WillMsgReq, Some(w)) => Packet::WillMsg {
                    msg: w.message.to_vec(),
                },
                (Packet::ConnAck { rc }, _) => {
                    accepted(rc)?;
                    break;
                }
                _ => return Err(TransportError::Malformed("will requested but none configured")),
            };
        }

        if let Some(l) = self.link.write().await.as_mut() {
            l.connected = true;
        }
        self.linked.notify_one();
        Ok(())
    }

    async fn register(&self, topic: &str) -> Result<u16, TransportError> {
        self.ensure_connected().await?;
        let mut rx = self.responses.lock().await;
        let msg_id = self.next_msg_id();
        let packet = Packet::Register {
            topic_id: 0,
            msg_id,
            topic: topic.to_string(),
        };
        match self
            .request(&mut rx, &packet, |p| matches!(p, Packet::RegAck { msg_id: m, .. } if *m == msg_id))
            .await?
        {
            Packet::RegAck { topic_id, rc, .. } => accepted(rc).map(|_| topic_id),
            _ => Err(TransportError::Malformed("expected REGACK")),
        }
    }

    async fn publish(&self, topic_id: u16, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        let msg_id = match qos {
            QoS::AtMostOnce => 0,
            _ => self.next_msg_id(),
        };
        let packet = Packet::Publish {
            flags: qos_flags(qos),
            topic_id,
            msg_id,
            data: payload.to_vec(),
        };

        match qos {
            QoS::AtMostOnce => self.send(&packet).await,
            QoS::AtLeastOnce => {
                let mut rx = self.responses.lock().await;
                match self
                    .request(&mut rx, &packet, |p| matches!(p, Packet::PubAck { msg_id: m, .. } if *m == msg_id))
                    .await?
                {
                    Packet::PubAck { rc, .. } => accepted(rc),
                    _ => Err(TransportError::Malformed("expected PUBACK")),
                }
            }
            QoS::ExactlyOnce => {
                let mut rx = self.responses.lock().await;
                let reply = self
                    .request(&mut rx, &packet, |p| {
                        matches!(p, Packet::PubRec { msg_id: m } if *m == msg_id)
                            || matches!(p, Packet::PubAck { msg_id: m, .. } if *m == msg_id)
                    })
                    .await?;
                // a gateway refusing the publish answers with PUBACK instead of PUBREC
                if let Packet::PubAck { rc, .. } = reply {
                    accepted(rc)?;
                    return Err(TransportError::Malformed("expected PUBREC"));
                }
                self.request(&mut rx, &Packet::PubRel { msg_id }, |p| {
                    matches!(p, Packet::PubComp { msg_id: m } if *m == msg_id)
                })
                .await
                .map(|_| ())
            }
        }
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<u16, TransportError> {
        self.ensure_connected().await?;
        let mut rx = self.responses.lock().await;
        let msg_id = self.next_msg_id();
        let packet = Packet::Subscribe {
            flags: qos_flags(qos),
            msg_id,
            topic: topic.to_string(),
        };
        match self
            .request(&mut rx, &packet, |p| matches!(p, Packet::SubAck { msg_id: m, .. } if *m == msg_id))
            .await?
        {
            Packet::SubAck { topic_id, rc, .. } => accepted(rc).map(|_| topic_id),
            _ => Err(TransportError::Malformed("expected SUBACK")),
        }
    }

    async fn recv(&self) -> Result<Delivery, TransportError> {
        self.deliveries.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}


// EOF
