// tests/gateway.rs
//
// MQTT-SN client and session against an in-process gateway on loopback UDP.

use std::{cell::RefCell, net::SocketAddr, sync::Arc, time::Duration};

use lpsnode::*;
use tokio::{net::UdpSocket, time::sleep};

const REG_TOPIC_ID: u16 = 7;
const SUB_TOPIC_ID: u16 = 9;

struct Gateway {
    socket: UdpSocket,
    seen: RefCell<Vec<Packet>>,
    connack: u8,
    push_on_subscribe: Option<Vec<u8>>,
}

impl Gateway {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            seen: RefCell::new(Vec::new()),
            connack: RC_ACCEPTED,
            push_on_subscribe: None,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn published(&self) -> Vec<Vec<u8>> {
        self.seen
            .borrow()
            .iter()
            .filter_map(|p| match p {
                Packet::Publish { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    async fn reply(&self, to: SocketAddr, p: Packet) {
        self.socket.send_to(&p.encode().unwrap(), to).await.unwrap();
    }

    async fn serve(&self) {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await.unwrap();
            let packet = Packet::decode(&buf[..n]).unwrap();
            self.seen.borrow_mut().push(packet.clone());
            match packet {
                Packet::Connect { flags, .. } if flags & FLAG_WILL != 0 => {
                    self.reply(from, Packet::WillTopicReq).await
                }
                Packet::Connect { .. } | Packet::WillMsg { .. } => {
                    self.reply(from, Packet::ConnAck { rc: self.connack }).await
                }
                Packet::WillTopic { .. } => self.reply(from, Packet::WillMsgReq).await,
                Packet::Register { msg_id, .. } => {
                    let ack = Packet::RegAck {
                        topic_id: REG_TOPIC_ID,
                        msg_id,
                        rc: RC_ACCEPTED,
                    };
                    self.reply(from, ack).await
                }
                Packet::Publish { flags, topic_id, msg_id, .. } => match flags_qos(flags) {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => {
                        let ack = Packet::PubAck {
                            topic_id,
                            msg_id,
                            rc: RC_ACCEPTED,
                        };
                        self.reply(from, ack).await
                    }
                    QoS::ExactlyOnce => self.reply(from, Packet::PubRec { msg_id }).await,
                },
                Packet::PubRel { msg_id } => self.reply(from, Packet::PubComp { msg_id }).await,
                Packet::Subscribe { flags, msg_id, .. } => {
                    let ack = Packet::SubAck {
                        flags,
                        topic_id: SUB_TOPIC_ID,
                        msg_id,
                        rc: RC_ACCEPTED,
                    };
                    self.reply(from, ack).await;
                    if let Some(data) = &self.push_on_subscribe {
                        let push = Packet::Publish {
                            flags: qos_flags(QoS::AtLeastOnce),
                            topic_id: SUB_TOPIC_ID,
                            msg_id: 300,
                            data: data.clone(),
                        };
                        self.reply(from, push).await;
                    }
                }
                Packet::PingReq => self.reply(from, Packet::PingResp).await,
                _ => {}
            }
        }
    }
}

fn session_config(gw: SocketAddr) -> SessionConfig {
    SessionConfig {
        broker_addr: gw.ip().to_string(),
        broker_port: gw.port(),
        topic_in: "ctl".into(),
        topic_out: "tele".into(),
        device_id: DeviceId::try_from("node1").unwrap(),
    }
}

struct BrokenSensor;

impl PressureSensor for BrokenSensor {
    fn read_temperature(&mut self) -> Result<i16, SensorReadError> {
        Err(SensorReadError::Temperature)
    }
    fn read_pressure(&mut self) -> Result<u16, SensorReadError> {
        Ok(1000)
    }
}

#[tokio::test]
async fn client_talks_mqtt_sn() {
    let mut gw = Gateway::bind().await;
    gw.push_on_subscribe = Some(b"on".to_vec());
    let client = MqttSnClient::with_retry(Duration::from_secs(2), 2);

    let body = async {
        let will = Will {
            topic: "tele",
            message: b"connected",
        };
        client
            .connect(gw.addr(), "node1", Some(will), Duration::from_secs(360))
            .await
            .unwrap();
        assert_eq!(client.register("tele").await.unwrap(), REG_TOPIC_ID);
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            client.publish(REG_TOPIC_ID, b"x", qos).await.unwrap();
        }
        assert_eq!(client.subscribe("ctl/node1", QoS::AtMostOnce).await.unwrap(), SUB_TOPIC_ID);
        let d = client.recv().await.unwrap();
        assert_eq!(
            d,
            Delivery {
                topic_id: SUB_TOPIC_ID,
                payload: b"on".to_vec()
            }
        );
        // give the receiver a moment to ack the QoS 1 push
        sleep(Duration::from_millis(50)).await;
    };

    tokio::select! {
        r = client.run() => panic!("receiver ended: {r:?}"),
        _ = gw.serve() => unreachable!(),
        _ = body => {}
    }

    let seen = gw.seen.borrow();
    assert!(seen.contains(&Packet::WillTopic {
        flags: 0,
        topic: "tele".into()
    }));
    assert!(seen.contains(&Packet::WillMsg {
        msg: b"connected".to_vec()
    }));
    assert!(seen.iter().any(|p| matches!(p, Packet::PubRel { .. })));
    assert!(seen.contains(&Packet::PubAck {
        topic_id: SUB_TOPIC_ID,
        msg_id: 300,
        rc: RC_ACCEPTED
    }));
}

#[tokio::test]
async fn idle_client_pings_within_keep_alive() {
    let gw = Gateway::bind().await;
    let client = MqttSnClient::with_retry(Duration::from_secs(2), 2);

    let body = async {
        client
            .connect(gw.addr(), "node1", None, Duration::from_secs(2))
            .await
            .unwrap();
        sleep(Duration::from_millis(3500)).await;
    };

    tokio::select! {
        r = client.run() => panic!("receiver ended: {r:?}"),
        _ = gw.serve() => unreachable!(),
        _ = body => {}
    }

    let pings = gw.seen.borrow().iter().filter(|p| **p == Packet::PingReq).count();
    assert!(pings >= 2, "only {pings} PINGREQ in 3.5s with a 2s keep-alive");
}

#[tokio::test]
async fn session_relays_telemetry_and_control() {
    let mut gw = Gateway::bind().await;
    gw.push_on_subscribe = Some(b"blinking".to_vec());
    let transport = Arc::new(MqttSnClient::with_retry(Duration::from_secs(2), 2));

    let mut config = NodeConfig::default();
    config.session = session_config(gw.addr());
    let state = Arc::new(NodeState::new(config));
    let session = MessagingSession::new(transport.clone(), state.config.session.clone(), state.config.keep_alive());

    let body = async {
        session.setup(status_handler(state.clone())).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);

        tokio::select! {
            _ = session.receive_until_fault() => panic!("session faulted"),
            _ = async {
                while state.status.text().is_empty() {
                    sleep(Duration::from_millis(5)).await;
                }
            } => {}
        }
        assert_eq!(state.status.read(), *b"blin");

        sample_once(&mut SimulatedLps::new(Reading::new(2550, 1013)), &session)
            .await
            .unwrap();
        let err = sample_once(&mut BrokenSensor, &session).await.unwrap_err();
        assert!(matches!(err, TickError::Sensor(SensorReadError::Temperature)));
        assert_eq!(session.state(), SessionState::Active);
        sleep(Duration::from_millis(50)).await;
    };

    tokio::select! {
        r = transport.run() => panic!("receiver ended: {r:?}"),
        _ = gw.serve() => unreachable!(),
        _ = body => {}
    }

    let published = gw.published();
    assert_eq!(published.len(), 1);
    let v: serde_json::Value = serde_json::from_slice(&published[0]).unwrap();
    assert_eq!(v["id"], "node1");
    assert_eq!(v["Pressure(hPa)"].as_str().unwrap().len(), 4);
    assert!(gw.seen.borrow().contains(&Packet::Subscribe {
        flags: qos_flags(QoS::AtMostOnce),
        msg_id: 1,
        topic: "ctl/node1".into()
    }));
}

#[tokio::test]
async fn rejected_connect_faults_session() {
    let mut gw = Gateway::bind().await;
    gw.connack = 0x03;
    let transport = Arc::new(MqttSnClient::with_retry(Duration::from_secs(2), 1));
    let session = MessagingSession::new(transport.clone(), session_config(gw.addr()), Duration::from_secs(60));

    let body = async {
        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Transport {
                source: TransportError::Rejected(0x03),
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Faulted);
        let err = session.publish("tele", b"x", QoS::AtMostOnce).await.unwrap_err();
        assert!(matches!(err, PublishError::NotActive(SessionState::Faulted)));
    };

    tokio::select! {
        r = transport.run() => panic!("receiver ended: {r:?}"),
        _ = gw.serve() => unreachable!(),
        _ = body => {}
    }
    assert!(gw.published().is_empty());
}

#[tokio::test]
async fn silent_gateway_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = MqttSnClient::with_retry(Duration::from_millis(50), 2);

    let body = client.connect(silent.local_addr().unwrap(), "node1", None, Duration::from_secs(60));
    let res = tokio::select! {
        r = client.run() => panic!("receiver ended: {r:?}"),
        r = body => r,
    };
    assert!(matches!(res, Err(TransportError::Timeout)));

    // the CONNECT went out once per attempt
    let mut buf = [0u8; MAX_PACKET];
    for _ in 0..2 {
        let (n, _) = silent.recv_from(&mut buf).await.unwrap();
        assert!(matches!(Packet::decode(&buf[..n]).unwrap(), Packet::Connect { .. }));
    }
}

// EOF
