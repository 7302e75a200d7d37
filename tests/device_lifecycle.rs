mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use tuyalink::crypto::hmac_sha256;
use tuyalink::{
    CommandType, ConnectOptions, ConnectionState, Device, DeviceEvent, FrameCodec, TuyaError,
    TuyaMessage, Version,
};

fn is_connected(event: &DeviceEvent) -> bool {
    matches!(event, DeviceEvent::Connected)
}

fn is_state_change(event: &DeviceEvent) -> bool {
    matches!(event, DeviceEvent::StateChanged(_))
}

#[tokio::test]
async fn v33_connect_query_and_merge() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_3, port)).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_3).await;
    wait_for(&mut events, is_connected).await;
    assert!(device.is_connected());

    let query = sim.recv_cmd(CommandType::DpQuery).await;
    assert_eq!(query.seqno, Some(1));
    let body = query.json().unwrap();
    assert_eq!(body["devId"], DEVICE_ID);
    assert_eq!(body["gwId"], DEVICE_ID);

    sim.send(CommandType::DpQuery, br#"{"devId":"bfbee61e344c952b34gfia","dps":{"1":true,"2":0}}"#)
        .await;
    let DeviceEvent::StateChanged(dps) = wait_for(&mut events, is_state_change).await else {
        unreachable!()
    };
    assert_eq!(json!(dps), json!({"1": true, "2": 0}));

    // A later status report only carries the change.
    sim.send(CommandType::Status, br#"{"dps":{"2":5}}"#).await;
    let DeviceEvent::StateChanged(dps) = wait_for(&mut events, is_state_change).await else {
        unreachable!()
    };
    assert_eq!(json!(dps), json!({"1": true, "2": 5}));
    assert_eq!(json!(device.state()), json!({"1": true, "2": 5}));

    device.set_value(1, false).await.unwrap();
    let control = sim.recv_cmd(CommandType::Control).await;
    let body = control.json().unwrap();
    assert_eq!(body["dps"], json!({"1": false}));
    assert_eq!(body["devId"], DEVICE_ID);
}

#[tokio::test]
async fn v31_sends_tagged_control_frames() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_1, port)).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_1).await;
    wait_for(&mut events, is_connected).await;

    // Queries travel in plaintext.
    let raw = sim.recv_packet().await;
    assert!(raw.windows(7).any(|w| w == b"\"devId\""));
    let query = sim.codec().decode(&raw).unwrap();
    assert_eq!(query.cmd, CommandType::DpQuery as u32);

    device.set_value(3, "auto").await.unwrap();
    let raw = sim.recv_packet().await;
    assert_eq!(&raw[16..19], b"3.1");
    let control = sim.codec().decode(&raw).unwrap();
    assert_eq!(control.json().unwrap()["dps"], json!({"3": "auto"}));
}

#[tokio::test]
async fn v34_negotiates_session_before_querying() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_4, port)).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_4).await;
    sim.handshake().await;
    wait_for(&mut events, is_connected).await;
    assert_eq!(device.connection_state(), ConnectionState::Connected);

    // Decoded with the session codec, so it was sent under the session key.
    let query = sim.recv_cmd(CommandType::DpQueryNew).await;
    assert_eq!(query.seqno, Some(3));
    assert_eq!(query.json().unwrap()["devId"], DEVICE_ID);

    sim.send(CommandType::DpQueryNew, br#"{"dps":{"1":true,"20":"white"}}"#)
        .await;
    let DeviceEvent::StateChanged(dps) = wait_for(&mut events, is_state_change).await else {
        unreachable!()
    };
    assert_eq!(json!(dps), json!({"1": true, "20": "white"}));

    device.set_value(1, false).await.unwrap();
    let control = sim.recv_cmd(CommandType::ControlNew).await;
    let body = control.json().unwrap();
    assert_eq!(body["protocol"], 5);
    assert_eq!(body["data"]["dps"], json!({"1": false}));
}

#[tokio::test]
async fn v34_rejects_tampered_frames_and_keeps_the_session() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_4, port)).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_4).await;
    sim.handshake().await;
    wait_for(&mut events, is_connected).await;

    let msg = TuyaMessage::new(Version::V3_4, CommandType::Status, &br#"{"dps":{"1":true}}"#[..])
        .with_seqno(7)
        .with_retcode(0);
    let mut packet = sim.codec().encode(&msg).unwrap();
    let mac_start = packet.len() - 36;
    packet[mac_start + 3] ^= 0x40;
    sim.send_raw(&packet).await;

    let error = wait_for(&mut events, |e| matches!(e, DeviceEvent::Error(_))).await;
    let DeviceEvent::Error(err) = error else {
        unreachable!()
    };
    assert!(matches!(err, TuyaError::HmacMismatch { seqno: 7, .. }));
    assert!(err.is_integrity());
    assert!(device.is_connected());
    assert!(device.state().is_empty());

    sim.send(CommandType::Status, br#"{"dps":{"1":true}}"#).await;
    let DeviceEvent::StateChanged(dps) = wait_for(&mut events, is_state_change).await else {
        unreachable!()
    };
    assert_eq!(json!(dps), json!({"1": true}));
}

#[tokio::test]
async fn v34_bad_device_proof_aborts_connection() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_4, port)).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_4).await;
    sim.recv_cmd(CommandType::SessKeyNegStart).await;
    let mut response = REMOTE_NONCE.to_vec();
    response.extend_from_slice(&[0u8; 32]);
    sim.send(CommandType::SessKeyNegResp, &response).await;

    let error = wait_for(&mut events, |e| matches!(e, DeviceEvent::Error(_))).await;
    assert!(matches!(
        error,
        DeviceEvent::Error(TuyaError::HandshakeAuthentication)
    ));
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Disconnected));
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn v34_response_under_wrong_key_aborts_handshake() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_4, port)).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_4).await;
    let start = sim.recv_cmd(CommandType::SessKeyNegStart).await;
    assert_eq!(device.connection_state(), ConnectionState::NegotiatingSession);

    // A device configured with another local key signs its answer with it.
    let foreign_key = b"fedcba9876543210";
    let mut response = REMOTE_NONCE.to_vec();
    response.extend_from_slice(&hmac_sha256(foreign_key, &start.payload[..16]).unwrap());
    let msg = TuyaMessage::new(Version::V3_4, CommandType::SessKeyNegResp, response)
        .with_seqno(1)
        .with_retcode(0);
    let packet = FrameCodec::new(Version::V3_4, foreign_key)
        .unwrap()
        .encode(&msg)
        .unwrap();
    sim.send_raw(&packet).await;

    let error = wait_for(&mut events, |e| matches!(e, DeviceEvent::Error(_))).await;
    assert!(matches!(
        error,
        DeviceEvent::Error(TuyaError::HmacMismatch { cmd, .. })
            if cmd == CommandType::SessKeyNegResp as u32
    ));
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Disconnected));
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "no further events after the failed handshake"
    );

    device.connect(ConnectOptions::default()).await.unwrap();
    let mut sim = SimulatedDevice::accept(&listener, Version::V3_4).await;
    sim.handshake().await;
    wait_for(&mut events, is_connected).await;
}

#[tokio::test]
async fn disconnect_abandons_pending_handshake() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_4, port)).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_4).await;
    sim.recv_cmd(CommandType::SessKeyNegStart).await;
    assert_eq!(device.connection_state(), ConnectionState::NegotiatingSession);

    device.disconnect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, DeviceEvent::Disconnected)).await;
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    drop(sim);

    device.connect(ConnectOptions::default()).await.unwrap();
    let mut sim = SimulatedDevice::accept(&listener, Version::V3_4).await;
    sim.handshake().await;
    wait_for(&mut events, is_connected).await;
    assert!(device.is_connected());
}

#[tokio::test]
async fn nonzero_return_code_is_reported() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_3, port)).unwrap();
    let mut events = device.subscribe();
    device
        .connect(ConnectOptions {
            query_on_connect: false,
            enable_heartbeat: false,
        })
        .await
        .unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_3).await;
    wait_for(&mut events, is_connected).await;

    let msg = TuyaMessage::new(Version::V3_3, CommandType::Control, &b"data format error"[..])
        .with_seqno(4)
        .with_retcode(1);
    let packet = sim.codec().encode(&msg).unwrap();
    sim.send_raw(&packet).await;

    let error = wait_for(&mut events, |e| matches!(e, DeviceEvent::Error(_))).await;
    match error {
        DeviceEvent::Error(TuyaError::Protocol {
            cmd,
            seqno,
            return_code,
            payload,
        }) => {
            assert_eq!(cmd, CommandType::Control as u32);
            assert_eq!(seqno, 4);
            assert_eq!(return_code, 1);
            assert_eq!(payload, b"data format error");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(device.is_connected());
}

#[tokio::test]
async fn answered_heartbeats_keep_the_connection() {
    let (listener, port) = listen().await;
    let mut options = device_options(Version::V3_3, port);
    options.heartbeat_interval = Duration::from_millis(50);
    let device = Device::new(options).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let mut sim = SimulatedDevice::accept(&listener, Version::V3_3).await;
    wait_for(&mut events, is_connected).await;

    let beat = sim.recv_cmd(CommandType::HeartBeat).await;
    assert_eq!(beat.seqno, Some(0));
    assert_eq!(beat.json().unwrap()["devId"], DEVICE_ID);
    sim.send(CommandType::HeartBeat, b"").await;

    sim.answer_heartbeats(5).await;
    assert!(device.is_connected());
}

#[tokio::test]
async fn missed_heartbeats_disconnect_once() {
    let (listener, port) = listen().await;
    let mut options = device_options(Version::V3_3, port);
    options.heartbeat_interval = Duration::from_millis(100);
    let device = Device::new(options).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    // Accept and stay silent.
    let _sim = SimulatedDevice::accept(&listener, Version::V3_3).await;
    wait_for(&mut events, is_connected).await;

    let mut disconnects = 0;
    loop {
        match next_event(&mut events).await {
            DeviceEvent::Disconnected => disconnects += 1,
            DeviceEvent::Error(TuyaError::HeartbeatTimeout(limit)) => {
                assert_eq!(limit, Duration::from_millis(200));
                break;
            }
            _ => {}
        }
    }
    assert_eq!(disconnects, 1);
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, DeviceEvent::Disconnected));
    }
}

#[tokio::test]
async fn remote_close_and_reconnect() {
    let (listener, port) = listen().await;
    let device = Device::new(device_options(Version::V3_3, port)).unwrap();
    let mut events = device.subscribe();
    device.connect(ConnectOptions::default()).await.unwrap();

    let sim = SimulatedDevice::accept(&listener, Version::V3_3).await;
    wait_for(&mut events, is_connected).await;
    drop(sim);

    wait_for(&mut events, |e| matches!(e, DeviceEvent::Disconnected)).await;
    assert!(!device.is_connected());

    device.connect(ConnectOptions::default()).await.unwrap();
    let mut sim = SimulatedDevice::accept(&listener, Version::V3_3).await;
    wait_for(&mut events, is_connected).await;

    // Sequence numbers restart with the new socket.
    let query = sim.recv_cmd(CommandType::DpQuery).await;
    assert_eq!(query.seqno, Some(1));

    device.disconnect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, DeviceEvent::Disconnected)).await;
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}
