//! A scripted Tuya device for integration tests. It speaks the device side of
//! the protocol with the crate's own codec and crypto primitives.
#![allow(dead_code)]

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tuyalink::crypto::hmac_sha256;
use tuyalink::protocol::parse_header;
use tuyalink::session::{NONCE_LEN, derive_session_key};
use tuyalink::{
    CommandType, DeviceEvent, DeviceOptions, FrameCodec, TuyaMessage, Version,
};

pub const DEVICE_ID: &str = "bfbee61e344c952b34gfia";
pub const LOCAL_KEY: &str = "0123456789abcdef";
pub const REMOTE_NONCE: [u8; NONCE_LEN] = *b"fedcba9876543210";

const TIMEOUT: Duration = Duration::from_secs(5);

/// Listener the device under test connects to.
pub async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

pub fn device_options(version: Version, port: u16) -> DeviceOptions {
    let mut options = DeviceOptions::new(DEVICE_ID, "127.0.0.1", LOCAL_KEY);
    options.port = port;
    options.version = version;
    options
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut broadcast::Receiver<DeviceEvent>) -> DeviceEvent {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a device event")
        .expect("event channel closed")
}

/// Skip events until one matches.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<DeviceEvent>, mut pred: F) -> DeviceEvent
where
    F: FnMut(&DeviceEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Device end of one accepted connection.
pub struct SimulatedDevice {
    stream: TcpStream,
    version: Version,
    codec: FrameCodec,
    pending: Vec<u8>,
    seqno: u32,
}

impl SimulatedDevice {
    pub async fn accept(listener: &TcpListener, version: Version) -> Self {
        let (stream, _) = tokio::time::timeout(TIMEOUT, listener.accept())
            .await
            .expect("device was never contacted")
            .unwrap();
        Self {
            stream,
            version,
            codec: FrameCodec::new(version, LOCAL_KEY.as_bytes()).unwrap(),
            pending: Vec::new(),
            seqno: 0,
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Read exactly one packet from the client, without decoding it.
    pub async fn recv_packet(&mut self) -> Vec<u8> {
        loop {
            if let Ok(header) = parse_header(&self.pending) {
                if self.pending.len() >= header.total_length {
                    return self.pending.drain(..header.total_length).collect();
                }
            }
            let mut buf = [0u8; 1024];
            let n = tokio::time::timeout(TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("client went quiet")
                .unwrap();
            assert!(n > 0, "client closed the connection");
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    pub async fn recv(&mut self) -> TuyaMessage {
        let packet = self.recv_packet().await;
        self.codec.decode(&packet).unwrap()
    }

    /// Receive frames until one with the given command arrives.
    pub async fn recv_cmd(&mut self, cmd: CommandType) -> TuyaMessage {
        loop {
            let msg = self.recv().await;
            if msg.cmd == cmd as u32 {
                return msg;
            }
        }
    }

    /// Send a device frame with return code 0.
    pub async fn send(&mut self, cmd: CommandType, payload: &[u8]) {
        self.seqno += 1;
        let msg = TuyaMessage::new(self.version, cmd, payload)
            .with_seqno(self.seqno)
            .with_retcode(0);
        let packet = self.codec.encode(&msg).unwrap();
        self.send_raw(&packet).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Device side of the 3.4 key exchange. Returns the session key and
    /// switches this end to it.
    pub async fn handshake(&mut self) -> [u8; 16] {
        let start = self.recv_cmd(CommandType::SessKeyNegStart).await;
        let local_nonce: [u8; NONCE_LEN] = start.payload[..NONCE_LEN].try_into().unwrap();

        let mut response = REMOTE_NONCE.to_vec();
        response.extend_from_slice(&hmac_sha256(LOCAL_KEY.as_bytes(), &local_nonce).unwrap());
        self.send(CommandType::SessKeyNegResp, &response).await;

        let finish = self.recv_cmd(CommandType::SessKeyNegFinish).await;
        assert_eq!(
            finish.payload,
            hmac_sha256(LOCAL_KEY.as_bytes(), &REMOTE_NONCE).unwrap().to_vec()
        );

        let session_key =
            derive_session_key(LOCAL_KEY.as_bytes(), &local_nonce, &REMOTE_NONCE).unwrap();
        self.codec = FrameCodec::new(self.version, &session_key).unwrap();
        session_key
    }

    /// Answer every heartbeat until the client goes away or `count` are done.
    pub async fn answer_heartbeats(&mut self, count: usize) {
        for _ in 0..count {
            self.recv_cmd(CommandType::HeartBeat).await;
            self.send(CommandType::HeartBeat, b"").await;
        }
    }
}
