//! Individual Tuya device communication and state management.
//! A background task owns the TCP connection, the 3.4 session handshake,
//! heartbeats and the data point cache; [`Device`] handles talk to it over a
//! command channel and observe it through [`DeviceEvent`]s.

use crate::codec::FrameCodec;
use crate::config::{ConnectOptions, DeviceBuilder, DeviceOptions};
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, TuyaMessage, Version, split_packets};
use crate::session::SessionNegotiator;
use futures_core::stream::Stream;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::pending;
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;
const READ_BUFFER_SIZE: usize = 4096;

/// Data point index to value, e.g. `{"1": true, "2": 0}`.
pub type DataPointSet = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// 3.4 only: socket open, session key not yet agreed
    NegotiatingSession,
    Connected,
}

/// Everything a device connection reports, in arrival order.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    /// One packet as split from the socket, before decoding
    Packet(Vec<u8>),
    /// A decoded frame
    Frame(TuyaMessage),
    /// A frame payload that parsed as JSON
    Data(Value),
    /// The full data point cache after a merge
    StateChanged(DataPointSet),
    Error(TuyaError),
}

enum DeviceCommand {
    Connect(ConnectOptions),
    Disconnect,
    Query,
    SetDps(DataPointSet),
    Send { cmd: u32, payload: Vec<u8> },
}

/// State shared with handles. Written only by the connection task.
struct SharedState {
    connection: ConnectionState,
    dps: DataPointSet,
}

/// Handle to a Tuya device. Cheap to clone; the background task stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct Device {
    options: Arc<DeviceOptions>,
    shared: Arc<RwLock<SharedState>>,
    tx: mpsc::Sender<DeviceCommand>,
    events: broadcast::Sender<DeviceEvent>,
}

// -------------------------------------------------------------------------
// Public API
// -------------------------------------------------------------------------
impl Device {
    /// Validate the options and spawn the connection task on the current tokio
    /// runtime. The device starts disconnected.
    pub fn new(options: DeviceOptions) -> Result<Self> {
        options.validate()?;
        let codec = FrameCodec::new(options.version, &options.key)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TuyaError::Io(format!("no tokio runtime: {}", e)))?;

        let options = Arc::new(options);
        let shared = Arc::new(RwLock::new(SharedState {
            connection: ConnectionState::Disconnected,
            dps: DataPointSet::new(),
        }));
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let task = ConnectionTask {
            options: options.clone(),
            shared: shared.clone(),
            events: events.clone(),
            static_codec: codec.clone(),
            codec,
            stream: None,
            connecting: None,
            negotiator: None,
            heartbeat: None,
            last_heartbeat: Instant::now(),
            seqno: 0,
            connect_options: ConnectOptions::default(),
        };
        runtime.spawn(task.run(rx));

        Ok(Self {
            options,
            shared,
            tx,
            events,
        })
    }

    pub fn builder(id: impl Into<String>, key: impl AsRef<[u8]>) -> DeviceBuilder {
        DeviceBuilder::new(id, key)
    }

    /// Open the connection. Does nothing unless the device is disconnected.
    pub async fn connect(&self, options: ConnectOptions) -> Result<()> {
        self.send_to_task(DeviceCommand::Connect(options)).await
    }

    /// Close the connection, or abandon a pending connect or handshake.
    pub async fn disconnect(&self) -> Result<()> {
        self.send_to_task(DeviceCommand::Disconnect).await
    }

    /// Ask the device for all of its data points.
    ///
    /// Sends `DpQuery` (or `DpQueryNew` for v3.4); the answer arrives as
    /// [`DeviceEvent::Data`] and [`DeviceEvent::StateChanged`].
    pub async fn query(&self) -> Result<()> {
        self.send_to_task(DeviceCommand::Query).await
    }

    /// Set one or more data points.
    pub async fn set_dps(&self, dps: DataPointSet) -> Result<()> {
        self.send_to_task(DeviceCommand::SetDps(dps)).await
    }

    /// Set a single data point.
    pub async fn set_value(&self, index: u32, value: impl Into<Value>) -> Result<()> {
        let mut dps = DataPointSet::new();
        dps.insert(index.to_string(), value.into());
        self.set_dps(dps).await
    }

    /// Frame and send an arbitrary payload with the next sequence number.
    pub async fn send(&self, cmd: impl Into<u32>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send_to_task(DeviceCommand::Send {
            cmd: cmd.into(),
            payload: payload.into(),
        })
        .await
    }

    /// Snapshot of the cached data points.
    pub fn state(&self) -> DataPointSet {
        self.shared.read().dps.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.read().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn id(&self) -> &str {
        &self.options.id
    }

    pub fn version(&self) -> Version {
        self.options.version
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Receiver for every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Returns a Stream of events from the device. Events lost to a slow
    /// consumer are skipped with a warning.
    pub fn events(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        let mut rx = self.events.subscribe();
        let id = self.options.id.clone();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Event stream for device {} lagged, {} events dropped", id, n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    async fn send_to_task(&self, cmd: DeviceCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| {
            error!("Connection task for device {} is gone", self.options.id);
            TuyaError::Offline
        })
    }
}

// -------------------------------------------------------------------------
// Payloads
// -------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatPayload<'a> {
    gw_id: &'a str,
    dev_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryPayload<'a> {
    gw_id: &'a str,
    dev_id: &'a str,
    t: String,
    dps: DataPointSet,
    uid: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlPayload<'a> {
    gw_id: &'a str,
    dev_id: &'a str,
    uid: &'a str,
    t: String,
    dps: &'a DataPointSet,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlNewData<'a> {
    ctype: u32,
    dev_id: &'a str,
    gw_id: &'a str,
    uid: &'a str,
    dps: &'a DataPointSet,
}

#[derive(Serialize)]
struct ControlNewPayload<'a> {
    data: ControlNewData<'a>,
    protocol: u32,
    t: u64,
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn heartbeat_payload(options: &DeviceOptions) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&HeartbeatPayload {
        gw_id: options.gw_id(),
        dev_id: &options.id,
    })?)
}

fn query_payload(options: &DeviceOptions, t: u64) -> Result<(CommandType, Vec<u8>)> {
    let cmd = if options.version >= Version::V3_4 {
        CommandType::DpQueryNew
    } else {
        CommandType::DpQuery
    };
    let payload = serde_json::to_vec(&QueryPayload {
        gw_id: options.gw_id(),
        dev_id: &options.id,
        t: t.to_string(),
        dps: DataPointSet::new(),
        uid: &options.id,
    })?;
    Ok((cmd, payload))
}

fn control_payload(
    options: &DeviceOptions,
    dps: &DataPointSet,
    t: u64,
) -> Result<(CommandType, Vec<u8>)> {
    if options.version >= Version::V3_4 {
        let payload = serde_json::to_vec(&ControlNewPayload {
            data: ControlNewData {
                ctype: 0,
                dev_id: &options.id,
                gw_id: options.gw_id(),
                uid: "",
                dps,
            },
            protocol: 5,
            t,
        })?;
        Ok((CommandType::ControlNew, payload))
    } else {
        let payload = serde_json::to_vec(&ControlPayload {
            gw_id: options.gw_id(),
            dev_id: &options.id,
            uid: "",
            t: t.to_string(),
            dps,
        })?;
        Ok((CommandType::Control, payload))
    }
}

/// Merge a data point delta into the cache. Later values win per key; keys
/// absent from the delta are kept.
fn merge_dps(cache: &mut DataPointSet, delta: &Map<String, Value>) {
    for (index, value) in delta {
        cache.insert(index.clone(), value.clone());
    }
}

// -------------------------------------------------------------------------
// Background task
// -------------------------------------------------------------------------

/// What woke the task up.
enum Step {
    Command(Option<DeviceCommand>),
    Read(io::Result<usize>),
    Heartbeat,
    SocketOpened(std::result::Result<io::Result<TcpStream>, JoinError>),
}

async fn read_socket(stream: Option<&mut TcpStream>, buf: &mut [u8]) -> io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => pending().await,
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn socket_opened(
    connecting: Option<&mut JoinHandle<io::Result<TcpStream>>>,
) -> std::result::Result<io::Result<TcpStream>, JoinError> {
    match connecting {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

struct ConnectionTask {
    options: Arc<DeviceOptions>,
    shared: Arc<RwLock<SharedState>>,
    events: broadcast::Sender<DeviceEvent>,
    /// Codec under the device's local key
    static_codec: FrameCodec,
    /// Codec in use: the static one, or the session one after a 3.4 handshake
    codec: FrameCodec,
    stream: Option<TcpStream>,
    connecting: Option<JoinHandle<io::Result<TcpStream>>>,
    negotiator: Option<SessionNegotiator>,
    heartbeat: Option<Interval>,
    last_heartbeat: Instant,
    seqno: u32,
    connect_options: ConnectOptions,
}

impl ConnectionTask {
    async fn run(mut self, mut rx: mpsc::Receiver<DeviceCommand>) {
        debug!("Starting connection task for device {}", self.options.id);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let step = tokio::select! {
                cmd = rx.recv() => Step::Command(cmd),
                res = read_socket(self.stream.as_mut(), &mut buf) => Step::Read(res),
                _ = next_tick(self.heartbeat.as_mut()) => Step::Heartbeat,
                res = socket_opened(self.connecting.as_mut()) => Step::SocketOpened(res),
            };

            match step {
                Step::Command(None) => {
                    debug!("All handles for device {} dropped, stopping task", self.options.id);
                    break;
                }
                Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                Step::Read(Ok(0)) => {
                    info!("Device {} closed the connection", self.options.id);
                    self.teardown();
                }
                Step::Read(Ok(n)) => self.handle_bytes(&buf[..n]).await,
                Step::Read(Err(e)) => {
                    error!("Read from device {} failed: {}", self.options.id, e);
                    self.emit(DeviceEvent::Error(e.into()));
                    self.teardown();
                }
                Step::Heartbeat => self.handle_heartbeat().await,
                Step::SocketOpened(res) => {
                    self.connecting = None;
                    match res {
                        Ok(Ok(stream)) => self.on_socket_open(stream).await,
                        Ok(Err(e)) => {
                            error!("Connect to device {} failed: {}", self.options.id, e);
                            self.emit(DeviceEvent::Error(e.into()));
                            self.teardown();
                        }
                        Err(e) => {
                            error!("Connect task for device {} failed: {}", self.options.id, e);
                            self.emit(DeviceEvent::Error(TuyaError::Io(e.to_string())));
                            self.teardown();
                        }
                    }
                }
            }
        }

        self.teardown();
        debug!("Connection task for device {} exited", self.options.id);
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.read().connection
    }

    fn set_connection_state(&self, state: ConnectionState) -> ConnectionState {
        let previous = std::mem::replace(&mut self.shared.write().connection, state);
        if previous != state {
            debug!(
                "Device {} state {:?} -> {:?}",
                self.options.id, previous, state
            );
        }
        previous
    }

    async fn handle_command(&mut self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Connect(options) => self.start_connect(options),
            DeviceCommand::Disconnect => {
                debug!("Disconnect requested for device {}", self.options.id);
                self.teardown();
            }
            DeviceCommand::Query => {
                if self.ensure_connected() {
                    self.send_query().await;
                }
            }
            DeviceCommand::SetDps(dps) => {
                if self.ensure_connected() {
                    match control_payload(&self.options, &dps, timestamp()) {
                        Ok((cmd, payload)) => {
                            self.send_frame(cmd as u32, payload, true).await;
                        }
                        Err(e) => self.emit(DeviceEvent::Error(e)),
                    }
                }
            }
            DeviceCommand::Send { cmd, payload } => {
                if self.ensure_connected() {
                    self.send_frame(cmd, payload, true).await;
                }
            }
        }
    }

    fn ensure_connected(&self) -> bool {
        if self.connection_state() == ConnectionState::Connected {
            return true;
        }
        warn!("Device {} is not connected, dropping request", self.options.id);
        self.emit(DeviceEvent::Error(TuyaError::Offline));
        false
    }

    fn start_connect(&mut self, options: ConnectOptions) {
        if self.connection_state() != ConnectionState::Disconnected {
            debug!("Device {} already connecting or connected", self.options.id);
            return;
        }
        self.connect_options = options;
        self.set_connection_state(ConnectionState::Connecting);

        let address = self.options.address();
        info!("Connecting to device {} at {}", self.options.id, address);
        self.connecting = Some(tokio::spawn(async move { TcpStream::connect(address).await }));
    }

    async fn on_socket_open(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", self.options.id, e);
        }
        self.stream = Some(stream);
        self.seqno = 0;
        info!("Socket open to device {}", self.options.id);

        if self.options.version >= Version::V3_4 {
            self.set_connection_state(ConnectionState::NegotiatingSession);
            let mut negotiator = match SessionNegotiator::new(&self.options.key) {
                Ok(n) => n,
                Err(e) => {
                    self.emit(DeviceEvent::Error(e));
                    self.teardown();
                    return;
                }
            };
            let payload = negotiator.start();
            self.negotiator = Some(negotiator);
            self.send_frame(CommandType::SessKeyNegStart as u32, payload, true)
                .await;
        } else {
            self.on_ready().await;
        }
    }

    async fn on_ready(&mut self) {
        self.set_connection_state(ConnectionState::Connected);
        info!("Device {} connected", self.options.id);
        self.emit(DeviceEvent::Connected);
        self.last_heartbeat = Instant::now();

        if self.connect_options.enable_heartbeat {
            let period = self.options.heartbeat_interval;
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.heartbeat = Some(interval);
        }

        if self.connect_options.query_on_connect {
            self.send_query().await;
        }
    }

    async fn send_query(&mut self) {
        match query_payload(&self.options, timestamp()) {
            Ok((cmd, payload)) => {
                self.send_frame(cmd as u32, payload, true).await;
            }
            Err(e) => self.emit(DeviceEvent::Error(e)),
        }
    }

    /// Encode and write one frame. A write failure tears the connection down.
    /// Returns whether the frame went out.
    async fn send_frame(&mut self, cmd: u32, payload: Vec<u8>, numbered: bool) -> bool {
        let seqno = if numbered {
            self.seqno = self.seqno.wrapping_add(1);
            Some(self.seqno)
        } else {
            None
        };
        let msg = TuyaMessage {
            version: self.options.version,
            seqno,
            cmd,
            retcode: None,
            payload,
        };

        let packet = match self.codec.encode(&msg) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to encode cmd 0x{:02X} for {}: {}", cmd, self.options.id, e);
                self.emit(DeviceEvent::Error(e));
                return false;
            }
        };

        let Some(stream) = self.stream.as_mut() else {
            self.emit(DeviceEvent::Error(TuyaError::Offline));
            return false;
        };
        if let Err(e) = stream.write_all(&packet).await {
            error!("Write to device {} failed: {}", self.options.id, e);
            self.emit(DeviceEvent::Error(e.into()));
            self.teardown();
            return false;
        }
        true
    }

    async fn handle_bytes(&mut self, data: &[u8]) {
        debug!("Received from {}: {}", self.options.id, hex::encode(data));

        for packet in split_packets(data) {
            self.emit(DeviceEvent::Packet(packet.to_vec()));
            match self.codec.decode(packet) {
                Ok(msg) => {
                    self.emit(DeviceEvent::Frame(msg.clone()));
                    self.handle_frame(msg).await;
                }
                Err(e) => {
                    warn!("Dropping packet from {}: {}", self.options.id, e);
                    self.emit(DeviceEvent::Error(e));
                    // A handshake answer that cannot be read ends the attempt.
                    if self.connection_state() == ConnectionState::NegotiatingSession {
                        self.teardown();
                    }
                }
            }
            if self.stream.is_none() {
                break;
            }
        }
    }

    async fn handle_frame(&mut self, msg: TuyaMessage) {
        let negotiating = self.connection_state() == ConnectionState::NegotiatingSession;

        if let Some(return_code) = msg.retcode.filter(|rc| *rc != 0) {
            self.emit(DeviceEvent::Error(TuyaError::Protocol {
                cmd: msg.cmd,
                seqno: msg.seqno.unwrap_or_default(),
                return_code,
                payload: msg.payload.clone(),
            }));
            if negotiating {
                self.teardown();
                return;
            }
        }

        match msg.command() {
            Some(CommandType::HeartBeat) => {
                self.last_heartbeat = Instant::now();
                return;
            }
            Some(CommandType::SessKeyNegResp) if negotiating => {
                self.finish_handshake(&msg.payload).await;
                return;
            }
            _ => {}
        }

        let Ok(value) = serde_json::from_slice::<Value>(&msg.payload) else {
            debug!("Ignoring non-JSON payload on cmd 0x{:02X}", msg.cmd);
            return;
        };
        self.emit(DeviceEvent::Data(value.clone()));

        if let Some(delta) = value.get("dps").and_then(Value::as_object) {
            let snapshot = {
                let mut shared = self.shared.write();
                merge_dps(&mut shared.dps, delta);
                shared.dps.clone()
            };
            self.emit(DeviceEvent::StateChanged(snapshot));
        }
    }

    async fn finish_handshake(&mut self, payload: &[u8]) {
        let Some(mut negotiator) = self.negotiator.take() else {
            warn!("Unexpected negotiation response from {}", self.options.id);
            return;
        };

        let handshake = match negotiator.handle_response(payload) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("Session negotiation with {} failed: {}", self.options.id, e);
                self.emit(DeviceEvent::Error(e));
                self.teardown();
                return;
            }
        };

        if !self
            .send_frame(
                CommandType::SessKeyNegFinish as u32,
                handshake.finish_payload,
                true,
            )
            .await
        {
            return;
        }

        match FrameCodec::new(self.options.version, &handshake.session.session_key) {
            Ok(codec) => self.codec = codec,
            Err(e) => {
                self.emit(DeviceEvent::Error(e));
                self.teardown();
                return;
            }
        }
        debug!("Session key for {} established", self.options.id);
        self.on_ready().await;
    }

    async fn handle_heartbeat(&mut self) {
        let limit = self.options.heartbeat_interval * 2;
        if self.last_heartbeat.elapsed() > limit {
            warn!("Heartbeat timeout for device {}", self.options.id);
            self.teardown();
            self.emit(DeviceEvent::Error(TuyaError::HeartbeatTimeout(limit)));
            return;
        }

        match heartbeat_payload(&self.options) {
            Ok(payload) => {
                self.send_frame(CommandType::HeartBeat as u32, payload, false)
                    .await;
            }
            Err(e) => self.emit(DeviceEvent::Error(e)),
        }
    }

    /// Drop the socket and everything tied to it. Emits `Disconnected` only on
    /// an actual transition.
    fn teardown(&mut self) {
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        self.stream = None;
        self.heartbeat = None;
        self.negotiator = None;
        self.codec = self.static_codec.clone();

        if self.set_connection_state(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            info!("Device {} disconnected", self.options.id);
            self.emit(DeviceEvent::Disconnected);
        }
    }
}
