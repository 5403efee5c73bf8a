//! Mock NatNet server for tests and demos.
//!
//! Answers discovery, connect, echo, description and text command requests on its command port
//! and streams frames at a configurable rate, either to every connected unicast client or to a
//! multicast group. Rigid body definitions and poses come from an [`AssetSource`].
//!
//! ```rust,no_run
//! use natnet::server::{MockServer, MockServerConfig};
//!
//! # async fn example() -> natnet::Result<()> {
//! let server = MockServer::new(MockServerConfig::default());
//! let task = server.start().await?;
//! // ... point a client at 127.0.0.1:1510 ...
//! server.close();
//! let _ = task.await;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, trace, warn};

use crate::protocol::command::{AssetRef, Command};
use crate::protocol::data::{FrameSuffix, MoCapData, RigidBodyData};
use crate::protocol::description::{
    MoCapDescription, RigidBodyDescription, RigidBodyMarkerDescription,
};
use crate::protocol::features::Feature;
use crate::protocol::server_info::{
    ConnectionInfo, DEFAULT_MULTICAST_ADDRESS, EchoResponse, ServerInfo,
};
use crate::protocol::{self, Message};
use crate::types::{FullVersion, Quaternion, Vector3, Version};
use crate::{NatNetError, Result, lock};

const MAX_ERRORS: u32 = 10;
const MIN_RATE: u32 = 1;
const MAX_RATE: u32 = 120;
/// Ticks per second of the mock clock: ticks are nanoseconds since start, plus [`TICK_ORIGIN`].
const CLOCK_FREQUENCY: u64 = 1_000_000_000;
/// Tick count at server start. Covers the exposure offset so early frame stamps keep their spacing.
const TICK_ORIGIN: u64 = EXPOSURE_TICKS;
/// Ticks between mid-exposure and transmit in every frame suffix.
const EXPOSURE_TICKS: u64 = 2_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockServerConfig {
    pub address: IpAddr,
    pub command_port: u16,
    pub data_port: u16,
    pub multicast: bool,
    pub multicast_address: Ipv4Addr,
    /// Stream version the server declares and encodes with.
    pub version: Version,
    /// Frames per second, clamped to 1..=120.
    pub rate: u32,
    /// Stop streaming after this many frames.
    pub frame_limit: Option<u32>,
    pub application_name: String,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            command_port: 1510,
            data_port: 1511,
            multicast: false,
            multicast_address: DEFAULT_MULTICAST_ADDRESS,
            version: Version::new(3, 1),
            rate: 60,
            frame_limit: None,
            application_name: "NatNet Mock".to_string(),
        }
    }
}

impl MockServerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: MockServerConfig = serde_yaml_ng::from_str(yaml)?;
        if config.version.major == 0 || config.version > Version::LATEST {
            return Err(NatNetError::Config {
                details: format!("mock server version {} is not supported", config.version),
            });
        }
        Ok(config)
    }
}

/// Supplies the assets a [`MockServer`] describes and streams.
pub trait AssetSource: Send + Sync + 'static {
    fn get_rigid_bodies_def(&self) -> Vec<RigidBodyDescription>;

    fn get_rigid_bodies_data(&self, frame_number: u32) -> Vec<RigidBodyData>;
}

/// Fixed set of rigid bodies drifting slowly along x.
#[derive(Debug, Clone)]
pub struct StaticAssets {
    bodies: Vec<RigidBodyDescription>,
}

impl StaticAssets {
    pub fn new(bodies: Vec<RigidBodyDescription>) -> Self {
        Self { bodies }
    }

    /// One body with three markers.
    pub fn single(name: &str, id: i32) -> Self {
        let markers = (1..=3)
            .map(|index| RigidBodyMarkerDescription {
                name: format!("{name}_{index}"),
                active_label: 0,
                offset: Vector3::new(0.025 * index as f32, 0.0, 0.0),
            })
            .collect();
        Self::new(vec![RigidBodyDescription {
            name: name.to_string(),
            id,
            parent_id: -1,
            offset: Vector3::default(),
            markers,
        }])
    }
}

impl Default for StaticAssets {
    fn default() -> Self {
        Self::single("RB0", 1)
    }
}

impl AssetSource for StaticAssets {
    fn get_rigid_bodies_def(&self) -> Vec<RigidBodyDescription> {
        self.bodies.clone()
    }

    fn get_rigid_bodies_data(&self, frame_number: u32) -> Vec<RigidBodyData> {
        self.bodies
            .iter()
            .enumerate()
            .map(|(index, body)| RigidBodyData {
                id: body.id,
                position: Vector3::new(frame_number as f32 * 0.001, 1.0, index as f32 * 0.5),
                orientation: Quaternion::IDENTITY,
                markers: Vec::new(),
                error: 0.0005,
                tracking_valid: true,
            })
            .collect()
    }
}

#[derive(Debug)]
struct ServerState {
    version: Version,
    version_changed: bool,
    clients: BTreeSet<IpAddr>,
    /// `None` streams every rigid body.
    subscriptions: Option<BTreeSet<i32>>,
    next_frame: u32,
}

struct ServerInner {
    config: MockServerConfig,
    assets: Arc<dyn AssetSource>,
    rate: AtomicU32,
    state: Mutex<ServerState>,
    started: Instant,
    cancel: CancellationToken,
    span: Span,
}

struct Sockets {
    command: UdpSocket,
    multicast: Option<UdpSocket>,
}

/// Cheap to clone; clones control the same server.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("command_address", &self.command_address())
            .field("rate", &self.rate())
            .finish_non_exhaustive()
    }
}

impl MockServer {
    pub fn new(config: MockServerConfig) -> Self {
        Self::with_assets(config, Arc::new(StaticAssets::default()))
    }

    pub fn with_assets(config: MockServerConfig, assets: Arc<dyn AssetSource>) -> Self {
        Self::with_span(config, assets, Span::current())
    }

    pub fn with_span(config: MockServerConfig, assets: Arc<dyn AssetSource>, span: Span) -> Self {
        let state = ServerState {
            version: config.version,
            version_changed: false,
            clients: BTreeSet::new(),
            subscriptions: None,
            next_frame: 0,
        };
        Self {
            inner: Arc::new(ServerInner {
                rate: AtomicU32::new(config.rate.clamp(MIN_RATE, MAX_RATE)),
                state: Mutex::new(state),
                started: Instant::now(),
                cancel: CancellationToken::new(),
                assets,
                config,
                span,
            }),
        }
    }

    pub fn config(&self) -> &MockServerConfig {
        &self.inner.config
    }

    pub fn command_address(&self) -> SocketAddr {
        SocketAddr::new(self.inner.config.address, self.inner.config.command_port)
    }

    pub fn rate(&self) -> u32 {
        self.inner.rate.load(Ordering::Relaxed)
    }

    /// Sets the frame rate, clamped to 1..=120 Hz. Returns the applied rate.
    pub fn set_rate(&self, hz: u32) -> u32 {
        let hz = hz.clamp(MIN_RATE, MAX_RATE);
        self.inner.rate.store(hz, Ordering::Relaxed);
        debug!(hz, "Mock server rate changed");
        hz
    }

    pub fn version(&self) -> Version {
        lock(&self.inner.state).version
    }

    /// Frames streamed so far.
    pub fn frames_sent(&self) -> u32 {
        lock(&self.inner.state).next_frame
    }

    pub fn clients(&self) -> Vec<IpAddr> {
        lock(&self.inner.state).clients.iter().copied().collect()
    }

    pub fn get_rigid_bodies_def(&self) -> Vec<RigidBodyDescription> {
        self.inner.assets.get_rigid_bodies_def()
    }

    pub fn get_rigid_bodies_data(&self, frame_number: u32) -> Vec<RigidBodyData> {
        self.inner.assets.get_rigid_bodies_data(frame_number)
    }

    /// Binds the sockets and serves until [`MockServer::close`].
    pub async fn run(&self) -> Result<()> {
        let sockets = self.bind().await?;
        self.serve(sockets).instrument(self.inner.span.clone()).await
    }

    /// Binds the sockets, then serves on a spawned task. Requests can be sent as soon as this
    /// returns.
    pub async fn start(&self) -> Result<JoinHandle<Result<()>>> {
        let sockets = self.bind().await?;
        let server = self.clone();
        Ok(tokio::spawn(async move { server.serve(sockets).await }.instrument(self.inner.span.clone())))
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    async fn bind(&self) -> Result<Sockets> {
        let config = &self.inner.config;
        let address = self.command_address();
        let command = UdpSocket::bind(address)
            .await
            .map_err(|e| NatNetError::io_error(format!("binding mock command socket on {address}"), e))?;
        command
            .set_broadcast(true)
            .map_err(|e| NatNetError::io_error("enabling broadcast on mock command socket", e))?;

        let multicast = if config.multicast {
            let socket = UdpSocket::bind(SocketAddr::new(config.address, 0))
                .await
                .map_err(|e| NatNetError::io_error("binding mock multicast socket", e))?;
            socket
                .set_multicast_loop_v4(true)
                .map_err(|e| NatNetError::io_error("enabling multicast loopback", e))?;
            Some(socket)
        } else {
            None
        };

        info!(%address, version = %config.version, multicast = config.multicast, "Mock server listening");
        Ok(Sockets { command, multicast })
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate()))
    }

    async fn serve(&self, sockets: Sockets) -> Result<()> {
        let mut buffer = vec![0u8; 65_536];
        let mut error_count = 0u32;
        let mut period = self.period();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    info!("Mock server stopped");
                    return Ok(());
                }
                received = sockets.command.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => {
                        error_count = 0;
                        self.answer(&sockets.command, &buffer[..len], from).await;
                    }
                    Err(e) => {
                        error_count += 1;
                        warn!("Mock command socket error ({}/{}): {}", error_count, MAX_ERRORS, e);
                        if error_count >= MAX_ERRORS {
                            error!("Too many mock command socket errors, stopping");
                            return Err(NatNetError::io_error("receiving mock server commands", e));
                        }
                        tokio::time::sleep(Duration::from_millis(50 * (1 << error_count.min(5)))).await;
                    }
                },
                _ = ticker.tick() => {
                    self.stream_frame(&sockets).await;
                    let next = self.period();
                    if next != period {
                        period = next;
                        ticker = interval_at(tokio::time::Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }
    }

    async fn answer(&self, socket: &UdpSocket, datagram: &[u8], from: SocketAddr) {
        let version = self.version();
        let request = match protocol::decode_datagram(datagram, version) {
            Ok(request) => request,
            Err(e) => {
                debug!(%from, error = %e, "Mock server dropped malformed request");
                return;
            }
        };
        trace!(%from, id = ?request.id(), "Mock server request");

        let Some(reply) = self.handle(request, from) else {
            return;
        };
        // replies to a version switch already use the new layout
        let version = self.version();
        match protocol::encode(&reply, version) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, from).await {
                    debug!(%from, "Mock server reply not sent: {}", e);
                }
            }
            Err(e) => warn!(id = ?reply.id(), "Mock server reply not encodable: {}", e),
        }
    }

    /// Reply to one request, if it has one.
    fn handle(&self, request: Message, from: SocketAddr) -> Option<Message> {
        match request {
            Message::Connect(hello) => {
                let added = lock(&self.inner.state).clients.insert(from.ip());
                if added {
                    info!(client = %from, name = %hello.client_name, "Mock client connected");
                }
                Some(Message::ServerInfo(self.server_info()))
            }
            Message::Discovery(_) => Some(Message::ServerInfo(self.server_info())),
            Message::EchoRequest(echo) => Some(Message::EchoResponse(EchoResponse {
                request_stamp: echo.timestamp,
                received_stamp: self.ticks(),
            })),
            Message::ModelDefRequest => Some(Message::ModelDef(self.description())),
            Message::FrameOfDataRequest => {
                let number = lock(&self.inner.state).next_frame;
                Some(Message::FrameOfData(self.frame(number, false)))
            }
            Message::Request(payload) => Some(self.command(Command::parse(&payload))),
            Message::KeepAlive => None,
            Message::Disconnect => {
                lock(&self.inner.state).clients.remove(&from.ip());
                info!(client = %from, "Mock client disconnected");
                None
            }
            other => {
                debug!(%from, id = ?other.id(), "Mock server ignoring message");
                None
            }
        }
    }

    fn command(&self, command: Command) -> Message {
        let version = self.version();
        let ok = || Message::Response(0i32.to_le_bytes().to_vec());
        let failed = || Message::Response(1i32.to_le_bytes().to_vec());
        let unrecognized = || Message::UnrecognizedRequest(Vec::new());
        debug!(%command, "Mock server command");

        match command {
            Command::FrameRate => Message::Response((self.rate() as f32).to_le_bytes().to_vec()),
            Command::SetProperty { name, value, .. } if name == "Master Rate" => {
                match value.parse::<f32>() {
                    Ok(hz) if hz.is_finite() && hz > 0.0 => {
                        self.set_rate(hz.round() as u32);
                        ok()
                    }
                    _ => failed(),
                }
            }
            Command::SetProperty { .. } => ok(),
            Command::GetProperty { name, .. } => match name.as_str() {
                "Master Rate" => Message::Response(format!("{}\0", self.rate()).into_bytes()),
                "Enabled" | "Active" => Message::Response(vec![1]),
                _ => unrecognized(),
            },
            Command::EnableAsset(_) | Command::DisableAsset(_) => {
                if version.supports(Feature::AssetEnable) { ok() } else { unrecognized() }
            }
            Command::Subscribe { asset, .. } if version.supports(Feature::Subscriptions) => {
                match self.resolve(&asset) {
                    Some(id) => {
                        lock(&self.inner.state).subscriptions.get_or_insert_with(BTreeSet::new).insert(id);
                        ok()
                    }
                    None => failed(),
                }
            }
            Command::Unsubscribe { asset, .. } if version.supports(Feature::Subscriptions) => {
                if let (Some(id), Some(subscribed)) =
                    (self.resolve(&asset), lock(&self.inner.state).subscriptions.as_mut())
                {
                    subscribed.remove(&id);
                }
                ok()
            }
            Command::SubscribeAll { .. } | Command::ClearNameSubscriptions | Command::ClearIdSubscriptions
                if version.supports(Feature::Subscriptions) =>
            {
                lock(&self.inner.state).subscriptions = None;
                ok()
            }
            Command::Bitstream(requested)
                if version.supports(Feature::BitstreamChange)
                    && requested.major > 0
                    && requested <= Version::LATEST =>
            {
                let mut state = lock(&self.inner.state);
                state.version = requested;
                state.version_changed = true;
                info!(from = %version, to = %requested, "Mock server stream version changed");
                ok()
            }
            _ => unrecognized(),
        }
    }

    fn resolve(&self, asset: &AssetRef) -> Option<i32> {
        match asset {
            AssetRef::Id(id) => Some(*id),
            AssetRef::Name(name) => self
                .inner
                .assets
                .get_rigid_bodies_def()
                .into_iter()
                .find(|body| &body.name == name)
                .map(|body| body.id),
        }
    }

    fn ticks(&self) -> u64 {
        u64::try_from(self.inner.started.elapsed().as_nanos())
            .unwrap_or(u64::MAX)
            .saturating_add(TICK_ORIGIN)
    }

    fn server_info(&self) -> ServerInfo {
        let config = &self.inner.config;
        let version = self.version();
        ServerInfo {
            application_name: config.application_name.clone(),
            server_version: FullVersion::new(3, 1, 0, 0),
            nat_net_version: FullVersion::from(version),
            high_resolution_clock_frequency: CLOCK_FREQUENCY,
            connection_info: ConnectionInfo {
                data_port: config.data_port,
                multicast: config.multicast,
                multicast_address: config.multicast_address,
            },
        }
    }

    fn description(&self) -> MoCapDescription {
        MoCapDescription { rigid_bodies: self.get_rigid_bodies_def(), ..Default::default() }
    }

    fn frame(&self, number: u32, consume_flags: bool) -> MoCapData {
        let mut rigid_bodies = self.get_rigid_bodies_data(number);
        let version_changed = {
            let mut state = lock(&self.inner.state);
            if let Some(subscribed) = &state.subscriptions {
                rigid_bodies.retain(|body| subscribed.contains(&body.id));
            }
            if consume_flags { std::mem::take(&mut state.version_changed) } else { state.version_changed }
        };

        let now = self.ticks();
        MoCapData {
            frame_number: number,
            rigid_bodies,
            suffix: FrameSuffix {
                timecode: number,
                timestamp: f64::from(number) / f64::from(self.rate()),
                stamp_camera_mid_exposure: now - EXPOSURE_TICKS,
                stamp_data_received: now - EXPOSURE_TICKS / 2,
                stamp_transmit: now,
                bitstream_version_changed: version_changed,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Sends the next frame to every destination. The frame number advances only when at least
    /// one destination exists.
    async fn stream_frame(&self, sockets: &Sockets) {
        let config = &self.inner.config;
        let (number, version, clients) = {
            let state = lock(&self.inner.state);
            (state.next_frame, state.version, state.clients.clone())
        };
        if config.frame_limit.is_some_and(|limit| number >= limit) {
            return;
        }

        let destinations: Vec<(&UdpSocket, SocketAddr)> = match &sockets.multicast {
            Some(socket) => {
                vec![(socket, SocketAddr::new(IpAddr::V4(config.multicast_address), config.data_port))]
            }
            None => clients
                .iter()
                .map(|ip| (&sockets.command, SocketAddr::new(*ip, config.data_port)))
                .collect(),
        };
        if destinations.is_empty() {
            return;
        }

        let frame = self.frame(number, true);
        let bytes = match protocol::encode(&Message::FrameOfData(frame), version) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(frame = number, "Mock frame not encodable: {}", e);
                return;
            }
        };
        for (socket, target) in destinations {
            if let Err(e) = socket.send_to(&bytes, target).await {
                debug!(%target, "Mock frame not sent: {}", e);
            }
        }
        lock(&self.inner.state).next_frame = number + 1;
        trace!(frame = number, "Mock frame sent");
    }
}
