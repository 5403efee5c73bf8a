//! Connection lifecycle: discovery, handshake, description and command exchanges.
//!
//! A [`Connection`] owns the command socket, the data transport and a maintenance task that keeps
//! the session alive (keep-alives, echo based clock sync, description refreshes). The current
//! server info, description and negotiated version travel together as one [`Session`] snapshot
//! published through a watch channel, so the streaming side never sees a half-updated session.
//!
//! The connection does not reconnect on its own. Repeated transport failures close it, and a
//! closed connection stays closed.

pub(crate) mod command;
pub(crate) mod discovery;
pub mod state;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, trace, warn};

use self::command::{CommandChannel, Expect};
use self::discovery::DiscoveryPlan;
pub use self::state::{ConnectionState, DataEndpoint, Session};
use crate::client::ClientConfig;
use crate::clock::{ClockSynchronizer, EchoSample, FrameLatencies, LocalClock};
use crate::pipeline::{
    Dispatcher, Frame, FrameSink, Pipeline, PipelineSnapshot, Refresh, UdpDataSource,
};
use crate::protocol::Message;
use crate::protocol::command::{AssetRef, Command, response_f32, response_status};
use crate::protocol::description::MoCapDescription;
use crate::protocol::features::Feature;
use crate::protocol::server_info::{ClientHello, EchoRequest, ServerInfo};
use crate::types::Version;
use crate::{NatNetError, Result, lock};

/// Minimum spacing between two refreshes of the same kind.
const REFRESH_COOLDOWN: Duration = Duration::from_secs(1);

/// Data transport currently feeding the dispatcher.
struct Link {
    endpoint: DataEndpoint,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    config: ClientConfig,
    hello: ClientHello,
    state: watch::Sender<ConnectionState>,
    sessions: watch::Sender<Option<Arc<Session>>>,
    command: CommandChannel,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn LocalClock>,
    sync: Mutex<ClockSynchronizer>,
    link: Mutex<Option<Link>>,
    framerate: Mutex<Option<f64>>,
    /// Serializes connect, unconnect and session replacing exchanges.
    lifecycle: tokio::sync::Mutex<()>,
    closing: AtomicBool,
    /// Set by `unconnect` until the next successful connect.
    detached: AtomicBool,
    cancel: CancellationToken,
    lost: CancellationToken,
    span: Span,
}

impl Drop for Shared {
    fn drop(&mut self) {
        debug!("Dropping connection");
        self.cancel.cancel();
        if !self.closing.swap(true, Ordering::SeqCst) {
            self.dispatcher.close();
        }
    }
}

/// Handle to one client connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("server", &self.session().map(|session| session.server_address))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens the command socket and starts the maintenance task. No traffic is sent yet.
    pub async fn open(
        config: ClientConfig,
        sink: Arc<dyn FrameSink>,
        clock: Arc<dyn LocalClock>,
        span: Span,
    ) -> Result<Self> {
        config.validate()?;

        let (sessions, session_rx) = watch::channel(None);
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (refresh_tx, refresh_rx) = mpsc::channel(4);
        let dispatcher = Arc::new(Dispatcher::new(
            session_rx.clone(),
            sink,
            Arc::clone(&clock),
            config.auto_refresh.then_some(refresh_tx),
        ));

        let cancel = CancellationToken::new();
        let lost = CancellationToken::new();
        let command = CommandChannel::open(
            config.client_address,
            session_rx,
            Arc::clone(&dispatcher),
            cancel.clone(),
            lost.clone(),
            span.clone(),
        )
        .await?;

        let shared = Arc::new(Shared {
            hello: ClientHello::new(config.client_name.clone(), config.max_version),
            sync: Mutex::new(ClockSynchronizer::new(0, config.clock_sync_window)),
            state,
            command,
            dispatcher,
            clock,
            link: Mutex::new(None),
            framerate: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            closing: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            cancel: cancel.clone(),
            lost: lost.clone(),
            span: span.clone(),
            sessions,
            config,
        });

        let maintenance = Maintenance {
            shared: Arc::downgrade(&shared),
            sessions: shared.sessions.subscribe(),
            refresh: refresh_rx,
            cancel,
            lost,
        };
        tokio::spawn(maintenance.run(shared.config.clone()).instrument(span));

        Ok(Self { shared })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.sessions.borrow().clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.session().map(|session| session.server_info.clone())
    }

    pub fn description(&self) -> Option<Arc<MoCapDescription>> {
        self.session().and_then(|session| session.description.clone())
    }

    /// Rigid body id to name, from the current description.
    pub fn rigid_body_names(&self) -> BTreeMap<i32, String> {
        self.description().map(|description| description.rigid_body_names()).unwrap_or_default()
    }

    pub fn version(&self) -> Option<Version> {
        self.session().map(|session| session.version)
    }

    pub fn can_subscribe(&self) -> bool {
        self.session().is_some_and(|session| session.can_subscribe())
    }

    pub fn can_change_bitstream_version(&self) -> bool {
        self.session().is_some_and(|session| session.can_change_bitstream_version())
    }

    pub fn stats(&self) -> PipelineSnapshot {
        self.shared.dispatcher.stats().snapshot()
    }

    /// Receiver holding the most recently decoded frame.
    pub fn latest(&self) -> watch::Receiver<Option<Frame>> {
        self.shared.dispatcher.latest()
    }

    /// Server frame rate, once [`Connection::get_framerate`] or [`Connection::set_framerate`]
    /// has succeeded.
    pub fn known_framerate(&self) -> Option<f64> {
        *lock(&self.shared.framerate)
    }

    /// Local address of the command socket.
    pub fn command_address(&self) -> Result<SocketAddr> {
        self.shared.command.local_addr()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(NatNetError::Closed);
        }
        Ok(())
    }

    fn require_session(&self) -> Result<Arc<Session>> {
        self.ensure_open()?;
        self.session().ok_or_else(|| {
            if self.shared.detached.load(Ordering::SeqCst) {
                NatNetError::Closed
            } else {
                NatNetError::invalid_state("not connected to a server")
            }
        })
    }

    fn set_state(&self, next: ConnectionState) {
        self.shared.state.send_if_modified(|state| {
            if *state == next || *state == ConnectionState::Closed {
                return false;
            }
            debug!(from = %state, to = %next, "Connection state changed");
            *state = next;
            true
        });
    }

    /// Replaces the session snapshot, resetting the clock when the server clock changed.
    fn install(&self, session: Option<Arc<Session>>) {
        if session.is_some() && self.shared.cancel.is_cancelled() {
            return;
        }
        if let Some(next) = &session {
            let frequency = next.server_info.high_resolution_clock_frequency;
            let same_clock = self.session().is_some_and(|current| {
                current.server_address == next.server_address
                    && current.server_info.high_resolution_clock_frequency == frequency
            });
            if !same_clock {
                lock(&self.shared.sync).reset(frequency);
            }
        }
        self.shared.sessions.send_replace(session);
    }

    fn session_for(&self, address: SocketAddr, info: ServerInfo) -> Session {
        let config = &self.shared.config;
        let version = Version::negotiate(config.max_version, info.version());
        let multicast = config.use_multicast.unwrap_or(info.connection_info.multicast);
        let port = match info.connection_info.data_port {
            0 => config.default_data_port(),
            port => port,
        };
        let data = DataEndpoint {
            port,
            multicast_group: multicast.then_some(info.connection_info.multicast_address),
        };
        Session::new(address, info, version, data)
    }

    /// Discovers servers on `address` (the configured discovery address when `None`).
    pub async fn discover(
        &self,
        address: Option<IpAddr>,
        max_results: usize,
    ) -> Result<BTreeMap<SocketAddr, ServerInfo>> {
        self.ensure_open()?;
        let config = &self.shared.config;
        let address = address.or(config.discovery_address).unwrap_or(config.server_address);
        let idle = self.state() == ConnectionState::Idle;
        if idle {
            self.set_state(ConnectionState::Discovering);
        }
        let found = self.discover_on(SocketAddr::new(address, config.command_port), max_results).await;
        if idle {
            self.set_state(ConnectionState::Idle);
        }
        found
    }

    async fn discover_on(
        &self,
        target: SocketAddr,
        max_results: usize,
    ) -> Result<BTreeMap<SocketAddr, ServerInfo>> {
        let config = &self.shared.config;
        let plan = DiscoveryPlan {
            target,
            timeout: config.discovery_timeout(),
            interval: config.discovery_interval(),
            max_results,
        };
        discovery::discover(&self.shared.command, &self.shared.hello, plan).await
    }

    /// Runs discovery (when a discovery address is configured), the handshake and the
    /// description exchange.
    ///
    /// On failure the connection is back in [`ConnectionState::Idle`] with no session.
    pub async fn connect(&self) -> Result<Arc<Session>> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.ensure_open()?;
        if self.state().is_connected() {
            return Err(NatNetError::invalid_state("already connected"));
        }

        match self.establish().await {
            Ok(session) => {
                self.shared.detached.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                info!(
                    server = %session.server_address,
                    version = %session.version,
                    app = %session.server_info.application_name,
                    "Connected"
                );
                Ok(session)
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.close_link().await;
                self.install(None);
                self.set_state(ConnectionState::Idle);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<Arc<Session>> {
        let config = &self.shared.config;
        let (address, discovered) = match config.discovery_address {
            Some(discovery) => {
                self.set_state(ConnectionState::Discovering);
                let target = SocketAddr::new(discovery, config.command_port);
                let found = self.discover_on(target, 1).await?;
                let (address, info) = found
                    .into_iter()
                    .next()
                    .ok_or_else(|| NatNetError::unreachable(target, config.request_attempts))?;
                (address, Some(info))
            }
            None => (config.server_command_address(), None),
        };

        self.set_state(ConnectionState::Connecting);
        debug!(%address, "Connecting");

        // a discovered server is known well enough to listen before it starts streaming to us
        if let Some(info) = discovered {
            let session = Arc::new(self.session_for(address, info));
            self.install(Some(Arc::clone(&session)));
            if config.start_listening {
                self.open_link(&session).await?;
            }
        }

        let info = self.handshake(address).await?;
        let unchanged = self.session().is_some_and(|current| current.server_info == info);
        if !unchanged {
            let session = Arc::new(self.session_for(address, info));
            self.install(Some(Arc::clone(&session)));
            if config.start_listening {
                self.open_link(&session).await?;
            }
        }

        self.fetch_description(address).await
    }

    async fn handshake(&self, address: SocketAddr) -> Result<ServerInfo> {
        let config = &self.shared.config;
        let reply = self
            .shared
            .command
            .exchange(
                address,
                &Message::Connect(self.shared.hello.clone()),
                Expect::ServerInfo,
                config.request_timeout(),
                config.request_attempts,
            )
            .await?;
        match reply {
            Message::ServerInfo(info) => Ok(info),
            other => Err(unexpected_reply("connect", &other)),
        }
    }

    async fn fetch_description(&self, address: SocketAddr) -> Result<Arc<Session>> {
        let config = &self.shared.config;
        let reply = self
            .shared
            .command
            .exchange(
                address,
                &Message::ModelDefRequest,
                Expect::ModelDef,
                config.request_timeout(),
                config.request_attempts,
            )
            .await?;
        let Message::ModelDef(description) = reply else {
            return Err(unexpected_reply("description request", &reply));
        };

        let mut replaced = None;
        self.shared.sessions.send_if_modified(|current| match current {
            Some(session) if session.server_address == address => {
                let next = Arc::new(session.with_description(description.clone()));
                *current = Some(Arc::clone(&next));
                replaced = Some(next);
                true
            }
            _ => false,
        });
        let session = replaced.ok_or(NatNetError::Closed)?;
        debug!(
            rigid_bodies = description.rigid_bodies.len(),
            skeletons = description.skeletons.len(),
            "Description installed"
        );
        Ok(session)
    }

    /// Re-fetches the description and swaps it in as a whole.
    pub async fn update_description(&self) -> Result<Arc<MoCapDescription>> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let session = self.require_session()?;
        let updated = self.fetch_description(session.server_address).await?;
        updated
            .description
            .clone()
            .ok_or_else(|| NatNetError::invalid_state("description missing after update"))
    }

    /// Re-queries the server info and renegotiates the version, keeping the description.
    pub async fn update_server_info(&self) -> Result<ServerInfo> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let session = self.require_session()?;
        let info = self.handshake(session.server_address).await?;
        let refreshed = self.session_for(session.server_address, info.clone());
        let next = match &session.description {
            Some(description) => refreshed.with_description(description.as_ref().clone()),
            None => refreshed,
        };
        info!(version = %next.version, "Server info refreshed");
        self.install(Some(Arc::new(next)));
        Ok(info)
    }

    /// Opens the data transport for the current session. Calling it again is a no-op, apart
    /// from re-registering with a unicast server.
    pub async fn start_listening_for_data(&self) -> Result<()> {
        let session = self.require_session()?;
        self.open_link(&session).await?;
        if !session.uses_multicast() {
            self.shared
                .command
                .send(session.server_address, &Message::Connect(self.shared.hello.clone()))
                .await?;
        }
        Ok(())
    }

    async fn open_link(&self, session: &Session) -> Result<()> {
        let current = lock(&self.shared.link).as_ref().map(|link| link.endpoint);
        if current == Some(session.data) {
            return Ok(());
        }
        self.close_link().await;

        let shared = &self.shared;
        let endpoint = session.data;
        let cancel = shared.cancel.child_token();
        let task = match endpoint.multicast_group {
            Some(group) => {
                let source = UdpDataSource::multicast(group, endpoint.port, shared.config.client_address)?;
                Pipeline::spawn(source, Arc::clone(&shared.dispatcher), cancel.clone(), shared.lost.clone(), shared.span.clone())
            }
            None => {
                let source =
                    UdpDataSource::unicast(SocketAddr::new(shared.config.client_address, endpoint.port)).await?;
                Pipeline::spawn(source, Arc::clone(&shared.dispatcher), cancel.clone(), shared.lost.clone(), shared.span.clone())
            }
        };
        info!(port = endpoint.port, group = ?endpoint.multicast_group, "Listening for frame data");
        *lock(&shared.link) = Some(Link { endpoint, cancel, task });
        Ok(())
    }

    async fn close_link(&self) {
        let link = lock(&self.shared.link).take();
        if let Some(link) = link {
            link.cancel.cancel();
            // the socket must be released before the port can be bound again
            if let Err(e) = link.task.await {
                debug!("Data receive task ended abnormally: {}", e);
            }
        }
    }

    async fn request(&self, command: Command) -> Result<Vec<u8>> {
        let session = self.require_session()?;
        let config = &self.shared.config;
        trace!(%command, "Sending command");
        let reply = self
            .shared
            .command
            .exchange(
                session.server_address,
                &Message::Request(command.to_bytes()),
                Expect::Response,
                config.request_timeout(),
                config.request_attempts,
            )
            .await?;
        match reply {
            Message::Response(payload) => Ok(payload),
            Message::UnrecognizedRequest(_) => {
                Err(NatNetError::unsupported(format!("command `{command}`"), session.version))
            }
            other => Err(unexpected_reply("command", &other)),
        }
    }

    /// Sends a text command verbatim and returns the raw response payload.
    pub async fn send_request(&self, text: &str) -> Result<Vec<u8>> {
        self.request(Command::parse(text.as_bytes())).await
    }

    pub async fn get_framerate(&self) -> Result<f32> {
        let hz = response_f32(&self.request(Command::FrameRate).await?)?;
        *lock(&self.shared.framerate) = Some(f64::from(hz));
        Ok(hz)
    }

    pub async fn set_framerate(&self, hz: f32) -> Result<bool> {
        let accepted = self.set_property(None, "Master Rate", &hz.to_string()).await?;
        if accepted {
            *lock(&self.shared.framerate) = Some(f64::from(hz));
        }
        Ok(accepted)
    }

    pub async fn set_property(&self, node: Option<&str>, name: &str, value: &str) -> Result<bool> {
        let command = Command::SetProperty {
            node: node.map(str::to_string),
            name: name.to_string(),
            value: value.to_string(),
        };
        Ok(accepted(&self.request(command).await?))
    }

    pub async fn get_property(&self, node: Option<&str>, name: &str) -> Result<Vec<u8>> {
        let command = Command::GetProperty { node: node.map(str::to_string), name: name.to_string() };
        self.request(command).await
    }

    pub async fn enable_asset(&self, name: &str) -> Result<bool> {
        self.require_feature(Feature::AssetEnable, "EnableAsset")?;
        Ok(accepted(&self.request(Command::EnableAsset(name.to_string())).await?))
    }

    pub async fn disable_asset(&self, name: &str) -> Result<bool> {
        self.require_feature(Feature::AssetEnable, "DisableAsset")?;
        Ok(accepted(&self.request(Command::DisableAsset(name.to_string())).await?))
    }

    fn require_feature(&self, feature: Feature, operation: &str) -> Result<Arc<Session>> {
        let session = self.require_session()?;
        if !session.version.supports(feature) {
            return Err(NatNetError::unsupported(operation, session.version));
        }
        Ok(session)
    }

    /// Whether subscription commands can be sent; logs and returns `false` otherwise, leaving the
    /// full stream in place.
    fn subscriptions_available(&self, operation: &str) -> Result<bool> {
        let session = self.require_session()?;
        if !session.can_subscribe() {
            warn!(
                version = %session.version,
                multicast = session.uses_multicast(),
                "{} ignored: server streams every asset to this session",
                operation
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Limits the stream to one asset. Returns `false` when the server refused or cannot filter.
    pub async fn subscribe(&self, kind: &str, asset: impl Into<AssetRef>) -> Result<bool> {
        if !self.subscriptions_available("subscribe")? {
            return Ok(false);
        }
        let command = Command::Subscribe { kind: kind.to_string(), asset: asset.into() };
        let accepted = accepted(&self.request(command).await?);
        if accepted {
            self.set_state(ConnectionState::Subscribed);
        }
        Ok(accepted)
    }

    pub async fn unsubscribe(&self, kind: &str, asset: impl Into<AssetRef>) -> Result<bool> {
        if !self.subscriptions_available("unsubscribe")? {
            return Ok(false);
        }
        let command = Command::Unsubscribe { kind: kind.to_string(), asset: asset.into() };
        Ok(accepted(&self.request(command).await?))
    }

    /// Streams every asset of `kind` again.
    pub async fn subscribe_all(&self, kind: &str) -> Result<bool> {
        if !self.subscriptions_available("subscribe_all")? {
            return Ok(false);
        }
        let accepted = accepted(&self.request(Command::SubscribeAll { kind: kind.to_string() }).await?);
        if accepted {
            self.set_state(ConnectionState::Connected);
        }
        Ok(accepted)
    }

    /// Drops both name and id subscriptions.
    pub async fn clear_subscriptions(&self) -> Result<bool> {
        if !self.subscriptions_available("clear_subscriptions")? {
            return Ok(false);
        }
        let by_name = accepted(&self.request(Command::ClearNameSubscriptions).await?);
        let by_id = accepted(&self.request(Command::ClearIdSubscriptions).await?);
        if by_name && by_id {
            self.set_state(ConnectionState::Connected);
        }
        Ok(by_name && by_id)
    }

    /// Asks the server to stream a different version and switches the decoder to it.
    pub async fn set_version(&self, version: Version) -> Result<bool> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let session = self.require_session()?;
        if !session.can_change_bitstream_version() {
            return Err(NatNetError::unsupported("bitstream version change", session.version));
        }
        if version.major == 0 || version > self.shared.config.max_version {
            return Err(NatNetError::unsupported(format!("stream version {version}"), session.version));
        }
        if !accepted(&self.request(Command::Bitstream(version)).await?) {
            return Ok(false);
        }
        info!(from = %session.version, to = %version, "Stream version changed");
        self.install(Some(Arc::new(session.with_server_info(session.server_info.clone(), version))));
        Ok(true)
    }

    /// Sends one echo request and records the round trip.
    pub async fn synchronize_clock(&self) -> Result<EchoSample> {
        let session = self.require_session()?;
        let shared = &self.shared;
        let stamp = shared.clock.now_ns();
        let reply = shared
            .command
            .exchange(
                session.server_address,
                &Message::EchoRequest(EchoRequest { timestamp: stamp }),
                Expect::Echo(stamp),
                shared.config.echo_timeout(),
                1,
            )
            .await?;
        let received = shared.clock.now_ns();
        let Message::EchoResponse(reply) = reply else {
            return Err(unexpected_reply("echo", &reply));
        };
        lock(&shared.sync).record(reply.request_stamp, reply.received_stamp, received)
    }

    pub fn is_clock_synchronized(&self) -> bool {
        self.session().is_some() && lock(&self.shared.sync).is_synchronized()
    }

    /// Maps a server tick value onto the local clock, in nanoseconds.
    pub fn server_ticks_to_client_ns_time(&self, ticks: u64) -> Result<u64> {
        self.require_session()?;
        lock(&self.shared.sync).server_ticks_to_client_ns_time(ticks)
    }

    /// Local time of the frame's mid-exposure instant.
    pub fn acquisition_stamp(&self, frame: &Frame) -> Result<u64> {
        self.require_session()?;
        lock(&self.shared.sync).acquisition_stamp(&frame.data.suffix)
    }

    pub fn compute_latencies(&self, frame: &Frame) -> Result<FrameLatencies> {
        self.require_session()?;
        lock(&self.shared.sync).compute_latencies(&frame.data.suffix, frame.received_ns)
    }

    /// Waits up to `duration`. Returns `false` early if the connection closes or the server is lost.
    /// An idle connection waits out the full duration.
    pub async fn wait(&self, duration: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        let lost = self.shared.lost.clone();
        let ended = async move {
            tokio::select! {
                closed = state.wait_for(|state| *state == ConnectionState::Closed) => closed.is_ok(),
                _ = lost.cancelled() => true,
            }
        };
        !matches!(tokio::time::timeout(duration, ended).await, Ok(true))
    }

    /// Leaves the server and releases the data transport. The connection can connect again.
    pub async fn unconnect(&self) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.shared.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.close_link().await;
        if let Some(session) = self.session() {
            if let Err(e) = self.shared.command.send(session.server_address, &Message::Disconnect).await {
                debug!("Disconnect not sent: {}", e);
            }
            info!(server = %session.server_address, "Disconnected");
        }
        self.install(None);
        lock(&self.shared.sync).reset(0);
        self.shared.detached.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Idle);
        Ok(())
    }

    /// Closes the connection for good. In-flight exchanges and waiting consumers are released
    /// with [`NatNetError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing connection");

        if let Some(session) = self.session() {
            if !shared.lost.is_cancelled() {
                let _ = shared.command.send(session.server_address, &Message::Disconnect).await;
            }
        }
        shared.cancel.cancel();
        self.close_link().await;
        shared.sessions.send_replace(None);
        lock(&shared.sync).reset(0);
        shared.state.send_replace(ConnectionState::Closed);
        shared.dispatcher.close();
    }

    async fn keep_alive(&self) {
        let Some(session) = self.session() else {
            return;
        };
        if session.uses_multicast() {
            return;
        }
        if let Err(e) = self.shared.command.send(session.server_address, &Message::KeepAlive).await {
            debug!("Keep-alive not sent: {}", e);
        }
    }
}

/// Command status `0`, or a reply too short to carry a status.
fn accepted(payload: &[u8]) -> bool {
    match response_status(payload) {
        Ok(status) => status == 0,
        Err(_) => true,
    }
}

fn unexpected_reply(operation: &str, message: &Message) -> NatNetError {
    NatNetError::malformed(operation, format!("unexpected reply {:?}", message.id()))
}

/// Background upkeep: clock sync echoes, keep-alives and refreshes requested by frames.
struct Maintenance {
    shared: Weak<Shared>,
    sessions: watch::Receiver<Option<Arc<Session>>>,
    refresh: mpsc::Receiver<Refresh>,
    cancel: CancellationToken,
    lost: CancellationToken,
}

impl Maintenance {
    fn connection(&self) -> Option<Connection> {
        self.shared.upgrade().map(|shared| Connection { shared })
    }

    async fn run(mut self, config: ClientConfig) {
        debug!("Maintenance task started");
        let mut echo = interval(config.clock_sync_period());
        echo.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keep_alive = interval(config.keep_alive_interval());
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut server = None;
        let mut burst = 0u32;
        let mut refresh_open = true;
        let mut refreshed: HashMap<Refresh, Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.lost.cancelled() => {
                    warn!("Transport lost, closing connection");
                    if let Some(connection) = self.connection() {
                        connection.close().await;
                    }
                    break;
                }
                changed = self.sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = self.sessions.borrow_and_update().as_ref().map(|session| {
                        (session.server_address, session.server_info.high_resolution_clock_frequency)
                    });
                    if current != server {
                        server = current;
                        burst = if config.clock_sync && server.is_some() { config.clock_sync_burst } else { 0 };
                    }
                }
                request = self.refresh.recv(), if refresh_open => {
                    let Some(request) = request else {
                        refresh_open = false;
                        continue;
                    };
                    let now = Instant::now();
                    if refreshed.get(&request).is_some_and(|at| now.duration_since(*at) < REFRESH_COOLDOWN) {
                        trace!(?request, "Refresh already done recently");
                        continue;
                    }
                    refreshed.insert(request, now);
                    let Some(connection) = self.connection() else { break };
                    let outcome = match request {
                        Refresh::Description => connection.update_description().await.map(|_| ()),
                        Refresh::ServerInfo => connection.update_server_info().await.map(|_| ()),
                    };
                    if let Err(e) = outcome {
                        warn!(?request, "Refresh failed: {}", e);
                    }
                }
                _ = keep_alive.tick() => {
                    let Some(connection) = self.connection() else { break };
                    connection.keep_alive().await;
                }
                _ = echo.tick(), if config.clock_sync && burst == 0 => {
                    let Some(connection) = self.connection() else { break };
                    echo_once(&connection).await;
                }
                _ = std::future::ready(()), if burst > 0 => {
                    burst -= 1;
                    let Some(connection) = self.connection() else { break };
                    echo_once(&connection).await;
                }
            }
        }
        debug!("Maintenance task ended");
    }
}

async fn echo_once(connection: &Connection) {
    if connection.session().is_none() {
        return;
    }
    match connection.synchronize_clock().await {
        Ok(sample) => trace!(rtt_ns = sample.rtt_ns, "Echo round trip"),
        Err(e) => debug!("Echo failed: {}", e),
    }
}
