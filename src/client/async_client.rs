//! Task based client.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_stream::wrappers::WatchStream;
use tracing::Span;

use super::ClientConfig;
use crate::clock::{EchoSample, FrameLatencies, LocalClock, SystemClock};
use crate::connection::{Connection, ConnectionState, Session};
use crate::pipeline::{Frame, FrameHandler, FrameQueue, FrameSink, PipelineSnapshot};
use crate::protocol::command::AssetRef;
use crate::protocol::description::MoCapDescription;
use crate::protocol::server_info::ServerInfo;
use crate::stream::ThrottleExt;
use crate::types::{UpdateRate, Version};
use crate::{NatNetError, Result};

/// How decoded frames reach the application.
#[derive(Clone)]
pub enum Delivery {
    /// Bounded queue drained with [`AsyncClient::get_data`].
    Queue,
    /// Called inline on the receive task for every frame.
    Handler(Arc<dyn FrameSink>),
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Queue => f.write_str("Queue"),
            Delivery::Handler(_) => f.write_str("Handler"),
        }
    }
}

/// Construction options that are not plain configuration values.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub delivery: Delivery,
    /// Parent span for every task the client spawns.
    pub span: Span,
    pub clock: Arc<dyn LocalClock>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { delivery: Delivery::Queue, span: Span::current(), clock: Arc::new(SystemClock::new()) }
    }
}

struct ClientInner {
    connection: Connection,
    queue: Option<Arc<FrameQueue>>,
}

/// NatNet client for use from async code.
///
/// Cloning is cheap and every clone drives the same connection.
///
/// # Handlers
///
/// A handler installed with [`AsyncClient::with_handler`] runs on the receive task, in line with
/// socket reads. It must not block or wait on the client: a slow handler stalls frame delivery
/// and one that awaits a command reply deadlocks the receive loop. Hand frames off to a channel
/// when more work is needed.
///
/// # Example
///
/// ```rust,no_run
/// use natnet::{AsyncClient, ClientConfig};
/// use std::time::Duration;
///
/// # async fn example() -> natnet::Result<()> {
/// let client = AsyncClient::new(ClientConfig::default()).await?;
/// client.connect().await?;
/// let frame = client.get_data(Duration::from_secs(1)).await?;
/// println!("frame {} with {} rigid bodies", frame.frame_number(), frame.data.rigid_bodies.len());
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncClient")
            .field("connection", &self.inner.connection)
            .field("queued", &self.inner.queue.as_ref().map(|queue| queue.len()))
            .finish()
    }
}

impl AsyncClient {
    /// Client delivering frames through a queue of `config.queue_capacity` frames.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        Self::with_options(config, ClientOptions::default()).await
    }

    /// Client calling `handler` for every frame. See the type docs for what handlers may do.
    pub async fn with_handler<F>(config: ClientConfig, handler: F) -> Result<Self>
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let options = ClientOptions {
            delivery: Delivery::Handler(Arc::new(FrameHandler::new(handler))),
            ..Default::default()
        };
        Self::with_options(config, options).await
    }

    pub async fn with_span(config: ClientConfig, span: Span) -> Result<Self> {
        Self::with_options(config, ClientOptions { span, ..Default::default() }).await
    }

    pub async fn with_options(config: ClientConfig, options: ClientOptions) -> Result<Self> {
        let (sink, queue): (Arc<dyn FrameSink>, _) = match options.delivery {
            Delivery::Queue => {
                let queue = Arc::new(FrameQueue::new(config.queue_capacity));
                (Arc::clone(&queue) as Arc<dyn FrameSink>, Some(queue))
            }
            Delivery::Handler(handler) => (handler, None),
        };
        let connection = Connection::open(config, sink, options.clock, options.span).await?;
        Ok(Self { inner: Arc::new(ClientInner { connection, queue }) })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.connection.session()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.connection.server_info()
    }

    pub fn description(&self) -> Option<Arc<MoCapDescription>> {
        self.inner.connection.description()
    }

    pub fn rigid_body_names(&self) -> BTreeMap<i32, String> {
        self.inner.connection.rigid_body_names()
    }

    pub fn version(&self) -> Option<Version> {
        self.inner.connection.version()
    }

    pub fn can_subscribe(&self) -> bool {
        self.inner.connection.can_subscribe()
    }

    pub fn can_change_bitstream_version(&self) -> bool {
        self.inner.connection.can_change_bitstream_version()
    }

    pub fn stats(&self) -> PipelineSnapshot {
        self.inner.connection.stats()
    }

    /// Frames evicted from the queue because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.queue.as_ref().map_or(0, |queue| queue.dropped())
    }

    pub async fn discover(
        &self,
        address: Option<IpAddr>,
        max_results: usize,
    ) -> Result<BTreeMap<SocketAddr, ServerInfo>> {
        self.inner.connection.discover(address, max_results).await
    }

    pub async fn connect(&self) -> Result<Arc<Session>> {
        self.inner.connection.connect().await
    }

    pub async fn update_description(&self) -> Result<Arc<MoCapDescription>> {
        self.inner.connection.update_description().await
    }

    pub async fn update_server_info(&self) -> Result<ServerInfo> {
        self.inner.connection.update_server_info().await
    }

    pub async fn start_listening_for_data(&self) -> Result<()> {
        self.inner.connection.start_listening_for_data().await
    }

    pub async fn subscribe(&self, kind: &str, asset: impl Into<AssetRef>) -> Result<bool> {
        self.inner.connection.subscribe(kind, asset).await
    }

    pub async fn unsubscribe(&self, kind: &str, asset: impl Into<AssetRef>) -> Result<bool> {
        self.inner.connection.unsubscribe(kind, asset).await
    }

    pub async fn subscribe_all(&self, kind: &str) -> Result<bool> {
        self.inner.connection.subscribe_all(kind).await
    }

    pub async fn clear_subscriptions(&self) -> Result<bool> {
        self.inner.connection.clear_subscriptions().await
    }

    pub async fn set_version(&self, version: Version) -> Result<bool> {
        self.inner.connection.set_version(version).await
    }

    pub async fn send_request(&self, text: &str) -> Result<Vec<u8>> {
        self.inner.connection.send_request(text).await
    }

    pub async fn get_framerate(&self) -> Result<f32> {
        self.inner.connection.get_framerate().await
    }

    pub async fn set_framerate(&self, hz: f32) -> Result<bool> {
        self.inner.connection.set_framerate(hz).await
    }

    pub async fn set_property(&self, node: Option<&str>, name: &str, value: &str) -> Result<bool> {
        self.inner.connection.set_property(node, name, value).await
    }

    pub async fn get_property(&self, node: Option<&str>, name: &str) -> Result<Vec<u8>> {
        self.inner.connection.get_property(node, name).await
    }

    pub async fn enable_asset(&self, name: &str) -> Result<bool> {
        self.inner.connection.enable_asset(name).await
    }

    pub async fn disable_asset(&self, name: &str) -> Result<bool> {
        self.inner.connection.disable_asset(name).await
    }

    /// Next queued frame, waiting up to `timeout`.
    ///
    /// Fails with [`NatNetError::InvalidState`] when frames go to a handler instead.
    pub async fn get_data(&self, timeout: Duration) -> Result<Frame> {
        let queue = self.inner.queue.as_ref().ok_or_else(|| {
            NatNetError::invalid_state("frames are delivered to a handler, not queued")
        })?;
        queue.pop(timeout).await
    }

    /// Newest frame received so far. In queue mode the queue is emptied.
    pub fn get_latest(&self) -> Option<Frame> {
        match &self.inner.queue {
            Some(queue) => queue.drain_latest(),
            None => self.inner.connection.latest().borrow().clone(),
        }
    }

    /// Frames as a stream, newest frame wins when `rate` is below the server's frame rate.
    ///
    /// The stream ends when the connection closes.
    pub fn watch_frames(&self, rate: UpdateRate) -> impl Stream<Item = Frame> + Send + 'static {
        let mut state = self.inner.connection.state_changes();
        let closed = async move {
            let _ = state.wait_for(|state| *state == ConnectionState::Closed).await;
        };
        let frames = WatchStream::from_changes(self.inner.connection.latest())
            .filter_map(|frame| async move { frame })
            .take_until(closed);

        match rate.throttle_interval(self.inner.connection.known_framerate()) {
            None => frames.boxed(),
            Some(interval) => frames.throttle(interval).boxed(),
        }
    }

    pub async fn synchronize_clock(&self) -> Result<EchoSample> {
        self.inner.connection.synchronize_clock().await
    }

    pub fn is_clock_synchronized(&self) -> bool {
        self.inner.connection.is_clock_synchronized()
    }

    pub fn server_ticks_to_client_ns_time(&self, ticks: u64) -> Result<u64> {
        self.inner.connection.server_ticks_to_client_ns_time(ticks)
    }

    pub fn acquisition_stamp(&self, frame: &Frame) -> Result<u64> {
        self.inner.connection.acquisition_stamp(frame)
    }

    pub fn compute_latencies(&self, frame: &Frame) -> Result<FrameLatencies> {
        self.inner.connection.compute_latencies(frame)
    }

    /// Waits up to `duration`; `false` when the connection closed or lost its server first.
    pub async fn wait(&self, duration: Duration) -> bool {
        self.inner.connection.wait(duration).await
    }

    pub async fn unconnect(&self) -> Result<()> {
        self.inner.connection.unconnect().await
    }

    pub async fn close(&self) {
        self.inner.connection.close().await;
    }
}
