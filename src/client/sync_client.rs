//! Blocking client running its own runtime thread.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AsyncClient, ClientConfig, ClientOptions, Delivery};
use crate::clock::{EchoSample, FrameLatencies};
use crate::connection::{ConnectionState, Session};
use crate::pipeline::{Frame, FrameHandler, PipelineSnapshot};
use crate::protocol::command::AssetRef;
use crate::protocol::description::MoCapDescription;
use crate::protocol::server_info::ServerInfo;
use crate::types::Version;
use crate::{NatNetError, Result};

/// Runs `future` on the client runtime and blocks until it finishes.
fn run_on<F, T>(runtime: &Handle, future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    futures::executor::block_on(runtime.spawn(future))
        .map_err(|e| NatNetError::Runtime { details: format!("client task failed: {e}") })?
}

/// NatNet client for blocking code.
///
/// Sockets, the receive loops and the maintenance task run on a dedicated thread; every method
/// blocks the caller until its operation finishes there. Handlers run on that thread too and
/// must not call back into the client. Methods must not be called from inside an async runtime.
#[derive(Debug)]
pub struct SyncClient {
    client: AsyncClient,
    runtime: Handle,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_options(config, ClientOptions::default())
    }

    pub fn with_handler<F>(config: ClientConfig, handler: F) -> Result<Self>
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let options = ClientOptions {
            delivery: Delivery::Handler(Arc::new(FrameHandler::new(handler))),
            ..Default::default()
        };
        Self::with_options(config, options)
    }

    pub fn with_options(config: ClientConfig, options: ClientOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| NatNetError::io_error("building client runtime", e))?;
        let handle = runtime.handle().clone();
        let shutdown = CancellationToken::new();

        let thread = std::thread::Builder::new()
            .name("natnet-client".to_string())
            .spawn({
                let shutdown = shutdown.clone();
                move || {
                    runtime.block_on(shutdown.cancelled());
                    debug!("Client runtime stopped");
                }
            })
            .map_err(|e| NatNetError::io_error("spawning client thread", e))?;

        match run_on(&handle, AsyncClient::with_options(config, options)) {
            Ok(client) => Ok(Self { client, runtime: handle, shutdown, thread: Some(thread) }),
            Err(e) => {
                shutdown.cancel();
                let _ = thread.join();
                Err(e)
            }
        }
    }

    fn run<F, T, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(AsyncClient) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        run_on(&self.runtime, operation(self.client.clone()))
    }

    /// The async client this facade drives.
    pub fn as_async(&self) -> &AsyncClient {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.client.session()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.client.server_info()
    }

    pub fn description(&self) -> Option<Arc<MoCapDescription>> {
        self.client.description()
    }

    pub fn rigid_body_names(&self) -> BTreeMap<i32, String> {
        self.client.rigid_body_names()
    }

    pub fn version(&self) -> Option<Version> {
        self.client.version()
    }

    pub fn can_subscribe(&self) -> bool {
        self.client.can_subscribe()
    }

    pub fn stats(&self) -> PipelineSnapshot {
        self.client.stats()
    }

    pub fn discover(
        &self,
        address: Option<IpAddr>,
        max_results: usize,
    ) -> Result<BTreeMap<SocketAddr, ServerInfo>> {
        self.run(move |client| async move { client.discover(address, max_results).await })
    }

    pub fn connect(&self) -> Result<Arc<Session>> {
        self.run(|client| async move { client.connect().await })
    }

    pub fn update_description(&self) -> Result<Arc<MoCapDescription>> {
        self.run(|client| async move { client.update_description().await })
    }

    pub fn start_listening_for_data(&self) -> Result<()> {
        self.run(|client| async move { client.start_listening_for_data().await })
    }

    pub fn subscribe(&self, kind: &str, asset: impl Into<AssetRef>) -> Result<bool> {
        let (kind, asset) = (kind.to_string(), asset.into());
        self.run(move |client| async move { client.subscribe(&kind, asset).await })
    }

    pub fn unsubscribe(&self, kind: &str, asset: impl Into<AssetRef>) -> Result<bool> {
        let (kind, asset) = (kind.to_string(), asset.into());
        self.run(move |client| async move { client.unsubscribe(&kind, asset).await })
    }

    pub fn subscribe_all(&self, kind: &str) -> Result<bool> {
        let kind = kind.to_string();
        self.run(move |client| async move { client.subscribe_all(&kind).await })
    }

    pub fn clear_subscriptions(&self) -> Result<bool> {
        self.run(|client| async move { client.clear_subscriptions().await })
    }

    pub fn set_version(&self, version: Version) -> Result<bool> {
        self.run(move |client| async move { client.set_version(version).await })
    }

    pub fn send_request(&self, text: &str) -> Result<Vec<u8>> {
        let text = text.to_string();
        self.run(move |client| async move { client.send_request(&text).await })
    }

    pub fn get_framerate(&self) -> Result<f32> {
        self.run(|client| async move { client.get_framerate().await })
    }

    pub fn set_framerate(&self, hz: f32) -> Result<bool> {
        self.run(move |client| async move { client.set_framerate(hz).await })
    }

    pub fn set_property(&self, node: Option<&str>, name: &str, value: &str) -> Result<bool> {
        let (node, name, value) = (node.map(str::to_string), name.to_string(), value.to_string());
        self.run(move |client| async move { client.set_property(node.as_deref(), &name, &value).await })
    }

    pub fn get_property(&self, node: Option<&str>, name: &str) -> Result<Vec<u8>> {
        let (node, name) = (node.map(str::to_string), name.to_string());
        self.run(move |client| async move { client.get_property(node.as_deref(), &name).await })
    }

    pub fn enable_asset(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.run(move |client| async move { client.enable_asset(&name).await })
    }

    pub fn disable_asset(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.run(move |client| async move { client.disable_asset(&name).await })
    }

    /// Blocks until the next frame is queued or `timeout` elapses.
    pub fn get_data(&self, timeout: Duration) -> Result<Frame> {
        self.run(move |client| async move { client.get_data(timeout).await })
    }

    pub fn get_latest(&self) -> Option<Frame> {
        self.client.get_latest()
    }

    pub fn synchronize_clock(&self) -> Result<EchoSample> {
        self.run(|client| async move { client.synchronize_clock().await })
    }

    pub fn server_ticks_to_client_ns_time(&self, ticks: u64) -> Result<u64> {
        self.client.server_ticks_to_client_ns_time(ticks)
    }

    pub fn compute_latencies(&self, frame: &Frame) -> Result<FrameLatencies> {
        self.client.compute_latencies(frame)
    }

    /// Blocks for `duration`; returns `false` early if the connection closes or loses its server.
    pub fn wait(&self, duration: Duration) -> bool {
        self.run(move |client| async move { Ok(client.wait(duration).await) }).unwrap_or(false)
    }

    pub fn unconnect(&self) -> Result<()> {
        self.run(|client| async move { client.unconnect().await })
    }

    /// Closes the connection; the runtime thread stops when the client is dropped.
    pub fn close(&self) -> Result<()> {
        self.run(|client| async move {
            client.close().await;
            Ok(())
        })
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing client on drop failed: {}", e);
        }
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Client runtime thread panicked");
            }
        }
    }
}
