//! Loopback tests for the connection state machine
//!
//! Each test starts a mock server on fresh ports and drives a connection against it.

use super::*;
use crate::pipeline::FrameQueue;
use crate::server::{MockServer, MockServerConfig};
use crate::test_utils::{free_ports, init_tracing, loopback_configs};
use anyhow::{Context, ensure};
use tokio::task::JoinHandle;

struct Harness {
    server: MockServer,
    server_task: JoinHandle<Result<()>>,
    connection: Connection,
    queue: Arc<FrameQueue>,
}

impl Harness {
    async fn start(version: Version) -> anyhow::Result<Self> {
        let (server_config, client_config) = loopback_configs(version);
        Self::start_with(server_config, client_config).await
    }

    async fn start_with(server_config: MockServerConfig, client_config: ClientConfig) -> anyhow::Result<Self> {
        init_tracing();
        let server = MockServer::new(server_config);
        let server_task = server.start().await.context("mock server did not bind")?;
        let queue = Arc::new(FrameQueue::new(64));
        let connection = Connection::open(
            client_config,
            Arc::clone(&queue) as Arc<dyn FrameSink>,
            Arc::new(crate::clock::SystemClock::new()),
            Span::current(),
        )
        .await?;
        Ok(Self { server, server_task, connection, queue })
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        self.connection.close().await;
        self.server.close();
        self.server_task.await??;
        Ok(())
    }
}

#[tokio::test]
async fn connect_fetches_description_and_streams() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let connection = &harness.connection;

    let session = connection.connect().await?;
    ensure!(connection.state() == ConnectionState::Connected);
    ensure!(session.version == Version::new(3, 1));
    ensure!(session.server_info.application_name == "NatNet Mock");

    let description = connection.description().context("description installed")?;
    ensure!(description.rigid_bodies.len() == 1);
    ensure!(description.rigid_bodies[0].name == "RB0");
    ensure!(connection.rigid_body_names().get(&1).map(String::as_str) == Some("RB0"));

    let frame = harness.queue.pop(Duration::from_secs(2)).await?;
    ensure!(frame.data.rigid_bodies[0].id == 1, "frame {:?}", frame.data);
    ensure!(!frame.stale_description);
    ensure!(connection.stats().frames >= 1);

    harness.shutdown().await
}

#[tokio::test]
async fn second_connect_is_rejected_while_connected() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    harness.connection.connect().await?;

    let again = harness.connection.connect().await;
    ensure!(matches!(again, Err(NatNetError::InvalidState { .. })), "got {again:?}");
    ensure!(harness.connection.state() == ConnectionState::Connected);

    harness.shutdown().await
}

#[tokio::test]
async fn framerate_round_trips_through_master_rate() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let connection = &harness.connection;
    connection.connect().await?;

    ensure!(connection.get_framerate().await? == 120.0);
    ensure!(connection.set_framerate(60.0).await?);
    ensure!(connection.get_framerate().await? == 60.0);
    ensure!(harness.server.rate() == 60);
    ensure!(connection.known_framerate() == Some(60.0));

    harness.shutdown().await
}

#[tokio::test]
async fn unknown_request_is_unsupported() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    harness.connection.connect().await?;

    let reply = harness.connection.send_request("NoSuchCommand").await;
    ensure!(matches!(reply, Err(NatNetError::CapabilityUnsupported { .. })), "got {reply:?}");

    harness.shutdown().await
}

#[tokio::test]
async fn subscriptions_are_ignored_before_version_4() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let connection = &harness.connection;
    connection.connect().await?;

    ensure!(!connection.can_subscribe());
    ensure!(!connection.subscribe("RigidBody", "RB0").await?);
    ensure!(connection.state() == ConnectionState::Connected);

    harness.shutdown().await
}

#[tokio::test]
async fn subscriptions_move_between_connected_and_subscribed() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(4, 1)).await?;
    let connection = &harness.connection;
    connection.connect().await?;

    ensure!(connection.can_subscribe());
    ensure!(connection.subscribe("RigidBody", 1).await?);
    ensure!(connection.state() == ConnectionState::Subscribed);

    ensure!(connection.clear_subscriptions().await?);
    ensure!(connection.state() == ConnectionState::Connected);

    harness.shutdown().await
}

#[tokio::test]
async fn bitstream_version_change_needs_version_4() -> anyhow::Result<()> {
    let old = Harness::start(Version::new(3, 1)).await?;
    old.connection.connect().await?;
    let refused = old.connection.set_version(Version::new(3, 0)).await;
    ensure!(matches!(refused, Err(NatNetError::CapabilityUnsupported { .. })), "got {refused:?}");
    old.shutdown().await?;

    let new = Harness::start(Version::new(4, 1)).await?;
    new.connection.connect().await?;
    ensure!(new.connection.set_version(Version::new(3, 0)).await?);
    ensure!(new.connection.version() == Some(Version::new(3, 0)));
    ensure!(new.server.version() == Version::new(3, 0));

    // frames keep decoding under the new layout
    new.queue.pop(Duration::from_secs(2)).await?;
    let frame = new.queue.pop(Duration::from_secs(2)).await?;
    ensure!(frame.data.rigid_bodies[0].id == 1);

    new.shutdown().await
}

#[tokio::test]
async fn clock_sync_maps_server_ticks() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let connection = &harness.connection;
    connection.connect().await?;

    let sample = connection.synchronize_clock().await?;
    ensure!(sample.rtt_ns < Duration::from_secs(1).as_nanos() as u64);
    ensure!(connection.is_clock_synchronized());

    let early = connection.server_ticks_to_client_ns_time(1_000)?;
    let late = connection.server_ticks_to_client_ns_time(2_000_000)?;
    ensure!(late >= early);

    let frame = harness.queue.pop(Duration::from_secs(2)).await?;
    let latencies = connection.compute_latencies(&frame)?;
    ensure!(latencies.system_ns == 2_000_000, "latencies {latencies:?}");

    harness.shutdown().await
}

#[tokio::test]
async fn clock_conversion_needs_a_session() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    ensure!(!harness.connection.is_clock_synchronized());
    let mapped = harness.connection.server_ticks_to_client_ns_time(10);
    ensure!(matches!(mapped, Err(NatNetError::InvalidState { .. })), "got {mapped:?}");
    harness.shutdown().await
}

#[tokio::test]
async fn clock_conversion_ends_with_the_session() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let connection = &harness.connection;
    connection.connect().await?;
    connection.synchronize_clock().await?;
    let frame = harness.queue.pop(Duration::from_secs(2)).await?;
    connection.server_ticks_to_client_ns_time(1_000)?;

    connection.unconnect().await?;
    ensure!(!connection.is_clock_synchronized());
    let mapped = connection.server_ticks_to_client_ns_time(1_000);
    ensure!(matches!(mapped, Err(NatNetError::Closed)), "after unconnect got {mapped:?}");
    let stamp = connection.acquisition_stamp(&frame);
    ensure!(matches!(stamp, Err(NatNetError::Closed)), "after unconnect got {stamp:?}");
    let latencies = connection.compute_latencies(&frame);
    ensure!(matches!(latencies, Err(NatNetError::Closed)), "after unconnect got {latencies:?}");

    connection.connect().await?;
    connection.synchronize_clock().await?;
    connection.server_ticks_to_client_ns_time(1_000)?;

    connection.close().await;
    ensure!(!connection.is_clock_synchronized());
    let mapped = connection.server_ticks_to_client_ns_time(1_000);
    ensure!(matches!(mapped, Err(NatNetError::Closed)), "after close got {mapped:?}");
    let latencies = connection.compute_latencies(&frame);
    ensure!(matches!(latencies, Err(NatNetError::Closed)), "after close got {latencies:?}");

    harness.shutdown().await
}

#[tokio::test]
async fn unconnect_allows_reconnect() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let connection = &harness.connection;
    connection.connect().await?;
    ensure!(harness.server.clients().len() == 1);

    connection.unconnect().await?;
    ensure!(connection.state() == ConnectionState::Idle);
    ensure!(connection.session().is_none());
    let rate = connection.get_framerate().await;
    ensure!(matches!(rate, Err(NatNetError::Closed)), "got {rate:?}");
    ensure!(connection.wait(Duration::from_millis(10)).await, "an idle connection waits out the duration");

    // the mock drops the client on Disconnect
    tokio::time::sleep(Duration::from_millis(50)).await;
    ensure!(harness.server.clients().is_empty());

    connection.connect().await?;
    ensure!(connection.state() == ConnectionState::Connected);
    ensure!(harness.server.clients().len() == 1);
    harness.queue.pop(Duration::from_secs(2)).await?;

    harness.shutdown().await
}

#[tokio::test]
async fn wait_runs_the_full_duration_before_connect() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let started = tokio::time::Instant::now();
    ensure!(harness.connection.wait(Duration::from_millis(100)).await);
    let waited = started.elapsed();
    ensure!(waited >= Duration::from_millis(100), "returned after {waited:?}");

    let connection = harness.connection.clone();
    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.close().await;
    });
    ensure!(!harness.connection.wait(Duration::from_secs(5)).await, "close ends the wait");
    closer.await?;

    harness.shutdown().await
}

#[tokio::test]
async fn commands_before_connect_are_invalid_state() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let rate = harness.connection.get_framerate().await;
    ensure!(matches!(rate, Err(NatNetError::InvalidState { .. })), "got {rate:?}");
    harness.shutdown().await
}

#[tokio::test]
async fn close_is_idempotent_and_final() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let connection = harness.connection.clone();
    connection.connect().await?;

    connection.close().await;
    connection.close().await;
    ensure!(connection.state() == ConnectionState::Closed);
    ensure!(harness.queue.is_closed());

    let reconnect = connection.connect().await;
    ensure!(matches!(reconnect, Err(NatNetError::Closed)), "got {reconnect:?}");
    let rate = connection.get_framerate().await;
    ensure!(rate.is_err());
    ensure!(!connection.wait(Duration::from_secs(1)).await);

    harness.shutdown().await
}

#[tokio::test]
async fn connect_without_server_is_unreachable() -> anyhow::Result<()> {
    init_tracing();
    let (command_port, data_port) = free_ports();
    let config = ClientConfig {
        client_address: IpAddr::from([127, 0, 0, 1]),
        server_address: IpAddr::from([127, 0, 0, 1]),
        command_port,
        data_port: Some(data_port),
        request_timeout_ms: 50,
        request_attempts: 2,
        ..Default::default()
    };
    let queue = Arc::new(FrameQueue::new(4));
    let connection = Connection::open(
        config,
        queue as Arc<dyn FrameSink>,
        Arc::new(crate::clock::SystemClock::new()),
        Span::current(),
    )
    .await?;

    let result = connection.connect().await;
    ensure!(matches!(result, Err(NatNetError::Unreachable { attempts: 2, .. })), "got {result:?}");
    ensure!(connection.state() == ConnectionState::Idle);
    ensure!(connection.session().is_none());

    connection.close().await;
    Ok(())
}

#[tokio::test]
async fn discovery_finds_the_mock_server() -> anyhow::Result<()> {
    let harness = Harness::start(Version::new(3, 1)).await?;
    let connection = &harness.connection;

    let found = connection.discover(Some(IpAddr::from([127, 0, 0, 1])), 1).await?;
    ensure!(found.len() == 1, "found {found:?}");
    let (address, info) = found.into_iter().next().context("one server")?;
    ensure!(address == harness.server.command_address());
    ensure!(info.connection_info.data_port == harness.server.config().data_port);
    ensure!(connection.state() == ConnectionState::Idle);
    ensure!(harness.server.clients().is_empty());

    harness.shutdown().await
}
