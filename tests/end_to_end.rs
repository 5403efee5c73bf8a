//! End-to-end tests: a mock server and a client talking over loopback.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use futures::StreamExt;
use natnet::{
    AsyncClient, ClientConfig, ConnectionState, MockServer, MockServerConfig, SyncClient,
    UpdateRate, Version,
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const FRAMES: u32 = 10;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn free_ports() -> Result<(u16, u16)> {
    let command = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    let data = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok((command.local_addr()?.port(), data.local_addr()?.port()))
}

/// A server streaming exactly [`FRAMES`] frames and a client that discovers it before connecting,
/// so the data socket is open before the first frame is sent.
fn configs() -> Result<(MockServerConfig, ClientConfig)> {
    let (command_port, data_port) = free_ports()?;
    let server = MockServerConfig {
        address: LOOPBACK,
        command_port,
        data_port,
        version: Version::new(3, 1),
        rate: 100,
        frame_limit: Some(FRAMES),
        ..Default::default()
    };
    let client = ClientConfig::from_yaml_str(&format!(
        "client_address: 127.0.0.1\n\
         discovery_address: 127.0.0.1\n\
         command_port: {command_port}\n\
         request_timeout_ms: 250\n\
         discovery_timeout_ms: 1000\n\
         discovery_interval_ms: 50\n\
         queue_capacity: 32\n"
    ))?;
    Ok((server, client))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_client_receives_every_frame_in_order() -> Result<()> {
    init_tracing();
    let (server_config, client_config) = configs()?;
    let server = MockServer::new(server_config);
    let server_task = server.start().await?;

    let client = AsyncClient::new(client_config).await?;
    let session = client.connect().await?;
    ensure!(session.version == Version::new(3, 1));
    ensure!(client.rigid_body_names().get(&1).map(String::as_str) == Some("RB0"));

    for expected in 0..FRAMES {
        let frame = client.get_data(Duration::from_secs(2)).await?;
        ensure!(frame.frame_number() == expected, "got frame {} expected {expected}", frame.frame_number());
        ensure!(frame.data.rigid_bodies[0].id == 1);
    }
    ensure!(client.dropped_frames() == 0);
    ensure!(client.stats().malformed == 0);

    let timed_out = client.get_data(Duration::from_millis(100)).await;
    ensure!(timed_out.is_err(), "no frames past the limit");

    client.close().await;
    ensure!(client.state() == ConnectionState::Closed);
    server.close();
    server_task.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_sees_frames_and_stream_ends_on_close() -> Result<()> {
    init_tracing();
    let (server_config, client_config) = configs()?;
    let server = MockServer::new(server_config);
    let server_task = server.start().await?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let client = AsyncClient::with_handler(client_config, {
        let seen = Arc::clone(&seen);
        move |frame| seen.lock().expect("handler lock").push(frame.frame_number())
    })
    .await?;
    let mut frames = client.watch_frames(UpdateRate::Native);
    client.connect().await?;

    let last = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(frame) = frames.next().await {
            if frame.frame_number() == FRAMES - 1 {
                return Some(frame);
            }
        }
        None
    })
    .await?
    .context("stream ended before the last frame")?;
    ensure!(last.data.rigid_bodies[0].id == 1);

    let numbers = seen.lock().expect("handler lock").clone();
    ensure!(numbers == (0..FRAMES).collect::<Vec<_>>(), "handler saw {numbers:?}");
    ensure!(client.get_data(Duration::from_millis(10)).await.is_err(), "no queue in handler mode");

    client.close().await;
    ensure!(tokio::time::timeout(Duration::from_secs(1), frames.next()).await?.is_none());

    server.close();
    server_task.await??;
    Ok(())
}

#[test]
fn sync_client_receives_every_frame_in_order() -> Result<()> {
    init_tracing();
    let (server_config, client_config) = configs()?;
    let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(1).enable_all().build()?;
    let server = MockServer::new(server_config);
    let server_task = runtime.block_on(server.start())?;

    let client = SyncClient::new(client_config)?;
    client.connect()?;
    ensure!(client.state() == ConnectionState::Connected);
    ensure!(client.get_framerate()? == 100.0);

    for expected in 0..FRAMES {
        let frame = client.get_data(Duration::from_secs(2))?;
        ensure!(frame.frame_number() == expected, "got frame {} expected {expected}", frame.frame_number());
        ensure!(frame.data.rigid_bodies[0].id == 1);
    }

    client.synchronize_clock()?;
    ensure!(client.server_ticks_to_client_ns_time(0).is_ok());

    client.close()?;
    ensure!(client.state() == ConnectionState::Closed);
    drop(client);

    server.close();
    runtime.block_on(server_task)??;
    Ok(())
}
