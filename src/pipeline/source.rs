//! Datagram sources feeding the pipeline.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, trace};

use crate::{NatNetError, Result};

/// Where the pipeline reads datagrams from.
///
/// Sources own their pacing: sockets wait on the network, replays on a timer.
#[async_trait::async_trait]
pub trait DatagramSource: Send + 'static {
    /// Returns:
    /// - `Ok(Some(bytes))` - one datagram
    /// - `Ok(None)` - the source is exhausted
    /// - `Err(e)` - transport failure
    async fn next_datagram(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Data socket, bound to a unicast port or joined to a multicast group.
#[derive(Debug)]
pub struct UdpDataSource {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl UdpDataSource {
    const BUFFER_SIZE: usize = 65_536;

    pub async fn unicast(address: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|e| NatNetError::io_error(format!("binding data socket on {address}"), e))?;
        info!(local = ?socket.local_addr().ok(), "Unicast data socket opened");
        Ok(Self::from_socket(socket))
    }

    /// Binds `port` on all interfaces and joins `group` through `interface`.
    pub fn multicast(group: Ipv4Addr, port: u16, interface: IpAddr) -> Result<Self> {
        let interface = match interface {
            IpAddr::V4(address) => address,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let context = format!("joining multicast group {group}:{port}");
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| NatNetError::io_error(context.clone(), e))?;
        socket
            .join_multicast_v4(&group, &interface)
            .map_err(|e| NatNetError::io_error(context.clone(), e))?;
        socket.set_nonblocking(true).map_err(|e| NatNetError::io_error(context.clone(), e))?;
        let socket = UdpSocket::from_std(socket).map_err(|e| NatNetError::io_error(context, e))?;
        info!(%group, port, %interface, "Multicast data socket opened");
        Ok(Self::from_socket(socket))
    }

    fn from_socket(socket: UdpSocket) -> Self {
        Self { socket, buffer: vec![0; Self::BUFFER_SIZE] }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(|e| NatNetError::io_error("reading data socket address", e))
    }
}

#[async_trait::async_trait]
impl DatagramSource for UdpDataSource {
    async fn next_datagram(&mut self) -> Result<Option<Vec<u8>>> {
        let (len, from) = self
            .socket
            .recv_from(&mut self.buffer)
            .await
            .map_err(|e| NatNetError::io_error("receiving frame data", e))?;
        trace!(%from, len, "Data datagram");
        Ok(Some(self.buffer[..len].to_vec()))
    }
}

/// Replays recorded datagrams at a fixed rate.
#[derive(Debug)]
pub struct ReplaySource {
    datagrams: std::vec::IntoIter<Vec<u8>>,
    interval: Interval,
}

impl ReplaySource {
    pub fn new(datagrams: Vec<Vec<u8>>, rate_hz: f64) -> Self {
        let rate_hz = rate_hz.clamp(0.1, 10_000.0);
        let mut interval = interval(Duration::from_secs_f64(1.0 / rate_hz));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(count = datagrams.len(), rate_hz, "Replay source created");
        Self { datagrams: datagrams.into_iter(), interval }
    }
}

#[async_trait::async_trait]
impl DatagramSource for ReplaySource {
    async fn next_datagram(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(datagram) = self.datagrams.next() else {
            debug!("Reached end of replay");
            return Ok(None);
        };
        self.interval.tick().await;
        Ok(Some(datagram))
    }
}
