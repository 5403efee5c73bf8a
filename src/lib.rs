//! Async client, wire codec and mock server for the NatNet motion-capture streaming protocol.
//!
//! A NatNet server (OptiTrack Motive or compatible) answers commands on a UDP command port and
//! streams one `FRAMEOFDATA` datagram per capture frame to a data port, unicast or multicast.
//! This crate speaks both sides of that exchange.
//!
//! # Features
//!
//! - **Version-aware codec**: every stream version from 1.x to 4.1, gated by one feature table
//! - **Connection state machine**: discovery, handshake, description refresh, subscriptions
//! - **Clock synchronization**: echo round trips map server ticks onto the local clock
//! - **Two facades**: [`AsyncClient`] for async code, [`SyncClient`] for blocking callers
//! - **Mock server**: a loopback [`MockServer`] for tests and local development
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use natnet::{AsyncClient, ClientConfig, UpdateRate};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> natnet::Result<()> {
//!     let client = AsyncClient::new(ClientConfig::default()).await?;
//!     let session = client.connect().await?;
//!     println!("connected to {} at {}", session.server_info.application_name, session.version);
//!
//!     let mut frames = client.watch_frames(UpdateRate::Max(30));
//!     while let Some(frame) = frames.next().await {
//!         for body in &frame.data.rigid_bodies {
//!             println!("{}: {:?}", body.id, body.position);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Wire format
pub mod protocol;

// Connection core and frame delivery
pub mod clock;
pub mod connection;
pub mod pipeline;
pub mod stream;

// Public surfaces
pub mod client;
pub mod server;

pub use error::*;
pub use types::*;

pub use client::{AsyncClient, ClientConfig, ClientOptions, DEFAULT_COMMAND_PORT, Delivery, SyncClient};
pub use clock::{EchoSample, FrameLatencies, LocalClock, SystemClock};
pub use connection::{Connection, ConnectionState, Session};
pub use pipeline::{Frame, FrameHandler, FrameQueue, FrameSink, PipelineSnapshot};
pub use protocol::data::MoCapData;
pub use protocol::description::MoCapDescription;
pub use protocol::server_info::ServerInfo;
pub use server::{AssetSource, MockServer, MockServerConfig, StaticAssets};

/// Locks `mutex`, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
