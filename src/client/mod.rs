//! Client facades over one shared connection core.
//!
//! [`AsyncClient`] is used from async code; [`SyncClient`] wraps it for blocking callers by
//! running the same tasks on a private runtime thread. Both expose the same operations and
//! neither adds protocol behavior of its own.

mod async_client;
mod config;
mod sync_client;

pub use async_client::{AsyncClient, ClientOptions, Delivery};
pub use config::{ClientConfig, DEFAULT_COMMAND_PORT};
pub use sync_client::SyncClient;
