//! Core value types shared by the codec, the connection and the mock server.
//!
//! - [`Vector3`], [`Quaternion`], [`Matrix3x4`], [`Matrix12x12`] are the fixed-width geometry
//!   leaves embedded in data and description records.
//! - [`Version`] is the negotiated `(major, minor)` pair every version-dependent layout is keyed on;
//!   [`FullVersion`] is the four-byte form carried on the wire.
//! - [`UpdateRate`] controls how fast consumer streams are allowed to emit.

mod geometry;
mod update_rate;
mod version;

pub use geometry::{Matrix3x4, Matrix12x12, Quaternion, Vector3};
pub use update_rate::UpdateRate;
pub use version::{FullVersion, Version};
