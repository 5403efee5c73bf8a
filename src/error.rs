//! Error types for the NatNet client, codec and mock server.
//!
//! Every fallible operation in this crate returns [`NatNetError`]. The variants
//! follow the failure scopes of the protocol:
//!
//! ## Error Categories
//!
//! - **Decode faults** ([`NatNetError::Malformed`], [`NatNetError::Incomplete`]): scoped to a
//!   single datagram. The streaming pipeline drops and counts them.
//! - **Exchange faults** ([`NatNetError::Unreachable`], [`NatNetError::Timeout`]): a command
//!   exchange ran out of its retry budget. The session keeps its prior state.
//! - **Session faults** ([`NatNetError::ClockNotSynchronized`],
//!   [`NatNetError::CapabilityUnsupported`], [`NatNetError::InvalidState`]).
//! - **Lifecycle** ([`NatNetError::Closed`]): the connection was closed.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use natnet::NatNetError;
//!
//! let error = NatNetError::unreachable("10.0.0.2:1510", 3);
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for NatNet operations.
pub type Result<T, E = NatNetError> = std::result::Result<T, E>;

/// Main error type for NatNet operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NatNetError {
    #[error("Malformed {context}: {details}")]
    Malformed { context: String, details: String },

    #[error("Incomplete message: need {needed} bytes, {available} available")]
    Incomplete { needed: usize, available: usize },

    #[error("Server {address} unreachable after {attempts} attempt(s)")]
    Unreachable { address: String, attempts: u32 },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Clock is not synchronized with the server yet")]
    ClockNotSynchronized,

    #[error("{capability} is not supported by protocol version {version}")]
    CapabilityUnsupported { capability: String, version: String },

    #[error("Connection closed")]
    Closed,

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("I/O error during {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Message payload of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },

    #[error("Configuration error: {details}")]
    Config { details: String },

    #[error("Runtime error: {details}")]
    Runtime { details: String },
}

impl NatNetError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            NatNetError::Unreachable { .. } => true,
            NatNetError::Timeout { .. } => true,
            NatNetError::ClockNotSynchronized => true,
            NatNetError::Incomplete { .. } => true,
            NatNetError::Io { .. } => true,
            NatNetError::Malformed { .. } => false,
            NatNetError::CapabilityUnsupported { .. } => false,
            NatNetError::Closed => false,
            NatNetError::InvalidState { .. } => false,
            NatNetError::Oversized { .. } => false,
            NatNetError::Config { .. } => false,
            NatNetError::Runtime { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            NatNetError::Malformed { .. } => vec![
                "Check that client and server agree on the protocol version",
                "Inspect the datagram source for truncation",
            ],
            NatNetError::Incomplete { .. } => {
                vec!["Buffer more bytes before decoding", "Check the transport for truncation"]
            }
            NatNetError::Unreachable { .. } => vec![
                "Verify the server address and command port",
                "Check that the server application is streaming",
                "Check firewall rules for UDP traffic",
            ],
            NatNetError::Timeout { .. } => vec![
                "Increase the request timeout",
                "Check network latency to the server",
            ],
            NatNetError::ClockNotSynchronized => vec![
                "Wait for the initial echo exchange to complete",
                "Enable clock synchronization in the client configuration",
            ],
            NatNetError::CapabilityUnsupported { .. } => vec![
                "Upgrade the server to a newer protocol version",
                "Use unicast streaming for subscription commands",
            ],
            NatNetError::Closed => vec!["Create a new client and reconnect"],
            NatNetError::InvalidState { .. } => {
                vec!["Connect to a server before issuing this operation"]
            }
            NatNetError::Io { .. } => vec![
                "Check that the local address and ports are available",
                "Verify network interface configuration",
            ],
            NatNetError::Oversized { .. } => vec!["Reduce the number of assets in the message"],
            NatNetError::Config { .. } => vec!["Fix the configuration value named in the error"],
            NatNetError::Runtime { .. } => vec!["Restart the client"],
        }
    }

    /// Helper constructor for malformed payloads.
    pub fn malformed(context: impl Into<String>, details: impl Into<String>) -> Self {
        NatNetError::Malformed { context: context.into(), details: details.into() }
    }

    /// Helper constructor for exhausted retry budgets.
    pub fn unreachable(address: impl ToString, attempts: u32) -> Self {
        NatNetError::Unreachable { address: address.to_string(), attempts }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        NatNetError::Timeout { operation: operation.into(), duration }
    }

    /// Helper constructor for capability gating failures.
    pub fn unsupported(capability: impl Into<String>, version: impl ToString) -> Self {
        NatNetError::CapabilityUnsupported {
            capability: capability.into(),
            version: version.to_string(),
        }
    }

    /// Helper constructor for socket failures.
    pub fn io_error(context: impl Into<String>, source: std::io::Error) -> Self {
        NatNetError::Io { context: context.into(), source }
    }

    /// Helper constructor for operations issued in the wrong lifecycle state.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        NatNetError::InvalidState { reason: reason.into() }
    }

    /// Whether this error was produced by a closed connection.
    pub fn is_closed(&self) -> bool {
        matches!(self, NatNetError::Closed)
    }
}

impl From<std::io::Error> for NatNetError {
    fn from(error: std::io::Error) -> Self {
        NatNetError::Io { context: "socket operation".to_string(), source: error }
    }
}

impl From<serde_yaml_ng::Error> for NatNetError {
    fn from(error: serde_yaml_ng::Error) -> Self {
        NatNetError::Config { details: error.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            context in "[a-zA-Z ]{1,20}",
            details in "[a-zA-Z0-9 ]{1,40}",
            address in "[0-9.:]{7,21}",
            attempts in 1u32..20u32,
            duration_ms in 1u64..60000u64
          ) {
            let malformed = NatNetError::malformed(context.clone(), details.clone());
            let unreachable = NatNetError::unreachable(address.clone(), attempts);
            let timeout = NatNetError::timeout(context.clone(), Duration::from_millis(duration_ms));

            let malformed_msg = malformed.to_string();
            prop_assert!(malformed_msg.contains(&context));
            prop_assert!(malformed_msg.contains(&details));

            let unreachable_msg = unreachable.to_string();
            prop_assert!(unreachable_msg.contains(&address));
            prop_assert!(unreachable_msg.contains(&attempts.to_string()));

            prop_assert!(timeout.to_string().contains(&context));
          }

          #[test]
          fn io_conversion_preserves_source(reason in "[a-z ]{1,30}") {
            let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, reason.clone());
            let converted: NatNetError = io_err.into();
            match converted {
              NatNetError::Io { source, .. } => {
                prop_assert_eq!(source.to_string(), reason);
              }
              _ => prop_assert!(false, "Expected Io error from io::Error conversion"),
            }
          }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<NatNetError>();

        let error = NatNetError::Closed;
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn retry_classification() {
        assert!(NatNetError::unreachable("127.0.0.1:1510", 3).is_retryable());
        assert!(NatNetError::timeout("echo", Duration::from_millis(500)).is_retryable());
        assert!(!NatNetError::malformed("frame", "short").is_retryable());
        assert!(!NatNetError::Closed.is_retryable());
        assert!(!NatNetError::unsupported("subscribe", "3.1").is_retryable());
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = vec![
            NatNetError::malformed("a", "b"),
            NatNetError::Incomplete { needed: 4, available: 2 },
            NatNetError::unreachable("x", 1),
            NatNetError::timeout("op", Duration::from_secs(1)),
            NatNetError::ClockNotSynchronized,
            NatNetError::unsupported("cap", "2.0"),
            NatNetError::Closed,
            NatNetError::invalid_state("idle"),
            NatNetError::io_error("bind", std::io::Error::other("boom")),
            NatNetError::Oversized { size: 70000, max: 65535 },
            NatNetError::Config { details: "bad".into() },
            NatNetError::Runtime { details: "gone".into() },
        ];
        for error in errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "{error} has no suggestions");
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn closed_is_cheap_to_check() {
        assert!(NatNetError::Closed.is_closed());
        assert!(!NatNetError::ClockNotSynchronized.is_closed());
    }
}
