//! Update rate control for frame streams

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum emission rate of a frame stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every frame the server streams
    Native,

    /// At most this many frames per second, latest frame wins
    /// A limit at or above the server's frame rate collapses to Native
    Max(u32),
}

impl UpdateRate {
    /// Normalize against the server frame rate, when known
    pub fn normalize(self, server_hz: Option<f64>) -> Self {
        match (self, server_hz) {
            (UpdateRate::Max(0), _) => UpdateRate::Native,
            (UpdateRate::Max(hz), Some(server)) if hz as f64 >= server => UpdateRate::Native,
            (rate, _) => rate,
        }
    }

    /// Throttle interval, if throttling is needed
    pub fn throttle_interval(self, server_hz: Option<f64>) -> Option<Duration> {
        match self.normalize(server_hz) {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_above_server_rate_collapse_to_native() {
        assert_eq!(UpdateRate::Max(240).normalize(Some(120.0)), UpdateRate::Native);
        assert_eq!(UpdateRate::Max(30).normalize(Some(120.0)), UpdateRate::Max(30));
        assert_eq!(UpdateRate::Max(30).normalize(None), UpdateRate::Max(30));
        assert_eq!(UpdateRate::Max(0).normalize(None), UpdateRate::Native);
    }

    #[test]
    fn interval_from_rate() {
        assert_eq!(UpdateRate::Native.throttle_interval(None), None);
        assert_eq!(UpdateRate::Max(10).throttle_interval(None), Some(Duration::from_millis(100)));
    }
}
