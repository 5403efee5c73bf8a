//! Server tick to local time mapping.
//!
//! The server stamps every frame with its free-running high resolution tick counter. Echo
//! round trips on the command channel measure how that counter relates to the local clock:
//! each reply yields one [`EchoSample`], and the sample with the smallest round trip inside a
//! sliding window is the active estimate. Asymmetric delays bias a mean but not the minimum.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::protocol::data::FrameSuffix;
use crate::{NatNetError, Result};

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Default number of echo samples kept for minimum-RTT selection.
pub const DEFAULT_WINDOW: usize = 16;

/// Monotonic local time source, in nanoseconds.
pub trait LocalClock: Send + Sync + fmt::Debug {
    fn now_ns(&self) -> u64;
}

/// Monotonic clock anchored to the Unix epoch at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    anchor_ns: u64,
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let anchor_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self { anchor_ns, start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock for SystemClock {
    fn now_ns(&self) -> u64 {
        let elapsed = u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.anchor_ns.saturating_add(elapsed)
    }
}

/// One measured echo round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoSample {
    pub rtt_ns: u64,
    /// Local time minus server time at the moment the server stamped the request.
    pub offset_ns: i128,
}

/// Latencies derived from one frame's suffix stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLatencies {
    /// Mid-exposure to transmit, measured on the server clock.
    pub system_ns: u64,
    /// Transmit to local receive, through the synchronized mapping. Negative values mean the
    /// estimate is off by more than the actual latency.
    pub transmit_ns: i64,
}

#[derive(Debug, Clone)]
pub struct ClockSynchronizer {
    frequency: u64,
    window: usize,
    samples: VecDeque<EchoSample>,
    last_mapping: Option<(u64, u64)>,
}

impl ClockSynchronizer {
    /// `frequency` is the server's declared tick rate; `0` leaves the clock unsynchronizable.
    pub fn new(frequency: u64, window: usize) -> Self {
        Self {
            frequency,
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            last_mapping: None,
        }
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Switches to a new server clock, dropping every sample taken against the old one.
    pub fn reset(&mut self, frequency: u64) {
        self.frequency = frequency;
        self.samples.clear();
        self.last_mapping = None;
    }

    pub fn ticks_to_ns(&self, ticks: u64) -> Result<i128> {
        if self.frequency == 0 {
            return Err(NatNetError::ClockNotSynchronized);
        }
        Ok(i128::from(ticks) * NANOS_PER_SECOND / i128::from(self.frequency))
    }

    /// Records an echo reply.
    ///
    /// `request_stamp` is the local send time echoed back by the server, `received_stamp` the
    /// server tick count when the request arrived and `local_receive` the local time the reply
    /// was read.
    pub fn record(
        &mut self,
        request_stamp: u64,
        received_stamp: u64,
        local_receive: u64,
    ) -> Result<EchoSample> {
        let rtt_ns = local_receive.saturating_sub(request_stamp);
        let server_ns = self.ticks_to_ns(received_stamp)?;
        let offset_ns = i128::from(request_stamp) + i128::from(rtt_ns / 2) - server_ns;
        let sample = EchoSample { rtt_ns, offset_ns };

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        trace!(rtt_ns, offset_ns = offset_ns as i64, "Echo sample recorded");
        Ok(sample)
    }

    /// Minimum-RTT sample in the window; the earliest one wins ties.
    pub fn best_sample(&self) -> Option<EchoSample> {
        self.samples.iter().min_by_key(|sample| sample.rtt_ns).copied()
    }

    pub fn offset_ns(&self) -> Result<i128> {
        self.best_sample()
            .map(|sample| sample.offset_ns)
            .ok_or(NatNetError::ClockNotSynchronized)
    }

    pub fn is_synchronized(&self) -> bool {
        self.frequency > 0 && !self.samples.is_empty()
    }

    /// Maps a server tick value onto the local clock.
    ///
    /// Mapped times never go backwards for non-decreasing ticks, even when a better sample
    /// moves the offset down between calls.
    pub fn server_ticks_to_client_ns_time(&mut self, ticks: u64) -> Result<u64> {
        let offset = self.offset_ns()?;
        let mapped = (self.ticks_to_ns(ticks)? + offset).clamp(0, i128::from(u64::MAX));
        let mut mapped = u64::try_from(mapped).unwrap_or(u64::MAX);

        match self.last_mapping {
            Some((last_ticks, last_mapped)) if ticks >= last_ticks => {
                mapped = mapped.max(last_mapped);
                self.last_mapping = Some((ticks, mapped));
            }
            Some(_) => {}
            None => self.last_mapping = Some((ticks, mapped)),
        }
        Ok(mapped)
    }

    /// Local time of the frame's mid-exposure instant.
    pub fn acquisition_stamp(&mut self, suffix: &FrameSuffix) -> Result<u64> {
        self.server_ticks_to_client_ns_time(suffix.stamp_camera_mid_exposure)
    }

    pub fn compute_latencies(
        &mut self,
        suffix: &FrameSuffix,
        received_ns: u64,
    ) -> Result<FrameLatencies> {
        let system = self.ticks_to_ns(
            suffix.stamp_transmit.saturating_sub(suffix.stamp_camera_mid_exposure),
        )?;
        let transmitted = self.server_ticks_to_client_ns_time(suffix.stamp_transmit)?;
        let transmit = i128::from(received_ns) - i128::from(transmitted);
        Ok(FrameLatencies {
            system_ns: u64::try_from(system).unwrap_or(u64::MAX),
            transmit_ns: i64::try_from(transmit).unwrap_or(if transmit < 0 { i64::MIN } else { i64::MAX }),
        })
    }
}
