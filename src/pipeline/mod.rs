//! Streaming pipeline: datagrams in, frames out.
//!
//! A [`Pipeline`] task owns one [`DatagramSource`] and hands every datagram to the shared
//! [`Dispatcher`], which decodes it with the current session's version and delivers the frame to
//! the configured [`FrameSink`]. Decode failures are scoped to the datagram: it is dropped and
//! counted in [`PipelineStats`], and the next datagram decodes normally.
//!
//! Frames are delivered in arrival order. Nothing is reordered by frame number; consumers that
//! care can compare [`Frame::frame_number`] values themselves.

pub mod sink;
pub mod source;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, trace, warn};

pub use sink::{Frame, FrameHandler, FrameQueue, FrameSink};
pub use source::{DatagramSource, ReplaySource, UdpDataSource};

use crate::clock::LocalClock;
use crate::connection::state::Session;
use crate::protocol::{self, Message};

/// Follow-up work a frame asks the connection to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Refresh {
    /// Tracked models changed or a frame referenced an undeclared asset.
    Description,
    /// The server switched stream versions.
    ServerInfo,
}

/// Counters shared by every task feeding the dispatcher.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames: AtomicU64,
    malformed: AtomicU64,
    not_ready: AtomicU64,
    ignored: AtomicU64,
    stale: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineSnapshot {
    /// Frames delivered to the sink.
    pub frames: u64,
    /// Datagrams dropped because they failed to decode.
    pub malformed: u64,
    /// Datagrams dropped because no session version was known yet.
    pub not_ready: u64,
    /// Well-formed datagrams that were not frame data.
    pub ignored: u64,
    /// Delivered frames flagged as outrunning the description.
    pub stale: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            not_ready: self.not_ready.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

/// Decodes datagrams against the current session and delivers frames.
pub(crate) struct Dispatcher {
    sessions: watch::Receiver<Option<Arc<Session>>>,
    sink: Arc<dyn FrameSink>,
    latest: watch::Sender<Option<Frame>>,
    clock: Arc<dyn LocalClock>,
    stats: Arc<PipelineStats>,
    refresh: Option<mpsc::Sender<Refresh>>,
}

impl Dispatcher {
    pub(crate) fn new(
        sessions: watch::Receiver<Option<Arc<Session>>>,
        sink: Arc<dyn FrameSink>,
        clock: Arc<dyn LocalClock>,
        refresh: Option<mpsc::Sender<Refresh>>,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self { sessions, sink, latest, clock, stats: Arc::new(PipelineStats::default()), refresh }
    }

    pub(crate) fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn latest(&self) -> watch::Receiver<Option<Frame>> {
        self.latest.subscribe()
    }

    pub(crate) fn close(&self) {
        self.sink.on_closed();
    }

    pub(crate) fn dispatch(&self, datagram: &[u8]) {
        let received_ns = self.clock.now_ns();
        let Some(session) = self.sessions.borrow().clone() else {
            self.stats.not_ready.fetch_add(1, Ordering::Relaxed);
            trace!(len = datagram.len(), "Dropping datagram received before the handshake");
            return;
        };

        let data = match protocol::decode_datagram(datagram, session.version) {
            Ok(Message::FrameOfData(data)) => data,
            Ok(other) => {
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                debug!(id = ?other.id(), "Ignoring non-frame message on the data path");
                return;
            }
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(len = datagram.len(), error = %e, "Dropping malformed frame datagram");
                return;
            }
        };

        let undeclared = session.description.is_some() && !session.asset_ids.covers(&data);
        let stale = undeclared || data.suffix.tracked_models_changed;
        if stale {
            self.stats.stale.fetch_add(1, Ordering::Relaxed);
            self.request(Refresh::Description);
        }
        if data.suffix.bitstream_version_changed {
            self.request(Refresh::ServerInfo);
        }

        trace!(frame = data.frame_number, stale, "Frame decoded");
        let frame = Frame { received_ns, data: Arc::new(data), stale_description: stale };
        self.latest.send_replace(Some(frame.clone()));
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.sink.on_frame(frame);
    }

    fn request(&self, refresh: Refresh) {
        if let Some(sender) = &self.refresh {
            // a request already queued covers this one
            let _ = sender.try_send(refresh);
        }
    }
}

/// Spawns receive loops that feed a [`Dispatcher`].
pub(crate) struct Pipeline;

impl Pipeline {
    const MAX_ERRORS: u32 = 10;

    /// Spawns the receive loop for `source`.
    ///
    /// The loop stops on `cancel` or when the source is exhausted. Repeated transport errors
    /// cancel `lost` so the owning connection can close.
    pub(crate) fn spawn<S>(
        source: S,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
        lost: CancellationToken,
        span: Span,
    ) -> JoinHandle<()>
    where
        S: DatagramSource,
    {
        tokio::spawn(Self::receive_task(source, dispatcher, cancel, lost).instrument(span))
    }

    async fn receive_task<S>(
        mut source: S,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
        lost: CancellationToken,
    ) where
        S: DatagramSource,
    {
        info!("Data receive task started");
        let mut datagram_count = 0u64;
        let mut error_count = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Data receive task cancelled");
                    break;
                }
                result = source.next_datagram() => result,
            };

            match result {
                Ok(Some(datagram)) => {
                    datagram_count += 1;
                    error_count = 0;
                    dispatcher.dispatch(&datagram);
                }
                Ok(None) => {
                    info!("Datagram source ended after {} datagrams", datagram_count);
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!("Data source error ({}/{}): {}", error_count, Self::MAX_ERRORS, e);

                    if error_count >= Self::MAX_ERRORS {
                        warn!("Too many data source errors, closing connection");
                        lost.cancel();
                        break;
                    }

                    // Exponential backoff: 50ms, 100ms, 200ms, ...
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        info!("Data receive task ended ({} datagrams)", datagram_count);
    }
}
