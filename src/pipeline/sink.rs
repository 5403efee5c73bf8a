//! Frame consumers: push handlers and the bounded pull queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::protocol::data::MoCapData;
use crate::{NatNetError, Result, lock};

/// One decoded frame as handed to consumers.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Local clock reading when the datagram was read, nanoseconds.
    pub received_ns: u64,
    pub data: Arc<MoCapData>,
    /// The frame references assets the current description does not declare, or the server
    /// flagged a change to its tracked models.
    pub stale_description: bool,
}

impl Frame {
    pub fn frame_number(&self) -> u32 {
        self.data.frame_number
    }
}

/// Receives every decoded frame in arrival order.
///
/// Implementations run inline on the receive task: they must return quickly and must not block,
/// or frames back up in the socket buffer.
pub trait FrameSink: Send + Sync + 'static {
    fn on_frame(&self, frame: Frame);

    /// Called once when the connection closes.
    fn on_closed(&self) {}
}

/// Adapts a closure into a [`FrameSink`].
pub struct FrameHandler<F> {
    handler: F,
}

impl<F> FrameHandler<F>
where
    F: Fn(Frame) + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> FrameSink for FrameHandler<F>
where
    F: Fn(Frame) + Send + Sync + 'static,
{
    fn on_frame(&self, frame: Frame) {
        (self.handler)(frame);
    }
}

impl<F> fmt::Debug for FrameHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandler").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
    dropped: u64,
}

/// Bounded frame queue; when full, the oldest frame is dropped to make room.
#[derive(Debug)]
pub struct FrameQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self { state: Mutex::new(QueueState::default()), notify: Notify::new(), capacity: capacity.max(1) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.state).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        lock(&self.state).dropped
    }

    pub fn push(&self, frame: Frame) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.dropped += 1;
            }
            state.frames.push_back(frame);
        }
        self.notify.notify_waiters();
    }

    pub fn try_pop(&self) -> Option<Frame> {
        lock(&self.state).frames.pop_front()
    }

    /// Empties the queue and returns its newest frame.
    pub fn drain_latest(&self) -> Option<Frame> {
        let mut state = lock(&self.state);
        let latest = state.frames.pop_back();
        state.frames.clear();
        latest
    }

    /// Waits for the next frame.
    ///
    /// Frames queued before a close are still returned; after that, [`NatNetError::Closed`].
    pub async fn pop(&self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock(&self.state);
                if let Some(frame) = state.frames.pop_front() {
                    return Ok(frame);
                }
                if state.closed {
                    return Err(NatNetError::Closed);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NatNetError::timeout("get_data", timeout));
            }
        }
    }

    /// Wakes every waiter; later pushes are ignored.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl FrameSink for FrameQueue {
    fn on_frame(&self, frame: Frame) {
        self.push(frame);
    }

    fn on_closed(&self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(number: u32) -> Frame {
        Frame {
            received_ns: u64::from(number),
            data: Arc::new(MoCapData { frame_number: number, ..Default::default() }),
            stale_description: false,
        }
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = FrameQueue::new(2);
        for number in 0..3 {
            queue.push(frame(number));
        }
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().map(|f| f.frame_number()), Some(1));
        assert_eq!(queue.try_pop().map(|f| f.frame_number()), Some(2));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn drain_latest_empties_queue() {
        let queue = FrameQueue::new(4);
        for number in 0..3 {
            queue.push(frame(number));
        }
        assert_eq!(queue.drain_latest().map(|f| f.frame_number()), Some(2));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let queue = FrameQueue::new(4);
        let err = queue.pop(Duration::from_millis(20)).await.expect_err("empty queue");
        assert!(matches!(err, NatNetError::Timeout { .. }));
    }

    #[tokio::test]
    async fn close_wakes_waiters_after_queued_frames() {
        let queue = Arc::new(FrameQueue::new(4));
        queue.push(frame(7));
        queue.close();
        assert_eq!(queue.pop(Duration::from_secs(1)).await.expect("queued").frame_number(), 7);
        assert!(queue.pop(Duration::from_secs(1)).await.expect_err("closed").is_closed());

        let waiting = Arc::new(FrameQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&waiting);
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        waiting.close();
        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(NatNetError::Closed)));
    }

    #[tokio::test]
    async fn pushes_wake_a_waiting_pop() {
        let queue = Arc::new(FrameQueue::new(4));
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.push(frame(3));
            })
        };
        let popped = queue.pop(Duration::from_secs(2)).await.expect("frame");
        assert_eq!(popped.frame_number(), 3);
        producer.await.expect("join");
    }

    #[test]
    fn handler_forwards_frames() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            FrameHandler::new(move |frame: Frame| lock(&seen).push(frame.frame_number()))
        };
        sink.on_frame(frame(1));
        sink.on_frame(frame(2));
        assert_eq!(*lock(&seen), vec![1, 2]);
    }
}
