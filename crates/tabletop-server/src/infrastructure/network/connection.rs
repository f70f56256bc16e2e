//! The abstract connection every transport produces.
//!
//! A [`Connection`] is a bidirectional byte channel to one remote peer.  The
//! send half is the trait; the receive half is a plain
//! [`std::sync::mpsc::Receiver`] of frame payloads handed over together with
//! the connection in an [`AcceptedConnection`].  When the peer goes away the
//! transport drops its sender, so the receiver's iterator ends.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tabletop_core::protocol::Channel;
use thiserror::Error;

/// Errors returned when sending on a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was closed locally or the peer went away.
    #[error("connection {0} is closed")]
    Closed(String),

    /// The payload could not be framed or encoded.
    #[error("cannot encode outgoing data: {0}")]
    Encoding(String),
}

/// Send half of a connection to one peer.
///
/// Implementations must be callable from any thread at any time; sends to a
/// dead connection fail with [`ConnectionError::Closed`] rather than block.
pub trait Connection: Send + Sync {
    /// Unique id: `<remote-address>-<sequence>` for sockets, the peer name for relay peers.
    fn id(&self) -> &str;

    /// Liveness probe used by reaping.
    fn is_alive(&self) -> bool;

    /// Queues one message payload on `channel`.
    fn send(&self, channel: Channel, payload: &[u8]) -> Result<(), ConnectionError>;

    /// Closes the connection.  Idempotent.
    fn close(&self);

    /// Frames accepted by [`send`](Self::send) on `channel` but not yet
    /// written out.  Connections that hand frames straight on report 0.
    fn queued(&self, _channel: Channel) -> usize {
        0
    }
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A connection fresh from a transport, not yet authenticated.
pub struct AcceptedConnection {
    pub connection: Arc<dyn Connection>,
    /// Payloads received from the peer, in arrival order.
    pub inbound: Receiver<Vec<u8>>,
}

// ── Outbound queue ────────────────────────────────────────────────────────────

/// What a writer gets from [`OutboundQueue::pop`].
#[derive(Debug, PartialEq)]
pub enum Outbound {
    Frame(Vec<u8>),
    /// The queue was closed and everything queued before the close has been handed out.
    Closed,
}

#[derive(Default)]
struct QueueState {
    queues: [VecDeque<Vec<u8>>; 2],
    next: usize,
    closed: bool,
}

/// One FIFO per [`Channel`], drained round-robin by a single writer.
///
/// Large asset bursts on [`Channel::Image`] therefore interleave with
/// session messages on [`Channel::Default`] instead of delaying them.
#[derive(Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends `frame` to `channel`'s queue.  Returns `false` once closed.
    pub fn push(&self, channel: Channel, frame: Vec<u8>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.queues[channel.index()].push_back(frame);
        self.ready.notify_one();
        true
    }

    /// Blocks until a frame is available or the queue is closed and empty.
    pub fn pop(&self) -> Outbound {
        let mut state = self.lock();
        loop {
            let count = state.queues.len();
            for step in 0..count {
                let index = (state.next + step) % count;
                if let Some(frame) = state.queues[index].pop_front() {
                    state.next = (index + 1) % count;
                    return Outbound::Frame(frame);
                }
            }
            if state.closed {
                return Outbound::Closed;
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Stops accepting frames.  Frames already queued are still handed out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Stops accepting frames and discards the ones still queued.
    pub fn abort(&self) {
        let mut state = self.lock();
        state.closed = true;
        for queue in state.queues.iter_mut() {
            queue.clear();
        }
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().queues.iter().map(VecDeque::len).sum()
    }

    /// Frames waiting on one channel.
    pub fn queued(&self, channel: Channel) -> usize {
        self.lock().queues[channel.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pop_alternates_between_busy_channels() {
        // Arrange: a burst of image frames queued before two session frames.
        let queue = OutboundQueue::new();
        for i in 0..3u8 {
            queue.push(Channel::Image, vec![100 + i]);
        }
        queue.push(Channel::Default, vec![1]);
        queue.push(Channel::Default, vec![2]);

        // Act
        let order: Vec<u8> = (0..5)
            .map(|_| match queue.pop() {
                Outbound::Frame(f) => f[0],
                Outbound::Closed => panic!("queue closed early"),
            })
            .collect();

        // Assert: session frames are not stuck behind the whole burst.
        assert_eq!(order, vec![1, 100, 2, 101, 102]);
    }

    #[test]
    fn test_close_drains_queued_frames_then_reports_closed() {
        let queue = OutboundQueue::new();
        queue.push(Channel::Default, vec![9]);
        queue.close();

        assert!(!queue.push(Channel::Default, vec![10]));
        assert_eq!(queue.pop(), Outbound::Frame(vec![9]));
        assert_eq!(queue.pop(), Outbound::Closed);
    }

    #[test]
    fn test_queued_counts_each_channel_separately() {
        let queue = OutboundQueue::new();
        queue.push(Channel::Image, vec![1]);
        queue.push(Channel::Image, vec![2]);
        queue.push(Channel::Default, vec![3]);

        assert_eq!(queue.queued(Channel::Image), 2);
        assert_eq!(queue.queued(Channel::Default), 1);

        queue.pop();
        assert_eq!(queue.queued(Channel::Default), 0);
        assert_eq!(queue.queued(Channel::Image), 2);
    }

    #[test]
    fn test_abort_discards_queued_frames() {
        let queue = OutboundQueue::new();
        queue.push(Channel::Image, vec![1]);
        queue.abort();
        assert_eq!(queue.pop(), Outbound::Closed);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        // Arrange
        let queue = Arc::new(OutboundQueue::new());
        let writer = {
            let q = Arc::clone(&queue);
            thread::spawn(move || q.pop())
        };

        // Act
        thread::sleep(Duration::from_millis(50));
        queue.push(Channel::Default, vec![7]);

        // Assert
        assert_eq!(writer.join().unwrap(), Outbound::Frame(vec![7]));
    }
}
