//! Client event stream.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::SharedError;

/// Everything a client announces over its event stream.
#[derive(Debug, Clone)]
pub enum Event {
    /// Transport established and authenticated.
    Connect,
    /// Handshake finished; queued commands have been flushed.
    Ready,
    /// The connection was lost (emitted once per lost connection).
    End,
    /// Backpressure cleared; callers may resume submitting.
    Drain,
    /// The pending queue emptied outside pub/sub mode.
    Idle,
    /// An error with no callback to deliver it to.
    Error(SharedError),
    /// A reconnection attempt has been scheduled.
    Reconnecting { delay: Duration, attempt: u32 },
    /// Pub/sub message on a subscribed channel.
    Message { channel: String, payload: Bytes },
    /// Pub/sub message matched by a subscribed pattern.
    PMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    Subscribe { channel: String, count: i64 },
    Unsubscribe {
        channel: Option<String>,
        count: i64,
    },
    PSubscribe { pattern: String, count: i64 },
    PUnsubscribe {
        pattern: Option<String>,
        count: i64,
    },
    /// One echoed command line while MONITOR is active.
    Monitor {
        timestamp: String,
        args: Vec<String>,
    },
}

/// Broadcast fan-out for [`Event`]s.
///
/// Slow subscribers may observe `Lagged` on the receiver side; the
/// engine never blocks on event delivery.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit, dropping the event when nobody is listening.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

// ── Tests ──────────────────────────────────────────────────────────
