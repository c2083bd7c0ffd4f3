//! Per-connection outbound event queue.
//!
//! Any thread may enqueue; only the connection's delivery thread writes to the
//! socket, taking a bounded batch between reads. Events keep their enqueue
//! order.
//!
//! The queue is bounded for the query executor only: it calls
//! [`Outbox::wait_for_space`] before queueing result events, and that call
//! blocks while the queue is full. Events raised on the delivery thread
//! (replies, errors, logout) are always queued, since that thread is the one
//! draining the queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use tdsweb_protocol::ServerMessage;

/// Events a connection may have queued before the executor has to wait.
pub const EVENT_QUEUE_DEPTH: usize = 256;

struct Queue {
    state: Mutex<QueueState>,
    space: Condvar,
    capacity: usize,
}

struct QueueState {
    events: VecDeque<ServerMessage>,
    closed: bool,
}

/// Sending half of a connection's event queue. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    queue: Arc<Queue>,
}

/// Receiving half, owned by the delivery thread. Dropping it closes the queue
/// and releases any waiting sender.
pub struct Events {
    queue: Arc<Queue>,
}

impl Outbox {
    /// Create a queue of [`EVENT_QUEUE_DEPTH`] and return both ends.
    pub fn channel() -> (Outbox, Events) {
        Self::bounded(EVENT_QUEUE_DEPTH)
    }

    pub fn bounded(capacity: usize) -> (Outbox, Events) {
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState { events: VecDeque::new(), closed: false }),
            space: Condvar::new(),
            capacity: capacity.max(1),
        });
        (Outbox { queue: Arc::clone(&queue) }, Events { queue })
    }

    /// Queue an event. Never blocks. Dropped silently once the connection is gone.
    pub fn send(&self, msg: ServerMessage) {
        let mut state = self.queue.state.lock();
        if state.closed {
            log::debug!("Event dropped: connection already closed");
            return;
        }
        state.events.push_back(msg);
    }

    /// Block until the queue is below capacity. Returns false if the
    /// connection closed instead.
    pub fn wait_for_space(&self) -> bool {
        let mut state = self.queue.state.lock();
        while !state.closed && state.events.len() >= self.queue.capacity {
            self.queue.space.wait(&mut state);
        }
        !state.closed
    }
}

impl Events {
    /// Take up to `max` queued events, oldest first.
    pub fn take(&self, max: usize) -> Vec<ServerMessage> {
        let mut state = self.queue.state.lock();
        let n = max.min(state.events.len());
        let batch: Vec<_> = state.events.drain(..n).collect();
        if !batch.is_empty() {
            self.queue.space.notify_all();
        }
        batch
    }

    /// Take everything queued so far.
    pub fn take_all(&self) -> Vec<ServerMessage> {
        self.take(usize::MAX)
    }

    /// Number of events waiting to be written.
    pub fn pending(&self) -> usize {
        self.queue.state.lock().events.len()
    }
}

impl Drop for Events {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.closed = true;
        state.events.clear();
        self.queue.space.notify_all();
    }
}
