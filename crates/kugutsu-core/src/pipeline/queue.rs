//! Priority work queue shared by the three pipeline stages.
//!
//! A max-priority queue with FIFO tie-break, an async `pop`, and in-flight
//! accounting so the pipeline can observe when a stage is fully idle
//! (nothing queued and nothing being processed).

use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Notify;

struct Entry<T> {
    priority: i32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on priority; earlier sequence wins ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Entry<T>>,
    seq: u64,
    /// Items popped but not yet reported done.
    active: usize,
    closed: bool,
}

/// A stage's work queue.
pub struct StageQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> StageQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                seq: 0,
                active: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue an item. Items pushed after `close` are dropped.
    pub fn push(&self, priority: i32, item: T) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            tracing::warn!(queue = self.name, "push after close, dropping item");
            return;
        }
        let seq = state.seq;
        state.seq += 1;
        state.heap.push(Entry {
            priority,
            seq,
            item,
        });
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is closed and
    /// drained. The caller must call [`StageQueue::task_done`] after
    /// processing the returned item.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = state.heap.pop() {
                    state.active += 1;
                    // Notify permits do not accumulate, so cascade the
                    // wakeup while items remain for other workers.
                    if !state.heap.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(entry.item);
                }
                if state.closed {
                    // Wake the next popper so shutdown cascades.
                    self.notify.notify_one();
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next item if one is queued, without waiting. The caller
    /// must call [`StageQueue::task_done`] after processing it.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heap.pop().map(|entry| {
            state.active += 1;
            entry.item
        })
    }

    /// Report that a previously popped item finished processing.
    pub fn task_done(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(state.active > 0, "task_done without matching pop");
        state.active = state.active.saturating_sub(1);
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heap.is_empty() && state.active == 0
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue: poppers drain remaining items, then receive `None`.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

impl<T> std::fmt::Debug for StageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("StageQueue")
            .field("name", &self.name)
            .field("queued", &state.heap.len())
            .field("active", &state.active)
            .field("closed", &state.closed)
            .finish()
    }
}
