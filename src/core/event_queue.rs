//! Bounded event queue
//!
//! Filled by the session reader task, drained by the application through
//! [`EventQueue::pop_timeout`]. When full, the configured overflow policy
//! decides which event is lost; every loss is counted.

use super::protocol::Frame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What to drop when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room
    #[default]
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}

/// Outcome of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss
    Queued,
    /// Queued after evicting the oldest event
    Evicted,
    /// Incoming event discarded
    Rejected,
    /// Queue closed, event discarded
    Closed,
}

/// Bounded FIFO of event frames
#[derive(Debug)]
pub struct EventQueue {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events (minimum 1)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            policy,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an event
    pub fn push(&self, frame: Frame) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut frames = self.frames.lock();
            if frames.len() < self.capacity {
                frames.push_back(frame);
                PushOutcome::Queued
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        frames.pop_front();
                        frames.push_back(frame);
                        PushOutcome::Evicted
                    }
                    OverflowPolicy::DropNewest => PushOutcome::Rejected,
                }
            }
        };
        if outcome != PushOutcome::Rejected {
            self.notify.notify_one();
        }
        outcome
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    /// Dequeue, waiting at most `timeout` for an event to arrive.
    ///
    /// Returns `None` on timeout, or once the queue is closed and empty.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<Frame> {
        self.frames.lock().drain(..).collect()
    }

    /// Events currently queued
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Maximum number of queued events
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events and wake every waiter
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
