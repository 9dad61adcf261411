// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO of accepted events awaiting upload.
//!
//! # Ordering
//!
//! Sequence numbers are assigned under the queue lock at the moment an event
//! is accepted, so queue order and sequence order are the same thing and a
//! drained [`Batch`] is always a contiguous, strictly increasing run.
//!
//! # Overflow
//!
//! When the queue holds `capacity` events a push never waits:
//!
//! - [`OverflowPolicy::DropOldest`] evicts the front of the queue (the lowest
//!   sequence number present) and accepts the new event.
//! - [`OverflowPolicy::DropIncoming`] rejects the new event with
//!   [`CaptureError::QueueOverflow`].
//!
//! Both cases are counted in [`EventQueue::dropped`].
//!
//! # Draining
//!
//! [`EventQueue::drain`] removes up to `n` events in one critical section
//! without any suspension point, so an event is either fully in the queue or
//! fully in the returned batch.

use crate::config::OverflowPolicy;
use crate::error::CaptureError;
use crate::event::{Event, EventPayload};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::warn;

/// Ordered, immutable group of events taken from the queue for one upload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    events: Vec<Event>,
}

impl Batch {
    #[must_use]
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn first_seq(&self) -> Option<u64> {
        self.events.first().map(Event::seq)
    }

    #[must_use]
    pub fn last_seq(&self) -> Option<u64> {
        self.events.last().map(Event::seq)
    }
}

/// Result of a successful push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pushed {
    /// Sequence numbers assigned to the pushed events, in order.
    pub seqs: Vec<u64>,
    /// Sequence numbers evicted to make room (drop-oldest only).
    pub evicted: Vec<u64>,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<Event>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    high_water_mark: usize,
    dropped: AtomicU64,
    high_water: Notify,
}

impl EventQueue {
    /// A zero `capacity` is treated as 1 and `high_water_mark` is clamped
    /// into `1..=capacity`.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy, high_water_mark: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(4096)),
                next_seq: 1,
            }),
            capacity,
            policy,
            high_water_mark: high_water_mark.clamp(1, capacity),
            dropped: AtomicU64::new(0),
            high_water: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, payload: EventPayload) -> Result<Pushed, CaptureError> {
        self.push_all(vec![payload])
    }

    /// Pushes `payloads` as one contiguous run of sequence numbers.
    ///
    /// Under [`OverflowPolicy::DropIncoming`] the run is accepted only if it
    /// fits entirely.
    pub fn push_all(&self, payloads: Vec<EventPayload>) -> Result<Pushed, CaptureError> {
        let timestamp_ms = now_ms();
        let mut state = self.lock();

        if self.policy == OverflowPolicy::DropIncoming
            && state.events.len() + payloads.len() > self.capacity
        {
            drop(state);
            let rejected = payloads.len() as u64;
            self.dropped.fetch_add(rejected, Ordering::Relaxed);
            warn!(
                "QUEUE | Queue is full ({} events), dropping {} incoming event(s)",
                self.capacity, rejected
            );
            return Err(CaptureError::QueueOverflow {
                capacity: self.capacity,
            });
        }

        let mut pushed = Pushed {
            seqs: Vec::with_capacity(payloads.len()),
            evicted: Vec::new(),
        };
        for payload in payloads {
            if state.events.len() >= self.capacity {
                if let Some(oldest) = state.events.pop_front() {
                    pushed.evicted.push(oldest.seq());
                }
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.events.push_back(Event::new(seq, timestamp_ms, payload));
            pushed.seqs.push(seq);
        }
        let len = state.events.len();
        drop(state);

        if !pushed.evicted.is_empty() {
            self.dropped
                .fetch_add(pushed.evicted.len() as u64, Ordering::Relaxed);
            warn!(
                "QUEUE | Queue is full ({} events), evicted {} oldest event(s)",
                self.capacity,
                pushed.evicted.len()
            );
        }
        if len >= self.high_water_mark {
            self.high_water.notify_one();
        }

        Ok(pushed)
    }

    /// Removes up to `max` events from the front of the queue.
    #[must_use]
    pub fn drain(&self, max: usize) -> Batch {
        let mut state = self.lock();
        let n = max.min(state.events.len());
        Batch::new(state.events.drain(..n).collect())
    }

    /// Resolves once the queue has reached its high-water mark.
    ///
    /// A crossing that happens while nobody waits is remembered, so the next
    /// call returns immediately.
    pub async fn high_water_reached(&self) {
        self.high_water.notified().await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Number of events lost to overflow so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Sequence numbers currently held, front first.
    #[must_use]
    pub fn sequence_numbers(&self) -> Vec<u64> {
        self.lock().events.iter().map(Event::seq).collect()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::event::{LogEvent, LogLevel};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn log(message: &str) -> EventPayload {
        EventPayload::Log(LogEvent {
            level: LogLevel::Info,
            args: vec![message.to_string()],
        })
    }

    #[test]
    fn test_push_assigns_increasing_sequence_numbers() {
        let queue = EventQueue::new(10, OverflowPolicy::DropOldest, 10);

        let first = queue.push(log("a")).unwrap();
        let second = queue.push_all(vec![log("b"), log("c")]).unwrap();

        assert_eq!(first.seqs, vec![1]);
        assert_eq!(second.seqs, vec![2, 3]);
        assert!(second.evicted.is_empty());
        assert_eq!(queue.sequence_numbers(), vec![1, 2, 3]);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let queue = EventQueue::new(2, OverflowPolicy::DropOldest, 2);

        queue.push(log("1")).unwrap();
        queue.push(log("2")).unwrap();
        let third = queue.push(log("3")).unwrap();

        assert_eq!(third.evicted, vec![1]);
        assert_eq!(queue.sequence_numbers(), vec![2, 3]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_drop_incoming_rejects_new_event() {
        let queue = EventQueue::new(2, OverflowPolicy::DropIncoming, 2);

        queue.push(log("1")).unwrap();
        queue.push(log("2")).unwrap();
        let err = queue.push(log("3")).unwrap_err();

        assert_eq!(err, CaptureError::QueueOverflow { capacity: 2 });
        assert_eq!(queue.sequence_numbers(), vec![1, 2]);
        assert_eq!(queue.dropped(), 1);

        // A rejected event does not consume a sequence number.
        let _ = queue.drain(1);
        assert_eq!(queue.push(log("4")).unwrap().seqs, vec![3]);
    }

    #[test]
    fn test_drop_incoming_rejects_whole_run() {
        let queue = EventQueue::new(3, OverflowPolicy::DropIncoming, 3);
        queue.push_all(vec![log("1"), log("2")]).unwrap();

        assert!(queue.push_all(vec![log("3"), log("4")]).is_err());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 2);
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let queue = EventQueue::new(10, OverflowPolicy::DropOldest, 10);
        for i in 0..5 {
            queue.push(log(&i.to_string())).unwrap();
        }

        let batch = queue.drain(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.first_seq(), Some(1));
        assert_eq!(batch.last_seq(), Some(3));
        assert_eq!(queue.sequence_numbers(), vec![4, 5]);

        let rest = queue.drain(10);
        assert_eq!(rest.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.drain(10).is_empty());
    }

    #[test]
    fn test_new_clamps_limits() {
        let queue = EventQueue::new(0, OverflowPolicy::DropOldest, 50);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.high_water_mark(), 1);
    }

    #[tokio::test]
    async fn test_high_water_mark_notifies() {
        let queue = EventQueue::new(10, OverflowPolicy::DropOldest, 2);
        queue.push(log("1")).unwrap();
        queue.push(log("2")).unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            queue.high_water_reached(),
        )
        .await
        .expect("high-water notification was not delivered");
    }

    #[test]
    fn test_concurrent_pushes_keep_unique_sequence_numbers() {
        let queue = Arc::new(EventQueue::new(10_000, OverflowPolicy::DropOldest, 10_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(log(&format!("{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seqs = queue.sequence_numbers();
        assert_eq!(seqs.len(), 1000);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    proptest! {
        #[test]
        fn prop_queue_never_exceeds_capacity(
            capacity in 1usize..16,
            ops in proptest::collection::vec(0usize..4, 0..64),
            drop_oldest in any::<bool>(),
        ) {
            let policy = if drop_oldest {
                OverflowPolicy::DropOldest
            } else {
                OverflowPolicy::DropIncoming
            };
            let queue = EventQueue::new(capacity, policy, capacity);
            let mut accepted = 0u64;

            for op in ops {
                if op == 0 {
                    let _ = queue.drain(2);
                } else if queue.push(log("x")).is_ok() {
                    accepted += 1;
                }
                prop_assert!(queue.len() <= capacity);
                let seqs = queue.sequence_numbers();
                prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
                if drop_oldest {
                    // Drop-oldest always keeps the newest accepted event.
                    prop_assert_eq!(seqs.last().copied().unwrap_or(accepted), accepted);
                }
            }
        }
    }
}
