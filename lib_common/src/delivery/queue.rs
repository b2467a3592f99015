//! # Bounded Delivery Queue
//!
//! The only state shared between the supervisor (producer) and the uploader
//! (consumer). A payload keeps its slot from `push` until the uploader calls
//! `complete`, so the uploader's own `requeue` after a timeout can never find
//! the queue full. When it is full for the producer, the `OverflowPolicy`
//! decides: wait for a slot, or evict the oldest queued payload.
//!
//! The `Stop` sentinel sits outside the capacity accounting so that shutdown
//! can always be signalled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::warn;
use thiserror::Error;
use tokio::sync::Notify;

use crate::configs::{OverflowPolicy, QueueSettings};
use crate::model::DeliveryPayload;

/// What the uploader receives from `pop`.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// A payload to push; its slot is held until `complete` or `requeue`.
    Payload(DeliveryPayload),
    /// Graceful shutdown request.
    Stop,
}

/// Returned by `try_push` when no slot is free.
#[derive(Debug, Error)]
#[error("Delivery queue full ({capacity} payloads)")]
pub struct QueueFull {
    /// The configured capacity.
    pub capacity: usize,
    /// The payload that did not fit.
    pub payload: DeliveryPayload,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<QueueItem>,
    queued: usize,
    in_flight: usize,
}

impl Inner {
    fn occupancy(&self) -> usize {
        self.queued + self.in_flight
    }

    fn evict_oldest(&mut self) -> Option<DeliveryPayload> {
        let index = self.items.iter().position(|item| matches!(item, QueueItem::Payload(_)))?;
        match self.items.remove(index) {
            Some(QueueItem::Payload(payload)) => {
                self.queued -= 1;
                Some(payload)
            }
            _ => None,
        }
    }
}

/// # Delivery Queue
#[derive(Debug)]
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
}

impl DeliveryQueue {
    /// Creates an empty queue. A zero capacity is raised to one.
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity: settings.capacity.max(1),
            overflow: settings.overflow,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues without waiting.
    pub fn try_push(&self, payload: DeliveryPayload) -> Result<(), QueueFull> {
        let mut inner = self.lock();
        if inner.occupancy() >= self.capacity {
            return Err(QueueFull {
                capacity: self.capacity,
                payload,
            });
        }
        inner.items.push_back(QueueItem::Payload(payload));
        inner.queued += 1;
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues according to the overflow policy.
    ///
    /// Returns the payload evicted to make room, if any. Under `Block`, or when
    /// every slot is in flight, waits until the uploader frees a slot.
    pub async fn push(&self, payload: DeliveryPayload) -> Option<DeliveryPayload> {
        let mut payload = payload;
        loop {
            match self.try_push(payload) {
                Ok(()) => return None,
                Err(full) => payload = full.payload,
            }

            if self.overflow == OverflowPolicy::DropOldest {
                let mut inner = self.lock();
                if let Some(evicted) = inner.evict_oldest() {
                    inner.items.push_back(QueueItem::Payload(payload));
                    inner.queued += 1;
                    drop(inner);
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("Delivery queue full, dropped oldest payload ({} dropped so far)", total);
                    self.not_empty.notify_one();
                    return Some(evicted);
                }
            }

            self.not_full.notified().await;
        }
    }

    /// Takes the next item, waiting while the queue is empty.
    pub async fn pop(&self) -> QueueItem {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    if matches!(item, QueueItem::Payload(_)) {
                        inner.queued -= 1;
                        inner.in_flight += 1;
                    }
                    return item;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Releases the slot of a popped payload.
    pub fn complete(&self) {
        {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
        self.not_full.notify_one();
    }

    /// Puts a popped payload back at the tail, keeping its slot.
    pub fn requeue(&self, payload: DeliveryPayload) {
        {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            inner.items.push_back(QueueItem::Payload(payload));
            inner.queued += 1;
        }
        self.not_empty.notify_one();
    }

    /// Asks the consumer to stop once it reaches the sentinel.
    pub fn send_stop(&self) {
        self.lock().items.push_back(QueueItem::Stop);
        self.not_empty.notify_one();
    }

    /// Payloads waiting to be popped.
    pub fn len(&self) -> usize {
        self.lock().queued
    }

    /// True when no payload is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payloads waiting plus payloads being uploaded.
    pub fn occupancy(&self) -> usize {
        self.lock().occupancy()
    }

    /// Maximum occupancy.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payloads evicted by the `DropOldest` policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DestinationId, PositionFix};
    use std::sync::Arc;
    use std::time::Duration;

    fn payload(ts: f64) -> DeliveryPayload {
        let fix = PositionFix::new("N0CALL", 1.0, 2.0, ts);
        DeliveryPayload::from_fix(DestinationId::from("IMEI"), &fix, ts)
    }

    fn queue(capacity: usize, overflow: OverflowPolicy) -> DeliveryQueue {
        DeliveryQueue::new(&QueueSettings { capacity, overflow })
    }

    fn stamp(item: QueueItem) -> i64 {
        match item {
            QueueItem::Payload(p) => p.events[0].timestamp_ms,
            QueueItem::Stop => -1,
        }
    }

    #[tokio::test]
    async fn fifo_order_and_stop_sentinel() {
        let q = queue(4, OverflowPolicy::Block);
        q.push(payload(1.0)).await;
        q.push(payload(2.0)).await;
        q.send_stop();

        assert_eq!(stamp(q.pop().await), 1000);
        q.complete();
        assert_eq!(stamp(q.pop().await), 2000);
        q.complete();
        assert_eq!(q.pop().await, QueueItem::Stop);
        assert!(q.is_empty());
        assert_eq!(q.occupancy(), 0);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_and_counts() {
        let q = queue(2, OverflowPolicy::DropOldest);
        assert!(q.push(payload(1.0)).await.is_none());
        assert!(q.push(payload(2.0)).await.is_none());
        let evicted = q.push(payload(3.0)).await.unwrap();
        assert_eq!(evicted.events[0].timestamp_ms, 1000);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.len(), 2);
        assert_eq!(stamp(q.pop().await), 2000);
    }

    #[tokio::test]
    async fn block_waits_for_a_completed_slot() {
        let q = Arc::new(queue(1, OverflowPolicy::Block));
        q.push(payload(1.0)).await;
        assert!(q.try_push(payload(9.0)).is_err());

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push(payload(2.0)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(stamp(q.pop().await), 1000);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "an in-flight payload still holds its slot");

        q.complete();
        assert!(producer.await.unwrap().is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.dropped(), 0);
    }

    #[tokio::test]
    async fn requeue_keeps_the_slot_when_full() {
        let q = queue(2, OverflowPolicy::Block);
        q.push(payload(1.0)).await;
        q.push(payload(2.0)).await;

        let QueueItem::Payload(first) = q.pop().await else {
            panic!("expected a payload");
        };
        q.requeue(first);
        assert_eq!(q.occupancy(), 2);
        assert_eq!(stamp(q.pop().await), 2000);
        q.complete();
        assert_eq!(stamp(q.pop().await), 1000);
    }

    #[tokio::test]
    async fn stop_is_outside_capacity() {
        let q = queue(1, OverflowPolicy::Block);
        q.push(payload(1.0)).await;
        q.send_stop();
        assert_eq!(q.occupancy(), 1);
        assert_eq!(stamp(q.pop().await), 1000);
        q.complete();
        assert_eq!(q.pop().await, QueueItem::Stop);
    }
}
