//! In-memory broker implementation.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

use super::{Delivery, QueueDepth, RetryPolicy, TaskDescriptor, TaskQueue};
use crate::domain::TaskId;
use crate::error::SpoolError;

/// Wakeup hint: "something about this task may be due at `at`".
///
/// Hints are advisory; they are validated against the slot when popped, so
/// a hint left behind by an earlier lease or delay is simply dropped.
/// Reverse ordering makes the BinaryHeap a min-heap (earliest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WakeEntry {
    at: Instant,
    task_id: TaskId,
}

impl PartialOrd for WakeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WakeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Deliverable now.
    Ready,
    /// Waiting out a retry backoff.
    Delayed { until: Instant },
    /// Delivered; becomes deliverable again if not acked by `deadline`.
    Leased { deadline: Instant },
    /// Dead-lettered; retained for inspection only.
    Dead,
}

/// Broker-side record of one task. The single source of truth for the
/// task's delivery state; `ready` and `wakeups` hold ids and hints only.
struct Slot {
    descriptor: TaskDescriptor,
    state: SlotState,
    /// Bumped on every delivery. A `Delivery` carrying an older value lost
    /// its lease and cannot ack or nack.
    generation: u64,
    /// Deliveries so far; feeds the backoff schedule.
    deliveries: u32,
}

struct QueueState {
    slots: HashMap<TaskId, Slot>,
    ready: VecDeque<TaskId>,
    wakeups: BinaryHeap<WakeEntry>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            ready: VecDeque::new(),
            wakeups: BinaryHeap::new(),
        }
    }

    /// Move due slots (backoff elapsed, lease expired) back to ready.
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.wakeups.peek() {
            if entry.at > now {
                break;
            }
            let Some(entry) = self.wakeups.pop() else {
                break;
            };
            let Some(slot) = self.slots.get_mut(&entry.task_id) else {
                continue;
            };
            let due = match slot.state {
                SlotState::Delayed { until } => until <= now,
                SlotState::Leased { deadline } => deadline <= now,
                SlotState::Ready | SlotState::Dead => false,
            };
            if due {
                trace!(task_id = %entry.task_id, "promoting due task");
                slot.state = SlotState::Ready;
                self.ready.push_back(entry.task_id);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        self.wakeups.peek().map(|entry| entry.at)
    }

    fn depth(&self) -> QueueDepth {
        let mut depth = QueueDepth::default();
        for slot in self.slots.values() {
            match slot.state {
                SlotState::Ready => depth.ready += 1,
                SlotState::Delayed { .. } => depth.delayed += 1,
                SlotState::Leased { .. } => depth.leased += 1,
                SlotState::Dead => depth.dead += 1,
            }
        }
        depth
    }
}

pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    retry_policy: RetryPolicy,
    lease_timeout: Duration,
}

impl InMemoryTaskQueue {
    pub fn new(retry_policy: RetryPolicy, lease_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            retry_policy,
            lease_timeout,
        }
    }

    /// Descriptors that exhausted their retries, for inspection. The
    /// status store carries the authoritative terminal state.
    pub async fn dead_letters(&self) -> Vec<TaskDescriptor> {
        let state = self.state.lock().await;
        state
            .slots
            .values()
            .filter(|slot| slot.state == SlotState::Dead)
            .map(|slot| slot.descriptor.clone())
            .collect()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, descriptor: TaskDescriptor) -> Result<(), SpoolError> {
        let task_id = descriptor.task_id;
        {
            let mut state = self.state.lock().await;
            if state.slots.contains_key(&task_id) {
                // Already tracked; duplicate admission retries are no-ops.
                return Ok(());
            }
            state.slots.insert(
                task_id,
                Slot {
                    descriptor,
                    state: SlotState::Ready,
                    generation: 0,
                    deliveries: 0,
                },
            );
            state.ready.push_back(task_id);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, SpoolError> {
        let give_up_at = Instant::now() + timeout;
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_due(now);

                while let Some(task_id) = state.ready.pop_front() {
                    let Some(slot) = state.slots.get_mut(&task_id) else {
                        continue;
                    };
                    if slot.state != SlotState::Ready {
                        // Stale ready entry; the slot moved on.
                        continue;
                    }
                    slot.generation += 1;
                    slot.deliveries += 1;
                    let deadline = now + self.lease_timeout;
                    slot.state = SlotState::Leased { deadline };
                    let delivery = Delivery {
                        descriptor: slot.descriptor.clone(),
                        generation: slot.generation,
                    };
                    state.wakeups.push(WakeEntry { at: deadline, task_id });
                    return Ok(Some(delivery));
                }

                state.next_wake()
            };

            let now = Instant::now();
            if now >= give_up_at {
                return Ok(None);
            }
            let sleep_until = next_wake.map_or(give_up_at, |wake| wake.min(give_up_at));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(sleep_until.into()) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), SpoolError> {
        let task_id = delivery.descriptor.task_id;
        let mut state = self.state.lock().await;
        let holds_lease = matches!(
            state.slots.get(&task_id),
            Some(slot) if matches!(slot.state, SlotState::Leased { .. })
                && slot.generation == delivery.generation
        );
        if !holds_lease {
            return Err(SpoolError::LostLease(task_id));
        }
        state.slots.remove(&task_id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), SpoolError> {
        let task_id = delivery.descriptor.task_id;
        let should_notify = {
            let mut state = self.state.lock().await;
            let Some(slot) = state.slots.get_mut(&task_id) else {
                return Err(SpoolError::LostLease(task_id));
            };
            if !matches!(slot.state, SlotState::Leased { .. })
                || slot.generation != delivery.generation
            {
                return Err(SpoolError::LostLease(task_id));
            }
            if requeue {
                let delay = self.retry_policy.next_delay(slot.deliveries);
                let until = Instant::now() + delay;
                slot.state = SlotState::Delayed { until };
                state.wakeups.push(WakeEntry { at: until, task_id });
                true
            } else {
                slot.state = SlotState::Dead;
                false
            }
        };
        // Wake a sleeper so it can re-arm its timer for the new entry.
        if should_notify {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, SpoolError> {
        let state = self.state.lock().await;
        Ok(state.depth())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobPayload;

    fn queue(lease_timeout: Duration, base_delay: Duration) -> InMemoryTaskQueue {
        InMemoryTaskQueue::new(
            RetryPolicy {
                base_delay,
                multiplier: 2.0,
                max_delay: Duration::from_secs(1),
                jitter: 0.0,
            },
            lease_timeout,
        )
    }

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            task_id: TaskId::generate(),
            payload: JobPayload::sample(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_delivers() {
        let q = queue(Duration::from_secs(30), Duration::from_millis(10));
        let d = descriptor();
        q.enqueue(d.clone()).await.unwrap();
        let delivery = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(delivery.descriptor, d);
        assert_eq!(delivery.generation, 1);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let q = queue(Duration::from_secs(30), Duration::from_millis(10));
        let got = q.dequeue(Duration::from_millis(30)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_a_noop() {
        let q = queue(Duration::from_secs(30), Duration::from_millis(10));
        let d = descriptor();
        q.enqueue(d.clone()).await.unwrap();
        q.enqueue(d).await.unwrap();
        assert_eq!(q.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn ack_forgets_the_task() {
        let q = queue(Duration::from_secs(30), Duration::from_millis(10));
        q.enqueue(descriptor()).await.unwrap();
        let delivery = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        q.ack(&delivery).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), QueueDepth::default());
        // Double ack is a lost lease, not a panic.
        assert!(matches!(
            q.ack(&delivery).await,
            Err(SpoolError::LostLease(_))
        ));
    }

    #[tokio::test]
    async fn nack_requeue_redelivers_after_backoff() {
        let q = queue(Duration::from_secs(30), Duration::from_millis(40));
        q.enqueue(descriptor()).await.unwrap();
        let first = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        q.nack(&first, true).await.unwrap();

        // Not deliverable while the backoff runs.
        assert!(q.dequeue(Duration::from_millis(10)).await.unwrap().is_none());

        let second = q.dequeue(Duration::from_millis(300)).await.unwrap().unwrap();
        assert_eq!(second.descriptor, first.descriptor);
        assert_eq!(second.generation, 2);
    }

    #[tokio::test]
    async fn nack_dead_routes_to_dead_letter() {
        let q = queue(Duration::from_secs(30), Duration::from_millis(10));
        let d = descriptor();
        q.enqueue(d.clone()).await.unwrap();
        let delivery = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        q.nack(&delivery, false).await.unwrap();
        assert_eq!(q.depth().await.unwrap().dead, 1);
        assert_eq!(q.dead_letters().await, vec![d]);
        assert!(q.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let q = queue(Duration::from_millis(30), Duration::from_millis(10));
        q.enqueue(descriptor()).await.unwrap();
        let lost = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();

        // Consumer goes quiet; the lease times out and someone else gets it.
        let retaken = q.dequeue(Duration::from_millis(300)).await.unwrap().unwrap();
        assert_eq!(retaken.generation, 2);

        // The original holder is fenced out.
        assert!(matches!(
            q.ack(&lost).await,
            Err(SpoolError::LostLease(_))
        ));
        assert!(matches!(
            q.nack(&lost, true).await,
            Err(SpoolError::LostLease(_))
        ));

        // The new holder is not.
        q.ack(&retaken).await.unwrap();
    }

    #[tokio::test]
    async fn delivery_is_fifo_when_uncontended() {
        let q = queue(Duration::from_secs(30), Duration::from_millis(10));
        let a = descriptor();
        let b = descriptor();
        q.enqueue(a.clone()).await.unwrap();
        q.enqueue(b.clone()).await.unwrap();
        let first = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        let second = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(first.descriptor, a);
        assert_eq!(second.descriptor, b);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let q = std::sync::Arc::new(queue(Duration::from_secs(30), Duration::from_millis(10)));
        let waiter = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(descriptor()).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert!(got.is_some());
    }
}
