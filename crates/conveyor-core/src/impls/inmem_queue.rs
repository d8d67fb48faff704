//! In-memory JobQueue: singleton keys, scheduled redeliveries, dead-letter routing.
//!
//! Fetched messages are leased. A lease that outlives `lease_timeout` is taken
//! back on the next fetch and counts as a failed delivery, so a worker that
//! vanished mid-handler cannot pin a message (or its singleton key) forever.
//! Completed and dead-lettered messages are evicted; only per-queue tallies remain.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::app::status::QueueCounts;
use crate::domain::{JobMessage, JobType, MessageId, PublishOptions, Published, QueueError};
use crate::policy::RetryDecision;
use crate::ports::clock::{self, Clock};
use crate::ports::{IdGenerator, JobQueue, MessageLease, UlidGenerator};

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

const LEASE_EXPIRED: &str = "lease expired";

/// One delivery of an active message. The token changes on every fetch, so a
/// lease taken back after expiry can no longer ack or fail the redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lease {
    token: u64,
    until: DateTime<Utc>,
}

/// States of a message still held by the queue. Each one holds the singleton key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageState {
    Queued,
    Active(Lease),
    RetryScheduled,
}

#[derive(Debug, Clone, Copy)]
enum Terminal {
    Completed,
    DeadLettered,
}

struct Slot {
    message: JobMessage,
    state: MessageState,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    completed: usize,
    dead_lettered: usize,
}

/// Min-heap entry: earliest `due_at` first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    due_at: DateTime<Utc>,
    id: MessageId,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct QueueState {
    slots: HashMap<MessageId, Slot>,
    ready: HashMap<JobType, VecDeque<MessageId>>,
    scheduled: BinaryHeap<Scheduled>,
    singletons: HashMap<(JobType, String), MessageId>,
    finished: HashMap<JobType, Tally>,
    next_token: u64,
}

impl QueueState {
    fn enqueue(&mut self, message: JobMessage) -> MessageId {
        let id = message.id;
        if let Some(key) = message.singleton_key() {
            self.singletons
                .insert((message.queue.clone(), key.to_string()), id);
        }
        self.ready.entry(message.queue.clone()).or_default().push_back(id);
        self.slots.insert(
            id,
            Slot {
                message,
                state: MessageState::Queued,
            },
        );
        id
    }

    fn live_singleton(&self, queue: &JobType, key: &str) -> Option<MessageId> {
        let id = self.singletons.get(&(queue.clone(), key.to_string()))?;
        self.slots.contains_key(id).then_some(*id)
    }

    fn release_singleton(&mut self, id: MessageId) {
        let Some(slot) = self.slots.get(&id) else {
            return;
        };
        if let Some(key) = slot.message.singleton_key() {
            let entry = (slot.message.queue.clone(), key.to_string());
            if self.singletons.get(&entry) == Some(&id) {
                self.singletons.remove(&entry);
            }
        }
    }

    /// Evict a message that reached a terminal state, keeping only its tally.
    fn finish(&mut self, id: MessageId, outcome: Terminal) {
        self.release_singleton(id);
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        let tally = self.finished.entry(slot.message.queue).or_default();
        match outcome {
            Terminal::Completed => tally.completed += 1,
            Terminal::DeadLettered => tally.dead_lettered += 1,
        }
    }

    /// Move due redeliveries back to their ready queues.
    fn promote_scheduled(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.due_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(slot) = self.slots.get_mut(&entry.id)
                && slot.state == MessageState::RetryScheduled
            {
                slot.state = MessageState::Queued;
                self.ready
                    .entry(slot.message.queue.clone())
                    .or_default()
                    .push_back(entry.id);
            }
        }
    }

    /// Take back every lease whose deadline has passed.
    fn reclaim_expired(&mut self, now: DateTime<Utc>, ids: &dyn IdGenerator) {
        let expired: Vec<(MessageId, u64)> = self
            .slots
            .iter()
            .filter_map(|(id, slot)| match slot.state {
                MessageState::Active(lease) if lease.until <= now => Some((*id, lease.token)),
                _ => None,
            })
            .collect();

        for (id, token) in expired {
            warn!(message_id = %id, "lease expired, counting a failed delivery");
            if let Err(e) = self.fail_delivery(id, token, LEASE_EXPIRED.to_string(), now, ids) {
                warn!(message_id = %id, error = %e, "could not reclaim lease");
            }
        }
    }

    fn active_mut(&mut self, id: MessageId, token: u64) -> Result<&mut Slot, QueueError> {
        match self.slots.get_mut(&id) {
            Some(slot) if matches!(slot.state, MessageState::Active(lease) if lease.token == token) => {
                Ok(slot)
            }
            _ => Err(QueueError::LeaseLost),
        }
    }

    /// Count a failed delivery, then schedule the redelivery or dead-letter once retries run out.
    fn fail_delivery(
        &mut self,
        id: MessageId,
        token: u64,
        error: String,
        now: DateTime<Utc>,
        ids: &dyn IdGenerator,
    ) -> Result<(), QueueError> {
        let slot = self.active_mut(id, token)?;
        slot.message.retry_count += 1;
        slot.message.last_error = Some(error.clone());
        let queue = slot.message.queue.clone();

        match slot.message.options.decide(slot.message.retry_count) {
            RetryDecision::Retry { retry, delay } => {
                slot.state = MessageState::RetryScheduled;
                let due_at = clock::after(now, delay);
                self.scheduled.push(Scheduled { due_at, id });
                debug!(
                    queue = %queue,
                    message_id = %id,
                    retry,
                    due_at = %due_at,
                    "redelivery scheduled"
                );
            }
            RetryDecision::Exhausted => {
                let target = self.dead_letter(id, token, error, ids.message_id(), now)?;
                warn!(
                    queue = %queue,
                    message_id = %id,
                    dead_letter = ?target.as_ref().map(JobType::as_str),
                    "retries exhausted"
                );
            }
        }
        Ok(())
    }

    /// Terminally fail `id` and copy its payload into the dead-letter queue, if any.
    fn dead_letter(
        &mut self,
        id: MessageId,
        token: u64,
        reason: String,
        dead_letter_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<Option<JobType>, QueueError> {
        let slot = self.active_mut(id, token)?;
        let target = slot.message.options.dead_letter.clone();
        let payload = slot.message.payload.clone();
        self.finish(id, Terminal::DeadLettered);

        if let Some(queue) = &target {
            let mut copy = JobMessage::new(
                dead_letter_id,
                queue.clone(),
                payload,
                PublishOptions::none(),
                now,
            );
            copy.last_error = Some(reason);
            self.enqueue(copy);
        }
        Ok(target)
    }
}

/// Reference JobQueue kept entirely in memory. Time comes from the injected
/// clock, so redelivery schedules and lease expiry are testable with `FixedClock`.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    lease_timeout: Duration,
}

impl InMemoryJobQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            clock,
            ids,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    /// Keep above the worker's handler timeout, or slow handlers get redelivered.
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub async fn counts(&self, queue: &JobType) -> QueueCounts {
        let state = self.state.lock().await;
        let tally = state.finished.get(queue).copied().unwrap_or_default();
        let mut counts = QueueCounts {
            completed: tally.completed,
            dead_lettered: tally.dead_lettered,
            ..QueueCounts::default()
        };
        for slot in state.slots.values().filter(|s| &s.message.queue == queue) {
            match slot.state {
                MessageState::Queued => counts.queued += 1,
                MessageState::Active(_) => counts.active += 1,
                MessageState::RetryScheduled => counts.retry_scheduled += 1,
            }
        }
        counts
    }

    /// Messages waiting in dead-letter queue `queue`, oldest first.
    pub async fn dead_letters(&self, queue: &JobType) -> Vec<JobMessage> {
        let state = self.state.lock().await;
        let mut messages: Vec<JobMessage> = state
            .slots
            .values()
            .filter(|s| &s.message.queue == queue)
            .map(|s| s.message.clone())
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        messages
    }

    /// A message the queue still holds. Completed and dead-lettered ones are gone.
    pub async fn get(&self, id: MessageId) -> Option<JobMessage> {
        let state = self.state.lock().await;
        state.slots.get(&id).map(|s| s.message.clone())
    }

    /// Every queue that has held a message.
    pub async fn queues(&self) -> Vec<JobType> {
        let state = self.state.lock().await;
        let mut queues: Vec<JobType> = state.ready.keys().cloned().collect();
        queues.sort();
        queues
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn publish(
        &self,
        queue: &JobType,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<Published, QueueError> {
        let mut state = self.state.lock().await;

        if let Some(key) = options.singleton_key.as_deref()
            && let Some(existing) = state.live_singleton(queue, key)
        {
            debug!(queue = %queue, singleton_key = key, message_id = %existing, "singleton hit");
            return Ok(Published::Deduplicated(existing));
        }

        let message = JobMessage::new(
            self.ids.message_id(),
            queue.clone(),
            payload,
            options,
            self.clock.now(),
        );
        Ok(Published::Enqueued(state.enqueue(message)))
    }

    async fn fetch(&self, queue: &JobType, max: usize) -> Result<Vec<Box<dyn MessageLease>>, QueueError> {
        let now = self.clock.now();
        let until = clock::after(now, self.lease_timeout);
        let mut state = self.state.lock().await;
        state.reclaim_expired(now, self.ids.as_ref());
        state.promote_scheduled(now);

        let mut leases: Vec<Box<dyn MessageLease>> = Vec::new();
        while leases.len() < max {
            let Some(id) = state.ready.get_mut(queue).and_then(VecDeque::pop_front) else {
                break;
            };
            state.next_token += 1;
            let token = state.next_token;
            let Some(slot) = state.slots.get_mut(&id) else {
                continue;
            };
            if slot.state != MessageState::Queued {
                continue;
            }
            slot.state = MessageState::Active(Lease { token, until });
            leases.push(Box::new(InMemoryLease {
                message: slot.message.clone(),
                token,
                queue: self.clone(),
            }));
        }
        Ok(leases)
    }
}

struct InMemoryLease {
    message: JobMessage,
    token: u64,
    queue: InMemoryJobQueue,
}

#[async_trait]
impl MessageLease for InMemoryLease {
    fn message(&self) -> &JobMessage {
        &self.message
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut state = self.queue.state.lock().await;
        state.active_mut(self.message.id, self.token)?;
        state.finish(self.message.id, Terminal::Completed);
        Ok(())
    }

    async fn fail(self: Box<Self>, error: String) -> Result<(), QueueError> {
        let now = self.queue.clock.now();
        let mut state = self.queue.state.lock().await;
        state.fail_delivery(self.message.id, self.token, error, now, self.queue.ids.as_ref())
    }

    async fn dead_letter(self: Box<Self>, reason: String) -> Result<(), QueueError> {
        let now = self.queue.clock.now();
        let dead_letter_id = self.queue.ids.message_id();
        let mut state = self.queue.state.lock().await;
        state.dead_letter(self.message.id, self.token, reason, dead_letter_id, now)?;
        Ok(())
    }
}
