//! Deduplicated priority queue of permission sync requests.
//!
//! At most one request per `(type, id)` lives in the queue. A request stays
//! in the queue while it is being processed (marked acquired) and is removed
//! by the orchestrator once the sync finishes, so the same user or repository
//! is never synced twice concurrently.

use authz::FetchPermsOptions;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};
use tokio::sync::mpsc;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    Default
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    #[default]
    Low,
    High
}

/// Kind of entity a request syncs. `User` outranks `Repo` when priorities
/// tie.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RequestType {
    Unknown,
    Repo,
    User
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub priority: Priority,
    pub request_type: RequestType,
    pub id: i32,
    /// When the entity was last synced; older requests run first.
    pub last_updated: DateTime<Utc>,
    /// The entity has never been synced.
    pub no_perms: bool,
    pub invalidate_caches: bool
}

impl RequestMeta {
    pub fn new(request_type: RequestType, id: i32, priority: Priority) -> Self {
        Self {
            priority,
            request_type,
            id,
            last_updated: Utc::now(),
            no_perms: false,
            invalidate_caches: false
        }
    }

    pub fn user(id: i32, priority: Priority) -> Self {
        Self::new(RequestType::User, id, priority)
    }

    pub fn repo(id: i32, priority: Priority) -> Self {
        Self::new(RequestType::Repo, id, priority)
    }

    pub fn with_last_updated(mut self, last_updated: DateTime<Utc>) -> Self {
        self.last_updated = last_updated;
        self
    }

    pub fn with_no_perms(mut self, no_perms: bool) -> Self {
        self.no_perms = no_perms;
        self
    }

    pub fn with_invalidate_caches(mut self, invalidate_caches: bool) -> Self {
        self.invalidate_caches = invalidate_caches;
        self
    }

    pub fn fetch_options(&self) -> FetchPermsOptions {
        FetchPermsOptions {
            invalidate_caches: self.invalidate_caches
        }
    }

    /// Strictly more urgent or strictly staler than `other`.
    fn improves_on(&self, other: &RequestMeta) -> bool {
        self.priority > other.priority || self.last_updated < other.last_updated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub meta: RequestMeta,
    pub acquired: bool
}

impl SyncRequest {
    pub fn new(meta: RequestMeta) -> Self {
        Self {
            meta,
            acquired: false
        }
    }

    fn key(&self) -> RequestKey {
        (self.meta.request_type, self.meta.id)
    }

    /// Heap order: pending before acquired, then priority, then request type,
    /// then staleness.
    fn runs_before(&self, other: &SyncRequest) -> bool {
        if self.acquired != other.acquired {
            return !self.acquired;
        }
        if self.meta.priority != other.meta.priority {
            return self.meta.priority > other.meta.priority;
        }
        if self.meta.request_type != other.meta.request_type {
            return self.meta.request_type > other.meta.request_type;
        }
        self.meta.last_updated < other.meta.last_updated
    }
}

type RequestKey = (RequestType, i32);

/// Binary min-heap over `runs_before` with a position index per key. Not
/// synchronized; [`RequestQueue`] owns it behind a mutex.
#[derive(Debug, Default)]
struct RequestHeap {
    entries: Vec<SyncRequest>,
    positions: HashMap<RequestKey, usize>
}

impl RequestHeap {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, key: &RequestKey) -> Option<&SyncRequest> {
        self.positions.get(key).map(|&i| &self.entries[i])
    }

    fn peek(&self) -> Option<&SyncRequest> {
        self.entries.first()
    }

    /// The most urgent pending request whose type is accepted. Falls back to a
    /// scan when the root is acquired or of a rejected type.
    fn best_pending(&self, accept: impl Fn(RequestType) -> bool) -> Option<RequestKey> {
        let root = self.peek()?;
        if root.acquired {
            return None;
        }
        if accept(root.meta.request_type) {
            return Some(root.key());
        }
        self.entries
            .iter()
            .filter(|r| !r.acquired && accept(r.meta.request_type))
            .fold(None::<&SyncRequest>, |best, r| match best {
                Some(b) if !r.runs_before(b) => Some(b),
                _ => Some(r)
            })
            .map(SyncRequest::key)
    }

    fn push(&mut self, request: SyncRequest) {
        let i = self.entries.len();
        self.positions.insert(request.key(), i);
        self.entries.push(request);
        self.up(i);
    }

    fn remove(&mut self, key: &RequestKey) -> Option<SyncRequest> {
        let i = *self.positions.get(key)?;
        let last = self.entries.len() - 1;
        if i != last {
            self.swap(i, last);
        }
        let removed = self.entries.pop()?;
        self.positions.remove(key);
        if i < self.entries.len() {
            self.fix(i);
        }
        Some(removed)
    }

    /// Mutates the entry in place and restores heap order.
    fn update(&mut self, key: &RequestKey, f: impl FnOnce(&mut SyncRequest)) -> bool {
        let Some(&i) = self.positions.get(key) else {
            return false;
        };
        f(&mut self.entries[i]);
        self.fix(i);
        true
    }

    fn fix(&mut self, i: usize) {
        if !self.down(i) {
            self.up(i);
        }
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.entries[i].runs_before(&self.entries[j])
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
        self.positions.insert(self.entries[i].key(), i);
        self.positions.insert(self.entries[j].key(), j);
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let parent = (j - 1) / 2;
            if !self.less(j, parent) {
                break;
            }
            self.swap(j, parent);
            j = parent;
        }
    }

    fn down(&mut self, start: usize) -> bool {
        let n = self.entries.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            if left + 1 < n && self.less(left + 1, left) {
                child = left + 1;
            }
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }
}

/// Thread-safe request queue shared by producers (scheduler, worker, API) and
/// the orchestrator's consumer loop.
pub struct RequestQueue {
    heap: Mutex<RequestHeap>,
    notify_tx: mpsc::Sender<()>,
    notify_rx: tokio::sync::Mutex<mpsc::Receiver<()>>
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(1);
        Self {
            heap: Mutex::new(RequestHeap::default()),
            notify_tx,
            notify_rx: tokio::sync::Mutex::new(notify_rx)
        }
    }

    /// Adds a request, or upgrades the queued request for the same entity.
    ///
    /// Returns `true` only when an existing request was updated in place. A
    /// request that is already being processed is never touched, and a
    /// duplicate that is neither more urgent nor staler is ignored.
    pub fn enqueue(&self, meta: RequestMeta) -> bool {
        let key = (meta.request_type, meta.id);
        let mut heap = self.heap.lock();

        let Some(existing) = heap.get(&key) else {
            heap.push(SyncRequest::new(meta));
            drop(heap);
            self.notify();
            return false;
        };

        if existing.acquired || !meta.improves_on(&existing.meta) {
            return false;
        }

        heap.update(&key, |request| {
            let current = &mut request.meta;
            current.priority = current.priority.max(meta.priority);
            current.last_updated = current.last_updated.min(meta.last_updated);
            current.no_perms |= meta.no_perms;
            current.invalidate_caches |= meta.invalidate_caches;
        })
    }

    /// Removes the request for the entity if its acquired flag equals
    /// `acquired`.
    pub fn remove(&self, request_type: RequestType, id: i32, acquired: bool) -> bool {
        let key = (request_type, id);
        let mut heap = self.heap.lock();
        match heap.get(&key) {
            Some(request) if request.acquired == acquired => heap.remove(&key).is_some(),
            _ => false
        }
    }

    /// Marks the most urgent pending request as acquired and returns it.
    /// Returns `None` when the queue is empty or everything is in flight.
    pub fn acquire_next(&self) -> Option<SyncRequest> {
        self.acquire_next_where(|_| true)
    }

    /// Like [`RequestQueue::acquire_next`], restricted to request types for
    /// which `accept` returns `true`. Requests of other types stay pending.
    pub fn acquire_next_where(&self, accept: impl Fn(RequestType) -> bool) -> Option<SyncRequest> {
        let mut heap = self.heap.lock();
        let key = heap.best_pending(accept)?;
        let mut acquired = None;
        heap.update(&key, |request| {
            request.acquired = true;
            acquired = Some(request.clone());
        });
        acquired
    }

    /// Enqueues `meta` already acquired, for callers that sync outside the
    /// consumer loop. A pending request for the same entity is merged and
    /// taken over. Returns `None` while the entity is being synced.
    pub fn claim(&self, meta: RequestMeta) -> Option<SyncRequest> {
        let key = (meta.request_type, meta.id);
        let mut heap = self.heap.lock();
        match heap.get(&key) {
            Some(existing) if existing.acquired => None,
            Some(_) => {
                let mut claimed = None;
                heap.update(&key, |request| {
                    let current = &mut request.meta;
                    current.priority = current.priority.max(meta.priority);
                    current.last_updated = current.last_updated.min(meta.last_updated);
                    current.no_perms |= meta.no_perms;
                    current.invalidate_caches |= meta.invalidate_caches;
                    request.acquired = true;
                    claimed = Some(request.clone());
                });
                claimed
            }
            None => {
                let request = SyncRequest {
                    meta,
                    acquired: true
                };
                heap.push(request.clone());
                Some(request)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes the consumer. Drops the signal when one is already pending.
    pub fn notify(&self) {
        let _ = self.notify_tx.try_send(());
    }

    /// Waits until a producer signals new work.
    pub async fn notified(&self) {
        let mut rx = self.notify_rx.lock().await;
        let _ = rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(seconds)
    }

    fn drain(queue: &RequestQueue) -> Vec<(RequestType, i32)> {
        let mut order = Vec::new();
        while let Some(request) = queue.acquire_next() {
            order.push((request.meta.request_type, request.meta.id));
        }
        order
    }

    #[test]
    fn test_enqueue_deduplicates_by_type_and_id() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::user(1, Priority::Low));
        queue.enqueue(RequestMeta::user(1, Priority::Low));
        queue.enqueue(RequestMeta::user(1, Priority::High));
        queue.enqueue(RequestMeta::repo(1, Priority::Low));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_high_priority_dequeues_first() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::user(1, Priority::Low).with_last_updated(at(0)));
        queue.enqueue(RequestMeta::user(2, Priority::High).with_last_updated(at(100)));
        assert_eq!(
            drain(&queue),
            vec![(RequestType::User, 2), (RequestType::User, 1)]
        );
    }

    #[test]
    fn test_user_before_repo_on_equal_priority() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::repo(1, Priority::Low).with_last_updated(at(0)));
        queue.enqueue(RequestMeta::user(1, Priority::Low).with_last_updated(at(100)));
        assert_eq!(
            drain(&queue),
            vec![(RequestType::User, 1), (RequestType::Repo, 1)]
        );
    }

    #[test]
    fn test_older_request_dequeues_first() {
        let queue = RequestQueue::new();
        for (id, seconds) in [(1, 300), (2, 100), (3, 200), (4, 50)] {
            queue.enqueue(RequestMeta::repo(id, Priority::Low).with_last_updated(at(seconds)));
        }
        let ids: Vec<i32> = drain(&queue).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_low_after_high_is_noop() {
        let queue = RequestQueue::new();
        let high = RequestMeta::user(1, Priority::High).with_last_updated(at(10));
        assert!(!queue.enqueue(high.clone()));
        assert!(!queue.enqueue(RequestMeta::user(1, Priority::Low).with_last_updated(at(20))));

        let request = queue.acquire_next().unwrap();
        assert_eq!(request.meta, high);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_upgrade_in_place() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::user(1, Priority::Low).with_last_updated(at(10)));
        queue.enqueue(RequestMeta::user(2, Priority::Low).with_last_updated(at(5)));

        assert!(queue.enqueue(RequestMeta::user(1, Priority::High).with_last_updated(at(20))));
        assert_eq!(queue.len(), 2);

        let first = queue.acquire_next().unwrap();
        assert_eq!(first.meta.id, 1);
        assert_eq!(first.meta.priority, Priority::High);
        // Staleness is kept from the older request.
        assert_eq!(first.meta.last_updated, at(10));
    }

    #[test]
    fn test_acquired_requests_are_not_updated_or_reacquired() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::user(1, Priority::Low));
        let acquired = queue.acquire_next().unwrap();
        assert!(acquired.acquired);

        assert!(!queue.enqueue(RequestMeta::user(1, Priority::High)));
        assert!(queue.acquire_next().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_requires_matching_acquired_flag() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::repo(7, Priority::Low));
        assert!(!queue.remove(RequestType::Repo, 7, true));

        queue.acquire_next().unwrap();
        assert!(!queue.remove(RequestType::Repo, 7, false));
        assert!(queue.remove(RequestType::Repo, 7, true));
        assert!(queue.is_empty());
        assert!(!queue.remove(RequestType::Repo, 7, true));
    }

    #[test]
    fn test_acquired_entries_sort_last() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::user(1, Priority::High));
        queue.enqueue(RequestMeta::repo(2, Priority::Low));
        queue.enqueue(RequestMeta::repo(3, Priority::Low));

        assert_eq!(queue.acquire_next().unwrap().meta.id, 1);
        let second = queue.acquire_next().unwrap();
        assert_eq!(second.meta.request_type, RequestType::Repo);

        // Removing an entry from the middle keeps the heap consistent.
        assert!(queue.remove(RequestType::User, 1, true));
        let third = queue.acquire_next().unwrap();
        assert_ne!(third.meta.id, second.meta.id);
        assert!(queue.acquire_next().is_none());
    }

    #[test]
    fn test_heap_survives_interleaved_operations() {
        let queue = RequestQueue::new();
        for id in 0..50 {
            let priority = if id % 3 == 0 { Priority::High } else { Priority::Low };
            queue.enqueue(RequestMeta::repo(id, priority).with_last_updated(at(i64::from(100 - id))));
        }
        for id in (0..50).step_by(7) {
            queue.remove(RequestType::Repo, id, false);
        }

        let mut previous: Option<RequestMeta> = None;
        while let Some(request) = queue.acquire_next() {
            if let Some(prev) = &previous {
                assert!(
                    prev.priority > request.meta.priority
                        || (prev.priority == request.meta.priority
                            && prev.last_updated <= request.meta.last_updated)
                );
            }
            previous = Some(request.meta);
        }
    }

    #[test]
    fn test_acquire_next_where_skips_rejected_types() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::user(1, Priority::High).with_last_updated(at(0)));
        queue.enqueue(RequestMeta::repo(2, Priority::Low).with_last_updated(at(50)));
        queue.enqueue(RequestMeta::repo(3, Priority::High).with_last_updated(at(100)));

        let repo = queue
            .acquire_next_where(|t| t == RequestType::Repo)
            .unwrap();
        assert_eq!(repo.meta.id, 3);
        assert!(queue.acquire_next_where(|_| false).is_none());

        // The user request was left pending.
        let next = queue.acquire_next().unwrap();
        assert_eq!((next.meta.request_type, next.meta.id), (RequestType::User, 1));
    }

    #[test]
    fn test_claim_takes_over_pending_request() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::user(1, Priority::Low).with_last_updated(at(10)));

        let claimed = queue
            .claim(RequestMeta::user(1, Priority::High).with_last_updated(at(20)))
            .unwrap();
        assert!(claimed.acquired);
        assert_eq!(claimed.meta.priority, Priority::High);
        assert_eq!(claimed.meta.last_updated, at(10));
        assert_eq!(queue.len(), 1);
        assert!(queue.acquire_next().is_none());

        // Already in flight.
        assert!(queue.claim(RequestMeta::user(1, Priority::High)).is_none());
        assert!(queue.remove(RequestType::User, 1, true));

        let fresh = queue.claim(RequestMeta::repo(4, Priority::Low)).unwrap();
        assert!(fresh.acquired);
        assert!(queue.acquire_next().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_notifies_consumer() {
        let queue = RequestQueue::new();
        queue.enqueue(RequestMeta::user(1, Priority::Low));
        queue.enqueue(RequestMeta::user(2, Priority::Low));

        tokio::time::timeout(StdDuration::from_secs(1), queue.notified())
            .await
            .expect("signal after enqueue");

        // The second signal was dropped because the channel was full.
        let pending = tokio::time::timeout(StdDuration::from_millis(50), queue.notified()).await;
        assert!(pending.is_err());
    }

    #[test]
    fn test_priority_strings() {
        assert_eq!(Priority::High.to_string(), "high");
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!(RequestType::User > RequestType::Repo);
        assert!(RequestType::Repo > RequestType::Unknown);
    }
}
