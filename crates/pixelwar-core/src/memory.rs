//! In-process implementations of every collaborator.
//!
//! Used by the test suites and by single-process development runs. The
//! semantics mirror the networked stores: expiring keys, atomic
//! set-if-absent, sorted sets whose ties come back in reverse member order,
//! and a partitioned queue with redelivery.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pixelwar_types::{Cell, CellCoord, UpdateMessage, UserId};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::backend::Backend;
use crate::cache::PixelCache;
use crate::cells::{CellRecord, CellStore, CellWrite};
use crate::cooldown::{CooldownStore, SetIfAbsent};
use crate::error::StoreError;
use crate::lock::LockProvider;
use crate::queue::{Delivery, UpdateQueue, UpdateSource, partition_for};
use crate::ranking::RankingStore;

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct KvState {
    strings: HashMap<String, Expiring<String>>,
    zsets: HashMap<String, Expiring<HashMap<String, i64>>>,
}

impl KvState {
    fn string(&mut self, key: &str, now: Instant) -> Option<&Expiring<String>> {
        if self.strings.get(key).is_some_and(|e| !e.live(now)) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn zset(&mut self, key: &str, now: Instant) -> Option<&HashMap<String, i64>> {
        if self.zsets.get(key).is_some_and(|e| !e.live(now)) {
            self.zsets.remove(key);
        }
        self.zsets.get(key).map(|e| &e.value)
    }

    fn zincr(&mut self, key: &str, member: &str, delta: i64, now: Instant) -> i64 {
        if self.zsets.get(key).is_some_and(|e| !e.live(now)) {
            self.zsets.remove(key);
        }
        let set = self.zsets.entry(key.to_owned()).or_insert_with(|| Expiring {
            value: HashMap::new(),
            expires_at: None,
        });
        let score = set.value.entry(member.to_owned()).or_insert(0);
        *score = score.saturating_add(delta);
        *score
    }

    fn sorted(&mut self, key: &str, now: Instant) -> Vec<(String, i64)> {
        let mut rows: Vec<(String, i64)> = self
            .zset(key, now)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        rows
    }
}

/// In-memory key-value store with expiring keys and sorted sets.
///
/// Expiry follows the tokio clock so tests can pause and advance time.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    state: Arc<Mutex<KvState>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn expiry(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

impl CooldownStore for MemoryKv {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<SetIfAbsent, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(existing) = state.string(key, now) {
            let remaining = existing
                .expires_at
                .map_or(Duration::ZERO, |at| at.saturating_duration_since(now));
            return Ok(SetIfAbsent::Exists { remaining });
        }
        state.strings.insert(
            key.to_owned(),
            Expiring {
                value: String::new(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(SetIfAbsent::Created)
    }
}

impl LockProvider for MemoryKv {
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.string(key, now).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_owned(),
            Expiring {
                value: token.to_owned(),
                expires_at: expiry(now, lease),
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.string(key, now).is_some_and(|e| e.value == token) {
            state.strings.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

impl PixelCache for MemoryKv {
    async fn set_color(&self, key: &str, color: &str) -> Result<(), StoreError> {
        self.state.lock().await.strings.insert(
            key.to_owned(),
            Expiring {
                value: color.to_owned(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get_color(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state.string(key, now).map(|e| e.value.clone()))
    }

    async fn clear_color(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().await.strings.remove(key);
        Ok(())
    }

    async fn increment_heatmap(
        &self,
        window_key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.zincr(window_key, member, 1, now);
        if let Some(set) = state.zsets.get_mut(window_key) {
            set.expires_at = expiry(now, ttl);
        }
        Ok(())
    }

    async fn hot_members(
        &self,
        window_key: &str,
        limit: usize,
    ) -> Result<Vec<(String, u64)>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state
            .sorted(window_key, now)
            .into_iter()
            .take(limit)
            .map(|(member, score)| (member, u64::try_from(score).unwrap_or(0)))
            .collect())
    }
}

impl RankingStore for MemoryKv {
    async fn add_score(&self, key: &str, member: &str, delta: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        Ok(self.state.lock().await.zincr(key, member, delta, now))
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state.zset(key, now).and_then(|set| set.get(member).copied()))
    }

    async fn top_scores(&self, key: &str, limit: usize) -> Result<Vec<(String, i64)>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state.sorted(key, now).into_iter().take(limit).collect())
    }

    async fn members_with_score(&self, key: &str, score: i64) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state
            .sorted(key, now)
            .into_iter()
            .filter(|(_, s)| *s == score)
            .map(|(member, _)| member)
            .collect())
    }

    async fn all_scores(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state.sorted(key, now))
    }
}

// ---------------------------------------------------------------------------
// Durable cell store
// ---------------------------------------------------------------------------

/// In-memory durable cell store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCellStore {
    cells: Arc<Mutex<BTreeMap<CellCoord, CellRecord>>>,
}

impl MemoryCellStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CellStore for MemoryCellStore {
    async fn find(&self, cell: CellCoord) -> Result<Option<CellRecord>, StoreError> {
        Ok(self.cells.lock().await.get(&cell).cloned())
    }

    async fn insert_if_absent(&self, record: &CellRecord) -> Result<bool, StoreError> {
        let mut cells = self.cells.lock().await;
        if cells.contains_key(&record.coord) {
            return Ok(false);
        }
        cells.insert(record.coord, record.clone());
        Ok(true)
    }

    async fn update_if_version(
        &self,
        cell: CellCoord,
        expected_version: i64,
        write: &CellWrite,
    ) -> Result<bool, StoreError> {
        let mut cells = self.cells.lock().await;
        let Some(record) = cells.get_mut(&cell) else {
            return Ok(false);
        };
        if record.version != expected_version {
            return Ok(false);
        }
        record.color.clone_from(&write.color);
        record.owner.clone_from(&write.owner);
        record.version = record.version.saturating_add(1);
        record.last_message_id = write.message_id;
        record.last_enqueued_at = write.enqueued_at;
        Ok(true)
    }

    async fn find_in_bounds(
        &self,
        min: CellCoord,
        max: CellCoord,
        limit: u64,
    ) -> Result<Vec<Cell>, StoreError> {
        let cells = self.cells.lock().await;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(cells
            .values()
            .filter(|r| {
                (min.x..=max.x).contains(&r.coord.x) && (min.y..=max.y).contains(&r.coord.y)
            })
            .take(limit)
            .map(CellRecord::to_cell)
            .collect())
    }

    async fn all(&self) -> Result<Vec<Cell>, StoreError> {
        Ok(self
            .cells
            .lock()
            .await
            .values()
            .map(CellRecord::to_cell)
            .collect())
    }

    async fn ownership_counts(&self) -> Result<Vec<(UserId, i64)>, StoreError> {
        let cells = self.cells.lock().await;
        let mut counts: BTreeMap<UserId, i64> = BTreeMap::new();
        for record in cells.values() {
            let count = counts.entry(record.owner.clone()).or_insert(0);
            *count = count.saturating_add(1);
        }
        Ok(counts.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Partitioned queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
}

/// A handed-back delivery waiting for its redelivery time.
#[derive(Debug)]
struct Pending {
    payload: Vec<u8>,
    attempt: u64,
    ready_at: Instant,
}

type RedeliveryQueue = Arc<Mutex<VecDeque<Pending>>>;

/// In-memory partitioned queue with explicit acknowledgement.
///
/// Each partition's source can be taken once. A retried delivery is handed
/// out again, after its delay, before any newer message of its partition.
/// With a delivery limit, a message retried on its last allowed delivery is
/// discarded, as the broker does.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    senders: Arc<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    receivers: Arc<Mutex<Vec<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>>,
    counters: Arc<QueueCounters>,
    delivery_limit: Option<u64>,
}

impl MemoryQueue {
    /// Create a queue with `partitions` partitions (at least one) and
    /// unlimited redelivery.
    pub fn new(partitions: u32) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Some(rx))
            })
            .unzip();
        Self {
            senders: Arc::new(senders),
            receivers: Arc::new(Mutex::new(receivers)),
            counters: Arc::new(QueueCounters::default()),
            delivery_limit: None,
        }
    }

    /// Give up on a message after `limit` deliveries (`None` for unlimited).
    #[must_use]
    pub const fn with_delivery_limit(mut self, limit: Option<u64>) -> Self {
        self.delivery_limit = limit;
        self
    }

    /// Number of partitions.
    pub fn partitions(&self) -> u32 {
        u32::try_from(self.senders.len()).unwrap_or(u32::MAX)
    }

    /// Take the consumer of `partition`. `None` if it does not exist or was
    /// already taken.
    pub async fn source(&self, partition: u32) -> Option<MemorySource> {
        let index = usize::try_from(partition).ok()?;
        let rx = self.receivers.lock().await.get_mut(index)?.take()?;
        Some(MemorySource {
            rx,
            redeliver: Arc::new(Mutex::new(VecDeque::new())),
            counters: Arc::clone(&self.counters),
            delivery_limit: self.delivery_limit,
        })
    }

    /// Push a raw payload onto `partition`, bypassing serialization.
    pub fn inject(&self, partition: u32, payload: Vec<u8>) -> Result<(), StoreError> {
        let index = usize::try_from(partition)
            .map_err(|e| StoreError::Unavailable(format!("partition {partition}: {e}")))?;
        let tx = self
            .senders
            .get(index)
            .ok_or_else(|| StoreError::Unavailable(format!("no partition {partition}")))?;
        tx.send(payload)
            .map_err(|_closed| StoreError::Unavailable(format!("partition {partition} closed")))?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Messages accepted so far.
    pub fn enqueued(&self) -> u64 {
        self.counters.enqueued.load(Ordering::Relaxed)
    }

    /// Deliveries acknowledged so far.
    pub fn acked(&self) -> u64 {
        self.counters.acked.load(Ordering::Relaxed)
    }

    /// Deliveries handed back for redelivery so far.
    pub fn retried(&self) -> u64 {
        self.counters.retried.load(Ordering::Relaxed)
    }

    /// Messages discarded after their last allowed delivery.
    pub fn exhausted(&self) -> u64 {
        self.counters.exhausted.load(Ordering::Relaxed)
    }
}

impl UpdateQueue for MemoryQueue {
    async fn enqueue(&self, cell: CellCoord, message: &UpdateMessage) -> Result<(), StoreError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.inject(partition_for(cell, self.partitions()), payload)
    }
}

/// Consumer of one [`MemoryQueue`] partition.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    redeliver: RedeliveryQueue,
    counters: Arc<QueueCounters>,
    delivery_limit: Option<u64>,
}

impl MemorySource {
    fn delivery(&self, payload: Vec<u8>, attempt: u64) -> MemoryDelivery {
        MemoryDelivery {
            payload,
            attempt,
            redeliver: Arc::clone(&self.redeliver),
            counters: Arc::clone(&self.counters),
            delivery_limit: self.delivery_limit,
        }
    }
}

impl UpdateSource for MemorySource {
    type Delivery = MemoryDelivery;

    async fn next_delivery(&mut self) -> Option<Result<MemoryDelivery, StoreError>> {
        // Peek first so a cancelled wait leaves the retried message queued.
        let ready_at = self.redeliver.lock().await.front().map(|p| p.ready_at);
        if let Some(ready_at) = ready_at {
            tokio::time::sleep_until(ready_at).await;
            let pending = self.redeliver.lock().await.pop_front();
            if let Some(pending) = pending {
                let attempt = pending.attempt.saturating_add(1);
                return Some(Ok(self.delivery(pending.payload, attempt)));
            }
        }
        let payload = self.rx.recv().await?;
        Some(Ok(self.delivery(payload, 1)))
    }
}

/// A message delivered by [`MemorySource`].
#[derive(Debug)]
pub struct MemoryDelivery {
    payload: Vec<u8>,
    attempt: u64,
    redeliver: RedeliveryQueue,
    counters: Arc<QueueCounters>,
    delivery_limit: Option<u64>,
}

impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn attempt(&self) -> u64 {
        self.attempt
    }

    async fn ack(self) -> Result<(), StoreError> {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn retry(self, delay: Duration) -> Result<(), StoreError> {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        if self.delivery_limit.is_some_and(|limit| self.attempt >= limit) {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let now = Instant::now();
        self.redeliver.lock().await.push_front(Pending {
            payload: self.payload,
            attempt: self.attempt,
            ready_at: now.checked_add(delay).unwrap_or(now),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Every collaborator kept in process memory.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    /// Cooldown, lock, cache and ranking store.
    pub kv: MemoryKv,
    /// Durable cell store.
    pub cells: MemoryCellStore,
    /// Update queue.
    pub queue: MemoryQueue,
}

impl MemoryBackend {
    /// Create an empty backend whose queue has `partitions` partitions.
    pub fn new(partitions: u32) -> Self {
        Self {
            kv: MemoryKv::new(),
            cells: MemoryCellStore::new(),
            queue: MemoryQueue::new(partitions),
        }
    }
}

impl Backend for MemoryBackend {
    type Cooldown = MemoryKv;
    type Locks = MemoryKv;
    type Cache = MemoryKv;
    type Queue = MemoryQueue;
    type Cells = MemoryCellStore;
    type Ranking = MemoryKv;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use pixelwar_types::{CoordinatePair, MessageId};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn keys_expire_on_the_tokio_clock() {
        let kv = MemoryKv::new();
        assert_eq!(
            kv.set_if_absent("k", Duration::from_secs(1)).await.unwrap(),
            SetIfAbsent::Created
        );
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(matches!(
            kv.set_if_absent("k", Duration::from_secs(1)).await.unwrap(),
            SetIfAbsent::Exists { remaining } if remaining == Duration::from_millis(600)
        ));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(
            kv.set_if_absent("k", Duration::from_secs(1)).await.unwrap(),
            SetIfAbsent::Created
        );
    }

    #[tokio::test]
    async fn sorted_ties_come_back_in_reverse_member_order() {
        let kv = MemoryKv::new();
        for member in ["a", "b", "c"] {
            kv.add_score("z", member, 2).await.unwrap();
        }
        let top = kv.top_scores("z", 3).await.unwrap();
        let members: Vec<&str> = top.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn cell_store_version_check() {
        let store = MemoryCellStore::new();
        let cell = Cell {
            coord: CellCoord::new(1, 1),
            color: String::from("#111111"),
            owner: UserId::from("u1"),
        };
        assert!(
            store
                .insert_if_absent(&CellRecord::claim(&cell, None, Utc::now()))
                .await
                .unwrap()
        );
        assert!(
            !store
                .insert_if_absent(&CellRecord::claim(&cell, None, Utc::now()))
                .await
                .unwrap()
        );

        let write = CellWrite {
            color: String::from("#222222"),
            owner: UserId::from("u2"),
            message_id: Some(MessageId::new()),
            enqueued_at: Utc::now(),
        };
        assert!(!store.update_if_version(cell.coord, 7, &write).await.unwrap());
        assert!(store.update_if_version(cell.coord, 1, &write).await.unwrap());

        let record = store.find(cell.coord).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.owner, UserId::from("u2"));
    }

    #[tokio::test]
    async fn bounds_are_inclusive() {
        let store = MemoryCellStore::new();
        for (x, y) in [(0, 0), (2, 2), (3, 0)] {
            let cell = Cell {
                coord: CellCoord::new(x, y),
                color: String::from("#000000"),
                owner: UserId::from("u"),
            };
            store
                .insert_if_absent(&CellRecord::claim(&cell, None, Utc::now()))
                .await
                .unwrap();
        }
        let found = store
            .find_in_bounds(CellCoord::new(0, 0), CellCoord::new(2, 2), 100)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn retried_delivery_comes_back_first() {
        let queue = MemoryQueue::new(1);
        let mut source = queue.source(0).await.unwrap();
        assert!(queue.source(0).await.is_none());

        let message = |color: &str| UpdateMessage {
            id: Some(MessageId::new()),
            coordinate_pair: CoordinatePair(0.0, 0.0),
            color: color.to_owned(),
            user_id: UserId::from("u"),
            enqueued_at: Utc::now(),
        };
        queue.enqueue(CellCoord::new(0, 0), &message("#000001")).await.unwrap();
        queue.enqueue(CellCoord::new(0, 0), &message("#000002")).await.unwrap();

        let first = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.attempt(), 1);
        let first_payload = first.payload().to_vec();
        first.retry(Duration::ZERO).await.unwrap();

        let again = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.payload(), first_payload.as_slice());
        assert_eq!(again.attempt(), 2);
        again.ack().await.unwrap();

        assert_eq!(queue.enqueued(), 2);
        assert_eq!(queue.acked(), 1);
        assert_eq!(queue.retried(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_its_delay() {
        let queue = MemoryQueue::new(1);
        let mut source = queue.source(0).await.unwrap();
        queue.inject(0, b"first".to_vec()).unwrap();
        queue.inject(0, b"second".to_vec()).unwrap();

        let started = Instant::now();
        let first = source.next_delivery().await.unwrap().unwrap();
        first.retry(Duration::from_secs(3)).await.unwrap();

        let again = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.payload(), b"first");
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn delivery_limit_discards_the_message() {
        let queue = MemoryQueue::new(1).with_delivery_limit(Some(2));
        let mut source = queue.source(0).await.unwrap();
        queue.inject(0, b"doomed".to_vec()).unwrap();
        queue.inject(0, b"next".to_vec()).unwrap();

        for _ in 0..2 {
            let delivery = source.next_delivery().await.unwrap().unwrap();
            assert_eq!(delivery.payload(), b"doomed");
            delivery.retry(Duration::ZERO).await.unwrap();
        }

        let after = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(after.payload(), b"next");
        assert_eq!(queue.exhausted(), 1);
        assert_eq!(queue.retried(), 2);
    }
}
