//! Durable path: consume update messages, persist cells, move scores.
//!
//! Per message the worker looks up the cell's durable record and either
//! claims an empty cell, repaints its owner's cell or transfers ownership.
//! Records are versioned and every write is a compare-and-set, so a lost race
//! re-reads instead of double-applying a transfer. Replays are recognised by
//! message id.
//!
//! Order between writes to one cell comes from the queue alone: a cell maps
//! to one partition, and a partition is consumed one message at a time. The
//! enqueue timestamps come from many API instances and are never compared.
//!
//! A message that fails for a transient reason is handed back with a delay
//! that doubles per attempt, and the rest of its partition waits behind it.

use std::sync::Arc;
use std::time::Duration;

use pixelwar_types::{Cell, CellCoord, PixelBroadcast, UpdateMessage, UserId};
use tokio::sync::{Notify, RwLock, watch};

use crate::broadcast::Broadcaster;
use crate::cells::{CellRecord, CellStore, CellWrite};
use crate::config::{PixelWarConfig, WorkerConfig};
use crate::error::{ConsistencyWarning, RetryPolicy, StoreError, WorkerError};
use crate::grid::GridQuantizer;
use crate::queue::{Delivery, UpdateSource};
use crate::ranking::{RankingLedger, RankingStore, ReconcileReport};

/// Compare-and-set attempts per message before handing it back to the broker.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Pause after the queue itself fails, before polling again.
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Effect of one message on the durable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The cell was empty and is now owned by the message's user.
    Claimed {
        /// Affected cell.
        cell: CellCoord,
    },
    /// The user already owned the cell; only the color changed.
    Repainted {
        /// Affected cell.
        cell: CellCoord,
    },
    /// Ownership moved from `from` to the message's user.
    Transferred {
        /// Affected cell.
        cell: CellCoord,
        /// Previous owner.
        from: UserId,
    },
    /// The message was already applied.
    Duplicate {
        /// Affected cell.
        cell: CellCoord,
    },
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed and acknowledged.
    Acked(ApplyOutcome),
    /// Unusable payload, acknowledged and discarded.
    Dropped,
    /// Handed back to the broker for another attempt.
    Redelivered {
        /// Delivery count of the failed attempt, starting at 1.
        attempt: u64,
        /// Earliest time until the next attempt.
        delay: Duration,
    },
    /// Failed on its last allowed delivery. The broker discards it.
    Exhausted {
        /// Delivery count of the failed attempt.
        attempt: u64,
    },
}

/// Persistence worker. One instance may serve several partitions.
#[derive(Debug)]
pub struct PersistenceWorker<S, R, B> {
    cells: S,
    ranking: RankingLedger<R>,
    broadcaster: B,
    quantizer: GridQuantizer,
    channel: String,
    retry: WorkerConfig,
    delivery_limit: Option<u64>,
    reconcile: Arc<Notify>,
    /// Held shared while a message is applied, exclusively while the ledger
    /// is reconciled.
    gate: RwLock<()>,
}

impl<S, R, B> PersistenceWorker<S, R, B>
where
    S: CellStore,
    R: RankingStore,
    B: Broadcaster,
{
    /// Build a worker.
    pub fn new(cells: S, ranking: RankingLedger<R>, broadcaster: B, config: &PixelWarConfig) -> Self {
        Self {
            cells,
            ranking,
            broadcaster,
            quantizer: GridQuantizer::new(&config.grid),
            channel: config.broadcast.channel.clone(),
            retry: config.worker.clone(),
            delivery_limit: config.queue.delivery_limit(),
            reconcile: Arc::new(Notify::new()),
            gate: RwLock::new(()),
        }
    }

    /// Durable cell store.
    pub const fn cells(&self) -> &S {
        &self.cells
    }

    /// Ranking ledger.
    pub const fn ranking(&self) -> &RankingLedger<R> {
        &self.ranking
    }

    /// Signal fired whenever the ledger may have diverged from the records.
    pub fn reconcile_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.reconcile)
    }

    /// Consume `source` until it closes or `shutdown` flips to `true`.
    ///
    /// A failing message never ends the loop.
    pub async fn run<U: UpdateSource>(
        &self,
        mut source: U,
        partition: u32,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(partition, "Persistence worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = source.next_delivery() => match next {
                    None => {
                        tracing::info!(partition, "Update source closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(partition, error = %e, "Update source failed, backing off");
                        tokio::time::sleep(SOURCE_ERROR_BACKOFF).await;
                    }
                    Some(Ok(delivery)) => {
                        self.process(delivery).await;
                    }
                },
            }
        }
        tracing::info!(partition, "Persistence worker stopped");
    }

    /// Handle one delivery, then acknowledge it or hand it back as the
    /// failure's [`RetryPolicy`] asks.
    pub async fn process<D: Delivery>(&self, delivery: D) -> Disposition {
        let error = match self.handle_payload(delivery.payload()).await {
            Ok(outcome) => {
                tracing::debug!(?outcome, "Update applied");
                acknowledge(delivery).await;
                return Disposition::Acked(outcome);
            }
            Err(e) => e,
        };

        let attempt = delivery.attempt();
        let delay = match error.retry_policy() {
            RetryPolicy::DoNotRetry => {
                tracing::warn!(error = %error, "Dropping unusable update message");
                acknowledge(delivery).await;
                return Disposition::Dropped;
            }
            RetryPolicy::RetryAfter(delay) => delay,
            RetryPolicy::RetryWithBackoff | RetryPolicy::Redeliver => {
                self.retry.retry_delay(attempt)
            }
        };

        let exhausted = self.delivery_limit.is_some_and(|limit| attempt >= limit);
        if exhausted {
            tracing::error!(
                attempt,
                error = %error,
                payload = %String::from_utf8_lossy(delivery.payload()),
                "Redelivery exhausted, accepted update will be discarded"
            );
        } else {
            tracing::warn!(
                attempt,
                retry_in_ms = delay.as_millis(),
                error = %error,
                "Update not applied, requesting redelivery"
            );
        }
        if let Err(e) = delivery.retry(delay).await {
            tracing::warn!(attempt, error = %e, "Failed to hand delivery back");
        }

        if exhausted {
            Disposition::Exhausted { attempt }
        } else {
            Disposition::Redelivered { attempt, delay }
        }
    }

    /// Decode and apply one raw message.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<ApplyOutcome, WorkerError> {
        let message: UpdateMessage =
            serde_json::from_slice(payload).map_err(|e| WorkerError::Parse(e.to_string()))?;
        self.apply(&message).await
    }

    /// Apply one message to the durable record and the ledger.
    ///
    /// Waits while a reconciliation pass is running.
    pub async fn apply(&self, message: &UpdateMessage) -> Result<ApplyOutcome, WorkerError> {
        if !message.coordinate_pair.is_finite() {
            return Err(WorkerError::Invalid(String::from(
                "coordinate pair is not finite",
            )));
        }
        if message.color.is_empty() || message.user_id.as_str().is_empty() {
            return Err(WorkerError::Invalid(String::from("empty color or user id")));
        }

        // Producers snap already; re-snapping keeps old or foreign producers
        // on the same grid.
        let cell = self.quantizer.quantize_pair(message.coordinate_pair);

        let applying = self.gate.read().await;
        let result = self.write_cell(cell, message).await;
        drop(applying);

        let outcome = result?;
        self.announce(&outcome, message).await;
        Ok(outcome)
    }

    async fn write_cell(
        &self,
        cell: CellCoord,
        message: &UpdateMessage,
    ) -> Result<ApplyOutcome, WorkerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let existing = self.cells.find(cell).await?;
            let outcome = match existing {
                None => self.try_claim(cell, message).await?,
                Some(record) => self.try_overwrite(&record, message).await?,
            };
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
            tracing::debug!(cell_x = cell.x, cell_y = cell.y, "Lost write race, re-reading cell");
        }

        Err(WorkerError::Conflict {
            cell,
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    async fn try_claim(
        &self,
        cell: CellCoord,
        message: &UpdateMessage,
    ) -> Result<Option<ApplyOutcome>, StoreError> {
        let record = CellRecord::claim(
            &Cell {
                coord: cell,
                color: message.color.clone(),
                owner: message.user_id.clone(),
            },
            message.id,
            message.enqueued_at,
        );
        if !self.cells.insert_if_absent(&record).await? {
            return Ok(None);
        }
        if let Err(e) = self.ranking.increment(&message.user_id).await {
            self.diverged(cell, message, &e);
        }
        Ok(Some(ApplyOutcome::Claimed { cell }))
    }

    async fn try_overwrite(
        &self,
        record: &CellRecord,
        message: &UpdateMessage,
    ) -> Result<Option<ApplyOutcome>, StoreError> {
        let cell = record.coord;
        if is_replay(record, message) {
            return Ok(Some(ApplyOutcome::Duplicate { cell }));
        }

        let write = CellWrite {
            color: message.color.clone(),
            owner: message.user_id.clone(),
            message_id: message.id,
            enqueued_at: message.enqueued_at,
        };
        if !self
            .cells
            .update_if_version(cell, record.version, &write)
            .await?
        {
            return Ok(None);
        }

        if record.owner == message.user_id {
            return Ok(Some(ApplyOutcome::Repainted { cell }));
        }

        if let Err(e) = self.ranking.decrement(&record.owner).await {
            self.diverged(cell, message, &e);
        }
        if let Err(e) = self.ranking.increment(&message.user_id).await {
            self.diverged(cell, message, &e);
        }
        Ok(Some(ApplyOutcome::Transferred {
            cell,
            from: record.owner.clone(),
        }))
    }

    fn diverged(&self, cell: CellCoord, message: &UpdateMessage, error: &StoreError) {
        let warning = ConsistencyWarning {
            cell,
            message_id: message.id,
            detail: error.to_string(),
        };
        tracing::warn!(
            cell_x = cell.x,
            cell_y = cell.y,
            message_id = ?warning.message_id,
            kind = ?warning.kind(),
            "{warning}"
        );
        self.reconcile.notify_one();
    }

    async fn announce(&self, outcome: &ApplyOutcome, message: &UpdateMessage) {
        let (cell, previous_owner) = match outcome {
            ApplyOutcome::Claimed { cell } | ApplyOutcome::Repainted { cell } => (*cell, None),
            ApplyOutcome::Transferred { cell, from } => (*cell, Some(from.clone())),
            ApplyOutcome::Duplicate { .. } => return,
        };
        let payload = PixelBroadcast {
            coordinate_pair: self.quantizer.dequantize(cell),
            cell,
            color: message.color.clone(),
            user_id: message.user_id.clone(),
            previous_owner,
            timestamp: message.enqueued_at,
        };
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize pixel broadcast");
                return;
            }
        };
        if let Err(e) = self.broadcaster.publish(&self.channel, bytes).await {
            tracing::warn!(cell_x = cell.x, cell_y = cell.y, error = %e, "Pixel broadcast failed");
        }
    }

    /// Run one reconciliation pass with message application held off, so
    /// no write is half applied while durable ownership is scanned.
    ///
    /// Only this worker's partitions are held off.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, StoreError> {
        let quiet = self.gate.write().await;
        let report = self.ranking.reconcile(&self.cells).await;
        drop(quiet);
        report
    }

    /// Repair the ledger on a fixed interval and whenever a divergence is
    /// signalled, until `shutdown` flips to `true`.
    pub async fn reconcile_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                () = self.reconcile.notified() => {}
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.reconcile_now().await {
                tracing::warn!(error = %e, "Ranking reconciliation failed");
            }
        }
    }
}

/// Whether `message` is the update already recorded in `record`.
fn is_replay(record: &CellRecord, message: &UpdateMessage) -> bool {
    match message.id {
        Some(id) => record.last_message_id == Some(id),
        None => {
            record.last_enqueued_at == message.enqueued_at
                && record.owner == message.user_id
                && record.color == message.color
        }
    }
}

async fn acknowledge<D: Delivery>(delivery: D) {
    if let Err(e) = delivery.ack().await {
        tracing::warn!(error = %e, "Failed to acknowledge delivery");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{Duration as ChronoDuration, Utc};
    use pixelwar_types::{CoordinatePair, MessageId};

    use super::*;
    use crate::broadcast::LocalBroadcaster;
    use crate::config::{QueueConfig, RankingConfig};
    use crate::memory::{MemoryCellStore, MemoryKv, MemoryQueue};
    use crate::queue::UpdateQueue as _;

    type TestWorker = PersistenceWorker<MemoryCellStore, MemoryKv, LocalBroadcaster>;

    fn worker() -> (TestWorker, LocalBroadcaster) {
        let config = PixelWarConfig::default();
        let bus = LocalBroadcaster::new(64);
        let worker = PersistenceWorker::new(
            MemoryCellStore::new(),
            RankingLedger::new(MemoryKv::new(), &RankingConfig::default()),
            bus.clone(),
            &config,
        );
        (worker, bus)
    }

    fn message(user: &str, color: &str) -> UpdateMessage {
        UpdateMessage {
            id: Some(MessageId::new()),
            coordinate_pair: CoordinatePair(37.5, 127.5),
            color: color.to_owned(),
            user_id: UserId::from(user),
            enqueued_at: Utc::now(),
        }
    }

    async fn score(worker: &TestWorker, user: &str) -> i64 {
        worker.ranking().score(&UserId::from(user)).await.unwrap()
    }

    #[tokio::test]
    async fn claim_repaint_transfer_scoring() {
        let (worker, _bus) = worker();

        let claim = worker.apply(&message("a", "#FF0000")).await.unwrap();
        assert!(matches!(claim, ApplyOutcome::Claimed { .. }));
        assert_eq!(score(&worker, "a").await, 1);

        let repaint = worker.apply(&message("a", "#00FF00")).await.unwrap();
        assert!(matches!(repaint, ApplyOutcome::Repainted { .. }));
        assert_eq!(score(&worker, "a").await, 1);

        let transfer = worker.apply(&message("b", "#0000FF")).await.unwrap();
        assert!(
            matches!(transfer, ApplyOutcome::Transferred { ref from, .. } if from.as_str() == "a")
        );
        assert_eq!(score(&worker, "a").await, 0);
        assert_eq!(score(&worker, "b").await, 1);
    }

    #[tokio::test]
    async fn replayed_message_is_not_counted_twice() {
        let (worker, _bus) = worker();
        worker.apply(&message("a", "#FF0000")).await.unwrap();
        let steal = message("b", "#0000FF");

        worker.apply(&steal).await.unwrap();
        let replay = worker.apply(&steal).await.unwrap();

        assert!(matches!(replay, ApplyOutcome::Duplicate { .. }));
        assert_eq!(score(&worker, "a").await, 0);
        assert_eq!(score(&worker, "b").await, 1);
    }

    #[tokio::test]
    async fn replay_without_message_id_is_recognised() {
        let (worker, _bus) = worker();
        let mut legacy = message("a", "#FF0000");
        legacy.id = None;
        worker.apply(&legacy).await.unwrap();
        let replay = worker.apply(&legacy).await.unwrap();
        assert!(matches!(replay, ApplyOutcome::Duplicate { .. }));
        assert_eq!(score(&worker, "a").await, 1);
    }

    #[tokio::test]
    async fn later_write_from_a_lagging_clock_still_applies() {
        let (worker, _bus) = worker();
        worker.apply(&message("b", "#0000FF")).await.unwrap();
        // Enqueued after b's write by an API instance whose clock runs behind.
        let mut behind = message("a", "#FF0000");
        behind.enqueued_at = Utc::now()
            .checked_sub_signed(ChronoDuration::seconds(10))
            .unwrap();

        let outcome = worker.apply(&behind).await.unwrap();

        assert!(
            matches!(outcome, ApplyOutcome::Transferred { ref from, .. } if from.as_str() == "b")
        );
        let cell = GridQuantizer::new(&PixelWarConfig::default().grid)
            .quantize_pair(behind.coordinate_pair);
        let record = worker.cells().find(cell).await.unwrap().unwrap();
        assert_eq!(record.owner, UserId::from("a"));
        assert_eq!(record.color, "#FF0000");
        assert_eq!(score(&worker, "a").await, 1);
        assert_eq!(score(&worker, "b").await, 0);
    }

    #[tokio::test]
    async fn transfer_is_broadcast_with_snapped_coordinate() {
        let (worker, bus) = worker();
        let mut rx = bus.subscribe();
        worker.apply(&message("a", "#FF0000")).await.unwrap();
        worker.apply(&message("b", "#0000FF")).await.unwrap();

        let _claim = rx.recv().await.unwrap();
        let transfer = rx.recv().await.unwrap();
        assert_eq!(transfer.channel, "pixels");
        let payload: PixelBroadcast = serde_json::from_slice(&transfer.payload).unwrap();
        assert_eq!(payload.user_id, UserId::from("b"));
        assert_eq!(payload.previous_owner, Some(UserId::from("a")));
        let quantizer = GridQuantizer::new(&PixelWarConfig::default().grid);
        assert_eq!(payload.coordinate_pair, quantizer.dequantize(payload.cell));
    }

    #[tokio::test]
    async fn unparseable_and_invalid_payloads_are_dropped() {
        let (worker, _bus) = worker();
        assert!(matches!(
            worker.handle_payload(b"{not json").await,
            Err(WorkerError::Parse(_))
        ));
        let missing_user = br##"{"coordinatePair":[1.0,2.0],"color":"#FFF","timestamp":"2026-01-01T00:00:00Z"}"##;
        assert!(matches!(
            worker.handle_payload(missing_user).await,
            Err(WorkerError::Parse(_))
        ));
        let empty_color = br#"{"coordinatePair":[1.0,2.0],"color":"","userId":"u","timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(matches!(
            worker.handle_payload(empty_color).await,
            Err(WorkerError::Invalid(_))
        ));
    }

    #[derive(Clone, Default)]
    struct FlakyRanking {
        inner: MemoryKv,
        failing: Arc<AtomicBool>,
    }

    impl RankingStore for FlakyRanking {
        fn add_score(
            &self,
            key: &str,
            member: &str,
            delta: i64,
        ) -> impl Future<Output = Result<i64, StoreError>> + Send {
            let failing = self.failing.load(Ordering::SeqCst);
            let inner = self.inner.clone();
            let (key, member) = (key.to_owned(), member.to_owned());
            async move {
                if failing {
                    return Err(StoreError::Unavailable(String::from("ranking down")));
                }
                inner.add_score(&key, &member, delta).await
            }
        }

        fn score(
            &self,
            key: &str,
            member: &str,
        ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send {
            self.inner.score(key, member)
        }

        fn top_scores(
            &self,
            key: &str,
            limit: usize,
        ) -> impl Future<Output = Result<Vec<(String, i64)>, StoreError>> + Send {
            self.inner.top_scores(key, limit)
        }

        fn members_with_score(
            &self,
            key: &str,
            score: i64,
        ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send {
            self.inner.members_with_score(key, score)
        }

        fn all_scores(
            &self,
            key: &str,
        ) -> impl Future<Output = Result<Vec<(String, i64)>, StoreError>> + Send {
            self.inner.all_scores(key)
        }
    }

    #[tokio::test]
    async fn ledger_failure_after_durable_write_is_flagged_and_repaired() {
        let ranking = FlakyRanking::default();
        let worker = PersistenceWorker::new(
            MemoryCellStore::new(),
            RankingLedger::new(ranking.clone(), &RankingConfig::default()),
            LocalBroadcaster::new(8),
            &PixelWarConfig::default(),
        );
        let signal = worker.reconcile_signal();

        ranking.failing.store(true, Ordering::SeqCst);
        let outcome = worker.apply(&message("a", "#FF0000")).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Claimed { .. }));
        // The permit stored by notify_one completes immediately.
        signal.notified().await;

        ranking.failing.store(false, Ordering::SeqCst);
        assert_eq!(worker.ranking().score(&UserId::from("a")).await.unwrap(), 0);
        let report = worker.reconcile_now().await.unwrap();
        assert_eq!(report.adjusted, 1);
        assert_eq!(worker.ranking().score(&UserId::from("a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_loop_survives_poison_messages() {
        let (worker, _bus) = worker();
        let queue = MemoryQueue::new(1);
        let source = queue.source(0).await.unwrap();

        queue.inject(0, b"garbage".to_vec()).unwrap();
        let msg = message("a", "#FF0000");
        let cell = GridQuantizer::new(&PixelWarConfig::default().grid).quantize_pair(msg.coordinate_pair);
        queue.enqueue(cell, &msg).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = Arc::new(worker);
        let handle = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run(source, 0, rx).await })
        };

        for _ in 0..100 {
            if queue.acked() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(queue.acked(), 2);
        assert_eq!(score(&worker, "a").await, 1);
    }

    /// Durable store whose reads can be switched off and whose next claim
    /// can be held open until released.
    #[derive(Clone, Default)]
    struct ControlledCells {
        inner: MemoryCellStore,
        down: Arc<AtomicBool>,
        hold_next_claim: Arc<AtomicBool>,
        claim_entered: Arc<Notify>,
        claim_release: Arc<Notify>,
    }

    impl CellStore for ControlledCells {
        async fn find(&self, cell: CellCoord) -> Result<Option<CellRecord>, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable(String::from("cells down")));
            }
            self.inner.find(cell).await
        }

        async fn insert_if_absent(&self, record: &CellRecord) -> Result<bool, StoreError> {
            let inserted = self.inner.insert_if_absent(record).await?;
            if self.hold_next_claim.swap(false, Ordering::SeqCst) {
                self.claim_entered.notify_one();
                self.claim_release.notified().await;
            }
            Ok(inserted)
        }

        async fn update_if_version(
            &self,
            cell: CellCoord,
            expected_version: i64,
            write: &CellWrite,
        ) -> Result<bool, StoreError> {
            self.inner.update_if_version(cell, expected_version, write).await
        }

        async fn find_in_bounds(
            &self,
            min: CellCoord,
            max: CellCoord,
            limit: u64,
        ) -> Result<Vec<Cell>, StoreError> {
            self.inner.find_in_bounds(min, max, limit).await
        }

        async fn all(&self) -> Result<Vec<Cell>, StoreError> {
            self.inner.all().await
        }

        async fn ownership_counts(&self) -> Result<Vec<(UserId, i64)>, StoreError> {
            self.inner.ownership_counts().await
        }
    }

    fn worker_over(
        cells: ControlledCells,
        config: &PixelWarConfig,
    ) -> PersistenceWorker<ControlledCells, MemoryKv, LocalBroadcaster> {
        PersistenceWorker::new(
            cells,
            RankingLedger::new(MemoryKv::new(), &RankingConfig::default()),
            LocalBroadcaster::new(8),
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_waits_for_an_in_flight_write() {
        let cells = ControlledCells::default();
        cells.hold_next_claim.store(true, Ordering::SeqCst);
        let worker = Arc::new(worker_over(cells.clone(), &PixelWarConfig::default()));
        let write = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.apply(&message("a", "#FF0000")).await })
        };

        // The durable record exists, the ledger point does not yet.
        cells.claim_entered.notified().await;
        assert_eq!(cells.inner.ownership_counts().await.unwrap().len(), 1);
        let blocked = tokio::time::timeout(Duration::from_millis(100), worker.reconcile_now()).await;
        assert!(blocked.is_err());

        cells.claim_release.notify_one();
        let outcome = write.await.unwrap().unwrap();
        assert!(matches!(outcome, ApplyOutcome::Claimed { .. }));

        let report = worker.reconcile_now().await.unwrap();
        assert_eq!(report.adjusted, 0);
        assert_eq!(worker.ranking().score(&UserId::from("a")).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_is_redelivered_with_growing_delay() {
        let cells = ControlledCells::default();
        let worker = worker_over(cells.clone(), &PixelWarConfig::default());
        let queue = MemoryQueue::new(1);
        let mut source = queue.source(0).await.unwrap();
        let msg = message("a", "#FF0000");
        queue.enqueue(CellCoord::new(0, 0), &msg).await.unwrap();
        cells.down.store(true, Ordering::SeqCst);

        let first = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(
            worker.process(first).await,
            Disposition::Redelivered {
                attempt: 1,
                delay: Duration::from_millis(250)
            }
        );

        let started = tokio::time::Instant::now();
        let second = source.next_delivery().await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(
            worker.process(second).await,
            Disposition::Redelivered {
                attempt: 2,
                delay: Duration::from_millis(500)
            }
        );

        cells.down.store(false, Ordering::SeqCst);
        let third = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(third.attempt(), 3);
        assert!(matches!(
            worker.process(third).await,
            Disposition::Acked(ApplyOutcome::Claimed { .. })
        ));

        assert_eq!(queue.retried(), 2);
        assert_eq!(queue.exhausted(), 0);
        assert_eq!(queue.acked(), 1);
        assert_eq!(worker.ranking().score(&UserId::from("a")).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_redelivery_is_reported_and_the_partition_moves_on() {
        let config = PixelWarConfig {
            queue: QueueConfig {
                max_deliver: 2,
                ..QueueConfig::default()
            },
            ..PixelWarConfig::default()
        };
        let cells = ControlledCells::default();
        let worker = worker_over(cells.clone(), &config);
        let queue = MemoryQueue::new(1).with_delivery_limit(config.queue.delivery_limit());
        let mut source = queue.source(0).await.unwrap();
        queue
            .enqueue(CellCoord::new(0, 0), &message("a", "#FF0000"))
            .await
            .unwrap();
        queue
            .enqueue(CellCoord::new(0, 0), &message("b", "#0000FF"))
            .await
            .unwrap();
        cells.down.store(true, Ordering::SeqCst);

        let first = source.next_delivery().await.unwrap().unwrap();
        assert!(matches!(
            worker.process(first).await,
            Disposition::Redelivered { attempt: 1, .. }
        ));
        let second = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(
            worker.process(second).await,
            Disposition::Exhausted { attempt: 2 }
        );
        assert_eq!(queue.exhausted(), 1);

        cells.down.store(false, Ordering::SeqCst);
        let next = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(next.attempt(), 1);
        assert!(matches!(
            worker.process(next).await,
            Disposition::Acked(ApplyOutcome::Claimed { .. })
        ));
        assert_eq!(worker.ranking().score(&UserId::from("b")).await.unwrap(), 1);
        assert_eq!(worker.ranking().score(&UserId::from("a")).await.unwrap(), 0);
    }
}
