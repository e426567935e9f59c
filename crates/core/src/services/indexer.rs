//! Transfer indexer - historical backfill plus live merge.
//!
//! The indexer folds transfers from a [`TransferSource`] into a
//! [`BalanceSheet`]. History is fetched in fixed-size block batches;
//! new transfers arrive through a live subscription that may run
//! concurrently with backfill.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use crate::error::{IndexerError, IndexerResult};
use crate::metrics::{
    BatchTimer, record_duplicates_skipped, record_query_error, record_segment_indexed,
    record_subscription_error, record_transfers_folded,
};
use crate::models::{Address, Balance, IndexedSegment, LogKey, TransferEvent};
use crate::ports::{
    Connection, IndexReader, IndexSnapshot, IndexStatus, OrderDirection, Pagination, TransferSource,
    TransferStream,
};
use crate::services::balances::{BalanceSheet, FoldRules, ReceiverAccounting};

/// Default number of blocks per backfill query.
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Default depth below the latest block for which transfers are kept.
pub const DEFAULT_RETENTION_BLOCKS: u64 = 10_000;

const INITIAL_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the transfer indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Blocks per backfill query.
    pub batch_size: u64,
    /// Sentinel address marking mints and burns.
    pub zero_address: Address,
    /// How receivers are booked.
    pub receiver_accounting: ReceiverAccounting,
    /// Skip transfers whose `(block_number, log_index)` was already folded.
    pub deduplicate: bool,
    /// Retries per batch before backfill halts.
    pub max_retries: u32,
    /// Delay before the first retry (doubles per retry).
    pub retry_delay: Duration,
    /// Upper bound for the retry delay.
    pub max_retry_delay: Duration,
    /// Blocks below the latest one for which transfers, segments, and
    /// deduplication keys are kept. `None` keeps everything.
    ///
    /// Balances are never pruned. Deduplication only covers this window.
    pub retention_blocks: Option<u64>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            zero_address: Address::ZERO,
            receiver_accounting: ReceiverAccounting::Credit,
            deduplicate: true,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            retention_blocks: Some(DEFAULT_RETENTION_BLOCKS),
        }
    }
}

impl IndexerConfig {
    fn fold_rules(&self) -> FoldRules {
        FoldRules {
            zero_address: self.zero_address,
            receiver: self.receiver_accounting,
        }
    }
}

// =============================================================================
// Backfill window
// =============================================================================

/// An inclusive block range to backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillWindow {
    pub start: u64,
    pub end: u64,
}

impl BackfillWindow {
    /// Blocks `head - lookback ..= head` (`lookback + 1` blocks), clamped at genesis.
    pub fn recent(head: u64, lookback: u64) -> Self {
        Self {
            start: head.saturating_sub(lookback),
            end: head,
        }
    }

    /// Split the window into `[from, to]` batches of at most `batch_size` blocks.
    ///
    /// Batches are contiguous, non-overlapping, and ascending.
    pub fn batches(&self, batch_size: u64) -> impl Iterator<Item = (u64, u64)> + use<> {
        let end = self.end;
        let step = batch_size.max(1);
        let mut cursor = (self.start <= self.end).then_some(self.start);

        std::iter::from_fn(move || {
            let from = cursor?;
            let to = from.saturating_add(step - 1).min(end);
            cursor = if to == end { None } else { Some(to + 1) };
            Some((from, to))
        })
    }
}

/// Summary of a completed backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Segments committed by this run.
    pub segments: usize,
    /// Transfers folded by this run.
    pub transfers: u64,
    /// Transfers skipped as already folded.
    pub duplicates: u64,
}

// =============================================================================
// Index state
// =============================================================================

/// Everything the indexer derives. Mutated only under the write lock.
///
/// Backfilled transfers live in their segment; live transfers in
/// `live_transfers`. Both, and `processed`, hold only blocks at or above
/// `retained_from`.
#[derive(Debug, Default)]
struct IndexState {
    sheet: BalanceSheet,
    segments: Vec<IndexedSegment>,
    live_transfers: Vec<TransferEvent>,
    processed: HashSet<LogKey>,
    segments_committed: usize,
    backfill_from: Option<u64>,
    backfill_to: Option<u64>,
    retained_from: u64,
    transfers_folded: u64,
    duplicates_skipped: u64,
    latest_block: Option<u64>,
    updated_at: Option<chrono::DateTime<Utc>>,
}

impl IndexState {
    /// Fold one transfer. Returns `false` if it was skipped as a duplicate.
    fn fold(&mut self, event: &TransferEvent, rules: &FoldRules, deduplicate: bool) -> bool {
        if deduplicate && !self.processed.insert(event.key()) {
            self.duplicates_skipped += 1;
            return false;
        }

        self.sheet.apply(event, rules);
        self.transfers_folded += 1;
        self.see_block(event.block_number);
        true
    }

    fn see_block(&mut self, number: u64) {
        self.latest_block = Some(self.latest_block.map_or(number, |b| b.max(number)));
        self.updated_at = Some(Utc::now());
    }

    /// Drop history that fell out of the retention window.
    fn prune(&mut self, retention: Option<u64>) {
        let (Some(retention), Some(latest)) = (retention, self.latest_block) else {
            return;
        };
        let floor = latest.saturating_sub(retention);
        if floor <= self.retained_from {
            return;
        }

        self.retained_from = floor;
        self.segments.retain(|s| s.to >= floor);
        self.live_transfers.retain(|t| t.block_number >= floor);
        self.processed.retain(|k| k.block_number >= floor);
        trace!(floor, segments = self.segments.len(), "History pruned");
    }
}

// =============================================================================
// TransferIndexer
// =============================================================================

/// Indexer folding historical and live transfers into a balance view.
///
/// # Consistency
///
/// A batch is folded and its segment recorded under one write lock, so
/// readers see either none or all of it. Live transfers are folded one at a
/// time through the same fold step.
///
/// # Ordering
///
/// Each backfill batch is sorted by `(block_number, log_index)` before
/// folding. Live transfers are folded in arrival order. With
/// `deduplicate` enabled a live transfer already covered by backfill (or
/// vice versa) is folded only once.
pub struct TransferIndexer<S: TransferSource> {
    config: IndexerConfig,
    source: Arc<S>,
    state: Arc<RwLock<IndexState>>,
    live_subscriptions: Arc<AtomicUsize>,
}

impl<S: TransferSource + 'static> TransferIndexer<S> {
    pub fn new(config: IndexerConfig, source: Arc<S>) -> Self {
        if config.receiver_accounting == ReceiverAccounting::Debit {
            warn!("⚠️  Receiver debit accounting enabled, balances will not match the chain");
        }
        if !config.deduplicate {
            warn!("⚠️  Deduplication disabled, overlapping live and backfill transfers count twice");
        }

        Self {
            config,
            source,
            state: Arc::new(RwLock::new(IndexState::default())),
            live_subscriptions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Backfill `start..=end` without external cancellation.
    pub async fn backfill(&self, start: u64, end: u64) -> IndexerResult<BackfillReport> {
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.backfill_with_shutdown(start, end, &mut shutdown_rx)
            .await
    }

    /// Backfill `start..=end` in batches, checking `shutdown_rx` between batches.
    ///
    /// Returns [`IndexerError::ShutdownRequested`] when cancelled and
    /// [`IndexerError::QueryFailed`] when a batch exhausts its retries. In
    /// both cases every segment committed so far stays valid and no partial
    /// segment is recorded.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn backfill_with_shutdown(
        &self,
        start: u64,
        end: u64,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> IndexerResult<BackfillReport> {
        if self.config.batch_size == 0 {
            return Err(IndexerError::ConfigError(
                "batch_size must be greater than zero".into(),
            ));
        }
        if start > end {
            return Err(IndexerError::InvalidRange {
                from: start,
                to: end,
            });
        }

        let window = BackfillWindow { start, end };
        info!(
            blocks = (end - start).saturating_add(1),
            batch_size = self.config.batch_size,
            "📚 Starting backfill"
        );

        let mut report = BackfillReport::default();

        for (from, to) in window.batches(self.config.batch_size) {
            if *shutdown_rx.borrow() {
                debug!(from, "Shutdown requested, stopping backfill");
                return Err(IndexerError::ShutdownRequested);
            }

            let _timer = BatchTimer::new();
            let mut events = self.query_with_retry(from, to, shutdown_rx).await?;
            events.sort_by_key(TransferEvent::key);

            let (folded, duplicates) = self.commit_segment(from, to, events);
            report.segments += 1;
            report.transfers += folded;
            report.duplicates += duplicates;

            debug!(from, to, folded, duplicates, "Segment indexed");
        }

        info!(
            segments = report.segments,
            transfers = report.transfers,
            "📚 Backfill complete"
        );
        Ok(report)
    }

    /// Query one batch, retrying with exponential backoff.
    async fn query_with_retry(
        &self,
        from: u64,
        to: u64,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> IndexerResult<Vec<TransferEvent>> {
        let mut delay = self.config.retry_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;

            let error = match self.source.query_range(from, to).await {
                Ok(events) => return Ok(events),
                Err(e) => e,
            };

            if attempts > self.config.max_retries {
                record_query_error(true);
                error!(from, to, attempts, error = %error, "❌ Batch query failed, halting backfill");
                return Err(IndexerError::QueryFailed {
                    from,
                    to,
                    attempts,
                    source: error,
                });
            }

            record_query_error(false);
            warn!(
                from,
                to,
                attempt = attempts,
                retry_in_ms = delay.as_millis(),
                error = %error,
                "⚠️  Batch query failed, retrying..."
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    delay = (delay * 2).min(self.config.max_retry_delay);
                }
                _ = shutdown_requested(shutdown_rx) => {
                    return Err(IndexerError::ShutdownRequested);
                }
            }
        }
    }

    /// Fold a batch and record its segment atomically.
    fn commit_segment(&self, from: u64, to: u64, events: Vec<TransferEvent>) -> (u64, u64) {
        let rules = self.config.fold_rules();
        let mut state = self.state.write();

        let mut folded = 0;
        let mut duplicates = 0;
        for event in &events {
            if state.fold(event, &rules, self.config.deduplicate) {
                folded += 1;
            } else {
                duplicates += 1;
            }
        }

        state.see_block(to);
        state.segments.push(IndexedSegment {
            from,
            to,
            events,
            indexed_at: Utc::now(),
        });
        state.segments_committed += 1;
        state.backfill_from = Some(state.backfill_from.map_or(from, |b| b.min(from)));
        state.backfill_to = Some(state.backfill_to.map_or(to, |b| b.max(to)));
        state.prune(self.config.retention_blocks);
        drop(state);

        record_segment_indexed();
        record_transfers_folded("backfill", folded);
        if duplicates > 0 {
            record_duplicates_skipped("backfill", duplicates);
        }

        (folded, duplicates)
    }

    /// Start folding live transfers from `from_block` on.
    ///
    /// Pass the block after the backfill window so the two meet without a
    /// gap. The initial subscription error is returned to the caller. Later
    /// stream errors are logged and followed by a resubscribe with backoff
    /// from the block of the last live transfer; transfers the new stream
    /// replays up to that point are skipped. Balances already folded are
    /// never unwound. The subscription stops when the returned handle is
    /// unsubscribed or dropped, or when the source closes the stream.
    #[instrument(skip(self))]
    pub async fn live_start(&self, from_block: u64) -> IndexerResult<LiveHandle> {
        let stream = self.source.subscribe(from_block).await?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let live = LiveMerge {
            source: self.source.clone(),
            state: self.state.clone(),
            rules: self.config.fold_rules(),
            deduplicate: self.config.deduplicate,
            retention: self.config.retention_blocks,
            live_subscriptions: self.live_subscriptions.clone(),
            resume_from: from_block,
            last_key: None,
        };

        self.live_subscriptions.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(live.run(stream, stop_rx).instrument(info_span!("live")));

        info!(from_block, "📡 Live subscription started");
        Ok(LiveHandle {
            stop_tx,
            task: Some(task),
        })
    }
}

// =============================================================================
// Live merge
// =============================================================================

struct LiveMerge<S: TransferSource> {
    source: Arc<S>,
    state: Arc<RwLock<IndexState>>,
    rules: FoldRules,
    deduplicate: bool,
    retention: Option<u64>,
    live_subscriptions: Arc<AtomicUsize>,
    /// Block a resubscribe starts from.
    resume_from: u64,
    /// Highest key taken from any stream.
    last_key: Option<LogKey>,
}

impl<S: TransferSource> LiveMerge<S> {
    async fn run(mut self, stream: TransferStream, mut stop_rx: watch::Receiver<bool>) {
        let mut retry_delay = INITIAL_RESUBSCRIBE_DELAY;
        let mut current = Some(stream);
        // Keys at or below this were taken from an earlier stream.
        let mut replayed_until: Option<LogKey> = None;

        'subscription: loop {
            if let Some(mut stream) = current.take() {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut stop_rx) => break 'subscription,
                        item = stream.next() => match item {
                            Some(Ok(event)) => {
                                retry_delay = INITIAL_RESUBSCRIBE_DELAY;
                                let key = event.key();
                                if replayed_until.is_some_and(|until| key <= until) {
                                    trace!(%key, "Replayed transfer, skipping");
                                } else {
                                    replayed_until = None;
                                    self.take(&event);
                                }
                            }
                            Some(Err(e)) => {
                                record_subscription_error();
                                warn!(error = %e, "⚠️  Subscription error, resubscribing...");
                                break;
                            }
                            None => {
                                debug!("Source closed the subscription");
                                break 'subscription;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {
                    retry_delay = (retry_delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                }
                _ = shutdown_requested(&mut stop_rx) => break 'subscription,
            }

            match self.source.subscribe(self.resume_from).await {
                Ok(stream) => {
                    debug!(from_block = self.resume_from, "📡 Subscription re-established");
                    replayed_until = self.last_key;
                    current = Some(stream);
                }
                Err(e) => {
                    record_subscription_error();
                    warn!(
                        error = %e,
                        retry_in_ms = retry_delay.as_millis(),
                        "⚠️  Failed to resubscribe, retrying..."
                    );
                }
            }
        }

        self.live_subscriptions.fetch_sub(1, Ordering::SeqCst);
        info!("📡 Live subscription stopped");
    }

    fn take(&mut self, event: &TransferEvent) {
        let key = event.key();
        self.last_key = Some(self.last_key.map_or(key, |k| k.max(key)));
        self.resume_from = self.resume_from.max(event.block_number);

        let folded = {
            let mut state = self.state.write();
            let folded = state.fold(event, &self.rules, self.deduplicate);
            if folded {
                state.live_transfers.push(event.clone());
            }
            state.prune(self.retention);
            folded
        };

        if folded {
            trace!(key = %event.key(), "Live transfer folded");
            record_transfers_folded("live", 1);
        } else {
            trace!(key = %event.key(), "Live transfer already folded, skipping");
            record_duplicates_skipped("live", 1);
        }
    }
}

/// Registration token for a live subscription.
///
/// Unsubscribing is idempotent and safe after the subscription ended on its
/// own. Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct LiveHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LiveHandle {
    /// Stop folding live transfers.
    pub fn unsubscribe(&self) {
        let was_stopped = self.stop_tx.send_replace(true);
        if !was_stopped {
            debug!("Unsubscribing from live transfers");
        }
    }

    /// Whether the live task is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Unsubscribe and wait for the live task to finish.
    pub async fn stopped(mut self) {
        self.unsubscribe();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!(error = ?e, "❌ Live task failed");
        }
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// Resolve once `rx` reads `true`. Never resolves if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Read access
// =============================================================================

impl<S: TransferSource> TransferIndexer<S> {
    fn status_of(&self, state: &IndexState) -> IndexStatus {
        IndexStatus {
            segments: state.segments_committed,
            backfill_from: state.backfill_from,
            backfill_to: state.backfill_to,
            latest_block: state.latest_block,
            balances: state.sheet.len(),
            transfers_folded: state.transfers_folded,
            duplicates_skipped: state.duplicates_skipped,
            retained_from: state.retained_from,
            live: self.live_subscriptions.load(Ordering::SeqCst) > 0,
            updated_at: state.updated_at,
        }
    }
}

impl<S: TransferSource> IndexReader for TransferIndexer<S> {
    fn status(&self) -> IndexStatus {
        let state = self.state.read();
        self.status_of(&state)
    }

    fn snapshot(&self) -> IndexSnapshot {
        let state = self.state.read();
        let mut balances: Vec<Balance> = state.sheet.iter().cloned().collect();
        balances.sort_by_key(|b| b.address);

        IndexSnapshot {
            status: self.status_of(&state),
            balances,
            segments: state.segments.clone(),
        }
    }

    fn balance(&self, address: &Address) -> Option<Balance> {
        self.state.read().sheet.get(address).cloned()
    }

    fn list_balances(&self, pagination: Pagination, order: OrderDirection) -> Connection<Balance> {
        let mut balances: Vec<Balance> = self.state.read().sheet.iter().cloned().collect();
        balances.sort_by(|a, b| match order {
            OrderDirection::Asc => a.weight.cmp(&b.weight).then(a.address.cmp(&b.address)),
            OrderDirection::Desc => b.weight.cmp(&a.weight).then(a.address.cmp(&b.address)),
        });

        Connection::paginate(balances, &pagination, |b| b.address.to_hex())
    }

    fn segments(&self) -> Vec<IndexedSegment> {
        self.state.read().segments.clone()
    }

    fn confirmed_transfers(&self, head: u64, confirmations: u64) -> Vec<TransferEvent> {
        let state = self.state.read();
        let floor = state.retained_from;

        let mut transfers: Vec<TransferEvent> = state
            .segments
            .iter()
            .flat_map(|s| s.events.iter())
            .chain(state.live_transfers.iter())
            .filter(|t| {
                t.block_number >= floor
                    && t.block_number <= head
                    && head - t.block_number > confirmations
            })
            .cloned()
            .collect();
        drop(state);

        // A transfer seen by both backfill and live sits in both places.
        transfers.sort_by_key(TransferEvent::key);
        transfers.dedup_by_key(|t| t.key());
        transfers
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SourceError, SourceResult};
    use crate::models::BlockHash;
    use crate::ports::Cursor;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Mutex, OnceLock, Weak};

    type LiveSender = mpsc::UnboundedSender<SourceResult<TransferEvent>>;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn transfer(from: u8, to: u8, amount: u128, block_number: u64, log_index: u32) -> TransferEvent {
        TransferEvent {
            from: addr(from),
            to: addr(to),
            amount,
            block_number,
            block_hash: BlockHash([block_number as u8; 32]),
            log_index,
            transaction_hash: None,
        }
    }

    #[derive(Default)]
    struct FakeSource {
        events: Vec<TransferEvent>,
        /// Remaining failures per batch start.
        failures: Mutex<HashMap<u64, u32>>,
        queries: Mutex<Vec<(u64, u64)>>,
        streams: Mutex<VecDeque<mpsc::UnboundedReceiver<SourceResult<TransferEvent>>>>,
        subscriptions: Mutex<Vec<u64>>,
        reader: OnceLock<Weak<dyn IndexReader>>,
        segments_at_query: Mutex<Vec<usize>>,
    }

    impl FakeSource {
        fn with_events(events: Vec<TransferEvent>) -> Self {
            Self {
                events,
                ..Default::default()
            }
        }

        fn fail(self, from: u64, times: u32) -> Self {
            self.failures.lock().unwrap().insert(from, times);
            self
        }

        fn live_stream(&self) -> LiveSender {
            let (tx, rx) = mpsc::unbounded();
            self.streams.lock().unwrap().push_back(rx);
            tx
        }
    }

    #[async_trait]
    impl TransferSource for FakeSource {
        async fn head_block(&self) -> SourceResult<u64> {
            Ok(self.events.iter().map(|e| e.block_number).max().unwrap_or(0))
        }

        async fn query_range(&self, from: u64, to: u64) -> SourceResult<Vec<TransferEvent>> {
            self.queries.lock().unwrap().push((from, to));
            if let Some(reader) = self.reader.get().and_then(Weak::upgrade) {
                self.segments_at_query
                    .lock()
                    .unwrap()
                    .push(reader.segments().len());
            }

            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&from)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(SourceError::QueryFailed {
                    from,
                    to,
                    message: "node unavailable".into(),
                });
            }

            // Reverse order so the indexer has to sort.
            Ok(self
                .events
                .iter()
                .rev()
                .filter(|e| (from..=to).contains(&e.block_number))
                .cloned()
                .collect())
        }

        async fn subscribe(&self, from_block: u64) -> SourceResult<TransferStream> {
            self.subscriptions.lock().unwrap().push(from_block);
            match self.streams.lock().unwrap().pop_front() {
                Some(rx) => Ok(Box::pin(rx)),
                None => Err(SourceError::SubscriptionError("no stream available".into())),
            }
        }
    }

    fn test_config() -> IndexerConfig {
        IndexerConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(4),
            ..Default::default()
        }
    }

    fn indexer(source: FakeSource) -> (TransferIndexer<FakeSource>, Arc<FakeSource>) {
        let source = Arc::new(source);
        (TransferIndexer::new(test_config(), source.clone()), source)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn window_splits_into_contiguous_batches() {
        let batches: Vec<_> = BackfillWindow { start: 0, end: 250 }.batches(100).collect();
        assert_eq!(batches, vec![(0, 99), (100, 199), (200, 250)]);

        let single: Vec<_> = BackfillWindow { start: 7, end: 7 }.batches(100).collect();
        assert_eq!(single, vec![(7, 7)]);
    }

    #[test]
    fn window_batches_do_not_overflow_at_chain_end() {
        let window = BackfillWindow {
            start: u64::MAX - 5,
            end: u64::MAX,
        };
        let batches: Vec<_> = window.batches(4).collect();
        assert_eq!(
            batches,
            vec![(u64::MAX - 5, u64::MAX - 2), (u64::MAX - 1, u64::MAX)]
        );
    }

    #[test]
    fn recent_window_saturates_at_genesis() {
        assert_eq!(BackfillWindow::recent(100, 500), BackfillWindow { start: 0, end: 100 });
        assert_eq!(
            BackfillWindow::recent(3000, 500),
            BackfillWindow {
                start: 2500,
                end: 3000
            }
        );
    }

    #[tokio::test]
    async fn backfill_folds_every_batch() {
        let (indexer, source) = indexer(FakeSource::with_events(vec![
            transfer(0, 1, 100, 5, 0),
            transfer(1, 2, 30, 150, 0),
            transfer(2, 0, 10, 240, 3),
        ]));

        let report = indexer.backfill(0, 250).await.unwrap();

        assert_eq!(report.segments, 3);
        assert_eq!(report.transfers, 3);
        assert_eq!(
            *source.queries.lock().unwrap(),
            vec![(0, 99), (100, 199), (200, 250)]
        );
        assert_eq!(indexer.balance(&addr(1)).unwrap().weight, 70);
        assert_eq!(indexer.balance(&addr(2)).unwrap().weight, 20);
        assert!(indexer.balance(&Address::ZERO).is_none());

        let status = indexer.status();
        assert_eq!(status.backfill_from, Some(0));
        assert_eq!(status.backfill_to, Some(250));
        assert_eq!(status.latest_block, Some(250));
    }

    #[tokio::test]
    async fn snapshot_matches_individual_reads() {
        let (indexer, _) = indexer(FakeSource::with_events(vec![
            transfer(0, 2, 10, 5, 0),
            transfer(2, 1, 4, 120, 0),
        ]));
        indexer.backfill(0, 199).await.unwrap();

        let snapshot = indexer.snapshot();

        assert_eq!(snapshot.status.segments, 2);
        assert_eq!(snapshot.segments.len(), 2);
        let addresses: Vec<_> = snapshot.balances.iter().map(|b| b.address).collect();
        assert_eq!(addresses, vec![addr(1), addr(2)]);
        assert_eq!(snapshot.balances[1].weight, 6);
    }

    #[tokio::test]
    async fn segment_events_are_sorted_by_log_key() {
        let (indexer, _) = indexer(FakeSource::with_events(vec![
            transfer(0, 1, 1, 3, 0),
            transfer(0, 1, 1, 3, 2),
            transfer(0, 1, 1, 9, 1),
        ]));

        indexer.backfill(0, 99).await.unwrap();

        let keys: Vec<_> = indexer.segments()[0].events.iter().map(TransferEvent::key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    // Test critique: chaque segment est visible avant la requête suivante
    #[tokio::test]
    async fn each_segment_is_committed_before_the_next_query() {
        let source = Arc::new(FakeSource::with_events(vec![transfer(0, 1, 5, 10, 0)]));
        let indexer = Arc::new(TransferIndexer::new(test_config(), source.clone()));
        let reader: Arc<dyn IndexReader> = indexer.clone();
        source.reader.set(Arc::downgrade(&reader)).ok();

        indexer.backfill(0, 399).await.unwrap();

        assert_eq!(*source.segments_at_query.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failing_batch_halts_and_keeps_earlier_segments() {
        let (indexer, _) = indexer(
            FakeSource::with_events(vec![transfer(0, 1, 100, 5, 0), transfer(1, 2, 50, 120, 0)])
                .fail(100, u32::MAX),
        );

        let err = indexer.backfill(0, 250).await.unwrap_err();

        match err {
            IndexerError::QueryFailed {
                from,
                to,
                attempts,
                ..
            } => {
                assert_eq!((from, to), (100, 199));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(indexer.segments().len(), 1);
        assert_eq!(indexer.balance(&addr(1)).unwrap().weight, 100);
        assert!(indexer.balance(&addr(2)).is_none());
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let (indexer, source) = indexer(
            FakeSource::with_events(vec![transfer(0, 1, 100, 150, 0)]).fail(100, 1),
        );

        let report = indexer.backfill(0, 199).await.unwrap();

        assert_eq!(report.segments, 2);
        assert_eq!(source.queries.lock().unwrap().len(), 3);
        assert_eq!(indexer.balance(&addr(1)).unwrap().weight, 100);
    }

    #[tokio::test]
    async fn rejects_inverted_range_and_zero_batch() {
        let (indexer, _) = indexer(FakeSource::default());
        assert!(matches!(
            indexer.backfill(10, 5).await,
            Err(IndexerError::InvalidRange { from: 10, to: 5 })
        ));

        let zero = TransferIndexer::new(
            IndexerConfig {
                batch_size: 0,
                ..test_config()
            },
            Arc::new(FakeSource::default()),
        );
        assert!(matches!(
            zero.backfill(0, 5).await,
            Err(IndexerError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_between_batches() {
        let (indexer, source) = indexer(FakeSource::default());
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = indexer.backfill_with_shutdown(0, 500, &mut rx).await;

        assert!(matches!(result, Err(IndexerError::ShutdownRequested)));
        assert!(source.queries.lock().unwrap().is_empty());
        assert!(indexer.segments().is_empty());
    }

    #[tokio::test]
    async fn live_transfers_are_folded_once() {
        let overlap = transfer(0, 1, 100, 5, 0);
        let source = FakeSource::with_events(vec![overlap.clone()]);
        let live_tx = source.live_stream();
        let (indexer, _) = indexer(source);

        let handle = indexer.live_start(10).await.unwrap();
        indexer.backfill(0, 9).await.unwrap();

        live_tx.unbounded_send(Ok(overlap)).unwrap();
        live_tx.unbounded_send(Ok(transfer(1, 2, 40, 11, 0))).unwrap();

        wait_until(|| indexer.status().transfers_folded == 2 && indexer.status().duplicates_skipped == 1).await;
        assert_eq!(indexer.balance(&addr(1)).unwrap().weight, 60);
        assert_eq!(indexer.balance(&addr(2)).unwrap().weight, 40);
        assert_eq!(indexer.status().latest_block, Some(11));
        let listed: Vec<_> = indexer.confirmed_transfers(100, 0).iter().map(|t| t.block_number).collect();
        assert_eq!(listed, vec![5, 11]);

        handle.stopped().await;
    }

    #[tokio::test]
    async fn without_deduplication_overlap_counts_twice() {
        let overlap = transfer(0, 1, 100, 5, 0);
        let source = Arc::new(FakeSource::with_events(vec![overlap.clone()]));
        let live_tx = source.live_stream();
        let indexer = TransferIndexer::new(
            IndexerConfig {
                deduplicate: false,
                ..test_config()
            },
            source,
        );

        let handle = indexer.live_start(10).await.unwrap();
        indexer.backfill(0, 9).await.unwrap();
        live_tx.unbounded_send(Ok(overlap)).unwrap();

        wait_until(|| indexer.status().transfers_folded == 2).await;
        assert_eq!(indexer.balance(&addr(1)).unwrap().weight, 200);
        assert_eq!(indexer.status().duplicates_skipped, 0);

        handle.stopped().await;
    }

    #[tokio::test]
    async fn initial_subscribe_error_is_returned() {
        let (indexer, _) = indexer(FakeSource::default());

        let err = indexer.live_start(10).await.unwrap_err();

        assert!(matches!(
            err,
            IndexerError::Source(SourceError::SubscriptionError(_))
        ));
        assert!(!indexer.status().live);
    }

    #[tokio::test]
    async fn stream_error_triggers_resubscribe() {
        let source = FakeSource::default();
        let first = source.live_stream();
        let second = source.live_stream();
        let (indexer, _) = indexer(source);

        let handle = indexer.live_start(10).await.unwrap();
        first.unbounded_send(Ok(transfer(0, 1, 10, 1, 0))).unwrap();
        first
            .unbounded_send(Err(SourceError::SubscriptionError("socket closed".into())))
            .unwrap();
        second.unbounded_send(Ok(transfer(0, 1, 5, 2, 0))).unwrap();

        wait_until(|| indexer.status().transfers_folded == 2).await;
        assert_eq!(indexer.balance(&addr(1)).unwrap().weight, 15);
        assert!(handle.is_active());

        handle.stopped().await;
    }

    // Test critique: une reprise après erreur repart du dernier bloc reçu
    #[tokio::test]
    async fn resubscribe_resumes_from_last_live_block() {
        let source = Arc::new(FakeSource::default());
        let first = source.live_stream();
        let second = source.live_stream();
        let indexer = TransferIndexer::new(
            IndexerConfig {
                deduplicate: false,
                ..test_config()
            },
            source.clone(),
        );

        let handle = indexer.live_start(11).await.unwrap();
        first.unbounded_send(Ok(transfer(0, 1, 10, 11, 0))).unwrap();
        first.unbounded_send(Ok(transfer(0, 1, 20, 12, 0))).unwrap();
        first
            .unbounded_send(Err(SourceError::SubscriptionError("node returned 500".into())))
            .unwrap();
        // The new stream starts over at block 12.
        second.unbounded_send(Ok(transfer(0, 1, 20, 12, 0))).unwrap();
        second.unbounded_send(Ok(transfer(0, 1, 30, 12, 1))).unwrap();
        second.unbounded_send(Ok(transfer(0, 1, 40, 13, 0))).unwrap();

        wait_until(|| indexer.status().transfers_folded == 4).await;
        assert_eq!(*source.subscriptions.lock().unwrap(), vec![11, 12]);
        assert_eq!(indexer.balance(&addr(1)).unwrap().weight, 100);
        assert_eq!(indexer.status().duplicates_skipped, 0);

        handle.stopped().await;
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let source = FakeSource::default();
        let live_tx = source.live_stream();
        let (indexer, _) = indexer(source);

        let handle = indexer.live_start(10).await.unwrap();
        assert!(indexer.status().live);

        handle.unsubscribe();
        handle.unsubscribe();
        wait_until(|| !handle.is_active()).await;
        assert!(!indexer.status().live);

        // Transfers after unsubscribe are not folded.
        let _ = live_tx.unbounded_send(Ok(transfer(0, 1, 10, 1, 0)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(indexer.status().transfers_folded, 0);

        handle.stopped().await;
    }

    #[tokio::test]
    async fn closed_stream_ends_live_task() {
        let source = FakeSource::default();
        let live_tx = source.live_stream();
        let (indexer, _) = indexer(source);

        let handle = indexer.live_start(10).await.unwrap();
        drop(live_tx);

        wait_until(|| !handle.is_active()).await;
        assert!(!indexer.status().live);
    }

    #[tokio::test]
    async fn confirmed_transfers_are_strictly_deeper_than_threshold() {
        let (indexer, _) = indexer(FakeSource::with_events(vec![
            transfer(0, 1, 1, 10, 0),
            transfer(0, 1, 1, 30, 0),
            transfer(0, 1, 1, 40, 0),
        ]));
        indexer.backfill(0, 99).await.unwrap();

        let confirmed = indexer.confirmed_transfers(50, 20);

        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].block_number, 10);
    }

    #[tokio::test]
    async fn retention_window_bounds_stored_history() {
        let source = Arc::new(FakeSource::with_events(vec![
            transfer(0, 1, 10, 5, 0),
            transfer(0, 1, 10, 120, 0),
            transfer(0, 2, 10, 190, 0),
        ]));
        let indexer = TransferIndexer::new(
            IndexerConfig {
                retention_blocks: Some(50),
                ..test_config()
            },
            source,
        );

        indexer.backfill(0, 199).await.unwrap();

        let status = indexer.status();
        assert_eq!(status.segments, 2);
        assert_eq!(status.backfill_from, Some(0));
        assert_eq!(status.retained_from, 149);
        assert_eq!(status.transfers_folded, 3);
        let retained: Vec<_> = indexer.segments().iter().map(|s| (s.from, s.to)).collect();
        assert_eq!(retained, vec![(100, 199)]);
        assert_eq!(indexer.state.read().processed.len(), 1);

        // Balances keep everything.
        assert_eq!(indexer.balance(&addr(1)).unwrap().weight, 20);
        let listed: Vec<_> = indexer.confirmed_transfers(199, 0).iter().map(|t| t.block_number).collect();
        assert_eq!(listed, vec![190]);
    }

    #[tokio::test]
    async fn live_history_is_pruned_as_blocks_advance() {
        let source = Arc::new(FakeSource::default());
        let live_tx = source.live_stream();
        let indexer = TransferIndexer::new(
            IndexerConfig {
                retention_blocks: Some(10),
                ..test_config()
            },
            source,
        );

        let handle = indexer.live_start(1).await.unwrap();
        live_tx.unbounded_send(Ok(transfer(0, 1, 1, 5, 0))).unwrap();
        live_tx.unbounded_send(Ok(transfer(0, 1, 1, 30, 0))).unwrap();

        wait_until(|| indexer.status().transfers_folded == 2).await;
        {
            let state = indexer.state.read();
            assert_eq!(state.live_transfers.len(), 1);
            assert_eq!(state.processed.len(), 1);
        }
        assert_eq!(indexer.status().retained_from, 20);
        assert_eq!(indexer.confirmed_transfers(100, 0).len(), 1);

        handle.stopped().await;
    }

    #[tokio::test]
    async fn backfill_of_full_range_does_not_overflow() {
        let (indexer, source) = indexer(FakeSource::default());
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = indexer.backfill_with_shutdown(0, u64::MAX, &mut rx).await;

        assert!(matches!(result, Err(IndexerError::ShutdownRequested)));
        assert!(source.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn balances_are_listed_by_weight() {
        let (indexer, _) = indexer(FakeSource::with_events(vec![
            transfer(0, 1, 10, 1, 0),
            transfer(0, 2, 30, 1, 1),
            transfer(0, 3, 20, 1, 2),
        ]));
        indexer.backfill(0, 9).await.unwrap();

        let first_page = indexer.list_balances(
            Pagination {
                first: Some(2),
                after: None,
            },
            OrderDirection::Desc,
        );
        let weights: Vec<_> = first_page.edges.iter().map(|e| e.node.weight).collect();
        assert_eq!(weights, vec![30, 20]);
        assert!(first_page.page_info.has_next_page);

        let rest = indexer.list_balances(
            Pagination {
                first: Some(2),
                after: Some(Cursor {
                    value: addr(3).to_hex(),
                }),
            },
            OrderDirection::Desc,
        );
        assert_eq!(rest.edges.len(), 1);
        assert_eq!(rest.edges[0].node.address, addr(1));
    }
}
