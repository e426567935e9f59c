//! Port trait for read access to the indexed view.
//!
//! The read API (e.g., `tally-graphql`) depends on this trait rather than
//! on the indexer itself, so it never sees the source type.

use chrono::{DateTime, Utc};

use crate::models::{Address, Balance, IndexedSegment, TransferEvent};

use super::pagination::{Connection, OrderDirection, Pagination};

/// Summary of indexing progress.
#[derive(Debug, Clone, Default)]
pub struct IndexStatus {
    /// Number of backfill segments committed so far, pruned ones included.
    pub segments: usize,
    /// First block covered by backfill.
    pub backfill_from: Option<u64>,
    /// Last block covered by backfill.
    pub backfill_to: Option<u64>,
    /// Highest block seen in any folded transfer or segment.
    pub latest_block: Option<u64>,
    /// Number of addresses with a balance.
    pub balances: usize,
    /// Transfers folded so far.
    pub transfers_folded: u64,
    /// Transfers skipped as already folded.
    pub duplicates_skipped: u64,
    /// Lowest block whose transfers are still held. Older transfers are
    /// folded into balances but no longer listed.
    pub retained_from: u64,
    /// Whether a live subscription is running.
    pub live: bool,
    /// Time of the last fold.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Status, balances, and segments taken under one lock.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub status: IndexStatus,
    /// Balances sorted by address.
    pub balances: Vec<Balance>,
    pub segments: Vec<IndexedSegment>,
}

/// Read-only access to balances, segments, and folded transfers.
///
/// Every method returns data from one consistent snapshot; readers never
/// observe a half-folded batch.
pub trait IndexReader: Send + Sync {
    /// Indexing progress summary.
    fn status(&self) -> IndexStatus;

    /// Consistent copy of the whole view.
    fn snapshot(&self) -> IndexSnapshot;

    /// Balance of a single address.
    fn balance(&self, address: &Address) -> Option<Balance>;

    /// Balances sorted by weight (ties broken by address).
    fn list_balances(&self, pagination: Pagination, order: OrderDirection) -> Connection<Balance>;

    /// Retained segments, in commit order.
    fn segments(&self) -> Vec<IndexedSegment>;

    /// Retained transfers strictly more than `confirmations` blocks below
    /// `head`, each listed once, ordered by `(block_number, log_index)`.
    fn confirmed_transfers(&self, head: u64, confirmations: u64) -> Vec<TransferEvent>;
}
