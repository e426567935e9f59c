//! Port trait for the transfer event source.
//!
//! This trait defines the interface for querying historical transfers and
//! subscribing to new ones. Implementations live in the infrastructure
//! layer (e.g., `tally-evm`).

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::SourceResult;
use crate::models::TransferEvent;

/// Stream of live transfers, in arrival order.
pub type TransferStream = Pin<Box<dyn Stream<Item = SourceResult<TransferEvent>> + Send>>;

/// Port trait for a single-chain, single-token transfer source.
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Current head block number of the chain.
    async fn head_block(&self) -> SourceResult<u64>;

    /// Fetch all transfers in `from..=to`.
    ///
    /// Implementations should return transfers ordered by
    /// `(block_number, log_index)`; the indexer re-sorts regardless.
    async fn query_range(&self, from: u64, to: u64) -> SourceResult<Vec<TransferEvent>>;

    /// Subscribe to transfers in `from_block` and every later block.
    ///
    /// Transfers in blocks already produced are delivered first, so a caller
    /// that resubscribes from its last seen block loses nothing. Dropping the
    /// stream ends the subscription.
    async fn subscribe(&self, from_block: u64) -> SourceResult<TransferStream>;
}
