pub mod balances;
pub mod indexer;
pub mod notices;
pub mod tracker;

pub use balances::{BalanceSheet, FoldRules, ReceiverAccounting};
pub use indexer::{
    BackfillReport, BackfillWindow, DEFAULT_BATCH_SIZE, IndexerConfig, LiveHandle,
    TransferIndexer,
};
pub use notices::{Notice, NoticeOverride, NoticeOverrides, TransactionNotices};
pub use tracker::{Observers, TrackerConfig, TransactionSnapshot, TransactionTracker};
