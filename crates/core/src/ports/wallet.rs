//! Port trait for transactions handed back by a wallet.

use std::fmt;

use async_trait::async_trait;

use crate::error::TransactionResult;
use crate::models::{TransactionReceipt, TxHash};

/// A transaction the wallet signed and submitted.
///
/// The tracker treats it as opaque apart from its confirmation primitive.
#[async_trait]
pub trait SubmittedTransaction: fmt::Debug + Send + Sync {
    /// Hash of the submitted transaction.
    fn hash(&self) -> TxHash;

    /// Resolve once the transaction is mined, or fail if it reverted
    /// or was dropped.
    async fn wait(&self) -> TransactionResult<TransactionReceipt>;
}
