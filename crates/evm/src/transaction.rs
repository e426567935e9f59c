//! Submitted transactions tracked through receipts.

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use tally_core::error::{TransactionError, TransactionResult};
use tally_core::models::{TransactionReceipt, TxHash};
use tally_core::ports::SubmittedTransaction;

use crate::client::EvmClient;
use crate::decode::{decode_receipt, is_reverted};

/// A broadcast transaction awaiting its receipt.
///
/// `wait` polls `eth_getTransactionReceipt` until the receipt is
/// `receipt_confirmations` blocks deep. Transport errors while polling are
/// logged and retried; bound the wait with the tracker's mining timeout.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    client: EvmClient,
    hash: TxHash,
}

impl PendingTransaction {
    pub(crate) fn new(client: EvmClient, hash: TxHash) -> Self {
        Self { client, hash }
    }

    async fn poll_receipt(&self) -> TransactionResult<Option<TransactionReceipt>> {
        let receipt = match self.client.transaction_receipt(&self.hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(hash = %self.hash, error = %e, "⚠️  Receipt poll failed, retrying...");
                return Ok(None);
            }
        };

        if is_reverted(&receipt) {
            return Err(TransactionError::MiningFailed(format!(
                "transaction {} reverted",
                self.hash
            )));
        }

        let head = match self.client.block_number().await {
            Ok(head) => head,
            Err(e) => {
                warn!(hash = %self.hash, error = %e, "⚠️  Head poll failed, retrying...");
                return Ok(None);
            }
        };

        let receipt = decode_receipt(&receipt, head)
            .map_err(|e| TransactionError::MiningFailed(e.to_string()))?;
        let required = self.client.config().receipt_confirmations;
        if receipt.confirmations < required {
            trace!(
                hash = %self.hash,
                confirmations = receipt.confirmations,
                required,
                "Waiting for confirmations"
            );
            return Ok(None);
        }

        Ok(Some(receipt))
    }
}

#[async_trait]
impl SubmittedTransaction for PendingTransaction {
    fn hash(&self) -> TxHash {
        self.hash
    }

    async fn wait(&self) -> TransactionResult<TransactionReceipt> {
        loop {
            if let Some(receipt) = self.poll_receipt().await? {
                debug!(hash = %self.hash, block = receipt.block.number, "Receipt confirmed");
                return Ok(receipt);
            }
            sleep(self.client.config().poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EvmClientConfig;
    use crate::mock::MockNode;
    use serde_json::{Value, json};

    fn hash() -> TxHash {
        TxHash([0xcd; 32])
    }

    fn receipt(block: u64, status: &str) -> Value {
        json!({
            "transactionHash": hash().to_hex(),
            "blockNumber": format!("{block:#x}"),
            "blockHash": format!("0x{}", "ab".repeat(32)),
            "status": status,
            "gasUsed": "0x5208"
        })
    }

    async fn client(node: &MockNode, receipt_confirmations: u64) -> EvmClient {
        EvmClient::connect(EvmClientConfig {
            receipt_confirmations,
            ..node.config()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn missing_receipt_keeps_waiting() {
        let node = MockNode::start(100).await;
        let tx = client(&node, 1).await.pending_transaction(hash());

        assert_eq!(tx.poll_receipt().await, Ok(None));
    }

    #[tokio::test]
    async fn receipt_is_accepted_once_deep_enough() {
        let node = MockNode::start(101).await;
        node.set_receipt(&hash().to_hex(), receipt(100, "0x1"));
        let tx = client(&node, 3).await.pending_transaction(hash());

        assert_eq!(tx.poll_receipt().await, Ok(None));

        node.set_head(102);
        let accepted = tx.poll_receipt().await.unwrap().unwrap();
        assert_eq!(accepted.block.number, 100);
        assert_eq!(accepted.confirmations, 3);
        assert_eq!(accepted.gas_used, Some(21_000));
    }

    #[tokio::test]
    async fn reverted_receipt_fails_mining() {
        let node = MockNode::start(100).await;
        node.set_receipt(&hash().to_hex(), receipt(100, "0x0"));
        let tx = client(&node, 1).await.pending_transaction(hash());

        let err = tx.wait().await.unwrap_err();
        assert!(matches!(err, TransactionError::MiningFailed(message) if message.contains("reverted")));
    }

    #[tokio::test]
    async fn head_poll_errors_are_retried() {
        let node = MockNode::start(100).await;
        node.set_receipt(&hash().to_hex(), receipt(100, "0x1"));
        node.fail_head_polls(2);
        let tx = client(&node, 1).await.pending_transaction(hash());

        assert_eq!(tx.poll_receipt().await, Ok(None));

        let mined = tokio::time::timeout(std::time::Duration::from_secs(5), tx.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mined.transaction_hash, hash());
    }

    #[tokio::test]
    async fn broadcast_returns_tracked_transaction() {
        let node = MockNode::start(1).await;
        let client = client(&node, 1).await;

        let tx = client.send_raw_transaction(&[0x02, 0xf8]).await.unwrap();

        assert_eq!(tx.hash(), hash());
        assert_eq!(node.raw_transactions(), vec!["0x02f8".to_string()]);
    }
}
