//! EVM JSON-RPC client implementing the transfer source port.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, instrument, trace, warn};

use tally_core::error::{SourceError, SourceResult};
use tally_core::models::{Address, TokenMetadata, TransferEvent, TxHash};
use tally_core::ports::{TokenMetadataSource, TransferSource, TransferStream};

use crate::decode::{
    DECIMALS_SELECTOR, NAME_SELECTOR, RpcLog, RpcReceipt, SYMBOL_SELECTOR, TOTAL_SUPPLY_SELECTOR,
    TRANSFER_TOPIC, decode_abi_string, decode_transfer, parse_amount, parse_quantity, to_quantity,
};
use crate::transaction::PendingTransaction;

/// Maximum attempts for a request failing at the transport level.
const MAX_RETRIES: u8 = 3;

/// Configuration for the EVM client.
#[derive(Debug, Clone)]
pub struct EvmClientConfig {
    /// HTTP JSON-RPC endpoint (e.g., "http://localhost:8545").
    pub rpc_url: String,
    /// Token contract whose `Transfer` logs are indexed.
    pub token: Address,
    /// Delay between polls of the chain head.
    pub poll_interval: Duration,
    /// Depth a receipt must reach before a submitted transaction counts as mined.
    pub receipt_confirmations: u64,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Widest block range asked of `eth_getLogs` while a subscription catches up.
    pub max_block_range: u64,
}

impl Default for EvmClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            token: Address::ZERO,
            poll_interval: Duration::from_secs(4),
            receipt_confirmations: 1,
            request_timeout: Duration::from_secs(30),
            max_block_range: 1_000,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Response returned by the node.
#[derive(Debug, Deserialize)]
struct Response {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

/// EVM adapter implementing the [`TransferSource`] port over HTTP JSON-RPC.
///
/// Clones share the HTTP connection pool and request id counter.
#[derive(Clone)]
pub struct EvmClient {
    config: Arc<EvmClientConfig>,
    client: Client,
    id: Arc<AtomicUsize>,
}

impl fmt::Debug for EvmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmClient")
            .field("token", &self.config.token)
            .finish_non_exhaustive()
    }
}

impl EvmClient {
    /// Create a client and check that the node answers.
    #[instrument(skip_all, fields(token = %config.token))]
    pub async fn connect(config: EvmClientConfig) -> SourceResult<Self> {
        debug!("Connecting to node");

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SourceError::ConnectionFailed(format!("could not create client: {e}")))?;

        let this = Self {
            config: Arc::new(config),
            client,
            id: Arc::new(AtomicUsize::new(0)),
        };

        let chain_id: String = this.call("eth_chainId", json!([])).await?;
        debug!(chain_id = %chain_id, "Connected successfully");

        Ok(this)
    }

    pub fn config(&self) -> &EvmClientConfig {
        &self.config
    }

    fn next_id(&self) -> usize {
        self.id.fetch_add(1, Ordering::AcqRel)
    }

    /// Perform one JSON-RPC 2.0 call.
    ///
    /// Connection and timeout failures are retried; server errors are not.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> SourceResult<T> {
        let mut retries = 0;
        loop {
            let id = self.next_id();
            trace!(%method, %id, %retries, "Calling node");

            let response = self
                .client
                .post(&self.config.rpc_url)
                .json(&json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method,
                    "params": params,
                }))
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match response {
                Ok(resp) => {
                    let data = resp
                        .json::<Response>()
                        .await
                        .map_err(|e| SourceError::Decode(e.to_string()))?;
                    if let Some(err) = data.error {
                        return Err(SourceError::RpcError(format!(
                            "{method}: {} (code {})",
                            err.message, err.code
                        )));
                    }
                    return serde_json::from_value(data.result.unwrap_or(Value::Null))
                        .map_err(|e| SourceError::Decode(format!("{method}: {e}")));
                }
                Err(err) if err.is_connect() || err.is_timeout() => {
                    warn!(%method, error = %err, "⚠️  Node unreachable, retrying...");
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(SourceError::ConnectionFailed(err.to_string()));
                    }
                    sleep(Duration::from_millis(1_000)).await;
                }
                Err(err) => return Err(SourceError::RpcError(format!("{method}: {err}"))),
            }
        }
    }

    /// Current head block number.
    pub async fn block_number(&self) -> SourceResult<u64> {
        let head: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&head)
    }

    /// Decoded `Transfer` logs of the token in `from..=to`.
    ///
    /// Logs that cannot be decoded are skipped with a warning.
    #[instrument(skip(self))]
    pub async fn transfer_logs(&self, from: u64, to: u64) -> SourceResult<Vec<TransferEvent>> {
        let logs: Vec<RpcLog> = self
            .call(
                "eth_getLogs",
                json!([{
                    "address": self.config.token.to_hex(),
                    "fromBlock": to_quantity(from),
                    "toBlock": to_quantity(to),
                    "topics": [TRANSFER_TOPIC],
                }]),
            )
            .await
            .map_err(|e| SourceError::QueryFailed {
                from,
                to,
                message: e.to_string(),
            })?;

        let events: Vec<TransferEvent> = logs
            .iter()
            .filter(|log| !log.removed)
            .filter_map(|log| match decode_transfer(log) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "⚠️  Skipping undecodable Transfer log");
                    None
                }
            })
            .collect();

        trace!(logs = logs.len(), transfers = events.len(), "Logs fetched");
        Ok(events)
    }

    /// Receipt of `hash`, `None` while the transaction is not mined.
    pub(crate) async fn transaction_receipt(&self, hash: &TxHash) -> SourceResult<Option<RpcReceipt>> {
        self.call("eth_getTransactionReceipt", json!([hash.to_hex()]))
            .await
    }

    /// Broadcast a signed transaction.
    #[instrument(skip_all)]
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> SourceResult<PendingTransaction> {
        let hash: String = self
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        let hash = TxHash::from_hex(&hash)
            .map_err(|e| SourceError::Decode(format!("invalid transaction hash: {e}")))?;

        debug!(%hash, "Transaction broadcast");
        Ok(self.pending_transaction(hash))
    }

    /// Track a transaction submitted elsewhere (e.g., by a browser wallet).
    pub fn pending_transaction(&self, hash: TxHash) -> PendingTransaction {
        PendingTransaction::new(self.clone(), hash)
    }

    /// Call a view function of the token at the latest block.
    async fn call_token(&self, selector: &str) -> SourceResult<String> {
        self.call(
            "eth_call",
            json!([{ "to": self.config.token.to_hex(), "data": selector }, "latest"]),
        )
        .await
    }
}

#[async_trait]
impl TransferSource for EvmClient {
    async fn head_block(&self) -> SourceResult<u64> {
        self.block_number().await
    }

    async fn query_range(&self, from: u64, to: u64) -> SourceResult<Vec<TransferEvent>> {
        self.transfer_logs(from, to).await
    }

    /// Poll for blocks from `from_block` on and emit their transfers.
    ///
    /// Blocks already produced are read right away, at most
    /// `max_block_range` per request; then the head is polled every
    /// `poll_interval`. A failed poll yields one error and leaves the cursor
    /// where it was, so the same stream can keep being read.
    async fn subscribe(&self, from_block: u64) -> SourceResult<TransferStream> {
        let poll = LogPoll {
            client: self.clone(),
            next_block: from_block,
            pending: VecDeque::new(),
            caught_up: false,
        };
        debug!(from = from_block, "Polling for transfers");

        let stream = futures::stream::unfold(poll, |mut poll| async move {
            loop {
                if let Some(event) = poll.pending.pop_front() {
                    return Some((Ok(event), poll));
                }

                if poll.caught_up {
                    sleep(poll.client.config.poll_interval).await;
                }

                if let Err(e) = poll.next_batch().await {
                    poll.caught_up = true;
                    return Some((Err(SourceError::SubscriptionError(e.to_string())), poll));
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl TokenMetadataSource for EvmClient {
    /// Reads the four ERC-20 views concurrently.
    async fn token_metadata(&self) -> SourceResult<TokenMetadata> {
        let (name, symbol, decimals, total_supply) = tokio::try_join!(
            self.call_token(NAME_SELECTOR),
            self.call_token(SYMBOL_SELECTOR),
            self.call_token(DECIMALS_SELECTOR),
            self.call_token(TOTAL_SUPPLY_SELECTOR),
        )?;

        let decimals = u8::try_from(parse_amount(&decimals)?)
            .map_err(|_| SourceError::Decode("decimals exceed u8".into()))?;

        Ok(TokenMetadata {
            address: self.config.token,
            name: decode_abi_string(&name)?,
            symbol: decode_abi_string(&symbol)?,
            decimals,
            total_supply: parse_amount(&total_supply)?,
        })
    }
}

/// Polling cursor behind a live subscription.
struct LogPoll {
    client: EvmClient,
    /// First block not yet read.
    next_block: u64,
    pending: VecDeque<TransferEvent>,
    /// Whether the last poll reached the head.
    caught_up: bool,
}

impl LogPoll {
    async fn next_batch(&mut self) -> SourceResult<()> {
        let head = self.client.block_number().await?;
        if head < self.next_block {
            self.caught_up = true;
            return Ok(());
        }

        let span = self.client.config.max_block_range.max(1);
        let to = head.min(self.next_block.saturating_add(span - 1));
        let mut events = self.client.transfer_logs(self.next_block, to).await?;
        events.sort_by_key(TransferEvent::key);
        trace!(from = self.next_block, to, transfers = events.len(), "Polled new blocks");

        self.pending.extend(events);
        self.next_block = to + 1;
        self.caught_up = to == head;
        Ok(())
    }
}
