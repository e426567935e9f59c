//! In-process JSON-RPC node for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};

use tally_core::models::Address;

use crate::client::{EvmClient, EvmClientConfig};
use crate::decode::{TRANSFER_TOPIC, parse_quantity, to_quantity};

pub(crate) const TOKEN: Address = Address([0x5f; 20]);

#[derive(Default)]
struct Chain {
    head: u64,
    logs: Vec<Value>,
    receipts: HashMap<String, Value>,
    calls: HashMap<String, String>,
    /// Next `eth_blockNumber` calls answered with HTTP 500.
    failing_head_polls: u32,
    log_ranges: Vec<(u64, u64)>,
    raw_transactions: Vec<String>,
}

/// A fake node served on a random local port.
#[derive(Clone)]
pub(crate) struct MockNode {
    chain: Arc<Mutex<Chain>>,
    url: String,
}

impl MockNode {
    pub(crate) async fn start(head: u64) -> Self {
        let chain = Arc::new(Mutex::new(Chain {
            head,
            ..Default::default()
        }));
        let app = Router::new().route("/", post(rpc)).with_state(chain.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { chain, url }
    }

    pub(crate) fn config(&self) -> EvmClientConfig {
        EvmClientConfig {
            rpc_url: self.url.clone(),
            token: TOKEN,
            poll_interval: Duration::from_millis(20),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub(crate) async fn client(&self) -> EvmClient {
        EvmClient::connect(self.config()).await.unwrap()
    }

    pub(crate) fn set_head(&self, head: u64) {
        self.chain.lock().unwrap().head = head;
    }

    /// Add a mint of `amount` to `[to; 20]` and move the head to its block.
    pub(crate) fn mint(&self, block: u64, log_index: u32, to: u8, amount: u128) {
        let mut chain = self.chain.lock().unwrap();
        chain.logs.push(transfer_log(block, log_index, to, amount));
        chain.head = chain.head.max(block);
    }

    pub(crate) fn set_receipt(&self, hash: &str, receipt: Value) {
        self.chain
            .lock()
            .unwrap()
            .receipts
            .insert(hash.to_string(), receipt);
    }

    pub(crate) fn set_call(&self, selector: &str, data: String) {
        self.chain
            .lock()
            .unwrap()
            .calls
            .insert(selector.to_string(), data);
    }

    pub(crate) fn fail_head_polls(&self, times: u32) {
        self.chain.lock().unwrap().failing_head_polls = times;
    }

    pub(crate) fn log_ranges(&self) -> Vec<(u64, u64)> {
        self.chain.lock().unwrap().log_ranges.clone()
    }

    pub(crate) fn raw_transactions(&self) -> Vec<String> {
        self.chain.lock().unwrap().raw_transactions.clone()
    }
}

pub(crate) fn transfer_log(block: u64, log_index: u32, to: u8, amount: u128) -> Value {
    json!({
        "address": TOKEN.to_hex(),
        "topics": [
            TRANSFER_TOPIC,
            format!("0x{}", "00".repeat(32)),
            format!("0x{:0>64}", hex::encode([to; 20])),
        ],
        "data": format!("0x{amount:064x}"),
        "blockNumber": to_quantity(block),
        "blockHash": format!("0x{}", hex::encode([block as u8; 32])),
        "transactionHash": format!("0x{}", hex::encode([log_index as u8; 32])),
        "logIndex": to_quantity(u64::from(log_index)),
        "removed": false
    })
}

async fn rpc(State(chain): State<Arc<Mutex<Chain>>>, Json(request): Json<Value>) -> Response {
    let id = request["id"].clone();
    let params = &request["params"];
    let mut chain = chain.lock().unwrap();

    let result = match request["method"].as_str().unwrap_or_default() {
        "eth_chainId" => json!("0x7a69"),
        "eth_blockNumber" => {
            if chain.failing_head_polls > 0 {
                chain.failing_head_polls -= 1;
                return (StatusCode::INTERNAL_SERVER_ERROR, "upstream unavailable").into_response();
            }
            json!(to_quantity(chain.head))
        }
        "eth_getLogs" => {
            let from = parse_quantity(params[0]["fromBlock"].as_str().unwrap()).unwrap();
            let to = parse_quantity(params[0]["toBlock"].as_str().unwrap()).unwrap();
            chain.log_ranges.push((from, to));
            let logs: Vec<Value> = chain
                .logs
                .iter()
                .filter(|log| {
                    let block = parse_quantity(log["blockNumber"].as_str().unwrap()).unwrap();
                    (from..=to).contains(&block)
                })
                .cloned()
                .collect();
            json!(logs)
        }
        "eth_getTransactionReceipt" => {
            let hash = params[0].as_str().unwrap();
            chain.receipts.get(hash).cloned().unwrap_or(Value::Null)
        }
        "eth_sendRawTransaction" => {
            chain
                .raw_transactions
                .push(params[0].as_str().unwrap().to_string());
            json!(format!("0x{}", "cd".repeat(32)))
        }
        "eth_call" => {
            let selector = params[0]["data"].as_str().unwrap();
            match chain.calls.get(selector) {
                Some(data) => json!(data),
                None => {
                    return Json(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": 3, "message": "execution reverted" }
                    }))
                    .into_response();
                }
            }
        }
        other => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method {other} not found") }
            }))
            .into_response();
        }
    };

    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })).into_response()
}
