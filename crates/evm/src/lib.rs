//! EVM JSON-RPC adapter for Tally.
//!
//! This crate implements the [`TransferSource`], [`TokenMetadataSource`], and
//! [`SubmittedTransaction`] ports from `tally-core` against any node
//! exposing the standard `eth_*` HTTP JSON-RPC methods.
//!
//! # Features
//!
//! - `Transfer` log queries over inclusive block ranges (`eth_getLogs`)
//! - Live transfers by polling the chain head, resumable from any block
//! - ERC-20 token metadata through `eth_call`
//! - Broadcast of signed transactions and receipt tracking with a
//!   confirmation depth
//!
//! # Usage
//!
//! ```ignore
//! use tally_evm::{EvmClient, EvmClientConfig};
//!
//! let config = EvmClientConfig {
//!     rpc_url: "http://localhost:8545".to_string(),
//!     token: Address::from_hex("0x5fbdb2315678afecb367f032d93f642f64180aa3")?,
//!     ..Default::default()
//! };
//!
//! let client = EvmClient::connect(config).await?;
//! let head = client.head_block().await?;
//! let transfers = client.query_range(head - 100, head).await?;
//! let live = client.subscribe(head + 1).await?;
//! ```
//!
//! [`TransferSource`]: tally_core::ports::TransferSource
//! [`SubmittedTransaction`]: tally_core::ports::SubmittedTransaction
//! [`TokenMetadataSource`]: tally_core::ports::TokenMetadataSource

mod client;
mod decode;
mod transaction;

#[cfg(test)]
mod mock;

pub use client::{EvmClient, EvmClientConfig};
pub use decode::TRANSFER_TOPIC;
pub use transaction::PendingTransaction;
