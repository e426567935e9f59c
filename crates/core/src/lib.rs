//! Core domain layer for Tally.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! services for tracking submitted transactions and indexing token
//! transfers into balances. It follows hexagonal architecture principles -
//! this is the innermost layer with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       tally (binary)                        │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        tally-graphql         │          tally-evm           │
//! │           (API)              │       (JSON-RPC node)        │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                      tally-core  ← YOU ARE HERE             │
//! │                  (models, ports, services)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (TransferEvent, Balance, TransactionState, etc.)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Transaction tracker, transfer indexer, balance sheet, notices
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! - [`ports::TransferSource`] - Query and subscribe to token transfers
//! - [`ports::SubmittedTransaction`] - A signed transaction awaiting mining
//! - [`ports::IndexReader`] - Read access to the indexed balances
//!
//! ## Transaction Lifecycle
//!
//! ```text
//! Idle ──START──▶ Pending ──SIGNED──▶ Mining ──MINED──▶ Mined
//!                    │                  │
//!                    └──────FAILED──────┴──────────────▶ Failed
//! ```
//!
//! `Mined` and `Failed` accept a new START. Observers fire once per entry.
//!
//! ## Indexer Lifecycle
//!
//! 1. Subscribe to live transfers
//! 2. Backfill a recent block window in fixed-size batches
//! 3. Fold each batch into balances and record its segment atomically
//! 4. Fold live transfers as they arrive, skipping already folded logs

pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;
