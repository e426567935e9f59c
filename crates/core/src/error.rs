//! Error types for the Tally domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`TransactionError`] - Why a submitted transaction did not reach `Mined`
//! - [`TrackerError`] - Why the tracker refused to start a cycle
//! - [`SourceError`] - Transfer source (RPC) errors
//! - [`IndexerError`] - Top-level indexing errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use thiserror::Error;

use crate::models::TransactionState;

// =============================================================================
// Transaction Errors
// =============================================================================

/// Stage of the transaction lifecycle a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    /// Waiting for the wallet to sign and submit.
    Signing,
    /// Waiting for the submitted transaction to be mined.
    Mining,
}

impl std::fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signing => f.write_str("signing"),
            Self::Mining => f.write_str("mining"),
        }
    }
}

/// Failure cause carried by the `Failed` state.
///
/// These are never returned from [`crate::services::TransactionTracker::send`];
/// they only reach registered observers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    /// User or wallet declined before submission.
    #[error("Signing rejected: {0}")]
    SigningRejected(String),

    /// Submitted but reverted or dropped.
    #[error("Mining failed: {0}")]
    MiningFailed(String),

    /// No answer within the configured timeout.
    #[error("Timed out while {stage} after {elapsed_ms}ms")]
    Timeout {
        stage: TransactionStage,
        elapsed_ms: u64,
    },

    /// The caller stopped driving `send` before the transaction settled.
    #[error("Transaction abandoned before it settled")]
    Cancelled,
}

/// Reasons the tracker refused a `send`.
///
/// Unlike [`TransactionError`], these describe misuse of the tracker,
/// not the fate of a transaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// Another transaction is still pending or mining.
    #[error("Transaction already in flight (state: {0})")]
    InFlight(TransactionState),

    /// The tracker task has stopped.
    #[error("Transaction tracker closed")]
    Closed,
}

// =============================================================================
// Source Errors
// =============================================================================

/// Transfer source connectivity and decoding errors.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Connection to the node failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// RPC request failed.
    #[error("RPC error: {0}")]
    RpcError(String),

    /// Historical range query failed.
    #[error("Query failed for blocks {from}..={to}: {message}")]
    QueryFailed {
        from: u64,
        to: u64,
        message: String,
    },

    /// Live subscription failed or disconnected.
    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    /// Response could not be decoded.
    #[error("Decoding error: {0}")]
    Decode(String),
}

// =============================================================================
// Indexer Errors
// =============================================================================

/// Top-level indexing errors.
///
/// This is the main error type returned by [`crate::services::TransferIndexer`].
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Transfer source error.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// A backfill batch kept failing after all retries.
    ///
    /// Segments committed before this batch remain valid.
    #[error("Backfill halted at blocks {from}..={to} after {attempts} attempts: {source}")]
    QueryFailed {
        from: u64,
        to: u64,
        attempts: u32,
        #[source]
        source: SourceError,
    },

    /// Requested block range is empty or inverted.
    #[error("Invalid block range: {from}..={to}")]
    InvalidRange { from: u64, to: u64 },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error type for control flow.
    #[error("Indexer shutdown requested")]
    ShutdownRequested,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for indexer operations.
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Result type for a transaction's signing or mining step.
pub type TransactionResult<T> = Result<T, TransactionError>;
