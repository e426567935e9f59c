//! Metrics definitions for the indexer and transaction tracker.
//!
//! This module defines all metrics used throughout Tally.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

use crate::models::TransactionState;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "segments_indexed_total",
        "Total number of backfill segments committed"
    );
    describe_counter!(
        "transfers_folded_total",
        "Total number of transfers folded into the balance view"
    );
    describe_counter!(
        "transfers_duplicate_total",
        "Total number of transfers skipped because their log key was already folded"
    );
    describe_histogram!(
        "batch_processing_duration_seconds",
        "Time taken to query and fold a backfill batch in seconds"
    );
    describe_counter!(
        "query_errors_total",
        "Total number of failed range queries (including retried ones)"
    );
    describe_counter!(
        "subscription_errors_total",
        "Total number of live subscription errors"
    );
    describe_counter!(
        "transaction_transitions_total",
        "Total number of transaction state transitions"
    );
}

/// Record a committed backfill segment.
pub fn record_segment_indexed() {
    counter!("segments_indexed_total").increment(1);
}

/// Record folded transfers.
///
/// # Arguments
/// * `origin` - Where the transfers came from ("backfill" or "live")
/// * `count` - Number of transfers folded
pub fn record_transfers_folded(origin: &'static str, count: u64) {
    counter!("transfers_folded_total", "origin" => origin).increment(count);
}

/// Record transfers skipped as duplicates.
pub fn record_duplicates_skipped(origin: &'static str, count: u64) {
    counter!("transfers_duplicate_total", "origin" => origin).increment(count);
}

/// Record batch processing duration.
pub fn record_batch_processing_duration(duration_secs: f64) {
    histogram!("batch_processing_duration_seconds").record(duration_secs);
}

/// Record a failed range query.
///
/// # Arguments
/// * `final_attempt` - Whether no retry will follow
pub fn record_query_error(final_attempt: bool) {
    let outcome = if final_attempt { "halted" } else { "retried" };
    counter!("query_errors_total", "outcome" => outcome).increment(1);
}

/// Record a live subscription error.
pub fn record_subscription_error() {
    counter!("subscription_errors_total").increment(1);
}

/// Record a transaction entering `state`.
pub fn record_transaction_transition(state: TransactionState) {
    counter!("transaction_transitions_total", "state" => state.as_str()).increment(1);
}

/// A timer that automatically records batch duration when dropped.
pub struct BatchTimer {
    start: Instant,
}

impl BatchTimer {
    /// Start a new batch timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for BatchTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BatchTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_batch_processing_duration(duration);
    }
}
