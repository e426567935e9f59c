//! GraphQL API for the Tally transfer indexer.
//!
//! Provides a read-only GraphQL endpoint over any [`IndexReader`]:
//! indexer status, balances, backfill segments, and confirmed transfers.
//! With [`build_schema_with_token`] it also serves the token's metadata.
//!
//! ```ignore
//! use tally_graphql::{ConfirmationPolicy, ServerConfig, build_schema, serve_with_shutdown};
//!
//! let schema = build_schema(indexer.clone(), ConfirmationPolicy(20));
//! serve_with_shutdown(schema, ServerConfig::default(), shutdown).await?;
//! ```
//!
//! [`IndexReader`]: tally_core::ports::IndexReader

mod schema;
mod server;
mod types;

pub use schema::{
    ConfirmationPolicy, DEFAULT_CONFIRMATIONS, IndexQuery, MAX_QUERY_COMPLEXITY, MAX_QUERY_DEPTH,
    Order, PageInfo, build_schema, build_schema_with_token,
};
pub use server::{ServerConfig, serve_with_shutdown};
pub use types::TallySchema;
