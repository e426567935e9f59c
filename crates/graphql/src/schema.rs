//! GraphQL schema definition.
//!
//! This module provides the read-only schema over the indexed view:
//! indexer status, balances, backfill segments, and confirmed transfers,
//! plus the token's ERC-20 metadata when a metadata source is attached.

use std::sync::Arc;

use async_graphql::{Context, EmptyMutation, EmptySubscription, Object, Result, Schema};
use chrono::{DateTime, Utc};

use tally_core::models::Address;
use tally_core::ports::{Cursor, IndexReader, OrderDirection, Pagination, TokenMetadataSource};

use crate::types::TallySchema;

// -----------------------------------------------------------------------------
// Schema Configuration
// -----------------------------------------------------------------------------

/// Maximum query depth to prevent deeply nested queries (DoS protection).
/// Note: GraphQL introspection requires depth ~13, so we use 15 to allow it.
pub const MAX_QUERY_DEPTH: usize = 15;

/// Maximum query complexity score (DoS protection).
pub const MAX_QUERY_COMPLEXITY: usize = 500;

/// Default depth below head a transfer must reach to be listed.
pub const DEFAULT_CONFIRMATIONS: u64 = 20;

/// Confirmation depth used when a query does not give one.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationPolicy(pub u64);

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self(DEFAULT_CONFIRMATIONS)
    }
}

/// Build the schema over an index reader. The `token` field resolves to null.
///
/// Includes query depth and complexity limits for DoS protection.
pub fn build_schema<R: IndexReader + 'static>(
    reader: Arc<R>,
    confirmations: ConfirmationPolicy,
) -> TallySchema {
    let reader: Arc<dyn IndexReader> = reader;
    Schema::build(IndexQuery, EmptyMutation, EmptySubscription)
        .data(reader)
        .data(confirmations)
        .limit_depth(MAX_QUERY_DEPTH)
        .limit_complexity(MAX_QUERY_COMPLEXITY)
        .finish()
}

/// Build the schema over an index reader and a token metadata source.
pub fn build_schema_with_token<R, T>(
    reader: Arc<R>,
    token: Arc<T>,
    confirmations: ConfirmationPolicy,
) -> TallySchema
where
    R: IndexReader + 'static,
    T: TokenMetadataSource + 'static,
{
    let reader: Arc<dyn IndexReader> = reader;
    let token: Arc<dyn TokenMetadataSource> = token;
    Schema::build(IndexQuery, EmptyMutation, EmptySubscription)
        .data(reader)
        .data(token)
        .data(confirmations)
        .limit_depth(MAX_QUERY_DEPTH)
        .limit_complexity(MAX_QUERY_COMPLEXITY)
        .finish()
}

// -----------------------------------------------------------------------------
// Index Query
// -----------------------------------------------------------------------------

/// Query root for the transfer index.
#[derive(Default)]
pub struct IndexQuery;

#[Object]
impl IndexQuery {
    /// Get indexer status and statistics.
    async fn status<'ctx>(&self, ctx: &Context<'ctx>) -> Result<IndexerStatus> {
        let reader = ctx.data::<Arc<dyn IndexReader>>()?;
        Ok(IndexerStatus::from(reader.status()))
    }

    /// ERC-20 metadata of the indexed token, read from the chain.
    async fn token<'ctx>(&self, ctx: &Context<'ctx>) -> Result<Option<Token>> {
        let Some(source) = ctx.data_opt::<Arc<dyn TokenMetadataSource>>() else {
            return Ok(None);
        };

        let metadata = source.token_metadata().await?;
        Ok(Some(Token::from(metadata)))
    }

    /// Get the balance of one address.
    async fn balance<'ctx>(&self, ctx: &Context<'ctx>, address: String) -> Result<Option<Balance>> {
        let reader = ctx.data::<Arc<dyn IndexReader>>()?;

        let address = parse_address(&address)?;
        Ok(reader.balance(&address).map(Balance::from))
    }

    /// List balances sorted by weight.
    async fn balances<'ctx>(
        &self,
        ctx: &Context<'ctx>,
        #[graphql(default = 20)] first: Option<i32>,
        after: Option<String>,
        #[graphql(default)] order: Order,
    ) -> Result<BalanceConnection> {
        let reader = ctx.data::<Arc<dyn IndexReader>>()?;

        let pagination = Pagination {
            first: Some(validate_pagination_first(first)),
            after: after.map(|value| Cursor { value }),
        };

        Ok(BalanceConnection::from(
            reader.list_balances(pagination, order.into()),
        ))
    }

    /// Committed backfill segments, in commit order.
    async fn segments<'ctx>(&self, ctx: &Context<'ctx>) -> Result<Vec<Segment>> {
        let reader = ctx.data::<Arc<dyn IndexReader>>()?;
        Ok(reader.segments().into_iter().map(<Segment as From<tally_core::models::IndexedSegment>>::from).collect())
    }

    /// Transfers deeper than `minConfirmations` below `head`, newest first.
    ///
    /// `head` defaults to the latest indexed block.
    async fn transfers<'ctx>(
        &self,
        ctx: &Context<'ctx>,
        head: Option<u64>,
        min_confirmations: Option<u64>,
        #[graphql(default = 20)] first: Option<i32>,
        after: Option<String>,
    ) -> Result<TransferConnection> {
        let reader = ctx.data::<Arc<dyn IndexReader>>()?;
        let policy = ctx.data_opt::<ConfirmationPolicy>().copied().unwrap_or_default();

        let Some(head) = head.or(reader.status().latest_block) else {
            return Ok(TransferConnection::empty());
        };
        let confirmations = min_confirmations.unwrap_or(policy.0);

        let mut transfers = reader.confirmed_transfers(head, confirmations);
        transfers.sort_by_key(|t| std::cmp::Reverse(t.key()));

        let pagination = Pagination {
            first: Some(validate_pagination_first(first)),
            after: after.map(|value| Cursor { value }),
        };
        let connection =
            tally_core::ports::Connection::paginate(transfers, &pagination, |t| t.key().to_string());

        Ok(TransferConnection::from(connection))
    }
}

// -----------------------------------------------------------------------------
// GraphQL Types
// -----------------------------------------------------------------------------

/// Ordering direction.
#[derive(async_graphql::Enum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Desc,
    Asc,
}

impl From<Order> for OrderDirection {
    fn from(order: Order) -> Self {
        match order {
            Order::Asc => OrderDirection::Asc,
            Order::Desc => OrderDirection::Desc,
        }
    }
}

/// Indexer status.
#[derive(async_graphql::SimpleObject)]
pub struct IndexerStatus {
    pub segments: u64,
    pub backfill_from: Option<u64>,
    pub backfill_to: Option<u64>,
    pub latest_block: Option<u64>,
    pub balances: u64,
    pub transfers_folded: u64,
    pub duplicates_skipped: u64,
    pub retained_from: u64,
    pub live: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl From<tally_core::ports::IndexStatus> for IndexerStatus {
    fn from(s: tally_core::ports::IndexStatus) -> Self {
        Self {
            segments: s.segments as u64,
            backfill_from: s.backfill_from,
            backfill_to: s.backfill_to,
            latest_block: s.latest_block,
            balances: s.balances as u64,
            transfers_folded: s.transfers_folded,
            duplicates_skipped: s.duplicates_skipped,
            retained_from: s.retained_from,
            live: s.live,
            last_updated: s.updated_at,
        }
    }
}

/// ERC-20 token metadata.
#[derive(async_graphql::SimpleObject)]
pub struct Token {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// Total supply in smallest unit, as a decimal string.
    pub total_supply: String,
}

impl From<tally_core::models::TokenMetadata> for Token {
    fn from(t: tally_core::models::TokenMetadata) -> Self {
        Self {
            address: t.address.to_hex(),
            name: t.name,
            symbol: t.symbol,
            decimals: t.decimals,
            total_supply: t.total_supply.to_string(),
        }
    }
}

/// Net balance of an address.
#[derive(async_graphql::SimpleObject)]
pub struct Balance {
    pub address: String,
    /// Signed net amount, as a decimal string.
    pub weight: String,
    pub last_block_number: u64,
    pub last_block_hash: String,
}

impl From<tally_core::models::Balance> for Balance {
    fn from(b: tally_core::models::Balance) -> Self {
        Self {
            address: b.address.to_hex(),
            weight: b.weight.to_string(),
            last_block_number: b.last_block.number,
            last_block_hash: b.last_block.hash.to_hex(),
        }
    }
}

/// Token transfer.
#[derive(async_graphql::SimpleObject)]
pub struct Transfer {
    /// `{block_number}-{log_index}`.
    pub id: String,
    pub from: String,
    pub to: String,
    /// Amount as a decimal string.
    pub amount: String,
    pub block_number: u64,
    pub block_hash: String,
    pub log_index: u32,
    pub transaction_hash: Option<String>,
}

impl From<tally_core::models::TransferEvent> for Transfer {
    fn from(t: tally_core::models::TransferEvent) -> Self {
        Self {
            id: t.key().to_string(),
            from: t.from.to_hex(),
            to: t.to.to_hex(),
            amount: t.amount.to_string(),
            block_number: t.block_number,
            block_hash: t.block_hash.to_hex(),
            log_index: t.log_index,
            transaction_hash: t.transaction_hash.map(|h| h.to_hex()),
        }
    }
}

/// Backfill segment.
#[derive(async_graphql::SimpleObject)]
pub struct Segment {
    pub from: u64,
    pub to: u64,
    pub transfer_count: u64,
    pub indexed_at: DateTime<Utc>,
}

impl From<tally_core::models::IndexedSegment> for Segment {
    fn from(s: tally_core::models::IndexedSegment) -> Self {
        Self {
            from: s.from,
            to: s.to,
            transfer_count: s.events.len() as u64,
            indexed_at: s.indexed_at,
        }
    }
}

// -----------------------------------------------------------------------------
// Connection Types (Relay-style pagination)
// -----------------------------------------------------------------------------

#[derive(async_graphql::SimpleObject, Default)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

/// Generate Relay-style connection types (Edge + Connection) with From impl.
macro_rules! define_connection {
    ($node:ty, $core_model:ty, $edge:ident, $connection:ident) => {
        #[derive(async_graphql::SimpleObject)]
        pub struct $edge {
            pub node: $node,
            pub cursor: String,
        }

        #[derive(async_graphql::SimpleObject)]
        pub struct $connection {
            pub edges: Vec<$edge>,
            pub page_info: PageInfo,
            pub total_count: u64,
        }

        impl From<tally_core::ports::Connection<$core_model>> for $connection {
            fn from(conn: tally_core::ports::Connection<$core_model>) -> Self {
                Self {
                    edges: conn
                        .edges
                        .into_iter()
                        .map(|e| $edge {
                            node: <$node as From<$core_model>>::from(e.node),
                            cursor: e.cursor.value,
                        })
                        .collect(),
                    page_info: PageInfo {
                        has_next_page: conn.page_info.has_next_page,
                        has_previous_page: conn.page_info.has_previous_page,
                        start_cursor: conn.page_info.start_cursor.map(|c| c.value),
                        end_cursor: conn.page_info.end_cursor.map(|c| c.value),
                    },
                    total_count: conn.total_count as u64,
                }
            }
        }
    };
}

define_connection!(Balance, tally_core::models::Balance, BalanceEdge, BalanceConnection);
define_connection!(Transfer, tally_core::models::TransferEvent, TransferEdge, TransferConnection);

impl TransferConnection {
    /// No transfers, used before anything was indexed.
    fn empty() -> Self {
        Self {
            edges: Vec::new(),
            page_info: PageInfo::default(),
            total_count: 0,
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers & Validation
// -----------------------------------------------------------------------------

/// Maximum length for address strings (40 hex chars + "0x" prefix).
const MAX_ADDRESS_LENGTH: usize = 42;
/// Maximum page size for pagination.
const MAX_PAGE_SIZE: i32 = 100;
/// Default page size for pagination.
const DEFAULT_PAGE_SIZE: i32 = 20;

/// Parse and validate an address string.
fn parse_address(s: &str) -> Result<Address> {
    if s.len() > MAX_ADDRESS_LENGTH {
        return Err(async_graphql::Error::new(format!(
            "Address too long: maximum {} characters allowed",
            MAX_ADDRESS_LENGTH
        )));
    }

    let digits = s.strip_prefix("0x").unwrap_or(s);
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(async_graphql::Error::new(
            "Invalid address: must contain only hexadecimal characters",
        ));
    }

    Address::from_hex(digits)
        .map_err(|_| async_graphql::Error::new("Address must be exactly 20 bytes (40 hex characters)"))
}

/// Validate and normalize pagination first parameter.
fn validate_pagination_first(first: Option<i32>) -> usize {
    first.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE) as usize
}
