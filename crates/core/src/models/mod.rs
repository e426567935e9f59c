//! Domain models representing indexed transfer data.
//!
//! These models are source-agnostic and represent the canonical
//! form of indexed data within the domain layer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Fixed-size Byte Types
// =============================================================================

/// Macro to generate fixed-size byte newtypes with common functionality.
///
/// Generates:
/// - `from_hex()` - Parse from hex string (with or without 0x prefix)
/// - `to_hex()` - Convert to 0x-prefixed hex string
/// - `Display` trait implementation
/// - `From<[u8; N]>` implementation
macro_rules! fixed_bytes_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Length of the value in bytes.
            pub const LEN: usize = $len;

            /// Parse from hex string (with or without 0x prefix).
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s)?;
                let arr: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }

            /// Convert to 0x-prefixed hex string.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// Get the inner bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

fixed_bytes_newtype!(
    /// 20-byte account or contract address.
    Address,
    20
);

fixed_bytes_newtype!(
    /// 32-byte block hash.
    BlockHash,
    32
);

fixed_bytes_newtype!(
    /// 32-byte transaction hash.
    TxHash,
    32
);

impl Address {
    /// The zero address. Marks minting (as sender) and burning (as receiver).
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

// =============================================================================
// Block Identification
// =============================================================================

/// A block reference, combining number and hash for fork safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: BlockHash,
}

/// Ordering key of a log within the chain: `(block_number, log_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogKey {
    pub block_number: u64,
    pub log_index: u32,
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.block_number, self.log_index)
    }
}

// =============================================================================
// Transfers
// =============================================================================

/// A token transfer emitted by the chain.
///
/// Immutable once produced by a source. Ordered by [`TransferEvent::key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Sender. The zero address marks a mint.
    pub from: Address,
    /// Recipient. The zero address marks a burn.
    pub to: Address,
    /// Amount transferred (in smallest unit).
    pub amount: u128,
    /// Block number containing this transfer.
    pub block_number: u64,
    /// Block hash containing this transfer.
    pub block_hash: BlockHash,
    /// Log index within the block.
    pub log_index: u32,
    /// Transaction that emitted the log (if known).
    pub transaction_hash: Option<TxHash>,
}

impl TransferEvent {
    pub fn key(&self) -> LogKey {
        LogKey {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    pub fn block(&self) -> BlockRef {
        BlockRef {
            number: self.block_number,
            hash: self.block_hash,
        }
    }

    /// Whether this transfer mints tokens out of `zero`.
    pub fn is_mint(&self, zero: &Address) -> bool {
        &self.from == zero
    }

    /// Whether this transfer burns tokens into `zero`.
    pub fn is_burn(&self, zero: &Address) -> bool {
        &self.to == zero
    }
}

// =============================================================================
// Derived State
// =============================================================================

/// Net balance of one address, derived from folded transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub address: Address,
    /// Net of all amounts received minus all amounts sent, in fold order.
    pub weight: i128,
    /// Block of the last transfer that touched this balance.
    pub last_block: BlockRef,
}

/// One successfully queried backfill batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedSegment {
    /// First block of the range (inclusive).
    pub from: u64,
    /// Last block of the range (inclusive).
    pub to: u64,
    /// Transfers the range contained, in fold order.
    pub events: Vec<TransferEvent>,
    /// When this segment was committed.
    pub indexed_at: DateTime<Utc>,
}

impl IndexedSegment {
    /// Number of blocks covered by this segment.
    pub fn span(&self) -> u64 {
        (self.to - self.from).saturating_add(1)
    }
}

// =============================================================================
// Token
// =============================================================================

/// ERC-20 metadata of the indexed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// Total supply at the latest block, in smallest unit.
    pub total_supply: u128,
}

// =============================================================================
// Transactions
// =============================================================================

/// Lifecycle state of a submitted transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[default]
    Idle,
    Pending,
    Mining,
    Mined,
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Mining => "mining",
            Self::Mined => "mined",
            Self::Failed => "failed",
        }
    }

    /// Whether a transaction is between START and a terminal state.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Mining)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Mined | Self::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mining result of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: TxHash,
    /// Block that included the transaction.
    pub block: BlockRef,
    /// Blocks on top of the including block when the receipt was accepted.
    pub confirmations: u64,
    pub gas_used: Option<u128>,
}

// =============================================================================
// Tests
// =============================================================================
