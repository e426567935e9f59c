//! Port trait for token contract metadata.

use async_trait::async_trait;

use crate::error::SourceResult;
use crate::models::TokenMetadata;

/// Reads the indexed token's ERC-20 views.
#[async_trait]
pub trait TokenMetadataSource: Send + Sync {
    /// `name`, `symbol`, `decimals`, and `totalSupply` at the latest block.
    async fn token_metadata(&self) -> SourceResult<TokenMetadata>;
}
