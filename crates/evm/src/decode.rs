//! JSON-RPC payload types and `Transfer` log decoding.

use serde::Deserialize;

use tally_core::error::{SourceError, SourceResult};
use tally_core::models::{Address, BlockHash, BlockRef, TransactionReceipt, TransferEvent, TxHash};

/// `keccak256("Transfer(address,address,uint256)")`.
pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

// ERC-20 view selectors.
pub(crate) const NAME_SELECTOR: &str = "0x06fdde03";
pub(crate) const SYMBOL_SELECTOR: &str = "0x95d89b41";
pub(crate) const DECIMALS_SELECTOR: &str = "0x313ce567";
pub(crate) const TOTAL_SUPPLY_SELECTOR: &str = "0x18160ddd";

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcLog {
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
    pub block_hash: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

/// A receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcReceipt {
    pub transaction_hash: String,
    pub block_number: Option<String>,
    pub block_hash: Option<String>,
    /// `0x1` on success, `0x0` on revert. Absent before Byzantium.
    pub status: Option<String>,
    pub gas_used: Option<String>,
}

/// Parse a hex quantity such as `0x1b4`.
pub(crate) fn parse_quantity(value: &str) -> SourceResult<u64> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| SourceError::Decode(format!("quantity without 0x prefix: {value}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| SourceError::Decode(format!("invalid quantity {value}: {e}")))
}

/// Format a block number as a hex quantity.
pub(crate) fn to_quantity(value: u64) -> String {
    format!("{value:#x}")
}

/// Parse a 32-byte big-endian word that must fit in a `u128`.
pub(crate) fn parse_amount(data: &str) -> SourceResult<u128> {
    let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data))
        .map_err(|e| SourceError::Decode(format!("invalid log data: {e}")))?;
    if bytes.len() != 32 {
        return Err(SourceError::Decode(format!(
            "expected a 32-byte amount, got {} bytes",
            bytes.len()
        )));
    }

    let (high, low) = bytes.split_at(16);
    if high.iter().any(|b| *b != 0) {
        return Err(SourceError::Decode("amount exceeds u128".into()));
    }

    let mut word = [0u8; 16];
    word.copy_from_slice(low);
    Ok(u128::from_be_bytes(word))
}

/// Read an ABI word used as an offset or length.
fn word_to_usize(word: &[u8]) -> SourceResult<usize> {
    let (high, low) = word.split_at(24);
    if high.iter().any(|b| *b != 0) {
        return Err(SourceError::Decode("ABI offset out of range".into()));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(low);
    usize::try_from(u64::from_be_bytes(bytes))
        .map_err(|_| SourceError::Decode("ABI offset out of range".into()))
}

/// Decode the return data of a `string` view.
///
/// Some older tokens return `bytes32` instead; those are read as a
/// zero-padded UTF-8 string.
pub(crate) fn decode_abi_string(data: &str) -> SourceResult<String> {
    let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data))
        .map_err(|e| SourceError::Decode(format!("invalid return data: {e}")))?;

    let text = if bytes.len() == 32 {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(32);
        bytes[..end].to_vec()
    } else {
        if bytes.len() < 64 {
            return Err(SourceError::Decode(format!(
                "string return data too short: {} bytes",
                bytes.len()
            )));
        }
        let offset = word_to_usize(&bytes[..32])?;
        let len_word = bytes
            .get(offset..offset.saturating_add(32))
            .ok_or_else(|| SourceError::Decode("string offset out of bounds".into()))?;
        let len = word_to_usize(len_word)?;
        let start = offset + 32;
        bytes
            .get(start..start.saturating_add(len))
            .ok_or_else(|| SourceError::Decode("string length out of bounds".into()))?
            .to_vec()
    };

    String::from_utf8(text).map_err(|e| SourceError::Decode(format!("string is not UTF-8: {e}")))
}

/// Take the address out of a 32-byte indexed topic.
fn topic_address(topic: &str) -> SourceResult<Address> {
    let digits = topic.strip_prefix("0x").unwrap_or(topic);
    if digits.len() != 64 {
        return Err(SourceError::Decode(format!("invalid address topic: {topic}")));
    }
    Address::from_hex(&digits[24..])
        .map_err(|e| SourceError::Decode(format!("invalid address topic {topic}: {e}")))
}

fn required<'a>(field: &'a Option<String>, name: &str) -> SourceResult<&'a str> {
    field
        .as_deref()
        .ok_or_else(|| SourceError::Decode(format!("log is missing {name}")))
}

/// Decode an ERC-20 `Transfer(address indexed, address indexed, uint256)` log.
pub(crate) fn decode_transfer(log: &RpcLog) -> SourceResult<TransferEvent> {
    let [signature, from, to] = log.topics.as_slice() else {
        return Err(SourceError::Decode(format!(
            "expected 3 topics, got {}",
            log.topics.len()
        )));
    };
    if !signature.eq_ignore_ascii_case(TRANSFER_TOPIC) {
        return Err(SourceError::Decode(format!("not a Transfer log: {signature}")));
    }

    let block_hash = BlockHash::from_hex(required(&log.block_hash, "blockHash")?)
        .map_err(|e| SourceError::Decode(format!("invalid block hash: {e}")))?;
    let log_index = u32::try_from(parse_quantity(required(&log.log_index, "logIndex")?)?)
        .map_err(|_| SourceError::Decode("log index exceeds u32".into()))?;
    let transaction_hash = log
        .transaction_hash
        .as_deref()
        .map(TxHash::from_hex)
        .transpose()
        .map_err(|e| SourceError::Decode(format!("invalid transaction hash: {e}")))?;

    Ok(TransferEvent {
        from: topic_address(from)?,
        to: topic_address(to)?,
        amount: parse_amount(&log.data)?,
        block_number: parse_quantity(required(&log.block_number, "blockNumber")?)?,
        block_hash,
        log_index,
        transaction_hash,
    })
}

/// Convert a mined receipt. `head` is the current chain head.
pub(crate) fn decode_receipt(receipt: &RpcReceipt, head: u64) -> SourceResult<TransactionReceipt> {
    let number = parse_quantity(required(&receipt.block_number, "blockNumber")?)?;
    let hash = BlockHash::from_hex(required(&receipt.block_hash, "blockHash")?)
        .map_err(|e| SourceError::Decode(format!("invalid block hash: {e}")))?;
    let transaction_hash = TxHash::from_hex(&receipt.transaction_hash)
        .map_err(|e| SourceError::Decode(format!("invalid transaction hash: {e}")))?;
    let gas_used = receipt
        .gas_used
        .as_deref()
        .map(parse_quantity)
        .transpose()?
        .map(u128::from);

    Ok(TransactionReceipt {
        transaction_hash,
        block: BlockRef { number, hash },
        confirmations: head.saturating_sub(number) + 1,
        gas_used,
    })
}

/// Whether the receipt reports a reverted execution.
pub(crate) fn is_reverted(receipt: &RpcReceipt) -> bool {
    receipt.status.as_deref() == Some("0x0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALICE_TOPIC: &str = "0x000000000000000000000000a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1";
    const ZERO_TOPIC: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

    fn log_fixture(from: &str, to: &str, data: &str) -> RpcLog {
        serde_json::from_value(json!({
            "address": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "topics": [TRANSFER_TOPIC, from, to],
            "data": data,
            "blockNumber": "0x1b4",
            "blockHash": format!("0x{}", "ab".repeat(32)),
            "transactionHash": format!("0x{}", "cd".repeat(32)),
            "transactionIndex": "0x0",
            "logIndex": "0x3",
            "removed": false
        }))
        .unwrap()
    }

    #[test]
    fn decodes_mint_log() {
        let data = format!("0x{:064x}", 1_000u128);
        let event = decode_transfer(&log_fixture(ZERO_TOPIC, ALICE_TOPIC, &data)).unwrap();

        assert!(event.is_mint(&Address::ZERO));
        assert_eq!(event.to, Address([0xa1; 20]));
        assert_eq!(event.amount, 1_000);
        assert_eq!(event.block_number, 436);
        assert_eq!(event.log_index, 3);
        assert_eq!(event.block_hash, BlockHash([0xab; 32]));
        assert_eq!(event.transaction_hash, Some(TxHash([0xcd; 32])));
    }

    #[test]
    fn rejects_amount_above_u128() {
        let data = format!("0x{}{}", "00".repeat(15), "01".repeat(17));
        let err = decode_transfer(&log_fixture(ALICE_TOPIC, ZERO_TOPIC, &data)).unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[test]
    fn rejects_erc721_style_log() {
        let mut log = log_fixture(ALICE_TOPIC, ZERO_TOPIC, "0x");
        log.topics.push(ZERO_TOPIC.to_string());
        assert!(decode_transfer(&log).is_err());
    }

    #[test]
    fn rejects_pending_log_without_block() {
        let mut log = log_fixture(ALICE_TOPIC, ZERO_TOPIC, &format!("0x{:064x}", 1u8));
        log.block_number = None;
        assert!(decode_transfer(&log).is_err());
    }

    #[test]
    fn decodes_abi_string() {
        // "Allfeat Token", as returned by `name()`.
        let data = format!(
            "0x{:064x}{:064x}{:0<64}",
            32,
            13,
            hex::encode("Allfeat Token")
        );
        assert_eq!(decode_abi_string(&data).unwrap(), "Allfeat Token");
    }

    #[test]
    fn decodes_bytes32_string() {
        let data = format!("0x{:0<64}", hex::encode("MKR"));
        assert_eq!(decode_abi_string(&data).unwrap(), "MKR");
    }

    #[test]
    fn rejects_truncated_abi_string() {
        let data = format!("0x{:064x}{:064x}{}", 32, 40, hex::encode("short"));
        assert!(decode_abi_string(&data).is_err());
        assert!(decode_abi_string("0x").is_err());
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert!(parse_quantity("1b4").is_err());
        assert_eq!(to_quantity(436), "0x1b4");
    }

    #[test]
    fn receipt_depth_and_status() {
        let receipt: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": format!("0x{}", "cd".repeat(32)),
            "blockNumber": "0x64",
            "blockHash": format!("0x{}", "ab".repeat(32)),
            "status": "0x0",
            "gasUsed": "0x5208",
            "logs": []
        }))
        .unwrap();

        assert!(is_reverted(&receipt));
        let decoded = decode_receipt(&receipt, 104).unwrap();
        assert_eq!(decoded.block.number, 100);
        assert_eq!(decoded.confirmations, 5);
        assert_eq!(decoded.gas_used, Some(21_000));
    }
}
