//! EVM JSON-RPC data types.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ─── Quantities ───────────────────────────────────────────────────────────────

/// Serde adapter for `0x`-hex encoded `u64` quantities.
pub mod quantity {
    use chainclient_core::parse_hex_u64;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{v:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let s = String::deserialize(d)?;
        parse_hex_u64(&s).ok_or_else(|| D::Error::custom(format!("invalid hex quantity: {s}")))
    }

    /// Same, for optional fields.
    pub mod opt {
        use chainclient_core::parse_hex_u64;
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
            match v {
                Some(v) => super::serialize(v, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(s) => parse_hex_u64(&s)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid hex quantity: {s}"))),
                None => Ok(None),
            }
        }
    }
}

/// Block tag argument: `"latest"` for `None`, hex otherwise.
pub fn to_block_number_arg(number: Option<u64>) -> String {
    match number {
        None => "latest".to_string(),
        Some(n) => format!("{n:#x}"),
    }
}

// ─── Heads & blocks ───────────────────────────────────────────────────────────

/// The subset of a block header the node tracks for chain-head purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    #[serde(with = "quantity")]
    pub number: u64,
    /// Hash exactly as reported by the node.
    pub hash: B256,
    pub parent_hash: B256,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    /// Chain the head belongs to. Set locally, never read from the node.
    #[serde(skip)]
    pub chain_id: Option<u64>,
}

/// A full block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(with = "quantity")]
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(default)]
    pub miner: Address,
    #[serde(default)]
    pub state_root: B256,
    #[serde(default)]
    pub transactions_root: B256,
    #[serde(default)]
    pub receipts_root: B256,
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub extra_data: Bytes,
}

/// A transaction as embedded in a full block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    #[serde(with = "quantity")]
    pub nonce: u64,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    #[serde(with = "quantity")]
    pub gas: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
    pub input: Bytes,
}

/// A block with its full transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: Header,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

// ─── Receipts & logs ──────────────────────────────────────────────────────────

/// An emitted event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default, with = "quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default, with = "quantity::opt")]
    pub transaction_index: Option<u64>,
    #[serde(default, with = "quantity::opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

/// A transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(with = "quantity")]
    pub transaction_index: u64,
    pub block_hash: B256,
    #[serde(with = "quantity")]
    pub block_number: u64,
    #[serde(default)]
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(with = "quantity")]
    pub cumulative_gas_used: u64,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub logs: Vec<Log>,
    /// `1` success, `0` reverted. Absent before Byzantium.
    #[serde(default, with = "quantity::opt")]
    pub status: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_gas_price: Option<U256>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status != Some(0)
    }
}

/// `eth_getLogs` / `eth_subscribe("logs")` filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    /// Mutually exclusive with the block range.
    pub block_hash: Option<B256>,
    pub addresses: Vec<Address>,
    /// Positional topic filters; `None` matches anything at that position.
    pub topics: Vec<Option<Vec<B256>>>,
}

impl LogFilter {
    /// JSON filter object for `eth_getLogs`.
    pub fn to_params(&self) -> Value {
        let mut obj = Map::new();
        if let Some(hash) = self.block_hash {
            obj.insert("blockHash".into(), json!(hash));
        } else {
            if let Some(from) = self.from_block {
                obj.insert("fromBlock".into(), json!(to_block_number_arg(Some(from))));
            }
            obj.insert("toBlock".into(), json!(to_block_number_arg(self.to_block)));
        }
        if !self.addresses.is_empty() {
            obj.insert("address".into(), json!(self.addresses));
        }
        if !self.topics.is_empty() {
            obj.insert("topics".into(), json!(self.topics));
        }
        Value::Object(obj)
    }

    /// Filter object for a `logs` subscription, which takes no block range.
    pub fn to_subscription_params(&self) -> Value {
        let mut obj = Map::new();
        if !self.addresses.is_empty() {
            obj.insert("address".into(), json!(self.addresses));
        }
        if !self.topics.is_empty() {
            obj.insert("topics".into(), json!(self.topics));
        }
        Value::Object(obj)
    }
}

// ─── Calls & transactions ─────────────────────────────────────────────────────

/// Arguments of `eth_call` / `eth_estimateGas`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "quantity::opt")]
    pub gas: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
}

/// A signed, RLP-encoded transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    raw: Bytes,
    hash: B256,
}

impl SignedTransaction {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        let raw = raw.into();
        let hash = keccak256(&raw);
        Self { raw, hash }
    }

    /// Parse a `0x`-prefixed hex encoding.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Ok(Self::new(bytes))
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// EIP-2718 type byte; `0` for legacy transactions.
    pub fn tx_type(&self) -> u8 {
        match self.raw.first() {
            Some(&b) if b <= 0x7f => b,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_number_arg() {
        assert_eq!(to_block_number_arg(None), "latest");
        assert_eq!(to_block_number_arg(Some(0)), "0x0");
        assert_eq!(to_block_number_arg(Some(4_096)), "0x1000");
    }

    #[test]
    fn head_from_rpc_ignores_remote_chain_id() {
        let head: Head = serde_json::from_value(json!({
            "number": "0x10",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "timestamp": "0x5f5e100",
            "baseFeePerGas": "0x7",
            "chainId": "0x5"
        }))
        .unwrap();
        assert_eq!(head.number, 16);
        assert_eq!(head.timestamp, 100_000_000);
        assert_eq!(head.base_fee_per_gas, Some(U256::from(7)));
        assert_eq!(head.chain_id, None);
    }

    #[test]
    fn receipt_without_status() {
        let receipt: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash": B256::repeat_byte(1),
            "transactionIndex": "0x0",
            "blockHash": B256::repeat_byte(2),
            "blockNumber": "0x1",
            "cumulativeGasUsed": "0x5208",
            "gasUsed": "0x5208",
            "logs": []
        }))
        .unwrap();
        assert_eq!(receipt.gas_used, 21_000);
        assert!(receipt.succeeded());
    }

    #[test]
    fn log_filter_params() {
        let filter = LogFilter {
            from_block: Some(1),
            addresses: vec![Address::repeat_byte(0xaa)],
            topics: vec![Some(vec![B256::repeat_byte(3)]), None],
            ..Default::default()
        };
        let params = filter.to_params();
        assert_eq!(params["fromBlock"], "0x1");
        assert_eq!(params["toBlock"], "latest");
        assert!(params["topics"][1].is_null());
        assert!(filter.to_subscription_params().get("fromBlock").is_none());
    }

    #[test]
    fn signed_transaction_hash_and_type() {
        let tx = SignedTransaction::from_hex("0x02f8").unwrap();
        assert_eq!(tx.tx_type(), 2);
        assert_eq!(tx.hash(), keccak256([0x02, 0xf8]));
        assert_eq!(SignedTransaction::new(vec![0xf8, 0x6c]).tx_type(), 0);
    }
}
