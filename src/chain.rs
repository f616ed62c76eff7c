use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The home chain identifier used when a transaction does not carry one.
pub const DEFAULT_CHAIN: &str = "bc";

/// Identifies the prior output a spending input consumes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: String,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_hash: impl Into<String>, index: u32) -> Self {
        OutPoint {
            tx_hash: tx_hash.into(),
            index,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub outpoint: OutPoint,
    /// The unlocking script, raw.
    pub script: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    /// The minimum transactable unit of this output's value.
    pub unit: u64,
    /// The locking script, raw.
    pub script: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub chain: String,
    pub nonce: String,
    pub locktime: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// An externally verified fact that value moved on a foreign chain.
/// Produced entirely by the rover/indexing collaborators; the engine only
/// consumes these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedTransaction {
    pub hash: String,
    pub chain: String,
    pub from_addr: String,
    pub to_addr: String,
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub chain: String,
    pub height: u64,
    /// Marked transactions carried by this block's rover headers,
    /// flattened across chains.
    pub marked_txs: Vec<MarkedTransaction>,
}

/// `<chain>.block.latest`
pub fn latest_block_key(chain: &str) -> String {
    format!("{chain}.block.latest")
}

/// `<chain>.txblock.<txhash>`; resolves to a block key.
pub fn tx_block_key(chain: &str, tx_hash: &str) -> String {
    format!("{chain}.txblock.{tx_hash}")
}

/// `<chain>.block.<blockhash>`
pub fn block_key(chain: &str, block_hash: &str) -> String {
    format!("{chain}.block.{block_hash}")
}

/// Splits a `<chain>.block.<hash>` key into chain and hash.
pub fn split_block_key(key: &str) -> Option<(&str, &str)> {
    let (chain, hash) = key.split_once(".block.")?;
    if chain.is_empty() || hash.is_empty() {
        return None;
    }
    Some((chain, hash))
}

/// `<chain>.op.<txhash>.<index>`; holds a prior ownership claim.
pub fn outpoint_claim_key(chain: &str, tx_hash: &str, index: u32) -> String {
    format!("{chain}.op.{tx_hash}.{index}")
}

/// Read-only access to the persistence collaborator.
///
/// Errors travel as [anyhow::Error]; the resolver wraps them into
/// [crate::error::ResolutionError::Storage]. A missing record is `None`,
/// never an error.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Raw key lookup (block-key indirection, claims).
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn transaction_by_hash(&self, hash: &str, chain: &str)
        -> Result<Option<Transaction>>;

    async fn block_by_hash(&self, hash: &str, chain: &str) -> Result<Option<Block>>;

    /// Home-chain blocks in `[from, to]`, ascending.
    async fn blocks_by_range(&self, from: u64, to: u64) -> Result<Vec<Block>>;

    async fn latest_block(&self, chain: &str) -> Result<Option<Block>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_grammar() {
        assert_eq!(latest_block_key("bc"), "bc.block.latest");
        assert_eq!(tx_block_key("bc", "abc123"), "bc.txblock.abc123");
        assert_eq!(block_key("bc", "ff00"), "bc.block.ff00");
        assert_eq!(outpoint_claim_key("bc", "abc123", 2), "bc.op.abc123.2");
        assert_eq!(split_block_key("bc.block.ff00"), Some(("bc", "ff00")));
        assert_eq!(split_block_key("garbage"), None);
    }
}
