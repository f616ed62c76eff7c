use rustc_hash::FxHashMap;

use crate::chain::{Block, MarkedTransaction, OutPoint, Transaction};
use crate::script::Script;

/// Category namespace reserved for emergency-service overrides.
pub const CATEGORY_EMERGENCY: u8 = 9;

/// An entry in the human-readable category table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CategoryEntry {
    /// A resolvable value (vanity address, protocol constant); `OP_X`
    /// pushes it.
    Value(Vec<u8>),
    /// A registered override switch, consulted by `OP_EMERGENCY`.
    Flag(bool),
}

/// Namespaced lookup table of human-readable keys.
///
/// Sets 0..=9 mirror the reserved address spaces (FIX protocol, vanity
/// addresses, XML-RPC, enterprise, transport, geo coordinates, emergency
/// services); all start empty and are populated by the embedding node.
#[derive(Clone, Debug, Default)]
pub struct CategoryTable {
    sets: FxHashMap<u8, FxHashMap<String, CategoryEntry>>,
}

impl CategoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, set: u8, key: impl Into<String>, entry: CategoryEntry) {
        self.sets.entry(set).or_default().insert(key.into(), entry);
    }

    pub fn lookup(&self, set: u8, key: &str) -> Option<&CategoryEntry> {
        self.sets.get(&set)?.get(key)
    }
}

/// A bound callback reference: the prior transaction whose output script
/// was spliced into the working script.
#[derive(Clone, Debug)]
pub struct CallbackRef {
    pub hash: String,
    pub index: u32,
    pub tx: Transaction,
    pub block: Option<Block>,
}

/// The immutable per-evaluation record settlement opcodes read from.
///
/// Constructed fresh for one evaluation by the resolver, never persisted,
/// never shared across evaluations.
#[derive(Clone, Debug)]
pub struct Environment {
    /// The working script (callback-expanded, input + output).
    pub script: Script,
    /// The current home-chain tip.
    pub latest_block: Block,
    pub outpoint: OutPoint,
    pub outpoint_tx: Transaction,
    pub outpoint_tx_block: Option<Block>,
    pub callback: Option<CallbackRef>,
    /// The spending transaction.
    pub input_tx: Transaction,
    /// Absent while the spending transaction is unmined.
    pub input_tx_block: Option<Block>,
    /// A prior ownership claim on the outpoint, if any.
    pub outpoint_owner: Option<String>,
    /// Marked foreign-chain transactions relevant to this evaluation.
    pub marked_txs: Vec<MarkedTransaction>,
    pub categories: CategoryTable,
}

impl Environment {
    /// The output the evaluated outpoint refers to, when the index is in
    /// range.
    pub fn outpoint_output(&self) -> Option<&crate::chain::TxOutput> {
        self.outpoint_tx.outputs.get(self.outpoint.index as usize)
    }
}
