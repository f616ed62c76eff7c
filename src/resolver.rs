//! Environment resolution: everything a settlement script needs is loaded
//! up front, so execution itself never touches storage.

use rustc_hash::FxHashSet;

use crate::cache::BoundedCache;
use crate::chain::{
    outpoint_claim_key, split_block_key, tx_block_key, Block, ChainReader, MarkedTransaction,
    Transaction, TxInput,
};
use crate::env::{CallbackRef, CategoryTable, Environment};
use crate::error::ResolutionError;
use crate::opcode::OpCode;
use crate::script::Script;
use crate::validator;
use crate::value::Value;

/// A cross-chain address the embedding node should start (or keep)
/// watching because a script referenced it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    pub chain: String,
    pub address: String,
}

/// The product of resolution: a ready environment, the working script to
/// execute, and any watch targets surfaced along the way.
#[derive(Debug)]
pub struct Resolution {
    pub env: Environment,
    pub script: Script,
    pub watches: Vec<WatchTarget>,
}

fn op_index(op: &OpCode) -> Option<u32> {
    match op {
        OpCode::Push(b) => Value::from_bytes(b).to_u64().and_then(|v| u32::try_from(v).ok()),
        OpCode::Const(n) => Some(*n as u32),
        _ => None,
    }
}

/// `(hash, index)` when the script leads with an outpoint reference
/// followed by OP_CALLBACK.
fn callback_reference(ops: &[OpCode]) -> Option<(String, u32)> {
    match ops {
        [OpCode::Push(h), idx, OpCode::Callback, ..] if h.len() == 32 => {
            Some((hex::encode(h), op_index(idx)?))
        }
        _ => None,
    }
}

async fn cached_tx<R: ChainReader + ?Sized>(
    reader: &R,
    cache: &BoundedCache<String, Transaction>,
    hash: &str,
    chain: &str,
) -> Result<Option<Transaction>, ResolutionError> {
    let key = format!("{chain}.tx.{hash}");
    if let Some(tx) = cache.get(&key) {
        return Ok(Some(tx));
    }
    let tx = reader.transaction_by_hash(hash, chain).await?;
    if let Some(tx) = &tx {
        cache.insert(key, tx.clone());
    }
    Ok(tx)
}

/// The block a mined transaction landed in, through the txblock
/// indirection. Unmined transactions resolve to `None`.
async fn block_of_tx<R: ChainReader + ?Sized>(
    reader: &R,
    chain: &str,
    tx_hash: &str,
) -> Result<Option<Block>, ResolutionError> {
    let Some(key) = reader.get(&tx_block_key(chain, tx_hash)).await? else {
        return Ok(None);
    };
    let Some((bchain, bhash)) = split_block_key(&key) else {
        return Ok(None);
    };
    Ok(reader.block_by_hash(bhash, bchain).await?)
}

/// Assembles the execution environment for spending `input` of `tx`
/// against `output_script`.
///
/// `cache` deduplicates transaction loads within one validation pass;
/// ownership claims are deliberately never cached.
pub async fn resolve<R: ChainReader + ?Sized>(
    reader: &R,
    cache: &BoundedCache<String, Transaction>,
    output_script: &Script,
    input_script: &Script,
    input: &TxInput,
    tx: &Transaction,
) -> Result<Resolution, ResolutionError> {
    let chain = tx.chain.as_str();
    let outpoint = &input.outpoint;
    if outpoint.tx_hash.len() < 64 {
        return Err(ResolutionError::BadOutpoint(outpoint.tx_hash.clone()));
    }

    let latest_block = reader
        .latest_block(chain)
        .await?
        .ok_or_else(|| ResolutionError::MissingBlock(format!("{chain}.block.latest")))?;

    // callback splice: the referenced prior script replaces its monoid tag
    // in the working script
    let mut callback = None;
    let working_output = if validator::includes_callback(output_script) {
        let (cb_hash, cb_index) = callback_reference(output_script.ops()).ok_or_else(|| {
            ResolutionError::BadScript("callback without a leading outpoint reference".into())
        })?;
        if output_script.contains(&OpCode::Monoid) {
            return Err(ResolutionError::MonoidWithCallback);
        }
        let cb_tx = cached_tx(reader, cache, &cb_hash, chain)
            .await?
            .ok_or_else(|| ResolutionError::UnresolvedCallback {
                hash: cb_hash.clone(),
                index: cb_index,
            })?;
        let cb_output = cb_tx.outputs.get(cb_index as usize).ok_or_else(|| {
            ResolutionError::UnresolvedCallback {
                hash: cb_hash.clone(),
                index: cb_index,
            }
        })?;
        let cb_script = Script::decode(&cb_output.script)
            .map_err(|e| ResolutionError::BadScript(e.to_string()))?;
        if !cb_script.starts_with(&OpCode::Monoid) {
            return Err(ResolutionError::CallbackNotMonoid);
        }
        let cb_block = block_of_tx(reader, chain, &cb_hash).await?;
        log::debug!("callback splice: {cb_hash}:{cb_index}, mined: {}", cb_block.is_some());
        callback = Some(CallbackRef {
            hash: cb_hash,
            index: cb_index,
            tx: cb_tx,
            block: cb_block,
        });
        // reference + OP_CALLBACK, then the prior script minus its tag,
        // then the local remainder
        let reference = Script::from_ops(output_script.ops()[..3].to_vec());
        let spliced = Script::from_ops(cb_script.ops()[1..].to_vec());
        let rest = Script::from_ops(output_script.ops()[3..].to_vec());
        reference.concat(&spliced).concat(&rest)
    } else {
        output_script.clone()
    };
    let working = input_script.concat(&working_output);

    let outpoint_tx = cached_tx(reader, cache, &outpoint.tx_hash, chain)
        .await?
        .ok_or_else(|| ResolutionError::MissingOutpoint {
            hash: outpoint.tx_hash.clone(),
            chain: chain.to_string(),
        })?;

    // a monoid-tagged outpoint demands that exactly one input of the
    // spending transaction consumes a monoid-tagged output
    if output_script.starts_with(&OpCode::Monoid) {
        let mut found = 0usize;
        for inp in &tx.inputs {
            let Some(ptx) = cached_tx(reader, cache, &inp.outpoint.tx_hash, chain).await? else {
                continue;
            };
            let Some(pout) = ptx.outputs.get(inp.outpoint.index as usize) else {
                continue;
            };
            if let Ok(s) = Script::decode(&pout.script) {
                if s.starts_with(&OpCode::Monoid) {
                    found += 1;
                }
            }
        }
        if found != 1 {
            return Err(ResolutionError::BrokenIsomorphism { found });
        }
    }

    let outpoint_tx_block = block_of_tx(reader, chain, &outpoint.tx_hash).await?;
    let input_tx_block = block_of_tx(reader, chain, &tx.hash).await?;

    // claims change between evaluations, so this read bypasses the cache
    let outpoint_owner = reader
        .get(&outpoint_claim_key(chain, &outpoint.tx_hash, outpoint.index))
        .await?;

    let marked_ops = validator::marked_opcodes(&working);
    let watches = watch_targets(&marked_ops);
    let marked_txs = collect_marked_txs(
        reader,
        &marked_ops,
        callback.as_ref().and_then(|cb| cb.block.as_ref()),
        outpoint_tx_block.as_ref(),
        &latest_block,
    )
    .await?;

    let env = Environment {
        script: working.clone(),
        latest_block,
        outpoint: outpoint.clone(),
        outpoint_tx,
        outpoint_tx_block,
        callback,
        input_tx: tx.clone(),
        input_tx_block,
        outpoint_owner,
        marked_txs,
        categories: CategoryTable::new(),
    };
    Ok(Resolution {
        env,
        script: working,
        watches,
    })
}

/// Watch targets referenced by marked opcodes: the maker and both taker
/// addresses of a trade, plus any explicitly marked address.
fn watch_targets(marked: &[validator::MarkedOp]) -> Vec<WatchTarget> {
    let mut out = Vec::new();
    for m in marked {
        match (&m.opcode, m.args.as_slice()) {
            (OpCode::MakerColl, [taker_to, taker_from, sell_chain, buy_chain, maker, ..]) => {
                let buy_chain = buy_chain.to_utf8().to_lowercase();
                let sell_chain = sell_chain.to_utf8().to_lowercase();
                out.push(WatchTarget {
                    chain: buy_chain.clone(),
                    address: maker.to_utf8(),
                });
                out.push(WatchTarget {
                    chain: buy_chain,
                    address: taker_from.to_utf8(),
                });
                out.push(WatchTarget {
                    chain: sell_chain,
                    address: taker_to.to_utf8(),
                });
            }
            (OpCode::Mark, [address, chain, ..]) => {
                out.push(WatchTarget {
                    chain: chain.to_utf8().to_lowercase(),
                    address: address.to_utf8(),
                });
            }
            _ => {}
        }
    }
    out.sort_by(|a, b| (&a.chain, &a.address).cmp(&(&b.chain, &b.address)));
    out.dedup();
    out
}

/// Gathers marked cross-chain transactions over the settlement window,
/// restricted to the addresses the trade involves. Without a DEPSET-bound
/// window or a trade there is nothing to gather.
async fn collect_marked_txs<R: ChainReader + ?Sized>(
    reader: &R,
    marked: &[validator::MarkedOp],
    callback_block: Option<&Block>,
    outpoint_block: Option<&Block>,
    latest: &Block,
) -> Result<Vec<MarkedTransaction>, ResolutionError> {
    let depset = marked
        .iter()
        .find(|m| m.opcode == OpCode::DepSet && m.args.len() == 3);
    let trade = marked
        .iter()
        .find(|m| m.opcode == OpCode::MakerColl && m.args.len() == 7);
    let (Some(depset), Some(trade)) = (depset, trade) else {
        return Ok(Vec::new());
    };
    let Some(start) = callback_block.or(outpoint_block) else {
        return Ok(Vec::new());
    };
    let (Some(shift), Some(settle)) = (depset.args[0].to_u64(), depset.args[2].to_u64()) else {
        return Ok(Vec::new());
    };
    // the window opens once the shift period has elapsed; transfers mined
    // during the shift do not count toward settlement
    let from = start.height + shift;
    let to = (start.height + shift + settle).min(latest.height);

    let addresses: FxHashSet<String> = [
        trade.args[0].to_utf8(),
        trade.args[1].to_utf8(),
        trade.args[4].to_utf8(),
    ]
    .into_iter()
    .collect();

    let blocks = reader.blocks_by_range(from, to).await?;
    let mut out = Vec::new();
    for block in blocks {
        for m in &block.marked_txs {
            if addresses.contains(&m.from_addr) || addresses.contains(&m.to_addr) {
                out.push(m.clone());
            }
        }
    }
    log::debug!("collected {} marked txs over blocks {from}..={to}", out.len());
    Ok(out)
}
