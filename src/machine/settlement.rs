//! Settlement opcode semantics. Everything here reads the resolved
//! [Environment]; without one, every operator fails closed by pushing
//! zero.

use num::BigInt;

use super::{EnvField, Machine};
use crate::chain::{Transaction, TxOutput};
use crate::crypto;
use crate::env::{CategoryEntry, Environment, CATEGORY_EMERGENCY};
use crate::error::ScriptError;
use crate::opcode::OpCode;
use crate::script::Script;
use crate::value::Value;

/// Shortest acceptable taker address payload, in bytes.
pub const MIN_TAKER_ADDR_LENGTH: usize = 28;

fn op_as_usize(op: &OpCode) -> Option<usize> {
    match op {
        OpCode::Push(b) => Value::from_bytes(b).to_usize(),
        OpCode::Const(n) => Some(*n as usize),
        _ => None,
    }
}

/// An output script "carries" a callback key when it leads with a push of
/// the outpoint hash followed by the outpoint index.
fn carries_callback_key(script: &Script, hash_hex: &str, index: usize) -> bool {
    match script.ops() {
        [OpCode::Push(h), idx, ..] => {
            hex::encode(h) == hash_hex && op_as_usize(idx) == Some(index)
        }
        _ => false,
    }
}

fn callback_outputs<'t>(tx: &'t Transaction, hash_hex: &str, index: usize) -> Vec<&'t TxOutput> {
    tx.outputs
        .iter()
        .filter(|o| match Script::decode(&o.script) {
            Ok(s) => carries_callback_key(&s, hash_hex, index),
            Err(_) => false,
        })
        .collect()
}

/// Drops the `OP_MONAD`/`OP_ENDMONAD` wrapper, if present, from a covenant
/// body.
fn strip_monad(mut ops: &[OpCode]) -> &[OpCode] {
    if ops.first() == Some(&OpCode::Monad) {
        ops = &ops[1..];
    }
    if ops.last() == Some(&OpCode::EndMonad) {
        ops = &ops[..ops.len() - 1];
    }
    ops
}

impl<'e> Machine<'e> {
    /// OP_DEPSET: classifies the current height against the settlement
    /// window. Pops settle, deposit, shift (top down; all relative to the
    /// window start) and pushes the phase code:
    ///
    ///   0  before the window opens
    ///   2  deposit phase
    ///   3  settlement phase
    ///   1  window expired
    pub(super) fn op_depset(&mut self) -> Result<(), ScriptError> {
        let args = self.stack.popn(3)?;
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        // malformed (negative) windows never open
        if args.iter().any(|a| a.is_negative()) {
            self.push_bool(false);
            return Ok(());
        }
        let shift = &args[2].0;
        let deposit = &args[1].0 + shift;
        let settle = &args[0].0 + shift;
        let start = env
            .callback
            .as_ref()
            .and_then(|cb| cb.block.as_ref())
            .or(env.outpoint_tx_block.as_ref());
        let Some(start) = start else {
            self.push_bool(false);
            return Ok(());
        };
        let current = env.input_tx_block.as_ref().unwrap_or(&env.latest_block);
        let height = BigInt::from(current.height);
        let base = BigInt::from(start.height);
        let code: u64 = if height <= &base + shift {
            0
        } else if height <= &base + &deposit {
            2
        } else if height <= &base + &settle {
            3
        } else {
            1
        };
        self.stack.push(Value::from(code));
        Ok(())
    }

    /// OP_MAKERCOLL: judges both legs of a maker/taker trade against the
    /// marked cross-chain transactions in the environment and pushes the
    /// outcome code: 0 neither settled, 2 both, 3 maker only, 4 taker
    /// only.
    pub(super) fn op_makercoll(&mut self) -> Result<(), ScriptError> {
        let args = self.stack.popn(7)?;
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        let sell_units = &args[0].0;
        let buy_units = &args[1].0;
        let maker_addr = args[2].to_utf8();
        let buy_chain = args[3].to_utf8().to_lowercase();
        let sell_chain = args[4].to_utf8().to_lowercase();
        let taker_from = args[5].to_utf8();
        let taker_to = args[6].to_utf8();

        // the taker leg is judged first: value the taker sent to the maker
        // on the denomination chain
        let taker_sent: BigInt = env
            .marked_txs
            .iter()
            .filter(|m| {
                m.from_addr == taker_from
                    && m.to_addr == maker_addr
                    && m.chain.to_lowercase() == buy_chain
            })
            .map(|m| BigInt::from(m.value))
            .sum();
        let taker_ok = &taker_sent >= buy_units;

        // then the maker leg: value the taker received on the numerator
        // chain
        let taker_received: BigInt = env
            .marked_txs
            .iter()
            .filter(|m| m.to_addr == taker_to && m.chain.to_lowercase() == sell_chain)
            .map(|m| BigInt::from(m.value))
            .sum();
        let maker_ok = &taker_received >= sell_units;

        let code: u64 = match (taker_ok, maker_ok) {
            (false, false) => 0,
            (true, true) => 2,
            (false, true) => 3,
            (true, false) => 4,
        };
        log::debug!(
            "makercoll: taker sent {taker_sent}/{buy_units} {buy_chain}, \
             taker received {taker_received}/{sell_units} {sell_chain}, code {code}"
        );
        self.stack.push(Value::from(code));
        Ok(())
    }

    /// OP_CALLBACK: checks that the spending transaction re-commits at
    /// least the referenced output's value back to the callback key. Pops
    /// the index then the hash; passes through on success, pushes zero on
    /// failure.
    pub(super) fn op_callback(&mut self) -> Result<(), ScriptError> {
        let index = self.stack.pop()?;
        let hash = self.stack.pop()?;
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        let Some(idx) = index.to_usize() else {
            self.push_bool(false);
            return Ok(());
        };
        let hash_hex = hex::encode(hash.to_bytes());
        let Some(cb) = &env.callback else {
            self.push_bool(false);
            return Ok(());
        };
        if cb.hash != hash_hex || cb.index as usize != idx {
            self.push_bool(false);
            return Ok(());
        }
        let Some(target) = cb.tx.outputs.get(idx) else {
            self.push_bool(false);
            return Ok(());
        };
        let outs = callback_outputs(&env.input_tx, &hash_hex, idx);
        let total: u64 = outs.iter().map(|o| o.value).sum();
        if outs.is_empty() || total < target.value {
            self.push_bool(false);
        }
        Ok(())
    }

    /// OP_MONOID: the self-referential variant of OP_CALLBACK. The key is
    /// the evaluated outpoint itself, and the spending transaction must
    /// carry its full value forward under that key.
    pub(super) fn op_monoid(&mut self) -> Result<(), ScriptError> {
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        let Some(op_out) = env.outpoint_output() else {
            self.push_bool(false);
            return Ok(());
        };
        let idx = env.outpoint.index as usize;
        let outs = callback_outputs(&env.input_tx, &env.outpoint.tx_hash, idx);
        let total: u64 = outs.iter().map(|o| o.value).sum();
        if outs.is_empty() || total < op_out.value {
            self.push_bool(false);
        }
        Ok(())
    }

    /// OP_MONAD..OP_ENDMONAD: a covenant over the continuation. Exactly
    /// one output of the spending transaction must carry the enclosed body
    /// (modulo the wrapper itself); the body is a constraint, not code, so
    /// execution resumes after OP_ENDMONAD. Returns the next program
    /// counter.
    pub(super) fn op_monad(&mut self, ops: &[OpCode], pc: usize) -> Result<usize, ScriptError> {
        let mut depth = 1usize;
        let mut end = pc + 1;
        while end < ops.len() {
            match ops[end] {
                OpCode::Monad => depth += 1,
                OpCode::EndMonad => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            end += 1;
        }
        if depth != 0 {
            return Err(ScriptError::BadOpcode("OP_MONAD without OP_ENDMONAD".into()));
        }
        let body = &ops[pc + 1..end];
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(end + 1);
        };
        let matching = env
            .input_tx
            .outputs
            .iter()
            .filter(|o| match Script::decode(&o.script) {
                Ok(s) => strip_monad(s.ops()) == body,
                Err(_) => false,
            })
            .count();
        self.push_bool(matching == 1);
        Ok(end + 1)
    }

    /// OP_MARK: consumes a chain, address and value triple. The watch
    /// registration happens during resolution; at execution time the
    /// operands are simply retired.
    pub(super) fn op_mark(&mut self) -> Result<(), ScriptError> {
        self.stack.popn(3)?;
        Ok(())
    }

    /// OP_PROMISE: like OP_MARK but with a counterparty, so four operands.
    pub(super) fn op_promise(&mut self) -> Result<(), ScriptError> {
        self.stack.popn(4)?;
        Ok(())
    }

    /// OP_X: resolves a key in one of the reserved category sets and
    /// pushes the registered value, or zero when nothing is registered.
    pub(super) fn op_x(&mut self) -> Result<(), ScriptError> {
        let set = self.stack.pop()?;
        let key = self.stack.pop()?;
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        let Some(set) = set.to_u64().and_then(|n| u8::try_from(n).ok()) else {
            self.push_bool(false);
            return Ok(());
        };
        match env.categories.lookup(set, &key.to_utf8()) {
            Some(CategoryEntry::Value(v)) => self.stack.push(Value::from_bytes(v)),
            Some(CategoryEntry::Flag(b)) => self.push_bool(*b),
            None => self.push_bool(false),
        }
        Ok(())
    }

    /// OP_EMERGENCY: an expiry gate with an override hook. Pushes whether
    /// the gate is still open; a flag registered under the emergency
    /// category additionally pushes its state on top.
    pub(super) fn op_emergency(&mut self) -> Result<(), ScriptError> {
        let expiry = self.stack.pop()?;
        let set_key = self.stack.pop()?;
        let event_key = self.stack.pop()?;
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        let block = env.input_tx_block.as_ref().unwrap_or(&env.latest_block);
        let expired = expiry.to_u64().map(|e| block.height >= e).unwrap_or(true);
        self.push_bool(!expired);
        let key = format!("{}.{}", set_key.to_utf8(), event_key.to_utf8());
        if let Some(entry) = env.categories.lookup(CATEGORY_EMERGENCY, &key) {
            let engaged = matches!(entry, CategoryEntry::Flag(true));
            self.push_bool(engaged);
        }
        Ok(())
    }

    /// OP_TAKERPAIR: sanity gate on a taker joining a trade; both
    /// addresses must be plausibly sized and a callback must be in force.
    pub(super) fn op_takerpair(&mut self) -> Result<(), ScriptError> {
        let _hash = self.stack.pop()?;
        let _index = self.stack.pop()?;
        let from = self.stack.pop()?;
        let to = self.stack.pop()?;
        let ok = self.env.map_or(false, |env| env.callback.is_some())
            && from.to_bytes().len() >= MIN_TAKER_ADDR_LENGTH
            && to.to_bytes().len() >= MIN_TAKER_ADDR_LENGTH;
        self.push_bool(ok);
        Ok(())
    }

    /// OP_MINUNITVALUE: pops a base multiplier; when the outpoint's unit
    /// times the base covers its whole value the partial-spend rule is
    /// satisfied trivially and zero is pushed, otherwise execution passes
    /// through to the partial-settlement branch.
    pub(super) fn op_minunitvalue(&mut self) -> Result<(), ScriptError> {
        let base = self.stack.pop()?;
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        if env.callback.is_none() {
            self.push_bool(false);
            return Ok(());
        }
        let (Some(out), Some(base)) = (env.outpoint_output(), base.to_u64()) else {
            self.push_bool(false);
            return Ok(());
        };
        let minimum = BigInt::from(out.unit) * base;
        if minimum >= BigInt::from(out.value) {
            self.stack.push(Value::zero());
        }
        Ok(())
    }

    /// The OP_ENVOUTPOINT* family: loads a field of the outpoint
    /// transaction onto the stack. Value and unit take an output index
    /// operand; the rest take none.
    pub(super) fn op_env_outpoint_field(&mut self, field: EnvField) -> Result<(), ScriptError> {
        let index = match field {
            EnvField::Value | EnvField::Unit => Some(self.stack.pop()?),
            _ => None,
        };
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        match field {
            EnvField::Value | EnvField::Unit => {
                let out = index
                    .and_then(|i| i.to_usize())
                    .and_then(|i| env.outpoint_tx.outputs.get(i));
                match out {
                    Some(o) => {
                        let v = if matches!(field, EnvField::Value) {
                            o.value
                        } else {
                            o.unit
                        };
                        self.stack.push(Value::from(v));
                    }
                    None => self.push_bool(false),
                }
            }
            EnvField::Hash => self.push_hex_or_text(&env.outpoint_tx.hash),
            EnvField::Nonce => self.push_hex_or_text(&env.outpoint_tx.nonce),
            EnvField::Locktime => self.stack.push(Value::from(env.outpoint_tx.locktime)),
        }
        Ok(())
    }

    /// Hex-looking fields push their decoded bytes, anything else pushes
    /// its UTF-8 bytes.
    fn push_hex_or_text(&mut self, s: &str) {
        match hex::decode(s) {
            Ok(b) => self.stack.push(Value::from_bytes(&b)),
            Err(_) => self.stack.push(Value::from_bytes(s.as_bytes())),
        }
    }

    /// OP_CHECKSIGNODATA: a recoverable signature check whose message is
    /// derived from the outpoint itself rather than taken from the stack.
    pub(super) fn op_checksig_nodata(&mut self) -> Result<(), ScriptError> {
        let signature = self.stack.pop()?;
        let Some(env) = self.env else {
            self.push_bool(false);
            return Ok(());
        };
        let msg = crypto::blake2bl(
            format!("{} {}", env.outpoint.tx_hash, env.outpoint.index).as_bytes(),
        );
        let msg = Value::from_bytes(&msg);
        self.check_recoverable(&msg, &signature);
        Ok(())
    }

    /// OP_DATATOHASH: the commit-reveal operator. Pops threshold,
    /// algorithm, owner address, revealed preimage sum and committed
    /// digest. An exact reveal (or one within the byte-distance threshold)
    /// pushes the owner address; a near-miss under a nonzero threshold
    /// must not equal the commitment outright.
    pub(super) fn op_datatohash(&mut self) -> Result<(), ScriptError> {
        let args = self.stack.popn(5)?;
        let threshold = &args[0];
        let alg = &args[1];
        let owners = &args[2];
        let hex_sum = &args[3];
        let hash_of_sum = &args[4];

        let alg_name = if alg.as_bool() { alg.to_utf8() } else { "0".to_string() };
        let digest: fn(&[u8]) -> Vec<u8> = match alg_name.as_str() {
            "0" | "blake2blcnoschnorr" => |d| crypto::blake2blc(d).to_vec(),
            "blake2blnoschnorr" => |d| crypto::blake2bl(d).to_vec(),
            "blake2blsnoschnorr" => |d| crypto::blake2bls(d).to_vec(),
            "sha1noschnorr" => |d| crypto::sha1(d).to_vec(),
            "sha256noschnorr" => |d| crypto::sha256(d).to_vec(),
            "ripemd160noschnorr" => |d| crypto::ripemd160(d).to_vec(),
            other => {
                log::warn!("datatohash: unsupported algorithm {other:?}");
                return Err(ScriptError::VerifyFailed);
            }
        };

        let sum = Value(&owners.0 + &hex_sum.0 + &alg.0 + &threshold.0);
        let summed = digest(&sum.to_bytes());
        if threshold.as_bool() {
            // a thresholded reveal that matches the commitment exactly is a
            // replay of the commitment itself
            if Value::from_bytes(&digest(&hex_sum.to_bytes())) == *hash_of_sum {
                return Err(ScriptError::VerifyFailed);
            }
            let dist = crypto::byte_distance(&summed, &hash_of_sum.to_bytes());
            if dist <= threshold.0 {
                self.stack.push(owners.clone());
            } else {
                return Err(ScriptError::VerifyFailed);
            }
        } else if Value::from_bytes(&summed) == *hash_of_sum {
            self.stack.push(owners.clone());
        } else {
            self.push_bool(false);
        }
        Ok(())
    }
}

/// Tests that need a resolved environment build one directly; resolution
/// itself is exercised elsewhere.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, MarkedTransaction, OutPoint, Transaction, TxInput, TxOutput};
    use crate::env::{CallbackRef, CategoryTable};

    fn block(height: u64) -> Block {
        Block {
            hash: format!("blockhash{height}"),
            chain: "bc".into(),
            height,
            marked_txs: vec![],
        }
    }

    fn outpoint_hash() -> String {
        "ab".repeat(32)
    }

    fn outpoint_tx(value: u64, unit: u64) -> Transaction {
        Transaction {
            hash: outpoint_hash(),
            chain: "bc".into(),
            nonce: "cd".repeat(16),
            locktime: 700,
            inputs: vec![],
            outputs: vec![TxOutput {
                value,
                unit,
                script: Script::parse("OP_MONOID").unwrap().encode(),
            }],
        }
    }

    fn spending_tx(outputs: Vec<TxOutput>) -> Transaction {
        Transaction {
            hash: "ef".repeat(32),
            chain: "bc".into(),
            nonce: "11".repeat(16),
            locktime: 0,
            inputs: vec![TxInput {
                outpoint: OutPoint::new(outpoint_hash(), 0),
                script: Script::empty().encode(),
            }],
            outputs,
        }
    }

    fn env_at(start_height: u64, current_height: u64) -> Environment {
        let otx = outpoint_tx(100, 1);
        Environment {
            script: Script::empty(),
            latest_block: block(current_height),
            outpoint: OutPoint::new(otx.hash.clone(), 0),
            outpoint_tx: otx,
            outpoint_tx_block: Some(block(start_height)),
            callback: None,
            input_tx: spending_tx(vec![]),
            input_tx_block: None,
            outpoint_owner: None,
            marked_txs: vec![],
            categories: CategoryTable::new(),
        }
    }

    fn run_env(text: &str, env: &Environment) -> Value {
        let script = Script::parse(text).unwrap();
        let mut m = Machine::with_env(env);
        m.execute(&script).unwrap();
        m.top().unwrap()
    }

    #[test]
    fn depset_phases() {
        // window opens at 1000: shift 5, deposit 10, settle 20
        let cases = [(1004, 0u64), (1008, 2), (1020, 3), (1030, 1)];
        for (height, expected) in cases {
            let env = env_at(1000, height);
            assert_eq!(
                run_env("5 10 20 OP_DEPSET", &env),
                Value::from(expected),
                "height {height}"
            );
        }
    }

    #[test]
    fn depset_rejects_negative_windows() {
        let env = env_at(1000, 1010);
        assert_eq!(run_env("5 10 -1 OP_DEPSET", &env), Value::zero());
    }

    #[test]
    fn makercoll_outcomes() {
        // maker sells 5 emb-side units for 10 btc-side units
        let script = "'takerto' 'takerfrom' 'eth' 'btc' 'makeraddr' 10 5 OP_MAKERCOLL";
        let taker_leg = MarkedTransaction {
            hash: "m1".into(),
            chain: "btc".into(),
            from_addr: "takerfrom".into(),
            to_addr: "makeraddr".into(),
            value: 10,
        };
        let maker_leg = MarkedTransaction {
            hash: "m2".into(),
            chain: "eth".into(),
            from_addr: "makeraddr".into(),
            to_addr: "takerto".into(),
            value: 5,
        };

        let env = env_at(1000, 1010);
        assert_eq!(run_env(script, &env), Value::from(0u64));

        let mut env = env_at(1000, 1010);
        env.marked_txs = vec![taker_leg.clone(), maker_leg.clone()];
        assert_eq!(run_env(script, &env), Value::from(2u64));

        let mut env = env_at(1000, 1010);
        env.marked_txs = vec![maker_leg.clone()];
        assert_eq!(run_env(script, &env), Value::from(3u64));

        let mut env = env_at(1000, 1010);
        env.marked_txs = vec![taker_leg.clone()];
        assert_eq!(run_env(script, &env), Value::from(4u64));

        // underpayment on the taker leg does not settle it
        let mut env = env_at(1000, 1010);
        env.marked_txs = vec![MarkedTransaction {
            value: 9,
            ..taker_leg
        }];
        assert_eq!(run_env(script, &env), Value::from(0u64));
    }

    #[test]
    fn monoid_requires_full_value_carried_forward() {
        let key_script = |value| TxOutput {
            value,
            unit: 1,
            script: Script::from_ops(vec![
                OpCode::Push(hex::decode(outpoint_hash()).unwrap().into()),
                OpCode::Const(0),
                OpCode::Monoid,
            ])
            .encode(),
        };

        let mut env = env_at(1000, 1010);
        env.input_tx = spending_tx(vec![key_script(100)]);
        let mut m = Machine::with_env(&env);
        m.execute(&Script::parse("OP_MONOID").unwrap()).unwrap();
        // pass-through: nothing pushed
        assert_eq!(m.stack_depth(), 0);

        let mut env = env_at(1000, 1010);
        env.input_tx = spending_tx(vec![key_script(99)]);
        let mut m = Machine::with_env(&env);
        m.execute(&Script::parse("OP_MONOID").unwrap()).unwrap();
        assert_eq!(m.top().unwrap(), Value::zero());

        // no carrying output at all
        let env = env_at(1000, 1010);
        let mut m = Machine::with_env(&env);
        m.execute(&Script::parse("OP_MONOID").unwrap()).unwrap();
        assert_eq!(m.top().unwrap(), Value::zero());
    }

    #[test]
    fn callback_checks_value_against_referenced_output() {
        let cb_tx = outpoint_tx(100, 1);
        let hash = cb_tx.hash.clone();
        let carried = TxOutput {
            value: 100,
            unit: 1,
            script: Script::from_ops(vec![
                OpCode::Push(hex::decode(&hash).unwrap().into()),
                OpCode::Const(0),
            ])
            .encode(),
        };
        let mut env = env_at(1000, 1010);
        env.callback = Some(CallbackRef {
            hash: hash.clone(),
            index: 0,
            tx: cb_tx,
            block: None,
        });
        env.input_tx = spending_tx(vec![carried]);

        let text = format!("0x{hash} 0 OP_CALLBACK 1");
        assert_eq!(run_env(&text, &env), Value::from(1u64));

        // short-changing the callback output fails
        env.input_tx.outputs[0].value = 99;
        let mut m = Machine::with_env(&env);
        m.execute(&Script::parse(&format!("0x{hash} 0 OP_CALLBACK")).unwrap())
            .unwrap();
        assert_eq!(m.top().unwrap(), Value::zero());
    }

    #[test]
    fn monad_constrains_the_continuation() {
        let body = Script::parse("OP_MONAD 'lock' OP_BLAKE2BL OP_ENDMONAD").unwrap();
        let carried = TxOutput {
            value: 100,
            unit: 1,
            script: body.encode(),
        };

        let mut env = env_at(1000, 1010);
        env.input_tx = spending_tx(vec![carried.clone()]);
        assert_eq!(
            run_env("OP_MONAD 'lock' OP_BLAKE2BL OP_ENDMONAD", &env),
            Value::from(1u64)
        );

        // two carrying outputs break the isomorphism
        let mut env = env_at(1000, 1010);
        env.input_tx = spending_tx(vec![carried.clone(), carried]);
        assert_eq!(
            run_env("OP_MONAD 'lock' OP_BLAKE2BL OP_ENDMONAD", &env),
            Value::zero()
        );

        // a different body does not match
        let other = TxOutput {
            value: 100,
            unit: 1,
            script: Script::parse("'other' OP_BLAKE2BL").unwrap().encode(),
        };
        let mut env = env_at(1000, 1010);
        env.input_tx = spending_tx(vec![other]);
        assert_eq!(
            run_env("OP_MONAD 'lock' OP_BLAKE2BL OP_ENDMONAD", &env),
            Value::zero()
        );
    }

    #[test]
    fn mark_and_promise_retire_their_operands() {
        let env = env_at(1000, 1010);
        let mut m = Machine::with_env(&env);
        m.execute(&Script::parse("'addr' 'eth' 99 OP_MARK 7").unwrap())
            .unwrap();
        assert_eq!(m.stack_depth(), 1);
        assert_eq!(m.top().unwrap(), Value::from(7u64));

        let mut m = Machine::with_env(&env);
        m.execute(&Script::parse("'addr' 'eth' 99 'counterparty' OP_PROMISE").unwrap())
            .unwrap();
        assert_eq!(m.stack_depth(), 0);
    }

    #[test]
    fn x_resolves_registered_categories() {
        let mut env = env_at(1000, 1010);
        env.categories
            .insert(1, "vanity", CategoryEntry::Value(b"realaddress".to_vec()));
        assert_eq!(
            run_env("'vanity' 1 OP_X", &env),
            Value::from_bytes(b"realaddress")
        );
        assert_eq!(run_env("'missing' 1 OP_X", &env), Value::zero());
    }

    #[test]
    fn emergency_gate_and_override() {
        // expires at height 2000
        let env = env_at(1000, 1010);
        assert_eq!(run_env("'fire' 'us' 2000 OP_EMERGENCY", &env), Value::from(1u64));
        let env = env_at(1000, 2500);
        assert_eq!(run_env("'fire' 'us' 2000 OP_EMERGENCY", &env), Value::zero());

        // a registered override pushes its state on top of the gate result
        let mut env = env_at(1000, 2500);
        env.categories
            .insert(CATEGORY_EMERGENCY, "us.fire", CategoryEntry::Flag(true));
        assert_eq!(run_env("'fire' 'us' 2000 OP_EMERGENCY", &env), Value::from(1u64));
    }

    #[test]
    fn takerpair_requires_callback_and_plausible_addresses() {
        let long_a = "a".repeat(30);
        let long_b = "b".repeat(30);
        let text = format!("'{long_b}' '{long_a}' 0 0x{} OP_TAKERPAIR", outpoint_hash());

        let env = env_at(1000, 1010);
        assert_eq!(run_env(&text, &env), Value::zero());

        let mut env = env_at(1000, 1010);
        env.callback = Some(CallbackRef {
            hash: outpoint_hash(),
            index: 0,
            tx: outpoint_tx(100, 1),
            block: None,
        });
        assert_eq!(run_env(&text, &env), Value::from(1u64));

        let short = format!("'tiny' '{long_a}' 0 0x{} OP_TAKERPAIR", outpoint_hash());
        assert_eq!(run_env(&short, &env), Value::zero());
    }

    #[test]
    fn minunitvalue_short_circuits_full_spends() {
        let mut env = env_at(1000, 1010);
        env.callback = Some(CallbackRef {
            hash: outpoint_hash(),
            index: 0,
            tx: outpoint_tx(100, 1),
            block: None,
        });
        // unit 1 * base 1000 covers the whole 100 value
        assert_eq!(run_env("1000 OP_MINUNITVALUE", &env), Value::zero());
        // unit 1 * base 50 does not; execution passes through
        let mut m = Machine::with_env(&env);
        m.execute(&Script::parse("50 OP_MINUNITVALUE").unwrap())
            .unwrap();
        assert_eq!(m.stack_depth(), 0);
    }

    #[test]
    fn env_outpoint_fields() {
        let env = env_at(1000, 1010);
        assert_eq!(run_env("0 OP_ENVOUTPOINTVALUE", &env), Value::from(100u64));
        assert_eq!(run_env("0 OP_ENVOUTPOINTUNIT", &env), Value::from(1u64));
        assert_eq!(run_env("5 OP_ENVOUTPOINTVALUE", &env), Value::zero());
        assert_eq!(
            run_env("OP_ENVOUTPOINTHASH", &env),
            Value::from_bytes(&hex::decode(outpoint_hash()).unwrap())
        );
        assert_eq!(run_env("OP_ENVOUTPOINTLOCKTIME", &env), Value::from(700u64));
    }

    #[test]
    fn checksig_nodata_binds_the_outpoint() {
        let sk = secp256k1::SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pk = crypto::public_key(&sk).serialize();
        let env = env_at(1000, 1010);
        let msg = crypto::blake2bl(
            format!("{} {}", env.outpoint.tx_hash, env.outpoint.index).as_bytes(),
        );
        let sig = crypto::sign_recoverable(&msg, &sk);
        let text = format!("0x{} OP_CHECKSIGNODATA", hex::encode(sig));
        assert_eq!(run_env(&text, &env), Value::from_bytes(&pk));

        // a signature over anything but this outpoint recovers a different
        // key and fails a downstream owner gate
        let wrong = crypto::sign_recoverable(&crypto::blake2bl(b"other outpoint"), &sk);
        let text = format!("0x{} OP_CHECKSIGNODATA", hex::encode(wrong));
        assert_ne!(run_env(&text, &env), Value::from_bytes(&pk));
    }

    #[test]
    fn datatohash_exact_reveal() {
        let owners = Value::from_bytes(b"settlementowneraddress");
        let hex_sum = Value::from(123456u64);
        let alg = Value::from_bytes(b"blake2blnoschnorr");
        let sum = Value(&owners.0 + &hex_sum.0 + &alg.0);
        let commitment = crypto::blake2bl(&sum.to_bytes());

        let text = format!(
            "0x{} 0x{} 0x{} 'blake2blnoschnorr' 0 OP_DATATOHASH",
            hex::encode(commitment),
            hex::encode(hex_sum.to_bytes()),
            hex::encode(owners.to_bytes()),
        );
        assert_eq!(run_env(&text, &env_at(1000, 1010)), owners);

        // a wrong reveal pushes zero
        let text = format!(
            "0x{} 0x{} 0x{} 'blake2blnoschnorr' 0 OP_DATATOHASH",
            hex::encode(commitment),
            hex::encode(Value::from(999u64).to_bytes()),
            hex::encode(owners.to_bytes()),
        );
        assert_eq!(run_env(&text, &env_at(1000, 1010)), Value::zero());
    }

    #[test]
    fn datatohash_rejects_unknown_algorithm() {
        let env = env_at(1000, 1010);
        let mut m = Machine::with_env(&env);
        let script = Script::parse("0xffee 0x01 'owner' 'md5' 0 OP_DATATOHASH").unwrap();
        assert!(matches!(
            m.execute(&script),
            Err(ScriptError::VerifyFailed)
        ));
    }
}
