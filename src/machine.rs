use num::{BigInt, Signed, Zero};

use crate::crypto;
use crate::env::Environment;
use crate::error::ScriptError;
use crate::opcode::OpCode;
use crate::script::Script;
use crate::stack::ScriptStack;
use crate::validator;
use crate::value::Value;

mod settlement;

/// Hard cap on CHECKMULTISIG participants.
const MAX_MULTISIG_KEYS: usize = 20;

/// A single script execution context.
///
/// Execution is fully synchronous; the environment, when present, was
/// resolved in full before the first opcode runs. One machine evaluates
/// one script and is then discarded.
pub struct Machine<'e> {
    stack: ScriptStack,
    alt: ScriptStack,
    /// Nested IF results; execution is live only while all entries are
    /// true.
    cond: Vec<bool>,
    env: Option<&'e Environment>,
    allow_disabled: bool,
    require_minimal: bool,
    halted: bool,
}

impl<'e> Machine<'e> {
    pub fn new() -> Self {
        Machine {
            stack: ScriptStack::new(),
            alt: ScriptStack::new(),
            cond: Vec::new(),
            env: None,
            allow_disabled: false,
            require_minimal: false,
            halted: false,
        }
    }

    pub fn with_env(env: &'e Environment) -> Self {
        let mut m = Machine::new();
        m.env = Some(env);
        m
    }

    pub fn allow_disabled(mut self, allow: bool) -> Self {
        self.allow_disabled = allow;
        self
    }

    pub fn require_minimal(mut self, require: bool) -> Self {
        self.require_minimal = require;
        self
    }

    /// The value that decides the evaluation, if any.
    pub fn top(&self) -> Option<Value> {
        self.stack.peek().ok()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Runs the script to completion or to the first fault.
    pub fn execute(&mut self, script: &Script) -> Result<(), ScriptError> {
        if !self.allow_disabled {
            if let Some(op) = validator::disabled_opcode(script) {
                return Err(ScriptError::DisabledOpcode(op.to_string()));
            }
        }
        if self.require_minimal && !script.is_minimal() {
            return Err(ScriptError::BadOpcode("non-minimal push".into()));
        }
        let ops = script.ops();
        let mut pc = 0;
        while pc < ops.len() && !self.halted {
            let executing = self.cond.iter().all(|c| *c);
            let op = &ops[pc];
            log::trace!("pc {pc}: {op} (live: {executing})");
            if !executing && !matches!(op, OpCode::If | OpCode::NotIf | OpCode::Else | OpCode::EndIf)
            {
                pc += 1;
                continue;
            }
            pc = self.step(ops, pc, executing)?;
        }
        if !self.cond.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    /// Executes the opcode at `pc`, returning the next program counter.
    fn step(&mut self, ops: &[OpCode], pc: usize, executing: bool) -> Result<usize, ScriptError> {
        let op = &ops[pc];
        match op {
            // pushes
            OpCode::Push(b) => self.stack.push(Value::from_bytes(b)),
            OpCode::Const(n) => self.stack.push(Value::from(*n as u64)),
            OpCode::Op1Negate => self.stack.push(Value(BigInt::from(-1))),

            // control
            OpCode::Nop => {}
            OpCode::If => {
                let taken = if executing { self.stack.pop()?.as_bool() } else { false };
                self.cond.push(taken);
            }
            OpCode::NotIf => {
                let taken = if executing { !self.stack.pop()?.as_bool() } else { false };
                self.cond.push(taken);
            }
            OpCode::Else => {
                let last = self
                    .cond
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
            }
            OpCode::EndIf => {
                self.cond.pop().ok_or(ScriptError::UnbalancedConditional)?;
            }
            OpCode::Verify => self.verify_top()?,
            OpCode::Return => {
                self.stack.push(Value::zero());
                self.halted = true;
            }

            // stack shuffling
            OpCode::ToAltStack => {
                let v = self.stack.pop()?;
                self.alt.push(v);
            }
            OpCode::FromAltStack => {
                let v = self.alt.pop()?;
                self.stack.push(v);
            }
            OpCode::Drop => {
                self.stack.pop()?;
            }
            OpCode::Drop2 => {
                self.stack.popn(2)?;
            }
            OpCode::Dup => {
                let v = self.stack.peek()?;
                self.stack.push(v);
            }
            OpCode::Dup2 => self.dup_n(2)?,
            OpCode::Dup3 => self.dup_n(3)?,
            OpCode::IfDup => {
                let v = self.stack.peek()?;
                if v.as_bool() {
                    self.stack.push(v);
                }
            }
            OpCode::Depth => {
                let depth = self.stack.len();
                self.stack.push(Value::from(depth as u64));
            }
            OpCode::Nip => {
                let [top, _bottom] = self.pop2()?;
                self.stack.push(top);
            }
            OpCode::Over => {
                let [b, a] = self.pop2()?;
                self.stack.push(a.clone());
                self.stack.push(b);
                self.stack.push(a);
            }
            OpCode::Pick => self.pick_or_roll(false)?,
            OpCode::Roll => self.pick_or_roll(true)?,
            OpCode::Rot => {
                let [c, b, a] = self.pop3()?;
                self.stack.push(b);
                self.stack.push(c);
                self.stack.push(a);
            }
            OpCode::Swap => {
                let [b, a] = self.pop2()?;
                self.stack.push(b);
                self.stack.push(a);
            }
            OpCode::Tuck => {
                let [b, a] = self.pop2()?;
                self.stack.push(b.clone());
                self.stack.push(a);
                self.stack.push(b);
            }
            OpCode::Over2 => {
                let vals = self.stack.popn(4)?;
                // d c b a -> a b c d a b
                for v in vals.iter().rev() {
                    self.stack.push(v.clone());
                }
                self.stack.push(vals[3].clone());
                self.stack.push(vals[2].clone());
            }
            OpCode::Rot2 => {
                let vals = self.stack.popn(6)?;
                // f e d c b a -> c d e f a b
                for v in vals[..4].iter().rev() {
                    self.stack.push(v.clone());
                }
                self.stack.push(vals[5].clone());
                self.stack.push(vals[4].clone());
            }
            OpCode::Swap2 => {
                let vals = self.stack.popn(4)?;
                // d c b a -> c d a b
                self.stack.push(vals[1].clone());
                self.stack.push(vals[0].clone());
                self.stack.push(vals[3].clone());
                self.stack.push(vals[2].clone());
            }
            OpCode::Size => {
                let v = self.stack.peek()?;
                self.stack.push(Value::from(v.to_bytes().len() as u64));
            }

            // bitwise (disabled set; reachable only in lenient mode)
            OpCode::Invert => self.do_monop(|x| Value(!x.0))?,
            OpCode::And => self.do_binop(|a, b| Value(a.0 & b.0))?,
            OpCode::Or => self.do_binop(|a, b| Value(a.0 | b.0))?,
            OpCode::Xor => self.do_binop(|a, b| Value(a.0 ^ b.0))?,
            OpCode::Equal => self.do_binop(|a, b| Value::from_bool(a == b))?,
            OpCode::EqualVerify => {
                self.do_binop(|a, b| Value::from_bool(a == b))?;
                self.verify_top()?;
            }

            // arithmetic
            OpCode::Add1 => self.do_monop(|x| Value(x.0 + 1))?,
            OpCode::Sub1 => self.do_monop(|x| Value(x.0 - 1))?,
            OpCode::Mul2 => self.do_monop(|x| Value(x.0 * 2))?,
            OpCode::Div2 => self.do_monop(|x| Value(x.0 / 2))?,
            OpCode::Negate => self.do_monop(|x| Value(-x.0))?,
            OpCode::Abs => self.do_monop(|x| Value(x.0.abs()))?,
            OpCode::Not => self.do_monop(|x| Value::from_bool(x.0.is_zero()))?,
            OpCode::NonZero => self.do_monop(|x| Value::from_bool(!x.0.is_zero()))?,
            OpCode::Add => self.do_binop(|a, b| Value(a.0 + b.0))?,
            OpCode::Sub => self.do_binop(|a, b| Value(a.0 - b.0))?,
            OpCode::Mul => self.do_binop(|a, b| Value(a.0 * b.0))?,
            OpCode::Div => self.checked_binop(|a, b| {
                if b.0.is_zero() {
                    None
                } else {
                    Some(Value(a.0 / b.0))
                }
            })?,
            OpCode::Mod => self.checked_binop(|a, b| {
                if b.0.is_zero() {
                    None
                } else {
                    Some(Value(a.0 % b.0))
                }
            })?,
            OpCode::LShift => self.checked_binop(|a, b| {
                let bits = b.to_usize()?;
                Some(Value(a.0 << bits))
            })?,
            OpCode::RShift => self.checked_binop(|a, b| {
                let bits = b.to_usize()?;
                Some(Value(a.0 >> bits))
            })?,
            OpCode::BoolAnd => {
                self.do_binop(|a, b| Value::from_bool(a.as_bool() && b.as_bool()))?
            }
            OpCode::BoolOr => {
                self.do_binop(|a, b| Value::from_bool(a.as_bool() || b.as_bool()))?
            }
            OpCode::NumEqual => self.do_binop(|a, b| Value::from_bool(a == b))?,
            OpCode::NumEqualVerify => {
                self.do_binop(|a, b| Value::from_bool(a == b))?;
                self.verify_top()?;
            }
            OpCode::NumNotEqual => self.do_binop(|a, b| Value::from_bool(a != b))?,
            OpCode::LessThan => self.do_binop(|a, b| Value::from_bool(a < b))?,
            OpCode::GreaterThan => self.do_binop(|a, b| Value::from_bool(a > b))?,
            OpCode::LessThanOrEqual => self.do_binop(|a, b| Value::from_bool(a <= b))?,
            OpCode::GreaterThanOrEqual => self.do_binop(|a, b| Value::from_bool(a >= b))?,
            OpCode::Min => self.do_binop(|a, b| if a <= b { a } else { b })?,
            OpCode::Max => self.do_binop(|a, b| if a >= b { a } else { b })?,
            OpCode::Within => {
                let [max, min, x] = self.pop3()?;
                self.stack.push(Value::from_bool(x >= min && x < max));
            }

            // hashing
            OpCode::Ripemd160 => self.do_monop(|x| Value::from_bytes(&crypto::ripemd160(&x.to_bytes())))?,
            OpCode::Sha1 => self.do_monop(|x| Value::from_bytes(&crypto::sha1(&x.to_bytes())))?,
            OpCode::Sha256 => self.do_monop(|x| Value::from_bytes(&crypto::sha256(&x.to_bytes())))?,
            OpCode::Hash160 => self.do_monop(|x| Value::from_bytes(&crypto::hash160(&x.to_bytes())))?,
            OpCode::Hash256 => self.do_monop(|x| Value::from_bytes(&crypto::hash256(&x.to_bytes())))?,
            OpCode::Blake2bl => self.do_monop(|x| Value::from_bytes(&crypto::blake2bl(&x.to_bytes())))?,
            OpCode::Blake2bls => self.do_monop(|x| Value::from_bytes(&crypto::blake2bls(&x.to_bytes())))?,
            OpCode::Blake2blc => self.do_monop(|x| Value::from_bytes(&crypto::blake2blc(&x.to_bytes())))?,
            OpCode::DataToHash => self.op_datatohash()?,

            // signatures
            OpCode::CheckSig => self.op_checksig()?,
            OpCode::CheckSigVerify => {
                self.op_checksig()?;
                self.verify_top()?;
            }
            OpCode::CheckMultiSig => self.op_checkmultisig()?,
            OpCode::CheckMultiSigVerify => {
                self.op_checkmultisig()?;
                self.verify_top()?;
            }
            OpCode::CheckSigNoPubkey => self.op_checksig_nopubkey()?,
            OpCode::CheckSigNoPubkeyVerify => {
                self.op_checksig_nopubkey()?;
                self.verify_top()?;
            }
            OpCode::CheckSigNoData => self.op_checksig_nodata()?,
            OpCode::CheckSigNoDataVerify => {
                self.op_checksig_nodata()?;
                self.verify_top()?;
            }
            OpCode::CheckSigFromChain => self.op_checksig_fromchain()?,

            // settlement
            OpCode::DepSet => self.op_depset()?,
            OpCode::MakerColl => self.op_makercoll()?,
            OpCode::Callback => self.op_callback()?,
            OpCode::Monoid => self.op_monoid()?,
            OpCode::Monad => return self.op_monad(ops, pc),
            OpCode::EndMonad => {
                // reachable only without a preceding OP_MONAD
                return Err(ScriptError::BadOpcode("OP_ENDMONAD without OP_MONAD".into()));
            }
            OpCode::Mark => self.op_mark()?,
            OpCode::X => self.op_x()?,
            OpCode::Emergency => self.op_emergency()?,
            OpCode::TakerPair => self.op_takerpair()?,
            OpCode::MinUnitValue => self.op_minunitvalue()?,
            OpCode::Promise => self.op_promise()?,
            OpCode::EnvOutpointValue => self.op_env_outpoint_field(EnvField::Value)?,
            OpCode::EnvOutpointUnit => self.op_env_outpoint_field(EnvField::Unit)?,
            OpCode::EnvOutpointHash => self.op_env_outpoint_field(EnvField::Hash)?,
            OpCode::EnvOutpointNonce => self.op_env_outpoint_field(EnvField::Nonce)?,
            OpCode::EnvOutpointLocktime => self.op_env_outpoint_field(EnvField::Locktime)?,
        }
        Ok(pc + 1)
    }

    fn push_bool(&mut self, b: bool) {
        self.stack.push(Value::from_bool(b));
    }

    fn verify_top(&mut self) -> Result<(), ScriptError> {
        if self.stack.pop()?.as_bool() {
            Ok(())
        } else {
            Err(ScriptError::VerifyFailed)
        }
    }

    fn do_monop(&mut self, op: impl Fn(Value) -> Value) -> Result<(), ScriptError> {
        let x = self.stack.pop()?;
        self.stack.push(op(x));
        Ok(())
    }

    /// Pops `b` then `a`, pushes `op(a, b)`.
    fn do_binop(&mut self, op: impl Fn(Value, Value) -> Value) -> Result<(), ScriptError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(op(a, b));
        Ok(())
    }

    fn checked_binop(
        &mut self,
        op: impl Fn(Value, Value) -> Option<Value>,
    ) -> Result<(), ScriptError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        let out = op(a, b).ok_or_else(|| ScriptError::BadOpcode("undefined arithmetic".into()))?;
        self.stack.push(out);
        Ok(())
    }

    /// `[top, second]`
    fn pop2(&mut self) -> Result<[Value; 2], ScriptError> {
        let v = self.stack.popn(2)?;
        Ok([v[0].clone(), v[1].clone()])
    }

    /// `[top, second, third]`
    fn pop3(&mut self) -> Result<[Value; 3], ScriptError> {
        let v = self.stack.popn(3)?;
        Ok([v[0].clone(), v[1].clone(), v[2].clone()])
    }

    fn dup_n(&mut self, n: usize) -> Result<(), ScriptError> {
        let vals = self.stack.popn(n)?;
        for _ in 0..2 {
            for v in vals.iter().rev() {
                self.stack.push(v.clone());
            }
        }
        Ok(())
    }

    /// Zero-based PICK/ROLL: copies (or moves) the n-th item back to the
    /// top.
    fn pick_or_roll(&mut self, remove: bool) -> Result<(), ScriptError> {
        let n = self
            .stack
            .pop()?
            .to_usize()
            .ok_or_else(|| ScriptError::BadOpcode("bad pick/roll depth".into()))?;
        let depth = n + 1;
        if depth > crate::stack::POPN_MAX {
            return Err(ScriptError::BadOpcode("pick/roll too deep".into()));
        }
        if depth == 1 {
            let top = self.stack.peek()?;
            if remove {
                self.stack.pop()?;
            }
            self.stack.push(top);
            return Ok(());
        }
        let mut vals = self.stack.popn(depth)?;
        let nth = if remove {
            vals.pop().expect("depth >= 2")
        } else {
            vals.last().expect("depth >= 2").clone()
        };
        for v in vals.iter().rev() {
            self.stack.push(v.clone());
        }
        self.stack.push(nth);
        Ok(())
    }

    fn op_checksig(&mut self) -> Result<(), ScriptError> {
        let pubkey = self.stack.pop()?;
        let signature = self.stack.pop()?;
        let msg = self.stack.pop()?;
        let ok = match (msg.to_bytes_padded(32), signature.to_bytes_padded(65)) {
            (Some(msg), Some(sig)) => {
                let msg: [u8; 32] = msg.try_into().expect("padded to 32");
                crypto::verify_signature(&msg, &sig, &pubkey.to_bytes())
            }
            _ => false,
        };
        self.push_bool(ok);
        Ok(())
    }

    fn op_checksig_nopubkey(&mut self) -> Result<(), ScriptError> {
        let signature = self.stack.pop()?;
        let msg = self.stack.pop()?;
        self.check_recoverable(&msg, &signature);
        Ok(())
    }

    /// A recoverable signature check scoped by a chain tag; the tag is
    /// consumed but carries no extra constraint.
    fn op_checksig_fromchain(&mut self) -> Result<(), ScriptError> {
        let _chain = self.stack.pop()?;
        let signature = self.stack.pop()?;
        let msg = self.stack.pop()?;
        self.check_recoverable(&msg, &signature);
        Ok(())
    }

    /// The recoverable-signature family pushes the recovered public key,
    /// not a boolean: the key recovered from a signature always verifies
    /// against that signature, so the signer is bound by gating the
    /// pushed key (hash comparison) downstream. Recovery failure pushes
    /// zero.
    fn check_recoverable(&mut self, msg: &Value, signature: &Value) {
        let recovered = (|| {
            let msg: [u8; 32] = msg.to_bytes_padded(32)?.try_into().ok()?;
            let sig = signature.to_bytes_padded(65)?;
            let pk = crypto::pubkey_from_signature(&msg, &sig)?;
            if crypto::verify_signature(&msg, &sig, &pk.serialize()) {
                Some(Value::from_bytes(&pk.serialize()))
            } else {
                None
            }
        })();
        match recovered {
            Some(pk) => self.stack.push(pk),
            None => self.push_bool(false),
        }
    }

    fn op_checkmultisig(&mut self) -> Result<(), ScriptError> {
        let num_keys = self
            .stack
            .pop()?
            .to_usize()
            .filter(|n| *n <= MAX_MULTISIG_KEYS)
            .ok_or_else(|| ScriptError::BadOpcode("bad multisig key count".into()))?;
        let mut keys = Vec::with_capacity(num_keys);
        for _ in 0..num_keys {
            keys.push(self.stack.pop()?.to_bytes());
        }
        let num_sigs = self
            .stack
            .pop()?
            .to_usize()
            .filter(|n| *n <= num_keys)
            .ok_or_else(|| ScriptError::BadOpcode("bad multisig signature count".into()))?;
        let mut sigs = Vec::with_capacity(num_sigs);
        for _ in 0..num_sigs {
            sigs.push(self.stack.pop()?);
        }
        let msg = self.stack.pop()?;
        let msg: Option<[u8; 32]> = msg.to_bytes_padded(32).map(|m| m.try_into().expect("32"));

        // each signature must match a key at or after the previous match
        let ok = match msg {
            Some(msg) => {
                let mut cursor = 0;
                sigs.iter().all(|sig| {
                    let sig = match sig.to_bytes_padded(65) {
                        Some(s) => s,
                        None => return false,
                    };
                    while cursor < keys.len() {
                        if crypto::verify_signature(&msg, &sig, &keys[cursor]) {
                            cursor += 1;
                            return true;
                        }
                        cursor += 1;
                    }
                    false
                })
            }
            None => false,
        };
        self.push_bool(ok);
        Ok(())
    }
}

impl Default for Machine<'_> {
    fn default() -> Self {
        Machine::new()
    }
}

/// Outpoint-transaction fields loadable by the `OP_ENVOUTPOINT*` family.
#[derive(Clone, Copy, Debug)]
enum EnvField {
    Value,
    Unit,
    Hash,
    Nonce,
    Locktime,
}
