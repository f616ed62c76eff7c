use std::fmt;

use bytes::Bytes;
use num::BigInt;
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::crypto;
use crate::opcode::{DecodeError, OpCode};

/// Mnemonic parse error.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unknown operator {0}")]
    UnknownOperator(String),
    #[error("unterminated byte string")]
    UnterminatedString,
    #[error("bad hex literal {0}")]
    BadHex(String),
    #[error("bad integer literal {0}")]
    BadInt(String),
}

/// Recognized output-script shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputType {
    NonStandard,
    Pubkey,
    PubkeyHash,
    ScriptHash,
    Multisig,
    NullData,
    WitnessPubkeyHash,
    WitnessScriptHash,
    WitnessMastHash,
    WitnessMalformed,
}

/// An ordered opcode sequence with a cached canonical byte encoding.
#[derive(Clone, Debug)]
pub struct Script {
    ops: Vec<OpCode>,
    raw: OnceCell<Bytes>,
}

impl PartialEq for Script {
    fn eq(&self, other: &Self) -> bool {
        self.ops == other.ops
    }
}
impl Eq for Script {}

impl Script {
    pub fn from_ops(ops: Vec<OpCode>) -> Self {
        Script {
            ops,
            raw: OnceCell::new(),
        }
    }

    pub fn empty() -> Self {
        Script::from_ops(vec![])
    }

    pub fn ops(&self) -> &[OpCode] {
        &self.ops
    }

    /// Decodes a raw script. The original bytes are retained, so a
    /// non-minimally encoded push survives decode and is caught by
    /// [Script::is_minimal] at execution time rather than here.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut input = raw;
        let mut ops = Vec::new();
        while !input.is_empty() {
            ops.push(OpCode::decode(&mut input)?);
        }
        let script = Script::from_ops(ops);
        let _ = script.raw.set(Bytes::copy_from_slice(raw));
        Ok(script)
    }

    /// The canonical byte encoding (cached).
    pub fn encode(&self) -> Bytes {
        self.raw
            .get_or_init(|| Bytes::from(canonical_encode(&self.ops)))
            .clone()
    }

    /// Whether the retained encoding equals the canonical one. Scripts
    /// built from opcodes are minimal by construction.
    pub fn is_minimal(&self) -> bool {
        match self.raw.get() {
            Some(raw) => raw.as_ref() == canonical_encode(&self.ops),
            None => true,
        }
    }

    /// Parses mnemonic script text: whitespace-separated `OP_` names
    /// (case-insensitive, prefix optional), decimal integers,
    /// single-quoted byte strings, and `0x`-prefixed hex literals.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut ops = Vec::new();
        for token in text.split_whitespace() {
            // pushes carry unsigned magnitudes, so a negative decimal
            // other than -1 becomes a magnitude push negated in place
            match token.strip_prefix('-') {
                Some(digits)
                    if token != "-1"
                        && !digits.is_empty()
                        && digits.chars().all(|c| c.is_ascii_digit()) =>
                {
                    ops.push(parse_token(digits)?);
                    ops.push(OpCode::Negate);
                }
                _ => ops.push(parse_token(token)?),
            }
        }
        Ok(Script::from_ops(ops))
    }

    /// This script followed by `other`; used to join an unlocking input
    /// script with the output script it spends.
    pub fn concat(&self, other: &Script) -> Script {
        let mut ops = self.ops.clone();
        ops.extend_from_slice(&other.ops);
        Script::from_ops(ops)
    }

    pub fn contains(&self, op: &OpCode) -> bool {
        self.ops.iter().any(|o| o == op)
    }

    pub fn starts_with(&self, op: &OpCode) -> bool {
        self.ops.first() == Some(op)
    }

    /// Classifies the output-script shape.
    pub fn output_type(&self) -> OutputType {
        let ops = &self.ops;
        match ops.as_slice() {
            [OpCode::Push(key), OpCode::CheckSig] if is_key_length(key.len()) => {
                OutputType::Pubkey
            }
            [OpCode::Dup, OpCode::Hash160, OpCode::Push(h), OpCode::EqualVerify, OpCode::CheckSig]
                if h.len() == 20 =>
            {
                OutputType::PubkeyHash
            }
            [OpCode::Hash160, OpCode::Push(h), OpCode::Equal] if h.len() == 20 => {
                OutputType::ScriptHash
            }
            [OpCode::Return] => OutputType::NullData,
            [OpCode::Return, OpCode::Push(data)] if data.len() <= 80 => OutputType::NullData,
            [OpCode::Const(version), OpCode::Push(program)] => {
                witness_type(*version, program.len())
            }
            _ => {
                if self.is_multisig() {
                    OutputType::Multisig
                } else {
                    OutputType::NonStandard
                }
            }
        }
    }

    fn is_multisig(&self) -> bool {
        let ops = &self.ops;
        if ops.len() < 4 || ops.last() != Some(&OpCode::CheckMultiSig) {
            return false;
        }
        let (m, n) = match (&ops[0], &ops[ops.len() - 2]) {
            (OpCode::Const(m), OpCode::Const(n)) => (*m, *n),
            _ => return false,
        };
        if m == 0 || m > n || n as usize != ops.len() - 3 {
            return false;
        }
        ops[1..ops.len() - 2]
            .iter()
            .all(|op| matches!(op, OpCode::Push(k) if is_key_length(k.len())))
    }

    // standard builders

    pub fn pay_to_pubkey(pubkey: &[u8]) -> Script {
        Script::from_ops(vec![
            OpCode::Push(Bytes::copy_from_slice(pubkey)),
            OpCode::CheckSig,
        ])
    }

    pub fn pay_to_pubkey_hash(hash: &[u8; 20]) -> Script {
        Script::from_ops(vec![
            OpCode::Dup,
            OpCode::Hash160,
            OpCode::Push(Bytes::copy_from_slice(hash)),
            OpCode::EqualVerify,
            OpCode::CheckSig,
        ])
    }

    /// The engine-native single-owner lock: the spender reveals nothing but
    /// a recoverable signature. The recovered key is hashed and gated
    /// against the committed `blake2bl` owner digest.
    pub fn pay_to_owner(owner_digest: &[u8; 32]) -> Script {
        Script::from_ops(vec![
            OpCode::CheckSigNoPubkey,
            OpCode::Blake2bl,
            OpCode::Push(Bytes::copy_from_slice(owner_digest)),
            OpCode::Equal,
        ])
    }

    pub fn pay_to_script_hash(hash: &[u8; 20]) -> Script {
        Script::from_ops(vec![
            OpCode::Hash160,
            OpCode::Push(Bytes::copy_from_slice(hash)),
            OpCode::Equal,
        ])
    }

    pub fn multisig(m: u8, pubkeys: &[&[u8]]) -> Script {
        let mut ops = vec![OpCode::Const(m)];
        for key in pubkeys {
            ops.push(OpCode::Push(Bytes::copy_from_slice(key)));
        }
        ops.push(OpCode::Const(pubkeys.len() as u8));
        ops.push(OpCode::CheckMultiSig);
        Script::from_ops(ops)
    }

    pub fn null_data(data: &[u8]) -> Script {
        Script::from_ops(vec![
            OpCode::Return,
            OpCode::Push(Bytes::copy_from_slice(data)),
        ])
    }

    pub fn witness_program(version: u8, program: &[u8]) -> Script {
        Script::from_ops(vec![
            OpCode::Const(version),
            OpCode::Push(Bytes::copy_from_slice(program)),
        ])
    }
}

fn witness_type(version: u8, program_len: usize) -> OutputType {
    if !(2..=40).contains(&program_len) {
        return OutputType::WitnessMalformed;
    }
    match (version, program_len) {
        (0, 20) => OutputType::WitnessPubkeyHash,
        (0, 32) => OutputType::WitnessScriptHash,
        (1, 32) => OutputType::WitnessMastHash,
        _ => OutputType::WitnessMalformed,
    }
}

fn is_key_length(len: usize) -> bool {
    len == 33 || len == 65
}

fn canonical_encode(ops: &[OpCode]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        // only oversized pushes can fail, and those cannot be built from
        // mnemonic or decoded input
        op.encode(&mut out).expect("encodable opcode");
    }
    out
}

fn parse_token(token: &str) -> Result<OpCode, ParseError> {
    if let Some(rest) = token.strip_prefix('\'') {
        let inner = rest
            .strip_suffix('\'')
            .ok_or(ParseError::UnterminatedString)?;
        return Ok(OpCode::Push(Bytes::copy_from_slice(inner.as_bytes())));
    }
    if let Some(hexpart) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        let bytes = hex::decode(hexpart).map_err(|_| ParseError::BadHex(token.to_string()))?;
        return Ok(OpCode::Push(Bytes::from(bytes)));
    }
    if token == "-1" {
        return Ok(OpCode::Op1Negate);
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        let n: BigInt = token
            .parse()
            .map_err(|_| ParseError::BadInt(token.to_string()))?;
        if let Ok(small) = u8::try_from(&n) {
            if small <= 16 {
                return Ok(OpCode::Const(small));
            }
        }
        let (_, magnitude) = n.to_bytes_be();
        return Ok(OpCode::Push(Bytes::from(magnitude)));
    }
    OpCode::by_name(token).ok_or_else(|| ParseError::UnknownOperator(token.to_string()))
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{op}")?;
        }
        Ok(())
    }
}

/// Recomputes a MAST root from a revealed leaf script and its sibling path.
/// Each path element is `(sibling digest, sibling_is_left)`.
pub fn mast_root(leaf: &Script, path: &[([u8; 32], bool)]) -> [u8; 32] {
    let mut node = crypto::sha256(&leaf.encode());
    for (sibling, sibling_is_left) in path {
        let mut joined = Vec::with_capacity(64);
        if *sibling_is_left {
            joined.extend_from_slice(sibling);
            joined.extend_from_slice(&node);
        } else {
            joined.extend_from_slice(&node);
            joined.extend_from_slice(sibling);
        }
        node = crypto::sha256(&joined);
    }
    node
}

/// Verifies that a revealed branch belongs to the committed MAST root.
pub fn verify_mast_branch(root: &[u8; 32], leaf: &Script, path: &[([u8; 32], bool)]) -> bool {
    mast_root(leaf, path) == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_round_trips_through_format() {
        let text = "OP_DUP OP_HASH160 0xdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef OP_EQUALVERIFY OP_CHECKSIG";
        let script = Script::parse(text).unwrap();
        assert_eq!(script.to_string(), text);
        assert_eq!(Script::parse(&script.to_string()).unwrap(), script);
    }

    #[test]
    fn binary_round_trips() {
        let script =
            Script::parse("2 'abc' OP_SWAP OP_MAKERCOLL OP_DEPSET 0xffee OP_EQUAL").unwrap();
        let raw = script.encode();
        let decoded = Script::decode(&raw).unwrap();
        assert_eq!(decoded, script);
        assert!(decoded.is_minimal());
        // encode is idempotent
        assert_eq!(decoded.encode(), raw);
    }

    #[test]
    fn non_minimal_pushes_are_decoded_but_flagged() {
        // PUSHDATA1 for a 3-byte payload; the direct form is shorter
        let raw = [0x4c, 0x03, 0xaa, 0xbb, 0xcc];
        let script = Script::decode(&raw).unwrap();
        assert_eq!(
            script.ops(),
            &[OpCode::Push(Bytes::from(vec![0xaa, 0xbb, 0xcc]))]
        );
        assert!(!script.is_minimal());
    }

    #[test]
    fn negative_decimals_parse() {
        assert_eq!(Script::parse("-1").unwrap().ops(), &[OpCode::Op1Negate]);
        assert_eq!(
            Script::parse("-5").unwrap().ops(),
            &[OpCode::Const(5), OpCode::Negate]
        );
        assert_eq!(
            Script::parse("-300").unwrap().ops(),
            &[OpCode::Push(Bytes::from(vec![0x01, 0x2c])), OpCode::Negate]
        );
        // a bare minus is still an unknown operator
        assert!(matches!(
            Script::parse("-"),
            Err(ParseError::UnknownOperator(_))
        ));
    }

    #[test]
    fn unknown_operator_is_a_parse_error() {
        assert!(matches!(
            Script::parse("OP_DUP OP_FAKEOP"),
            Err(ParseError::UnknownOperator(_))
        ));
    }

    #[test]
    fn recognizes_standard_output_shapes() {
        let key = [0x02; 33];
        assert_eq!(
            Script::pay_to_pubkey(&key).output_type(),
            OutputType::Pubkey
        );
        assert_eq!(
            Script::pay_to_pubkey_hash(&[7; 20]).output_type(),
            OutputType::PubkeyHash
        );
        assert_eq!(
            Script::pay_to_script_hash(&[7; 20]).output_type(),
            OutputType::ScriptHash
        );
        assert_eq!(
            Script::multisig(2, &[&key, &key, &key]).output_type(),
            OutputType::Multisig
        );
        assert_eq!(
            Script::null_data(b"hello").output_type(),
            OutputType::NullData
        );
        assert_eq!(
            Script::witness_program(0, &[1; 20]).output_type(),
            OutputType::WitnessPubkeyHash
        );
        assert_eq!(
            Script::witness_program(1, &[1; 32]).output_type(),
            OutputType::WitnessMastHash
        );
        assert_eq!(
            Script::witness_program(0, &[1; 33]).output_type(),
            OutputType::WitnessMalformed
        );
        assert_eq!(
            Script::parse("OP_ADD OP_ADD").unwrap().output_type(),
            OutputType::NonStandard
        );
    }

    #[test]
    fn mast_branch_accepts_committed_leaf_and_rejects_tampering() {
        let leaf = Script::parse("OP_DUP OP_EQUALVERIFY").unwrap();
        let path = [([0x11; 32], false), ([0x22; 32], true)];
        let root = mast_root(&leaf, &path);
        assert!(verify_mast_branch(&root, &leaf, &path));

        let mut bad_path = path;
        bad_path[0].0[0] ^= 1;
        assert!(!verify_mast_branch(&root, &leaf, &bad_path));
        let other_leaf = Script::parse("OP_DROP").unwrap();
        assert!(!verify_mast_branch(&root, &other_leaf, &path));
    }
}
