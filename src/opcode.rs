use std::io::Read;

use bytes::Bytes;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Escape byte introducing a two-byte (big-endian) extended opcode value.
/// The settlement operators live above the single-byte range; `0xfd` is
/// unassigned in the classic table and carries their `u16` values on the
/// wire.
pub const EXTENDED_ESCAPE: u8 = 0xfd;

/// One script instruction: a data push, a small constant, or a named
/// operator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Raw data push. Empty payloads encode as `0x00` and decode as
    /// `Const(0)`.
    Push(Bytes),
    /// Small-integer constant `OP_0`..`OP_16`.
    Const(u8),
    Op1Negate,

    // control
    Nop,
    If,
    NotIf,
    Else,
    EndIf,
    Verify,
    Return,

    // stack
    ToAltStack,
    FromAltStack,
    Drop2,
    Dup2,
    Dup3,
    Over2,
    Rot2,
    Swap2,
    IfDup,
    Depth,
    Drop,
    Dup,
    Nip,
    Over,
    Pick,
    Roll,
    Rot,
    Swap,
    Tuck,
    Size,

    // bitwise
    Invert,
    And,
    Or,
    Xor,
    Equal,
    EqualVerify,

    // arithmetic
    Add1,
    Sub1,
    Mul2,
    Div2,
    Negate,
    Abs,
    Not,
    NonZero,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    LShift,
    RShift,
    BoolAnd,
    BoolOr,
    NumEqual,
    NumEqualVerify,
    NumNotEqual,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    GreaterThanOrEqual,
    Min,
    Max,
    Within,

    // hashing and signatures
    Ripemd160,
    Sha1,
    Sha256,
    Hash160,
    Hash256,
    CheckSig,
    CheckSigVerify,
    CheckMultiSig,
    CheckMultiSigVerify,

    // extended: engine digests and commit-reveal
    Blake2bl,
    Blake2bls,
    Blake2blc,
    DataToHash,

    // extended: signature variants
    CheckSigFromChain,
    CheckSigNoPubkey,
    CheckSigNoPubkeyVerify,
    CheckSigNoData,
    CheckSigNoDataVerify,

    // extended: settlement
    DepSet,
    MakerColl,
    Monoid,
    Monad,
    EndMonad,
    Callback,
    Mark,
    X,
    Emergency,
    TakerPair,
    MinUnitValue,
    Promise,
    EnvOutpointValue,
    EnvOutpointUnit,
    EnvOutpointHash,
    EnvOutpointNonce,
    EnvOutpointLocktime,
}

/// Wire position of an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wire {
    Byte(u8),
    Ext(u16),
}

/// The fixed operator table: canonical name, wire value, variant.
#[rustfmt::skip]
static OPERATORS: &[(&str, Wire, OpCode)] = &[
    ("OP_NOP",                  Wire::Byte(0x61), OpCode::Nop),
    ("OP_IF",                   Wire::Byte(0x63), OpCode::If),
    ("OP_NOTIF",                Wire::Byte(0x64), OpCode::NotIf),
    ("OP_ELSE",                 Wire::Byte(0x67), OpCode::Else),
    ("OP_ENDIF",                Wire::Byte(0x68), OpCode::EndIf),
    ("OP_VERIFY",               Wire::Byte(0x69), OpCode::Verify),
    ("OP_RETURN",               Wire::Byte(0x6a), OpCode::Return),
    ("OP_TOALTSTACK",           Wire::Byte(0x6b), OpCode::ToAltStack),
    ("OP_FROMALTSTACK",         Wire::Byte(0x6c), OpCode::FromAltStack),
    ("OP_2DROP",                Wire::Byte(0x6d), OpCode::Drop2),
    ("OP_2DUP",                 Wire::Byte(0x6e), OpCode::Dup2),
    ("OP_3DUP",                 Wire::Byte(0x6f), OpCode::Dup3),
    ("OP_2OVER",                Wire::Byte(0x70), OpCode::Over2),
    ("OP_2ROT",                 Wire::Byte(0x71), OpCode::Rot2),
    ("OP_2SWAP",                Wire::Byte(0x72), OpCode::Swap2),
    ("OP_IFDUP",                Wire::Byte(0x73), OpCode::IfDup),
    ("OP_DEPTH",                Wire::Byte(0x74), OpCode::Depth),
    ("OP_DROP",                 Wire::Byte(0x75), OpCode::Drop),
    ("OP_DUP",                  Wire::Byte(0x76), OpCode::Dup),
    ("OP_NIP",                  Wire::Byte(0x77), OpCode::Nip),
    ("OP_OVER",                 Wire::Byte(0x78), OpCode::Over),
    ("OP_PICK",                 Wire::Byte(0x79), OpCode::Pick),
    ("OP_ROLL",                 Wire::Byte(0x7a), OpCode::Roll),
    ("OP_ROT",                  Wire::Byte(0x7b), OpCode::Rot),
    ("OP_SWAP",                 Wire::Byte(0x7c), OpCode::Swap),
    ("OP_TUCK",                 Wire::Byte(0x7d), OpCode::Tuck),
    ("OP_SIZE",                 Wire::Byte(0x82), OpCode::Size),
    ("OP_INVERT",               Wire::Byte(0x83), OpCode::Invert),
    ("OP_AND",                  Wire::Byte(0x84), OpCode::And),
    ("OP_OR",                   Wire::Byte(0x85), OpCode::Or),
    ("OP_XOR",                  Wire::Byte(0x86), OpCode::Xor),
    ("OP_EQUAL",                Wire::Byte(0x87), OpCode::Equal),
    ("OP_EQUALVERIFY",          Wire::Byte(0x88), OpCode::EqualVerify),
    ("OP_1ADD",                 Wire::Byte(0x8b), OpCode::Add1),
    ("OP_1SUB",                 Wire::Byte(0x8c), OpCode::Sub1),
    ("OP_2MUL",                 Wire::Byte(0x8d), OpCode::Mul2),
    ("OP_2DIV",                 Wire::Byte(0x8e), OpCode::Div2),
    ("OP_NEGATE",               Wire::Byte(0x8f), OpCode::Negate),
    ("OP_ABS",                  Wire::Byte(0x90), OpCode::Abs),
    ("OP_NOT",                  Wire::Byte(0x91), OpCode::Not),
    ("OP_0NOTEQUAL",            Wire::Byte(0x92), OpCode::NonZero),
    ("OP_ADD",                  Wire::Byte(0x93), OpCode::Add),
    ("OP_SUB",                  Wire::Byte(0x94), OpCode::Sub),
    ("OP_MUL",                  Wire::Byte(0x95), OpCode::Mul),
    ("OP_DIV",                  Wire::Byte(0x96), OpCode::Div),
    ("OP_MOD",                  Wire::Byte(0x97), OpCode::Mod),
    ("OP_LSHIFT",               Wire::Byte(0x98), OpCode::LShift),
    ("OP_RSHIFT",               Wire::Byte(0x99), OpCode::RShift),
    ("OP_BOOLAND",              Wire::Byte(0x9a), OpCode::BoolAnd),
    ("OP_BOOLOR",               Wire::Byte(0x9b), OpCode::BoolOr),
    ("OP_NUMEQUAL",             Wire::Byte(0x9c), OpCode::NumEqual),
    ("OP_NUMEQUALVERIFY",       Wire::Byte(0x9d), OpCode::NumEqualVerify),
    ("OP_NUMNOTEQUAL",          Wire::Byte(0x9e), OpCode::NumNotEqual),
    ("OP_LESSTHAN",             Wire::Byte(0x9f), OpCode::LessThan),
    ("OP_GREATERTHAN",          Wire::Byte(0xa0), OpCode::GreaterThan),
    ("OP_LESSTHANOREQUAL",      Wire::Byte(0xa1), OpCode::LessThanOrEqual),
    ("OP_GREATERTHANOREQUAL",   Wire::Byte(0xa2), OpCode::GreaterThanOrEqual),
    ("OP_MIN",                  Wire::Byte(0xa3), OpCode::Min),
    ("OP_MAX",                  Wire::Byte(0xa4), OpCode::Max),
    ("OP_WITHIN",               Wire::Byte(0xa5), OpCode::Within),
    ("OP_RIPEMD160",            Wire::Byte(0xa6), OpCode::Ripemd160),
    ("OP_SHA1",                 Wire::Byte(0xa7), OpCode::Sha1),
    ("OP_SHA256",               Wire::Byte(0xa8), OpCode::Sha256),
    ("OP_HASH160",              Wire::Byte(0xa9), OpCode::Hash160),
    ("OP_HASH256",              Wire::Byte(0xaa), OpCode::Hash256),
    ("OP_CHECKSIG",             Wire::Byte(0xac), OpCode::CheckSig),
    ("OP_CHECKSIGVERIFY",       Wire::Byte(0xad), OpCode::CheckSigVerify),
    ("OP_CHECKMULTISIG",        Wire::Byte(0xae), OpCode::CheckMultiSig),
    ("OP_CHECKMULTISIGVERIFY",  Wire::Byte(0xaf), OpCode::CheckMultiSigVerify),
    // extended range
    ("OP_CHECKSIGFROMCHAIN",    Wire::Ext(0x101), OpCode::CheckSigFromChain),
    ("OP_BLAKE2BL",             Wire::Ext(0x103), OpCode::Blake2bl),
    ("OP_BLAKE2BLS",            Wire::Ext(0x104), OpCode::Blake2bls),
    ("OP_BLAKE2BLC",            Wire::Ext(0x105), OpCode::Blake2blc),
    ("OP_DATATOHASH",           Wire::Ext(0x106), OpCode::DataToHash),
    ("OP_MARK",                 Wire::Ext(0x107), OpCode::Mark),
    ("OP_DEPSET",               Wire::Ext(0x108), OpCode::DepSet),
    ("OP_MAKERCOLL",            Wire::Ext(0x109), OpCode::MakerColl),
    ("OP_MONOID",               Wire::Ext(0x10a), OpCode::Monoid),
    ("OP_MONAD",                Wire::Ext(0x10b), OpCode::Monad),
    ("OP_ENDMONAD",             Wire::Ext(0x10c), OpCode::EndMonad),
    ("OP_CALLBACK",             Wire::Ext(0x10d), OpCode::Callback),
    ("OP_X",                    Wire::Ext(0x10e), OpCode::X),
    ("OP_EMERGENCY",            Wire::Ext(0x10f), OpCode::Emergency),
    ("OP_TAKERPAIR",            Wire::Ext(0x110), OpCode::TakerPair),
    ("OP_MINUNITVALUE",         Wire::Ext(0x111), OpCode::MinUnitValue),
    ("OP_PROMISE",              Wire::Ext(0x112), OpCode::Promise),
    ("OP_ENVOUTPOINTVALUE",     Wire::Ext(0x113), OpCode::EnvOutpointValue),
    ("OP_ENVOUTPOINTUNIT",      Wire::Ext(0x114), OpCode::EnvOutpointUnit),
    ("OP_ENVOUTPOINTHASH",      Wire::Ext(0x115), OpCode::EnvOutpointHash),
    ("OP_ENVOUTPOINTNONCE",     Wire::Ext(0x116), OpCode::EnvOutpointNonce),
    ("OP_ENVOUTPOINTLOCKTIME",  Wire::Ext(0x117), OpCode::EnvOutpointLocktime),
    ("OP_CHECKSIGNOPUBKEY",     Wire::Ext(0x118), OpCode::CheckSigNoPubkey),
    ("OP_CHECKSIGNOPUBKEYVERIFY", Wire::Ext(0x119), OpCode::CheckSigNoPubkeyVerify),
    ("OP_CHECKSIGNODATA",       Wire::Ext(0x11a), OpCode::CheckSigNoData),
    ("OP_CHECKSIGNODATAVERIFY", Wire::Ext(0x11b), OpCode::CheckSigNoDataVerify),
];

static NAME_TO_OP: Lazy<FxHashMap<&'static str, OpCode>> = Lazy::new(|| {
    OPERATORS
        .iter()
        .map(|(name, _, op)| (*name, op.clone()))
        .collect()
});

static BYTE_TO_OP: Lazy<FxHashMap<u8, OpCode>> = Lazy::new(|| {
    OPERATORS
        .iter()
        .filter_map(|(_, wire, op)| match wire {
            Wire::Byte(b) => Some((*b, op.clone())),
            Wire::Ext(_) => None,
        })
        .collect()
});

static EXT_TO_OP: Lazy<FxHashMap<u16, OpCode>> = Lazy::new(|| {
    OPERATORS
        .iter()
        .filter_map(|(_, wire, op)| match wire {
            Wire::Ext(v) => Some((*v, op.clone())),
            Wire::Byte(_) => None,
        })
        .collect()
});

static OP_TO_ROW: Lazy<FxHashMap<OpCode, (&'static str, Wire)>> = Lazy::new(|| {
    OPERATORS
        .iter()
        .map(|(name, wire, op)| (op.clone(), (*name, *wire)))
        .collect()
});

/// Opcode encoding error.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("push payload too large ({0} bytes)")]
    PushTooLarge(usize),
}

/// Opcode decoding error.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("I/O error: {0:?}")]
    IoError(#[from] std::io::Error),
    #[error("invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
    #[error("invalid extended opcode {0:#06x}")]
    InvalidExtended(u16),
}

fn read_byte<T: Read>(input: &mut T) -> std::io::Result<u8> {
    let mut z = [0; 1];
    input.read_exact(&mut z)?;
    Ok(z[0])
}

impl OpCode {
    /// The canonical `OP_`-prefixed name of an operator; pushes and
    /// constants have none.
    pub fn name(&self) -> Option<&'static str> {
        OP_TO_ROW.get(self).map(|(name, _)| *name)
    }

    /// Looks an operator up by mnemonic name. Case-insensitive; the `OP_`
    /// prefix is optional. Covers the constant names (`OP_0`..`OP_16`,
    /// `OP_TRUE`, `OP_FALSE`, `OP_1NEGATE`) as well.
    pub fn by_name(name: &str) -> Option<OpCode> {
        let upper = name.to_ascii_uppercase();
        let canon = if upper.starts_with("OP_") {
            upper
        } else {
            format!("OP_{upper}")
        };
        match canon.as_str() {
            "OP_FALSE" => return Some(OpCode::Const(0)),
            "OP_TRUE" => return Some(OpCode::Const(1)),
            "OP_1NEGATE" => return Some(OpCode::Op1Negate),
            _ => {}
        }
        if let Some(n) = canon.strip_prefix("OP_").and_then(|s| s.parse::<u8>().ok()) {
            if n <= 16 {
                return Some(OpCode::Const(n));
            }
        }
        NAME_TO_OP.get(canon.as_str()).cloned()
    }

    /// True for operators whose semantics read the execution environment.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            OpCode::DepSet
                | OpCode::MakerColl
                | OpCode::Monoid
                | OpCode::Monad
                | OpCode::EndMonad
                | OpCode::Callback
                | OpCode::X
                | OpCode::Emergency
                | OpCode::TakerPair
                | OpCode::MinUnitValue
                | OpCode::Promise
                | OpCode::CheckSigNoData
                | OpCode::CheckSigNoDataVerify
                | OpCode::EnvOutpointValue
                | OpCode::EnvOutpointUnit
                | OpCode::EnvOutpointHash
                | OpCode::EnvOutpointNonce
                | OpCode::EnvOutpointLocktime
        )
    }

    /// True for the legacy arithmetic/bitwise operators removed from the
    /// standard set for determinism.
    pub fn is_disabled(&self) -> bool {
        matches!(
            self,
            OpCode::Invert
                | OpCode::And
                | OpCode::Or
                | OpCode::Xor
                | OpCode::Mul2
                | OpCode::Div2
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::LShift
                | OpCode::RShift
        )
    }

    /// True for operators that register cross-chain watch targets.
    pub fn is_marked(&self) -> bool {
        matches!(
            self,
            OpCode::DepSet | OpCode::MakerColl | OpCode::Mark | OpCode::Promise
        )
    }

    /// Serializes the opcode onto `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self {
            OpCode::Push(b) => match b.len() {
                0 => out.push(0x00),
                n if n <= 0x4b => {
                    out.push(n as u8);
                    out.extend_from_slice(b);
                }
                n if n <= 0xff => {
                    out.push(0x4c);
                    out.push(n as u8);
                    out.extend_from_slice(b);
                }
                n if n <= 0xffff => {
                    out.push(0x4d);
                    out.extend_from_slice(&(n as u16).to_le_bytes());
                    out.extend_from_slice(b);
                }
                n if n <= u32::MAX as usize => {
                    out.push(0x4e);
                    out.extend_from_slice(&(n as u32).to_le_bytes());
                    out.extend_from_slice(b);
                }
                n => return Err(EncodeError::PushTooLarge(n)),
            },
            OpCode::Const(n) => {
                debug_assert!(*n <= 16);
                if *n == 0 {
                    out.push(0x00);
                } else {
                    out.push(0x50 + n);
                }
            }
            OpCode::Op1Negate => out.push(0x4f),
            op => {
                // constructed opcodes always sit in the operator table
                let (_, wire) = OP_TO_ROW[op];
                match wire {
                    Wire::Byte(b) => out.push(b),
                    Wire::Ext(v) => {
                        out.push(EXTENDED_ESCAPE);
                        out.extend_from_slice(&v.to_be_bytes());
                    }
                }
            }
        }
        Ok(())
    }

    /// Decodes one opcode from an input.
    pub fn decode<T: Read>(input: &mut T) -> Result<Self, DecodeError> {
        let read_push = |input: &mut T, len: usize| -> Result<OpCode, DecodeError> {
            let mut payload = vec![0u8; len];
            input.read_exact(&mut payload)?;
            Ok(OpCode::Push(Bytes::from(payload)))
        };
        match read_byte(input)? {
            0x00 => Ok(OpCode::Const(0)),
            b @ 0x01..=0x4b => read_push(input, b as usize),
            0x4c => {
                let len = read_byte(input)? as usize;
                read_push(input, len)
            }
            0x4d => {
                let mut z = [0; 2];
                input.read_exact(&mut z)?;
                read_push(input, u16::from_le_bytes(z) as usize)
            }
            0x4e => {
                let mut z = [0; 4];
                input.read_exact(&mut z)?;
                read_push(input, u32::from_le_bytes(z) as usize)
            }
            0x4f => Ok(OpCode::Op1Negate),
            b @ 0x51..=0x60 => Ok(OpCode::Const(b - 0x50)),
            EXTENDED_ESCAPE => {
                let mut z = [0; 2];
                input.read_exact(&mut z)?;
                let v = u16::from_be_bytes(z);
                EXT_TO_OP
                    .get(&v)
                    .cloned()
                    .ok_or(DecodeError::InvalidExtended(v))
            }
            b => BYTE_TO_OP.get(&b).cloned().ok_or(DecodeError::InvalidOpcode(b)),
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpCode::Push(b) => write!(f, "0x{}", hex::encode(b)),
            OpCode::Const(n) => write!(f, "OP_{n}"),
            OpCode::Op1Negate => write!(f, "OP_1NEGATE"),
            op => write!(f, "{}", op.name().unwrap_or("OP_INVALIDOPCODE")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(op: OpCode) {
        let mut raw = Vec::new();
        op.encode(&mut raw).unwrap();
        let decoded = OpCode::decode(&mut raw.as_slice()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn operators_round_trip() {
        for (_, _, op) in OPERATORS {
            round_trip(op.clone());
        }
    }

    #[test]
    fn pushes_and_constants_round_trip() {
        round_trip(OpCode::Push(Bytes::from(vec![0xab; 20])));
        round_trip(OpCode::Push(Bytes::from(vec![0xcd; 300])));
        round_trip(OpCode::Op1Negate);
        for n in 0..=16 {
            round_trip(OpCode::Const(n));
        }
    }

    #[test]
    fn names_resolve_case_insensitively() {
        assert_eq!(OpCode::by_name("OP_DUP"), Some(OpCode::Dup));
        assert_eq!(OpCode::by_name("dup"), Some(OpCode::Dup));
        assert_eq!(OpCode::by_name("op_makercoll"), Some(OpCode::MakerColl));
        assert_eq!(OpCode::by_name("OP_TRUE"), Some(OpCode::Const(1)));
        assert_eq!(OpCode::by_name("OP_BOGUS"), None);
    }

    #[test]
    fn unknown_bytes_are_rejected() {
        assert!(matches!(
            OpCode::decode(&mut [0xefu8].as_slice()),
            Err(DecodeError::InvalidOpcode(0xef))
        ));
        assert!(matches!(
            OpCode::decode(&mut [0xfdu8, 0x0f, 0xff].as_slice()),
            Err(DecodeError::InvalidExtended(0x0fff))
        ));
    }

    #[test]
    fn settlement_opcodes_use_the_escape_byte() {
        let mut raw = Vec::new();
        OpCode::DepSet.encode(&mut raw).unwrap();
        assert_eq!(raw, vec![EXTENDED_ESCAPE, 0x01, 0x08]);
    }
}
