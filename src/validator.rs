use num::BigInt;

use crate::opcode::OpCode;
use crate::script::Script;
use crate::value::Value;

/// A marked opcode found by the pre-execution scan, together with the
/// push arguments that immediately precede it ("tray" order: first pushed
/// first).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkedOp {
    pub opcode: OpCode,
    pub args: Vec<Value>,
}

fn push_value(op: &OpCode) -> Option<Value> {
    match op {
        OpCode::Push(b) => Some(Value::from_bytes(b)),
        OpCode::Const(n) => Some(Value::from(*n as u64)),
        OpCode::Op1Negate => Some(Value(BigInt::from(-1))),
        _ => None,
    }
}

/// The first permanently disabled opcode in the script, if any. Execution
/// refuses to run such a script unless the caller opts into lenient mode.
pub fn disabled_opcode(script: &Script) -> Option<&OpCode> {
    script.ops().iter().find(|op| op.is_disabled())
}

pub fn includes_disabled_opcode(script: &Script) -> bool {
    disabled_opcode(script).is_some()
}

/// The first environment-dependent opcode; `None` means the script can be
/// executed without resolving an environment.
pub fn first_async_opcode(script: &Script) -> Option<&OpCode> {
    script.ops().iter().find(|op| op.is_async())
}

pub fn includes_callback(script: &Script) -> bool {
    script.contains(&OpCode::Callback)
}

/// Scans for marked opcodes. The tray resets at every operator, so each
/// marked opcode captures exactly the pushes directly in front of it.
pub fn marked_opcodes(script: &Script) -> Vec<MarkedOp> {
    let mut found = Vec::new();
    let mut tray: Vec<Value> = Vec::new();
    for op in script.ops() {
        if let Some(v) = push_value(op) {
            tray.push(v);
        } else {
            if op.is_marked() {
                found.push(MarkedOp {
                    opcode: op.clone(),
                    args: tray.clone(),
                });
            }
            tray.clear();
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_disabled_opcodes() {
        let script = Script::parse("1 2 OP_MUL").unwrap();
        assert_eq!(disabled_opcode(&script), Some(&OpCode::Mul));
        let clean = Script::parse("1 2 OP_ADD").unwrap();
        assert_eq!(disabled_opcode(&clean), None);
    }

    #[test]
    fn finds_the_first_async_opcode() {
        let script = Script::parse("OP_DUP OP_MAKERCOLL OP_DEPSET").unwrap();
        assert_eq!(first_async_opcode(&script), Some(&OpCode::MakerColl));
        let sync = Script::parse("OP_DUP OP_HASH160 OP_EQUAL").unwrap();
        assert_eq!(first_async_opcode(&sync), None);
    }

    #[test]
    fn tray_scan_captures_preceding_pushes_only() {
        let script = Script::parse("5 10 20 OP_DEPSET 3 OP_DROP 'addr' 'eth' 99 OP_MARK").unwrap();
        let marked = marked_opcodes(&script);
        assert_eq!(marked.len(), 2);
        assert_eq!(marked[0].opcode, OpCode::DepSet);
        assert_eq!(
            marked[0].args,
            vec![Value::from(5u64), Value::from(10u64), Value::from(20u64)]
        );
        assert_eq!(marked[1].opcode, OpCode::Mark);
        assert_eq!(
            marked[1].args,
            vec![
                Value::from_bytes(b"addr"),
                Value::from_bytes(b"eth"),
                Value::from(99u64)
            ]
        );
    }
}
