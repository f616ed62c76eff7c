use crate::error::ScriptError;
use crate::value::Value;

/// Bounds on a multi-item pop.
pub const POPN_MIN: usize = 2;
pub const POPN_MAX: usize = 128;

/// The execution stack.
///
/// Items live on the stack in their serialized radix form; `push`
/// serializes and `pop`/`peek` deserialize, so operators always work on
/// [Value]s and never mutate the encoded form in place.
#[derive(Clone, Debug, Default)]
pub struct ScriptStack {
    items: Vec<String>,
}

impl ScriptStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, v: Value) {
        self.items.push(v.serialize());
    }

    pub fn pop(&mut self) -> Result<Value, ScriptError> {
        let raw = self.items.pop().ok_or(ScriptError::StackUnderflow {
            needed: 1,
            depth: 0,
        })?;
        // only `push` writes items, so the stored form always parses
        Value::deserialize(&raw).ok_or_else(|| ScriptError::BadOpcode(raw))
    }

    pub fn peek(&self) -> Result<Value, ScriptError> {
        let raw = self.items.last().ok_or(ScriptError::StackUnderflow {
            needed: 1,
            depth: 0,
        })?;
        Value::deserialize(raw).ok_or_else(|| ScriptError::BadOpcode(raw.clone()))
    }

    /// Pops `n` values at once; index 0 of the result is the former top.
    pub fn popn(&mut self, n: usize) -> Result<Vec<Value>, ScriptError> {
        debug_assert!((POPN_MIN..=POPN_MAX).contains(&n));
        if self.items.len() < n {
            return Err(ScriptError::StackUnderflow {
                needed: n,
                depth: self.items.len(),
            });
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.pop()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_is_lifo() {
        let mut s = ScriptStack::new();
        s.push(Value::from(1u64));
        s.push(Value::from(2u64));
        assert_eq!(s.pop().unwrap(), Value::from(2u64));
        assert_eq!(s.pop().unwrap(), Value::from(1u64));
    }

    #[test]
    fn pop_empty_is_underflow() {
        let mut s = ScriptStack::new();
        assert!(matches!(
            s.pop(),
            Err(ScriptError::StackUnderflow { needed: 1, .. })
        ));
    }

    #[test]
    fn popn_returns_top_first() {
        let mut s = ScriptStack::new();
        for i in 1..=3u64 {
            s.push(Value::from(i));
        }
        let got = s.popn(3).unwrap();
        assert_eq!(
            got,
            vec![Value::from(3u64), Value::from(2u64), Value::from(1u64)]
        );
    }

    #[test]
    fn popn_short_stack_is_underflow() {
        let mut s = ScriptStack::new();
        s.push(Value::from(1u64));
        assert!(matches!(
            s.popn(3),
            Err(ScriptError::StackUnderflow { needed: 3, depth: 1 })
        ));
    }
}
