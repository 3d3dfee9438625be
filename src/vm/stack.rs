//! Block-partitioned operand stack.

use crate::error::RuntimeError;
use crate::value::Value;

/// One stack of values split into nested blocks.
///
/// Every frame owns exactly one block. All operations except `open_block` and
/// `close_block` are relative to the innermost block, so a callee can neither
/// see nor disturb its caller's operands.
#[derive(Debug, Default)]
pub struct OperandStack {
    values: Vec<Value>,
    /// Start offset of each open block, innermost last.
    blocks: Vec<usize>,
}

impl OperandStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            blocks: Vec::with_capacity(64),
        }
    }

    #[inline]
    fn base(&self) -> usize {
        self.blocks.last().copied().unwrap_or(0)
    }

    pub fn open_block(&mut self) {
        self.blocks.push(self.values.len());
    }

    /// Drop everything above the innermost boundary, then the boundary itself.
    pub fn close_block(&mut self) -> Result<(), RuntimeError> {
        let base = self
            .blocks
            .pop()
            .ok_or_else(|| RuntimeError::internal("close_block without an open block"))?;
        self.values.truncate(base);
        Ok(())
    }

    /// Discard the values of the innermost block, keeping the block open.
    pub fn clear_block(&mut self) {
        let base = self.base();
        self.values.truncate(base);
    }

    /// Number of values in the innermost block.
    #[inline]
    pub fn length(&self) -> usize {
        self.values.len() - self.base()
    }

    /// Number of open blocks.
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Number of values across all blocks.
    pub fn total_len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        if self.length() == 0 {
            return Err(RuntimeError::internal("pop from an empty stack block"));
        }
        self.values
            .pop()
            .ok_or_else(|| RuntimeError::internal("pop from an empty stack"))
    }

    /// Pop `n` values, returned in push order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if n > self.length() {
            return Err(RuntimeError::internal(format!(
                "pop of {} values from a block of {}",
                n,
                self.length()
            )));
        }
        let at = self.values.len() - n;
        Ok(self.values.split_off(at))
    }

    /// Value `distance` slots below the top of the block (0 = top).
    pub fn peek_back(&self, distance: usize) -> Result<&Value, RuntimeError> {
        if distance >= self.length() {
            return Err(RuntimeError::internal(format!(
                "peek {} below the top of a block of {}",
                distance,
                self.length()
            )));
        }
        Ok(&self.values[self.values.len() - 1 - distance])
    }

    fn check_index(&self, index: usize) -> Result<usize, RuntimeError> {
        if index >= self.length() {
            return Err(RuntimeError::internal(format!(
                "stack index {} outside a block of {}",
                index,
                self.length()
            )));
        }
        Ok(self.base() + index)
    }

    /// Value at `index` counted from the bottom of the block.
    pub fn at(&self, index: usize) -> Result<&Value, RuntimeError> {
        let slot = self.check_index(index)?;
        Ok(&self.values[slot])
    }

    pub fn set_at(&mut self, index: usize, value: Value) -> Result<(), RuntimeError> {
        let slot = self.check_index(index)?;
        self.values[slot] = value;
        Ok(())
    }

    /// Values of the innermost block, bottom first.
    pub fn block(&self) -> &[Value] {
        &self.values[self.base()..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_relative_length() {
        let mut stack = OperandStack::new();
        stack.push(Value::Int(1));
        stack.open_block();
        assert_eq!(stack.length(), 0);
        stack.push(Value::Int(2));
        assert_eq!(stack.length(), 1);
        assert_eq!(stack.total_len(), 2);
    }

    #[test]
    fn test_close_block_discards_leftovers() {
        let mut stack = OperandStack::new();
        stack.push(Value::Int(1));
        stack.open_block();
        stack.push(Value::Int(2));
        stack.push(Value::Int(3));
        stack.close_block().unwrap();
        assert_eq!(stack.length(), 1);
        assert_eq!(stack.peek_back(0).unwrap().as_int().unwrap(), 1);
    }

    #[test]
    fn test_close_block_restores_length_for_any_sequence() {
        for pushes in 0..5 {
            for pops in 0..=pushes {
                let mut stack = OperandStack::new();
                stack.push(Value::Null);
                stack.open_block();
                stack.push(Value::Int(0));
                let after_open = stack.total_len() - 1;
                stack.open_block();
                for i in 0..pushes {
                    stack.push(Value::Int(i));
                }
                for _ in 0..pops {
                    stack.pop().unwrap();
                }
                stack.close_block().unwrap();
                assert_eq!(stack.total_len(), after_open + 1);
                assert_eq!(stack.length(), 1);
            }
        }
    }

    #[test]
    fn test_pop_cannot_cross_block_boundary() {
        let mut stack = OperandStack::new();
        stack.push(Value::Int(1));
        stack.open_block();
        let err = stack.pop().unwrap_err();
        assert!(err.is_internal());
        assert!(stack.peek_back(0).is_err());
    }

    #[test]
    fn test_pop_n_preserves_order() {
        let mut stack = OperandStack::new();
        stack.open_block();
        for i in 1..=3 {
            stack.push(Value::Int(i));
        }
        let values = stack.pop_n(2).unwrap();
        let ints: Vec<i64> = values.iter().map(|v| v.as_int().unwrap()).collect();
        assert_eq!(ints, vec![2, 3]);
        assert!(stack.pop_n(2).is_err());
    }

    #[test]
    fn test_at_and_set_at_are_block_relative() {
        let mut stack = OperandStack::new();
        stack.push(Value::Int(99));
        stack.open_block();
        stack.push(Value::Int(1));
        stack.push(Value::Int(2));
        assert_eq!(stack.at(0).unwrap().as_int().unwrap(), 1);
        stack.set_at(1, Value::Int(5)).unwrap();
        assert_eq!(stack.peek_back(0).unwrap().as_int().unwrap(), 5);
        assert!(stack.at(2).is_err());
        assert!(stack.set_at(2, Value::Null).is_err());
    }

    #[test]
    fn test_close_without_open_is_internal() {
        let mut stack = OperandStack::new();
        assert!(stack.close_block().unwrap_err().is_internal());
    }
}
