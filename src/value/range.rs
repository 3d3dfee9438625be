//! Iteration source produced by `GetIter` and the `range` builtin.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::value::Value;

const PREALLOC_LIMIT: usize = 4096;

#[derive(Debug)]
enum Cursor {
    Ints { next: i64, stop: i64, step: i64 },
    Items { items: Vec<Value>, pos: usize },
}

/// A forward-only sequence of values.
///
/// Container ranges iterate over a snapshot taken when the range was created,
/// so mutating the container inside a loop body does not disturb iteration.
#[derive(Debug)]
pub struct DataRange {
    cursor: RefCell<Cursor>,
}

impl DataRange {
    /// Integers from `start` towards `stop` (exclusive).
    pub fn ints(start: i64, stop: i64, step: i64) -> Result<Self, RuntimeError> {
        if step == 0 {
            return Err(RuntimeError::new("range step cannot be zero"));
        }
        Ok(Self {
            cursor: RefCell::new(Cursor::Ints {
                next: start,
                stop,
                step,
            }),
        })
    }

    pub fn items(items: Vec<Value>) -> Self {
        Self {
            cursor: RefCell::new(Cursor::Items { items, pos: 0 }),
        }
    }

    /// Range over an iterable value: array items, assoc array keys,
    /// string characters, or whatever a class node yields.
    pub fn over(value: &Value) -> Result<Rc<DataRange>, RuntimeError> {
        match value {
            Value::Range(range) => Ok(range.clone()),
            Value::Array(arr) => Ok(Rc::new(Self::items(arr.borrow().clone()))),
            Value::AssocArray(map) => Ok(Rc::new(Self::items(
                map.borrow().keys().map(|k| Value::String(k.clone())).collect(),
            ))),
            Value::String(s) => Ok(Rc::new(Self::items(
                s.chars().map(|c| Value::String(c.to_string())).collect(),
            ))),
            Value::ClassNode(node) => Ok(Rc::new(node.range()?)),
            Value::Undef | Value::Null => Ok(Rc::new(Self::items(Vec::new()))),
            other => Err(RuntimeError::type_mismatch("iterable", other.type_name())),
        }
    }

    pub fn next_value(&self) -> Option<Value> {
        let mut cursor = self.cursor.borrow_mut();
        match &mut *cursor {
            Cursor::Ints { next, stop, step } => {
                let done = if *step > 0 { *next >= *stop } else { *next <= *stop };
                if done {
                    return None;
                }
                let current = *next;
                *next = next.saturating_add(*step);
                Some(Value::Int(current))
            }
            Cursor::Items { items, pos } => {
                let item = items.get(*pos).cloned()?;
                *pos += 1;
                Some(item)
            }
        }
    }

    pub fn remaining(&self) -> usize {
        match &*self.cursor.borrow() {
            Cursor::Ints { next, stop, step } => {
                // i128 holds any i64 span without overflow.
                let (next, stop, step) = (*next as i128, *stop as i128, *step as i128);
                let span = if step > 0 { stop - next } else { next - stop };
                if span <= 0 {
                    0
                } else {
                    let step = step.abs();
                    usize::try_from((span + step - 1) / step).unwrap_or(usize::MAX)
                }
            }
            Cursor::Items { items, pos } => items.len().saturating_sub(*pos),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Drain the rest of the range into an array value.
    pub fn collect(&self) -> Value {
        let mut out = Vec::with_capacity(self.remaining().min(PREALLOC_LIMIT));
        while let Some(item) = self.next_value() {
            out.push(item);
        }
        Value::array(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(range: &DataRange) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(v) = range.next_value() {
            out.push(v.as_int().unwrap());
        }
        out
    }

    #[test]
    fn test_int_range() {
        let range = DataRange::ints(0, 5, 2).unwrap();
        assert_eq!(range.remaining(), 3);
        assert_eq!(drain(&range), vec![0, 2, 4]);
        assert!(range.is_empty());
    }

    #[test]
    fn test_descending_range() {
        let range = DataRange::ints(3, 0, -1).unwrap();
        assert_eq!(range.remaining(), 3);
        assert_eq!(drain(&range), vec![3, 2, 1]);
    }

    #[test]
    fn test_length_of_extreme_ranges() {
        let range = DataRange::ints(0, i64::MAX, 2).unwrap();
        assert_eq!(range.remaining(), (i64::MAX as usize + 1) / 2);
        assert!(!range.is_empty());

        let range = DataRange::ints(i64::MAX, i64::MIN, i64::MIN).unwrap();
        assert_eq!(range.remaining(), 2);
        assert_eq!(drain(&range), vec![i64::MAX, -1]);

        let range = DataRange::ints(i64::MIN, i64::MAX, 1).unwrap();
        assert_eq!(range.remaining(), usize::MAX);
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(DataRange::ints(0, 1, 0).is_err());
    }

    #[test]
    fn test_array_snapshot() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let range = DataRange::over(&arr).unwrap();
        arr.as_array().unwrap().borrow_mut().push(Value::Int(3));
        assert_eq!(drain(&range), vec![1, 2]);
    }

    #[test]
    fn test_dict_yields_keys() {
        let mut map = indexmap::IndexMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert("b".to_string(), Value::Int(2));
        let range = DataRange::over(&Value::dict(map)).unwrap();
        assert_eq!(range.next_value().unwrap().as_str().unwrap(), "a");
        assert_eq!(range.next_value().unwrap().as_str().unwrap(), "b");
        assert!(range.next_value().is_none());
    }

    #[test]
    fn test_not_iterable() {
        assert!(DataRange::over(&Value::Int(3)).is_err());
    }
}
