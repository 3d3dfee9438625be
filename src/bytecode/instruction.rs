//! Bytecode instruction definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opcodes for the bytecode virtual machine.
///
/// Every instruction carries a single integer operand; the comment on each opcode
/// says what it means for that opcode. "name" operands index a string constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// Do nothing.
    Nop,

    // ============ Constants & Stack ============
    /// Push a constant: LOAD_CONST <const_index>
    LoadConst,
    /// Push undef
    LoadUndef,
    /// Push null
    LoadNull,
    /// Push true
    LoadTrue,
    /// Push false
    LoadFalse,
    /// Pop the top value
    Pop,
    /// Duplicate the top value
    Dup,
    /// Swap the two topmost values
    Swap,

    // ============ Variables ============
    /// Read a variable of the current frame: LOAD_NAME <name>
    LoadName,
    /// Read a free variable (frame, module frame, global frame): LOAD_GLOBAL <name>
    LoadGlobal,
    /// Write a variable of the current frame: STORE_NAME <name>
    StoreName,
    /// Write a variable of the declaring module's frame: STORE_GLOBAL <name>
    StoreGlobal,

    // ============ Arithmetic ============
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,

    // ============ Comparison & Logic ============
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    /// item container -> bool
    Contains,

    // ============ Construction ============
    /// Join N values into a string: CONCAT <count>
    Concat,
    /// Build an array from N values: MAKE_ARRAY <count>
    MakeArray,
    /// Build an assoc array from N key/value pairs: MAKE_DICT <pair_count>
    MakeDict,
    /// Bind a code object into a callable: MAKE_FUNCTION <has_defaults>
    MakeFunction,
    /// Declare a class: MAKE_CLASS <has_base>
    MakeClass,

    // ============ Access ============
    /// target key -> value
    GetItem,
    /// target key value ->
    SetItem,
    /// target -> value: GET_ATTR <name>
    GetAttr,
    /// target value ->: SET_ATTR <name>
    SetAttr,
    /// target start end -> value
    Slice,

    // ============ Control Flow ============
    /// Absolute jump: JUMP <target>
    Jump,
    /// Pop, jump if falsy: JUMP_IF_FALSE <target>
    JumpIfFalse,
    /// Pop, jump if truthy: JUMP_IF_TRUE <target>
    JumpIfTrue,
    /// Jump keeping the value if falsy, else pop: JUMP_IF_FALSE_OR_POP <target>
    JumpIfFalseOrPop,
    /// Jump keeping the value if truthy, else pop: JUMP_IF_TRUE_OR_POP <target>
    JumpIfTrueOrPop,

    // ============ Iteration ============
    /// iterable -> range
    GetIter,
    /// Push the next item, or pop the range and jump: FOR_ITER <target>
    ForIter,

    // ============ Calls ============
    /// Call the callee on top of the stack: CALL <call_spec>
    Call,
    /// Return the top of the stack
    Return,
    /// Import a module: IMPORT <name>
    Import,
    /// Suspend on an async result: AWAIT <0 strict | 1 settle>
    Await,
}

impl OpCode {
    /// Whether the operand is an absolute instruction index.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::JumpIfTrue
                | OpCode::JumpIfFalseOrPop
                | OpCode::JumpIfTrueOrPop
                | OpCode::ForIter
        )
    }

    /// Whether the operand indexes the constant pool.
    pub fn uses_constant(self) -> bool {
        matches!(
            self,
            OpCode::LoadConst
                | OpCode::LoadName
                | OpCode::LoadGlobal
                | OpCode::StoreName
                | OpCode::StoreGlobal
                | OpCode::GetAttr
                | OpCode::SetAttr
                | OpCode::Import
        )
    }
}

/// A single instruction: an opcode and one integer operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    #[serde(default)]
    pub arg: i32,
}

impl Instruction {
    pub fn new(op: OpCode, arg: i32) -> Self {
        Self { op, arg }
    }

    /// An instruction whose operand is unused.
    pub fn bare(op: OpCode) -> Self {
        Self { op, arg: 0 }
    }

    /// Operand as an index (constant pool slot, jump target, element count).
    pub fn index(&self) -> Option<usize> {
        usize::try_from(self.arg).ok()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.op, self.arg)
    }
}

/// Shape of one call site, packed into the `Call` operand.
///
/// Bit 0 flags a keyword dictionary on the stack; the positional argument
/// count occupies the remaining bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSpec(i32);

impl CallSpec {
    pub fn new(positional: usize, has_keyword_dict: bool) -> Self {
        Self(((positional as i32) << 1) | has_keyword_dict as i32)
    }

    pub fn from_operand(arg: i32) -> Self {
        Self(arg)
    }

    pub fn positional(self) -> usize {
        (self.0 >> 1).max(0) as usize
    }

    pub fn has_keyword_dict(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn operand(self) -> i32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_spec_packing() {
        let spec = CallSpec::new(3, true);
        assert_eq!(spec.operand(), 7);
        assert_eq!(spec.positional(), 3);
        assert!(spec.has_keyword_dict());

        let spec = CallSpec::from_operand(4);
        assert_eq!(spec.positional(), 2);
        assert!(!spec.has_keyword_dict());
    }

    #[test]
    fn test_call_spec_zero() {
        let spec = CallSpec::new(0, false);
        assert_eq!(spec.operand(), 0);
        assert_eq!(spec.positional(), 0);
    }

    #[test]
    fn test_instruction_json_shape() {
        let ins: Instruction = serde_json::from_str(r#"{"op":"LoadConst","arg":2}"#).unwrap();
        assert_eq!(ins, Instruction::new(OpCode::LoadConst, 2));

        let ins: Instruction = serde_json::from_str(r#"{"op":"Return"}"#).unwrap();
        assert_eq!(ins, Instruction::bare(OpCode::Return));
    }

    #[test]
    fn test_negative_operand_is_not_an_index() {
        assert_eq!(Instruction::new(OpCode::Jump, -1).index(), None);
        assert_eq!(Instruction::new(OpCode::Jump, 5).index(), Some(5));
    }

    #[test]
    fn test_operand_classes() {
        assert!(OpCode::ForIter.is_jump());
        assert!(!OpCode::Call.is_jump());
        assert!(OpCode::Import.uses_constant());
        assert!(!OpCode::MakeArray.uses_constant());
    }
}
