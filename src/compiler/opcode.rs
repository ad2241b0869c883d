// Lunar Bytecode Instructions

use std::fmt;

/// Bytecode operation codes
///
/// Stack effects are written `[before] -> [after]`, top of stack last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Nop,
    /// Pop `num_val` values
    Pop,
    /// Push the constant in `value`
    Literal,
    /// Create a closure entering at `num_val`, capturing `symbols`
    Closure,
    /// [] -> [table]
    NewTable,
    /// [t, k, v] -> [t]
    TblInitN,
    /// [t, v] -> [t]; positional field `num_val`, `num_val2` = expand a final multi-value
    TblInitI,

    // Variables. Store-style ops read their value `num_val` below the top
    // (before popping their own operands), taking element `num_val2` of a multi-value
    Local,
    StoreLcl,
    /// Declares a local: a captured slot gets a fresh cell
    DefLcl,
    Upvalue,
    StoreUpv,
    GetGlobal,
    SetGlobal,
    /// Push the chunk environment table
    Env,

    // Indexing
    /// [obj, key] -> [value]
    Index,
    /// [obj] -> [value], key in `value`
    IndexN,
    /// [obj, key] -> []
    IndexSet,
    /// [obj] -> [], key in `value`
    IndexSetN,
    /// [obj] -> [f, obj], method name in `value`
    Method,

    // Functions
    /// Function prologue: `num_val` slots, `num_val2` parameters, slot layout in `symbols`
    BeginFn,
    /// [f, args...] -> [results]; `num_val` args, `num_val2` = tail call
    Call,
    /// Return; `num_val` = 0 (no values) or 1 (top of stack)
    Ret,

    // Jumps
    Jump,
    /// Pop, jump when falsy
    Jf,
    /// `or`: jump keeping the value when truthy, else pop
    JtOrPop,
    /// `and`: jump keeping the value when falsy, else pop
    JfOrPop,

    // Operators
    Concat,
    /// `num_val` = 1 negates (`~=`)
    Eq,
    /// `num_val` = 1 swaps operands (`>`)
    Less,
    /// `num_val` = 1 swaps operands (`>=`)
    LessEq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Power,
    FloorDiv,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    Neg,
    BitNot,
    Not,
    Len,

    // Multiple values
    /// Pack `num_val` values into one multi-value
    MkTuple,
    /// Truncate the top to a single value
    Scalar,
    /// Coerce the top to a number for a numeric for; `num_val` names the operand
    ToNum,

    // Blocks
    /// Enter a block owning slots `num_val..num_val2`
    Enter,
    /// Leave the innermost block, closing its `<close>` variables
    Leave,
    /// Leave `num_val` blocks (break / goto)
    Exit,
    /// Register slot `num_val` as a to-be-closed variable
    MarkClose,

    // Loops
    /// Validate the numeric-for control slots starting at `num_val`
    ForPrep,
    /// Jump to `num_val` when the counter in slot `num_val2` is past the limit
    JFor,
    /// Advance the counter in slot `num_val`
    Incr,
    /// [explist] -> []; store iterator, state and control in slots from `num_val`
    IterPrep,
    /// [results] -> [results] or jump to `num_val` (popping) when the first is nil;
    /// the control slot is `num_val2`
    IterUpd,

    Invalid,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{:?}", self).to_uppercase();
        f.pad(&name)
    }
}
