// Lunar Statement AST Nodes

use super::expr::Expr;
use crate::error::Span;
use crate::scope::{FrameLayout, RuntimeBlock, SymbolRef};

/// A lexical block with the runtime slot range it owns
#[derive(Debug, Clone)]
pub struct Block {
    pub statements: Vec<Stmt>,
    pub scope: RuntimeBlock,
    pub span: Span,
}

/// A function body together with its resolved frame layout
#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub name: String,
    pub params: Vec<SymbolRef>,
    /// Slot holding `...` for vararg functions
    pub varargs: Option<SymbolRef>,
    pub body: Block,
    pub layout: FrameLayout,
    pub span: Span,
}

/// A compiled-unit root: the main function of a chunk
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    pub main: FunctionBody,
}

/// Statement nodes
#[derive(Debug, Clone)]
pub enum Stmt {
    /// local a, b <const> = 1, 2
    Local {
        targets: Vec<SymbolRef>,
        values: Vec<Expr>,
        span: Span,
    },

    /// local function f() end
    LocalFunction {
        symbol: SymbolRef,
        body: Box<FunctionBody>,
        span: Span,
    },

    /// function a.b:c() end (target is the assignable path)
    Function {
        target: Expr,
        body: Box<FunctionBody>,
        span: Span,
    },

    /// a, t[k] = 1, 2
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
        span: Span,
    },

    /// A function call used as a statement
    Call { call: Expr, span: Span },

    /// do ... end
    Do { block: Block, span: Span },

    While {
        condition: Expr,
        body: Block,
        span: Span,
    },

    /// repeat ... until cond (cond sees the body's locals)
    Repeat {
        body: Block,
        condition: Expr,
        span: Span,
    },

    If {
        clauses: Vec<(Expr, Block)>,
        else_block: Option<Block>,
        span: Span,
    },

    /// for v = start, limit, step do ... end
    NumericFor {
        /// Hidden slots holding the snapshotted counter, limit and step
        control: [SymbolRef; 3],
        variable: SymbolRef,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        /// Block owning the hidden control slots
        loop_scope: RuntimeBlock,
        body: Block,
        span: Span,
    },

    /// for k, v in explist do ... end
    GenericFor {
        /// Hidden slots holding the iterator function, state and control value
        control: [SymbolRef; 3],
        variables: Vec<SymbolRef>,
        exprs: Vec<Expr>,
        loop_scope: RuntimeBlock,
        body: Block,
        span: Span,
    },

    Return { values: Vec<Expr>, span: Span },

    /// break, with the number of runtime blocks it leaves inside the loop
    Break { exits: usize, span: Span },

    /// goto label; `id` indexes the frame layout's goto table
    Goto { label: String, id: usize, span: Span },

    /// ::label::
    Label { name: String, id: usize, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Local { span, .. }
            | Stmt::LocalFunction { span, .. }
            | Stmt::Function { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::Call { span, .. }
            | Stmt::Do { span, .. }
            | Stmt::While { span, .. }
            | Stmt::Repeat { span, .. }
            | Stmt::If { span, .. }
            | Stmt::NumericFor { span, .. }
            | Stmt::GenericFor { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Break { span, .. }
            | Stmt::Goto { span, .. }
            | Stmt::Label { span, .. } => *span,
        }
    }
}
