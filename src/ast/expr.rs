// Lunar Expression AST Nodes

use super::stmt::FunctionBody;
use crate::error::Span;
use crate::lexer::TokenKind;
use crate::scope::SymbolRef;

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Concat,
    // Comparison
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    // Logical
    And,
    Or,
    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
}

impl BinaryOp {
    pub fn from_token(kind: &TokenKind) -> Option<Self> {
        match kind {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::SlashSlash => Some(BinaryOp::FloorDiv),
            TokenKind::Percent => Some(BinaryOp::Mod),
            TokenKind::Caret => Some(BinaryOp::Pow),
            TokenKind::DotDot => Some(BinaryOp::Concat),
            TokenKind::EqualEqual => Some(BinaryOp::Equal),
            TokenKind::TildeEqual => Some(BinaryOp::NotEqual),
            TokenKind::Less => Some(BinaryOp::Less),
            TokenKind::LessEqual => Some(BinaryOp::LessEqual),
            TokenKind::Greater => Some(BinaryOp::Greater),
            TokenKind::GreaterEqual => Some(BinaryOp::GreaterEqual),
            TokenKind::And => Some(BinaryOp::And),
            TokenKind::Or => Some(BinaryOp::Or),
            TokenKind::Ampersand => Some(BinaryOp::BitAnd),
            TokenKind::Pipe => Some(BinaryOp::BitOr),
            TokenKind::Tilde => Some(BinaryOp::BitXor),
            TokenKind::LessLess => Some(BinaryOp::ShiftLeft),
            TokenKind::GreaterGreater => Some(BinaryOp::ShiftRight),
            _ => None,
        }
    }

    /// Left and right binding power, following the reference operator table
    pub fn precedence(self) -> (u8, u8) {
        match self {
            BinaryOp::Or => (1, 1),
            BinaryOp::And => (2, 2),
            BinaryOp::Less
            | BinaryOp::LessEqual
            | BinaryOp::Greater
            | BinaryOp::GreaterEqual
            | BinaryOp::Equal
            | BinaryOp::NotEqual => (3, 3),
            BinaryOp::BitOr => (4, 4),
            BinaryOp::BitXor => (5, 5),
            BinaryOp::BitAnd => (6, 6),
            BinaryOp::ShiftLeft | BinaryOp::ShiftRight => (7, 7),
            // right associative
            BinaryOp::Concat => (9, 8),
            BinaryOp::Add | BinaryOp::Sub => (10, 10),
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod => (11, 11),
            // right associative, binds tighter than unary operators
            BinaryOp::Pow => (14, 13),
        }
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor
                | BinaryOp::ShiftLeft
                | BinaryOp::ShiftRight
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Concat => "..",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "~=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "~",
            BinaryOp::ShiftLeft => "<<",
            BinaryOp::ShiftRight => ">>",
        }
    }
}

/// Priority of unary operators (between `*` and `^`)
pub const UNARY_PRIORITY: u8 = 12;

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate, // -
    Not,    // not
    Length, // #
    BitNot, // ~
}

impl UnaryOp {
    pub fn from_token(kind: &TokenKind) -> Option<Self> {
        match kind {
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Hash => Some(UnaryOp::Length),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Negate => "-",
            UnaryOp::Not => "not",
            UnaryOp::Length => "#",
            UnaryOp::BitNot => "~",
        }
    }
}

/// One entry of a table constructor
#[derive(Debug, Clone)]
pub enum TableField {
    /// `expr` (array part, numbered from 1)
    Positional(Expr),
    /// `name = expr` or `[key] = expr`
    Keyed { key: Expr, value: Expr },
}

/// Expression nodes
#[derive(Debug, Clone)]
pub enum Expr {
    Nil { span: Span },
    Boolean { value: bool, span: Span },
    Integer { value: i64, span: Span },
    Float { value: f64, span: Span },
    String { value: Vec<u8>, span: Span },

    /// `...` inside a vararg function
    Varargs { symbol: SymbolRef, span: Span },

    /// Resolved variable reference: local, upvalue, global or `_ENV`
    Symbol { symbol: SymbolRef, span: Span },

    /// Index access: t[k], t.name
    Index {
        object: Box<Expr>,
        key: Box<Expr>,
        span: Span,
    },

    /// Function call: f(a, b)
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },

    /// Method call: obj:name(a, b)
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
        span: Span,
    },

    /// Anonymous function: function(params) body end
    Function { body: Box<FunctionBody>, span: Span },

    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
        span: Span,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },

    /// Parenthesized expression; truncates multiple results to one
    Paren { expr: Box<Expr>, span: Span },

    /// Table constructor: { 1, 2, x = 3, [k] = v }
    Table { fields: Vec<TableField>, span: Span },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Nil { span }
            | Expr::Boolean { span, .. }
            | Expr::Integer { span, .. }
            | Expr::Float { span, .. }
            | Expr::String { span, .. }
            | Expr::Varargs { span, .. }
            | Expr::Symbol { span, .. }
            | Expr::Index { span, .. }
            | Expr::Call { span, .. }
            | Expr::MethodCall { span, .. }
            | Expr::Function { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Paren { span, .. }
            | Expr::Table { span, .. } => *span,
        }
    }

    /// Calls and `...` can produce any number of values
    pub fn is_multi_value(&self) -> bool {
        matches!(
            self,
            Expr::Call { .. } | Expr::MethodCall { .. } | Expr::Varargs { .. }
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Expr::Call { .. } | Expr::MethodCall { .. })
    }

    /// Only variables and index expressions may be assigned to
    pub fn is_assignable(&self) -> bool {
        matches!(self, Expr::Symbol { .. } | Expr::Index { .. })
    }
}

/// Flat operator and suffix chains nest thousands of levels deep on the left,
/// so children are detached onto a work list instead of dropped recursively
impl Drop for Expr {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(mut expr) = pending.pop() {
            expr.detach_children(&mut pending);
        }
    }
}

impl Expr {
    fn detach_children(&mut self, into: &mut Vec<Expr>) {
        fn take(slot: &mut Expr) -> Expr {
            std::mem::replace(slot, Expr::Nil { span: Span::default() })
        }
        match self {
            Expr::Binary { left, right, .. } => {
                into.push(take(left));
                into.push(take(right));
            }
            Expr::Index { object, key, .. } => {
                into.push(take(object));
                into.push(take(key));
            }
            Expr::Call { callee, args, .. } => {
                into.push(take(callee));
                into.append(args);
            }
            Expr::MethodCall { object, args, .. } => {
                into.push(take(object));
                into.append(args);
            }
            Expr::Unary { operand, .. } => into.push(take(operand)),
            Expr::Paren { expr, .. } => into.push(take(expr)),
            Expr::Table { fields, .. } => {
                for field in fields.drain(..) {
                    match field {
                        TableField::Positional(value) => into.push(value),
                        TableField::Keyed { key, value } => {
                            into.push(key);
                            into.push(value);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_a_deep_left_chain_does_not_recurse() {
        let span = Span::default();
        let mut expr = Expr::Integer { value: 1, span };
        for _ in 0..200_000 {
            expr = Expr::Binary {
                left: Box::new(expr),
                op: BinaryOp::Add,
                right: Box::new(Expr::Integer { value: 1, span }),
                span,
            };
        }
        drop(expr);
    }
}
