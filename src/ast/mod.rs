// Lunar AST Module
// Syntax tree produced by the parser, with scopes already resolved

mod expr;
mod stmt;

pub use expr::*;
pub use stmt::*;
