// Lunar Programming Language
// An embeddable Lua 5.1 - 5.5 interpreter

pub mod ast;
pub mod builtins;
pub mod cache;
pub mod compiler;
pub mod debugger;
pub mod error;
pub mod lexer;
pub mod options;
pub mod parser;
pub mod profile;
pub mod scope;
pub mod script;
pub mod vm;

pub use error::{ErrorKind, LuaError, LuaResult};
pub use options::{CoreModules, ScriptOptions};
pub use profile::{CompatibilityProfile, LuaVersion, VersionGuard};
pub use script::Script;
pub use vm::{Number, Table, TableRef, Value, ValueCaller};

/// Compiles and runs `code` in a fresh script of the default dialect
pub fn run_string(code: &str) -> LuaResult<Value> {
    Script::default().do_string(code)
}
