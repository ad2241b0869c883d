// Lunar Error Handling Module
// Syntax, runtime and internal errors with source positions and script stack traces

use colored::*;
use std::fmt;
use thiserror::Error;

use crate::vm::value::Value;

/// Represents a position in the source code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self {
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

/// Represents a span in the source code (start to end position)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn from_positions(
        start_line: usize,
        start_col: usize,
        end_line: usize,
        end_col: usize,
    ) -> Self {
        Self {
            start: Position::new(start_line, start_col, 0),
            end: Position::new(end_line, end_col, 0),
        }
    }

    pub fn single(line: usize, column: usize, offset: usize) -> Self {
        let pos = Position::new(line, column, offset);
        Self {
            start: pos,
            end: pos,
        }
    }

    /// Smallest span covering both `self` and `other`
    pub fn merge(&self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }
}

/// A source-code span bound to a loaded chunk, used by the VM and debugger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub source_id: u32,
    pub from_line: u32,
    pub from_col: u32,
    pub to_line: u32,
    pub to_col: u32,
}

impl SourceRef {
    pub fn from_span(source_id: u32, span: Span) -> Self {
        Self {
            source_id,
            from_line: span.start.line as u32,
            from_col: span.start.column as u32,
            to_line: span.end.line as u32,
            to_col: span.end.column as u32,
        }
    }

    /// True when both refs point at the same source line
    pub fn same_line(&self, other: &SourceRef) -> bool {
        self.source_id == other.source_id && self.from_line == other.from_line
    }

    pub fn includes_line(&self, source_id: u32, line: u32) -> bool {
        self.source_id == source_id && self.from_line <= line && line <= self.to_line
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}:({},{}-{},{})",
            self.source_id, self.from_line, self.from_col, self.to_line, self.to_col
        )
    }
}

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Compile-time grammar or scoping violation
    SyntaxError,
    /// Execution-time failure; recoverable through `pcall`
    RuntimeError,
    /// Broken VM invariant; never intercepted by script code
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SyntaxError => write!(f, "SyntaxError"),
            ErrorKind::RuntimeError => write!(f, "RuntimeError"),
            ErrorKind::InternalError => write!(f, "InternalError"),
        }
    }
}

/// A stack frame for error traces
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function_name: String,
    pub chunk: String,
    pub line: usize,
}

impl StackFrame {
    pub fn new(function_name: impl Into<String>, chunk: impl Into<String>, line: usize) -> Self {
        Self {
            function_name: function_name.into(),
            chunk: chunk.into(),
            line,
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  at {} ({}:{})", self.function_name, self.chunk, self.line)
    }
}

/// Main error type for Lunar
#[derive(Debug, Clone, Error)]
#[error("{decorated_message}")]
pub struct LuaError {
    pub kind: ErrorKind,
    /// Message without location prefix
    pub message: String,
    /// Message prefixed with `chunk:line:` once the location is known
    pub decorated_message: String,
    pub span: Span,
    pub chunk: String,
    pub source_ref: Option<SourceRef>,
    /// Raw value passed to `error(v)` when it is not a string
    pub value: Option<Value>,
    pub help: Option<String>,
    pub stack_trace: Vec<StackFrame>,
    /// Set when the lexer or parser ran out of input (used by the REPL)
    pub premature_eof: bool,
    decorated: bool,
    source_lines: Vec<String>,
}

impl LuaError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            decorated_message: message.clone(),
            message,
            span: Span::default(),
            chunk: String::new(),
            source_ref: None,
            value: None,
            help: None,
            stack_trace: Vec::new(),
            premature_eof: false,
            decorated: false,
            source_lines: Vec::new(),
        }
    }

    pub fn syntax(message: impl Into<String>, span: Span, chunk: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::SyntaxError, message);
        err.chunk = chunk.into();
        err.span = span;
        err.decorated_message = format!("{}:{}: {}", err.chunk, span.start.line, err.message);
        err.decorated = true;
        err
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeError, message)
    }

    /// A runtime error carrying an arbitrary script value (`error({code = 1})`)
    pub fn with_value(value: Value) -> Self {
        let mut err = Self::new(ErrorKind::RuntimeError, value.to_display_string());
        err.value = Some(value);
        err.decorated = true;
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_lines = source.lines().map(String::from).collect();
        self
    }

    pub fn with_stack_trace(mut self, trace: Vec<StackFrame>) -> Self {
        self.stack_trace = trace;
        self
    }

    pub fn premature(mut self) -> Self {
        self.premature_eof = true;
        self
    }

    /// Marks the message as final so the VM will not prefix a location
    pub fn undecorated(mut self) -> Self {
        self.decorated = true;
        self
    }

    pub fn is_decorated(&self) -> bool {
        self.decorated
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind == ErrorKind::RuntimeError
    }

    /// Attach the faulting location and prefix it to the message, once
    pub fn decorate(&mut self, chunk: &str, source_ref: Option<SourceRef>) {
        if self.source_ref.is_none() {
            self.source_ref = source_ref;
        }
        if self.chunk.is_empty() {
            self.chunk = chunk.to_string();
        }
        if self.decorated {
            return;
        }
        self.decorated = true;
        self.decorated_message = match source_ref {
            Some(sref) => format!("{}:{}: {}", chunk, sref.from_line, self.message),
            None => format!("{}: {}", chunk, self.message),
        };
    }

    /// The value `pcall` hands back to script code
    pub fn to_script_value(&self) -> Value {
        match &self.value {
            Some(v) => v.clone(),
            None => Value::string(&self.decorated_message),
        }
    }

    pub fn push_frame(&mut self, frame: StackFrame) {
        self.stack_trace.push(frame);
    }

    /// Format the error for terminal display
    pub fn format(&self) -> String {
        let mut output = String::new();

        let header = format!(
            "{}: {}",
            self.kind.to_string().red().bold(),
            self.decorated_message.white().bold()
        );
        output.push_str(&header);
        output.push('\n');

        if self.kind == ErrorKind::SyntaxError && !self.source_lines.is_empty() {
            let error_line = self.span.start.line;
            let start_line = if error_line > 1 { error_line - 1 } else { 1 };
            let end_line = (error_line + 1).min(self.source_lines.len());

            output.push('\n');

            for line_num in start_line..=end_line {
                if line_num == 0 || line_num > self.source_lines.len() {
                    continue;
                }
                let line_content = &self.source_lines[line_num - 1];
                let line_num_str = format!("{:>4} |", line_num);

                if line_num == error_line {
                    output.push_str(&format!("{} {}\n", line_num_str.red(), line_content));

                    let spaces = " ".repeat(6 + self.span.start.column.saturating_sub(1));
                    let caret_len = if self.span.end.line == self.span.start.line
                        && self.span.end.column > self.span.start.column
                    {
                        self.span.end.column - self.span.start.column
                    } else {
                        1
                    };
                    output.push_str(&format!("{}{}\n", spaces, "^".repeat(caret_len).red().bold()));
                } else {
                    output.push_str(&format!("{} {}\n", line_num_str.dimmed(), line_content));
                }
            }
        }

        if let Some(ref help) = self.help {
            output.push_str(&format!("\n      {}: {}\n", "Help".cyan().bold(), help));
        }

        if !self.stack_trace.is_empty() {
            output.push_str(&format!("\n{}:\n", "Stack trace".yellow().bold()));
            for frame in self.stack_trace.iter() {
                output.push_str(&format!("{}\n", frame));
            }
        }

        output
    }
}

/// Result type for Lunar operations
pub type LuaResult<T> = Result<T, LuaError>;

// Convenience constructors for the common runtime failures
impl LuaError {
    pub fn arithmetic_on(type_name: &str) -> Self {
        Self::runtime(format!("attempt to perform arithmetic on a {} value", type_name))
    }

    pub fn bitwise_on(type_name: &str) -> Self {
        Self::runtime(format!("attempt to perform bitwise operation on a {} value", type_name))
    }

    pub fn no_integer_representation() -> Self {
        Self::runtime("number has no integer representation")
    }

    pub fn concat_on(type_name: &str) -> Self {
        Self::runtime(format!("attempt to concatenate a {} value", type_name))
    }

    pub fn length_of(type_name: &str) -> Self {
        Self::runtime(format!("attempt to get length of a {} value", type_name))
    }

    pub fn compare(left: &str, right: &str) -> Self {
        if left == right {
            Self::runtime(format!("attempt to compare two {} values", left))
        } else {
            Self::runtime(format!("attempt to compare {} with {}", left, right))
        }
    }

    /// `described` names the indexed variable, e.g. "global 'x'"
    pub fn index_of(type_name: &str, described: Option<&str>) -> Self {
        match described {
            Some(d) => Self::runtime(format!("attempt to index a {} value ({})", type_name, d)),
            None => Self::runtime(format!("attempt to index a {} value", type_name)),
        }
    }

    pub fn call_of(type_name: &str, described: Option<&str>) -> Self {
        match described {
            Some(d) => Self::runtime(format!("attempt to call a {} value ({})", type_name, d)),
            None => Self::runtime(format!("attempt to call a {} value", type_name)),
        }
    }

    pub fn bad_argument(index: usize, function: &str, detail: impl fmt::Display) -> Self {
        Self::runtime(format!(
            "bad argument #{} to '{}' ({})",
            index, function, detail
        ))
    }

    pub fn bad_argument_type(index: usize, function: &str, expected: &str, got: &str) -> Self {
        Self::bad_argument(index, function, format!("{} expected, got {}", expected, got))
    }

    pub fn stack_overflow() -> Self {
        Self::runtime("stack overflow")
    }

    pub fn cannot_resume_not_suspended() -> Self {
        Self::runtime("cannot resume non-suspended coroutine")
    }

    pub fn cannot_resume_dead() -> Self {
        Self::runtime("cannot resume dead coroutine")
    }

    pub fn cannot_yield() -> Self {
        Self::runtime("attempt to yield across a C-call boundary")
    }

    pub fn cannot_yield_main() -> Self {
        Self::runtime("attempt to yield from outside a coroutine")
    }

    pub fn for_loop_value(what: &str) -> Self {
        Self::runtime(format!("'for' {} must be a number", what))
    }

    pub fn for_step_zero() -> Self {
        Self::runtime("'for' step is zero")
    }

    pub fn close_metamethod_expected(variable: &str) -> Self {
        Self::runtime(format!("variable '{}' got a non-closable value", variable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_errors_are_decorated_with_chunk_and_line() {
        let err = LuaError::syntax("unexpected symbol near '='", Span::single(3, 5, 20), "main.lua");
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert_eq!(err.to_string(), "main.lua:3: unexpected symbol near '='");
    }

    #[test]
    fn runtime_decoration_happens_once() {
        let sref = SourceRef::from_span(0, Span::single(7, 1, 0));
        let mut err = LuaError::runtime("boom");
        err.decorate("chunk", Some(sref));
        err.decorate("other", None);
        assert_eq!(err.decorated_message, "chunk:7: boom");
        assert_eq!(err.message, "boom");
        assert_eq!(err.source_ref, Some(sref));
    }

    #[test]
    fn value_errors_are_not_prefixed() {
        let mut err = LuaError::with_value(Value::Boolean(false));
        err.decorate("chunk", None);
        assert_eq!(err.decorated_message, "false");
        assert!(matches!(err.to_script_value(), Value::Boolean(false)));
    }

    #[test]
    fn compare_message_mentions_both_types() {
        assert_eq!(
            LuaError::compare("number", "nil").message,
            "attempt to compare number with nil"
        );
        assert_eq!(
            LuaError::compare("table", "table").message,
            "attempt to compare two table values"
        );
    }

    #[test]
    fn source_ref_line_matching() {
        let sref = SourceRef::from_span(
            2,
            Span::new(Position::new(4, 1, 0), Position::new(6, 3, 0)),
        );
        assert!(sref.includes_line(2, 5));
        assert!(!sref.includes_line(1, 5));
        assert!(!sref.includes_line(2, 7));
    }
}
