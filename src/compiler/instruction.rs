// Lunar Instruction
// One flat bytecode instruction and the disassembly format

use std::fmt;
use std::rc::Rc;

use super::opcode::OpCode;
use crate::error::SourceRef;
use crate::scope::SymbolRef;
use crate::vm::Value;

/// A single VM instruction
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: OpCode,
    pub num_val: usize,
    pub num_val2: usize,
    pub value: Option<Value>,
    pub symbols: Option<Rc<[SymbolRef]>>,
    pub name: Option<Rc<str>>,
    /// None for synthetic cleanup instructions
    pub source_ref: Option<SourceRef>,
}

impl Instruction {
    pub fn new(opcode: OpCode) -> Self {
        Self {
            opcode,
            num_val: 0,
            num_val2: 0,
            value: None,
            symbols: None,
            name: None,
            source_ref: None,
        }
    }

    pub fn with_num(mut self, num_val: usize) -> Self {
        self.num_val = num_val;
        self
    }

    pub fn with_nums(mut self, num_val: usize, num_val2: usize) -> Self {
        self.num_val = num_val;
        self.num_val2 = num_val2;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_symbols(mut self, symbols: Vec<SymbolRef>) -> Self {
        self.symbols = Some(Rc::from(symbols.into_boxed_slice()));
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(Rc::from(name));
        self
    }

    pub fn is_jump(&self) -> bool {
        matches!(
            self.opcode,
            OpCode::Jump
                | OpCode::Jf
                | OpCode::JtOrPop
                | OpCode::JfOrPop
                | OpCode::JFor
                | OpCode::IterUpd
        )
    }

    /// First symbol operand, for single-target store instructions
    pub fn symbol(&self) -> Option<&SymbolRef> {
        self.symbols.as_ref().and_then(|s| s.first())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<10} {:>5} {:>5}", self.opcode, self.num_val, self.num_val2)?;
        if let Some(value) = &self.value {
            match value {
                Value::String(_) => write!(f, " {:?}", value)?,
                other => write!(f, " {}", other.to_display_string())?,
            }
        }
        if let Some(symbols) = &self.symbols {
            let list: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
            write!(f, " [{}]", list.join(", "))?;
        }
        if let Some(name) = &self.name {
            write!(f, " ; {}", name)?;
        }
        Ok(())
    }
}

/// Renders `code[from..to]` one instruction per line, prefixed by its address
pub fn disassemble(code: &[Instruction], from: usize, to: usize) -> String {
    let mut output = String::new();
    for (address, instruction) in code.iter().enumerate().take(to).skip(from) {
        let marker = if instruction.opcode == OpCode::BeginFn {
            "\n"
        } else {
            ""
        };
        output.push_str(marker);
        output.push_str(&format!("{:05}  {}\n", address, instruction));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_operands() {
        let instr = Instruction::new(OpCode::Literal).with_value(Value::string("hi"));
        assert_eq!(instr.to_string().trim_end(), "LITERAL        0     0 \"hi\"");
        let call = Instruction::new(OpCode::Call).with_nums(2, 1);
        assert!(call.to_string().starts_with("CALL           2     1"));
    }
}
