// Lunar Compiler
// Lowers the resolved AST into the shared flat instruction array

use std::rc::Rc;

use super::instruction::Instruction;
use super::opcode::OpCode;
use crate::ast::*;
use crate::error::{LuaError, LuaResult, SourceRef};
use crate::scope::{GotoTarget, LocalAttrib, SymbolKind, SymbolRef};
use crate::vm::Value;

/// Placeholder target of a jump that has not been patched yet
const UNPATCHED: usize = usize::MAX;

/// Per-function emission state
struct FunctionState {
    /// Stack of break jump placeholders, one list per enclosing loop
    break_jumps: Vec<Vec<usize>>,
    /// (jump address, label id) pairs patched when the function ends
    goto_jumps: Vec<(usize, usize)>,
    labels: Vec<Option<usize>>,
    gotos: Vec<GotoTarget>,
    /// `<close>` locals declared per open block
    close_counts: Vec<usize>,
}

impl FunctionState {
    fn new(body: &FunctionBody) -> Self {
        Self {
            break_jumps: Vec::new(),
            goto_jumps: Vec::new(),
            labels: vec![None; body.layout.label_count],
            gotos: body.layout.gotos.clone(),
            close_counts: Vec::new(),
        }
    }
}

/// The Lunar bytecode compiler
pub struct Compiler<'c> {
    code: &'c mut Vec<Instruction>,
    source_id: u32,
    current_ref: Option<SourceRef>,
    functions: Vec<FunctionState>,
}

impl<'c> Compiler<'c> {
    pub fn new(code: &'c mut Vec<Instruction>, source_id: u32) -> Self {
        Self {
            code,
            source_id,
            current_ref: None,
            functions: Vec::new(),
        }
    }

    /// Appends the chunk's code and returns the entry address of its main function
    pub fn compile_chunk(&mut self, chunk: &Chunk) -> LuaResult<usize> {
        let start = self.code.len();
        let entry = self.compile_function_body(&chunk.main)?;
        log::debug!(
            "compiled chunk {} ({} instructions at {})",
            chunk.name,
            self.code.len() - start,
            entry
        );
        Ok(entry)
    }

    fn state(&mut self) -> LuaResult<&mut FunctionState> {
        self.functions
            .last_mut()
            .ok_or_else(|| LuaError::internal("no function being compiled"))
    }

    // ==================== Functions ====================

    fn compile_function_body(&mut self, body: &FunctionBody) -> LuaResult<usize> {
        let entry = self.code.len();
        self.functions.push(FunctionState::new(body));

        let saved_ref = self.current_ref.take();
        self.emit_cleanup(
            Instruction::new(OpCode::BeginFn)
                .with_nums(body.layout.slots.len(), body.params.len())
                .with_value(Value::Boolean(body.varargs.is_some()))
                .with_symbols(body.layout.slots.clone())
                .with_name(&body.name),
        );
        self.compile_block(&body.body)?;
        self.emit_cleanup(Instruction::new(OpCode::Ret).with_num(0));
        self.current_ref = saved_ref;

        let state = self
            .functions
            .pop()
            .ok_or_else(|| LuaError::internal("function state underflow"))?;
        for (address, label) in state.goto_jumps {
            let target = state
                .labels
                .get(label)
                .copied()
                .flatten()
                .ok_or_else(|| LuaError::internal("goto to a label that was never emitted"))?;
            self.code[address].num_val = target;
        }

        Ok(entry)
    }

    fn compile_closure(&mut self, body: &FunctionBody) -> LuaResult<()> {
        let skip = self.emit_jump(OpCode::Jump);
        let entry = self.compile_function_body(body)?;
        self.patch_jump(skip);
        self.emit(
            Instruction::new(OpCode::Closure)
                .with_num(entry)
                .with_symbols(body.layout.upvalues.clone())
                .with_name(&body.name),
        );
        Ok(())
    }

    // ==================== Statements ====================

    fn compile_block(&mut self, block: &Block) -> LuaResult<()> {
        self.emit_cleanup(
            Instruction::new(OpCode::Enter).with_nums(block.scope.from, block.scope.to),
        );
        self.state()?.close_counts.push(0);
        for stmt in &block.statements {
            self.compile_stmt(stmt)?;
        }
        self.state()?.close_counts.pop();
        self.emit_cleanup(Instruction::new(OpCode::Leave));
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> LuaResult<()> {
        let saved_ref = self.current_ref;
        self.current_ref = Some(SourceRef::from_span(self.source_id, stmt.span()));

        match stmt {
            Stmt::Local {
                targets, values, ..
            } => self.compile_local(targets, values)?,
            Stmt::LocalFunction { symbol, body, .. } => {
                self.emit(Instruction::new(OpCode::Literal).with_value(Value::Nil));
                self.emit_store(symbol, 0, 0, true)?;
                self.emit(Instruction::new(OpCode::Pop).with_num(1));
                self.compile_closure(body)?;
                self.emit_store(symbol, 0, 0, false)?;
                self.emit(Instruction::new(OpCode::Pop).with_num(1));
            }
            Stmt::Function { target, body, .. } => {
                self.compile_closure(body)?;
                self.compile_assign_target(target, 0, 0)?;
                self.emit(Instruction::new(OpCode::Pop).with_num(1));
            }
            Stmt::Assign {
                targets, values, ..
            } => {
                let count = self.compile_expr_list(values)?;
                for (i, target) in targets.iter().enumerate() {
                    let (offset, element) = store_source(i, count);
                    self.compile_assign_target(target, offset, element)?;
                }
                self.emit(Instruction::new(OpCode::Pop).with_num(count));
            }
            Stmt::Call { call, .. } => {
                self.compile_expr(call)?;
                self.emit(Instruction::new(OpCode::Pop).with_num(1));
            }
            Stmt::Do { block, .. } => self.compile_block(block)?,
            Stmt::While {
                condition, body, ..
            } => self.compile_while(condition, body)?,
            Stmt::Repeat {
                body, condition, ..
            } => self.compile_repeat(body, condition)?,
            Stmt::If {
                clauses,
                else_block,
                ..
            } => self.compile_if(clauses, else_block.as_ref())?,
            Stmt::NumericFor {
                control,
                variable,
                start,
                limit,
                step,
                loop_scope,
                body,
                ..
            } => self.compile_numeric_for(
                control,
                variable,
                (start, limit, step.as_ref()),
                *loop_scope,
                body,
            )?,
            Stmt::GenericFor {
                control,
                variables,
                exprs,
                loop_scope,
                body,
                ..
            } => self.compile_generic_for(control, variables, exprs, *loop_scope, body)?,
            Stmt::Return { values, .. } => self.compile_return(values)?,
            Stmt::Break { exits, .. } => {
                if *exits > 0 {
                    self.emit_cleanup(Instruction::new(OpCode::Exit).with_num(*exits));
                }
                let jump = self.emit_jump(OpCode::Jump);
                self.state()?
                    .break_jumps
                    .last_mut()
                    .ok_or_else(|| LuaError::internal("break outside of a loop"))?
                    .push(jump);
            }
            Stmt::Goto { id, .. } => {
                let target = self
                    .state()?
                    .gotos
                    .get(*id)
                    .copied()
                    .ok_or_else(|| LuaError::internal("unresolved goto"))?;
                if target.exits > 0 {
                    self.emit_cleanup(Instruction::new(OpCode::Exit).with_num(target.exits));
                }
                let jump = self.emit_jump(OpCode::Jump);
                self.state()?.goto_jumps.push((jump, target.label_id));
            }
            Stmt::Label { id, .. } => {
                let here = self.code.len();
                let state = self.state()?;
                match state.labels.get_mut(*id) {
                    Some(slot) => *slot = Some(here),
                    None => return Err(LuaError::internal("label id out of range")),
                }
            }
        }

        self.current_ref = saved_ref;
        Ok(())
    }

    fn compile_local(&mut self, targets: &[SymbolRef], values: &[Expr]) -> LuaResult<()> {
        let count = if values.is_empty() {
            self.emit(Instruction::new(OpCode::Literal).with_value(Value::Nil));
            1
        } else {
            self.compile_expr_list(values)?
        };

        for (i, target) in targets.iter().enumerate() {
            let (offset, element) = store_source(i, count);
            self.emit_store(target, offset, element, true)?;
            if target.attrib == LocalAttrib::Close {
                self.emit(Instruction::new(OpCode::MarkClose).with_num(target.index));
                if let Some(count) = self.state()?.close_counts.last_mut() {
                    *count += 1;
                }
            }
        }
        self.emit(Instruction::new(OpCode::Pop).with_num(count));
        Ok(())
    }

    /// Stores the value `offset` below the top (element `element`) into an assignable expression
    fn compile_assign_target(&mut self, target: &Expr, offset: usize, element: usize) -> LuaResult<()> {
        match target {
            Expr::Symbol { symbol, .. } => self.emit_store(symbol, offset, element, false),
            Expr::Index { object, key, .. } => {
                self.compile_scalar(object)?;
                let mut instr = if let Expr::String { value, .. } = key.as_ref() {
                    Instruction::new(OpCode::IndexSetN)
                        .with_nums(offset + 1, element)
                        .with_value(Value::bytes(value))
                } else {
                    self.compile_scalar(key)?;
                    Instruction::new(OpCode::IndexSet).with_nums(offset + 2, element)
                };
                instr.name = describe(object).map(|d| Rc::from(d.as_str()));
                self.emit(instr);
                Ok(())
            }
            _ => Err(LuaError::internal("assignment to a non-assignable expression")),
        }
    }

    fn emit_store(
        &mut self,
        symbol: &SymbolRef,
        offset: usize,
        element: usize,
        declaration: bool,
    ) -> LuaResult<()> {
        let instruction = match symbol.kind {
            SymbolKind::Local => {
                let opcode = if declaration {
                    OpCode::DefLcl
                } else {
                    OpCode::StoreLcl
                };
                Instruction::new(opcode)
                    .with_nums(offset, element)
                    .with_symbols(vec![symbol.clone()])
            }
            SymbolKind::Upvalue => Instruction::new(OpCode::StoreUpv)
                .with_nums(offset, element)
                .with_symbols(vec![symbol.clone()]),
            SymbolKind::Global => Instruction::new(OpCode::SetGlobal)
                .with_nums(offset, element)
                .with_value(Value::string(&symbol.name)),
            SymbolKind::ChunkRoot => {
                return Err(LuaError::internal("cannot store into the chunk environment"))
            }
        };
        self.emit(instruction);
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &Block) -> LuaResult<()> {
        let loop_start = self.code.len();
        self.compile_scalar(condition)?;
        let exit_jump = self.emit_jump(OpCode::Jf);

        self.state()?.break_jumps.push(Vec::new());
        self.compile_block(body)?;
        self.emit(Instruction::new(OpCode::Jump).with_num(loop_start));

        self.patch_jump(exit_jump);
        self.patch_breaks()
    }

    fn compile_repeat(&mut self, body: &Block, condition: &Expr) -> LuaResult<()> {
        let loop_start = self.code.len();
        self.state()?.break_jumps.push(Vec::new());

        self.emit_cleanup(
            Instruction::new(OpCode::Enter).with_nums(body.scope.from, body.scope.to),
        );
        self.state()?.close_counts.push(0);
        for stmt in &body.statements {
            self.compile_stmt(stmt)?;
        }
        // the condition runs inside the body scope
        self.compile_scalar(condition)?;
        self.state()?.close_counts.pop();
        self.emit_cleanup(Instruction::new(OpCode::Leave));
        self.emit(Instruction::new(OpCode::Jf).with_num(loop_start));

        self.patch_breaks()
    }

    fn compile_if(&mut self, clauses: &[(Expr, Block)], else_block: Option<&Block>) -> LuaResult<()> {
        let mut end_jumps = Vec::new();

        for (i, (condition, block)) in clauses.iter().enumerate() {
            self.compile_scalar(condition)?;
            let next_clause = self.emit_jump(OpCode::Jf);
            self.compile_block(block)?;
            if i + 1 < clauses.len() || else_block.is_some() {
                end_jumps.push(self.emit_jump(OpCode::Jump));
            }
            self.patch_jump(next_clause);
        }

        if let Some(block) = else_block {
            self.compile_block(block)?;
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
        Ok(())
    }

    fn compile_numeric_for(
        &mut self,
        control: &[SymbolRef; 3],
        variable: &SymbolRef,
        (start, limit, step): (&Expr, &Expr, Option<&Expr>),
        loop_scope: crate::scope::RuntimeBlock,
        body: &Block,
    ) -> LuaResult<()> {
        let base = control[0].index;
        self.emit_cleanup(
            Instruction::new(OpCode::Enter).with_nums(loop_scope.from, loop_scope.to),
        );
        self.state()?.close_counts.push(0);

        // bounds are evaluated and snapshotted once
        self.compile_scalar(start)?;
        self.emit(Instruction::new(OpCode::ToNum).with_num(0));
        self.compile_scalar(limit)?;
        self.emit(Instruction::new(OpCode::ToNum).with_num(1));
        match step {
            Some(step) => self.compile_scalar(step)?,
            None => {
                self.emit(Instruction::new(OpCode::Literal).with_value(Value::integer(1)));
            }
        }
        self.emit(Instruction::new(OpCode::ToNum).with_num(2));
        for (i, slot) in control.iter().enumerate() {
            self.emit_store(slot, 2 - i, 0, true)?;
        }
        self.emit(Instruction::new(OpCode::Pop).with_num(3));
        self.emit(Instruction::new(OpCode::ForPrep).with_num(base));

        let loop_start = self.code.len();
        let exit_jump = self.emit(Instruction::new(OpCode::JFor).with_nums(UNPATCHED, base));
        self.state()?.break_jumps.push(Vec::new());

        self.emit_cleanup(
            Instruction::new(OpCode::Enter).with_nums(body.scope.from, body.scope.to),
        );
        self.state()?.close_counts.push(0);
        self.emit(Instruction::new(OpCode::Local).with_num(base).with_name("(for state)"));
        self.emit_store(variable, 0, 0, true)?;
        self.emit(Instruction::new(OpCode::Pop).with_num(1));
        for stmt in &body.statements {
            self.compile_stmt(stmt)?;
        }
        self.state()?.close_counts.pop();
        self.emit_cleanup(Instruction::new(OpCode::Leave));

        self.emit(Instruction::new(OpCode::Incr).with_num(base));
        self.emit(Instruction::new(OpCode::Jump).with_num(loop_start));

        self.patch_jump(exit_jump);
        self.patch_breaks()?;
        self.state()?.close_counts.pop();
        self.emit_cleanup(Instruction::new(OpCode::Leave));
        Ok(())
    }

    fn compile_generic_for(
        &mut self,
        control: &[SymbolRef; 3],
        variables: &[SymbolRef],
        exprs: &[Expr],
        loop_scope: crate::scope::RuntimeBlock,
        body: &Block,
    ) -> LuaResult<()> {
        let base = control[0].index;
        self.emit_cleanup(
            Instruction::new(OpCode::Enter).with_nums(loop_scope.from, loop_scope.to),
        );
        self.state()?.close_counts.push(0);

        let count = self.compile_expr_list(exprs)?;
        self.emit(Instruction::new(OpCode::MkTuple).with_num(count));
        self.emit(Instruction::new(OpCode::IterPrep).with_num(base));

        let loop_start = self.code.len();
        for slot in control {
            self.emit(Instruction::new(OpCode::Local).with_num(slot.index).with_name(&slot.name));
        }
        self.emit(Instruction::new(OpCode::Call).with_num(2).with_name("for iterator"));
        let exit_jump =
            self.emit(Instruction::new(OpCode::IterUpd).with_nums(UNPATCHED, control[2].index));
        self.state()?.break_jumps.push(Vec::new());

        self.emit_cleanup(
            Instruction::new(OpCode::Enter).with_nums(body.scope.from, body.scope.to),
        );
        self.state()?.close_counts.push(0);
        for (i, variable) in variables.iter().enumerate() {
            self.emit_store(variable, 0, i, true)?;
        }
        self.emit(Instruction::new(OpCode::Pop).with_num(1));
        for stmt in &body.statements {
            self.compile_stmt(stmt)?;
        }
        self.state()?.close_counts.pop();
        self.emit_cleanup(Instruction::new(OpCode::Leave));
        self.emit(Instruction::new(OpCode::Jump).with_num(loop_start));

        self.patch_jump(exit_jump);
        self.patch_breaks()?;
        self.state()?.close_counts.pop();
        self.emit_cleanup(Instruction::new(OpCode::Leave));
        Ok(())
    }

    fn compile_return(&mut self, values: &[Expr]) -> LuaResult<()> {
        match values {
            [] => {
                self.emit(Instruction::new(OpCode::Ret).with_num(0));
            }
            [single] => {
                let closes_pending = self.state()?.close_counts.iter().any(|&n| n > 0);
                match single {
                    Expr::Call { .. } | Expr::MethodCall { .. } if !closes_pending => {
                        self.compile_call(single, true)?;
                    }
                    other => self.compile_expr(other)?,
                }
                self.emit(Instruction::new(OpCode::Ret).with_num(1));
            }
            many => {
                let count = self.compile_expr_list(many)?;
                self.emit(Instruction::new(OpCode::MkTuple).with_num(count));
                self.emit(Instruction::new(OpCode::Ret).with_num(1));
            }
        }
        Ok(())
    }

    // ==================== Expressions ====================

    /// Pushes each expression; only the last may stay a multi-value
    fn compile_expr_list(&mut self, exprs: &[Expr]) -> LuaResult<usize> {
        for (i, expr) in exprs.iter().enumerate() {
            if i + 1 == exprs.len() {
                self.compile_expr(expr)?;
            } else {
                self.compile_scalar(expr)?;
            }
        }
        Ok(exprs.len())
    }

    fn compile_scalar(&mut self, expr: &Expr) -> LuaResult<()> {
        self.compile_expr(expr)?;
        if expr.is_multi_value() {
            self.emit(Instruction::new(OpCode::Scalar));
        }
        Ok(())
    }

    /// Pushes exactly one stack value (possibly a multi-value for calls and `...`)
    ///
    /// Left-nested chains (`a + b + c`, `t.x.y`, `f()()`) are lowered by walking
    /// their left spine with an explicit stack.
    fn compile_expr(&mut self, expr: &Expr) -> LuaResult<()> {
        let mut spine = Vec::new();
        let mut base = expr;
        while let Some(prefix) = chain_prefix(base) {
            spine.push(base);
            base = prefix;
        }

        self.compile_leaf(base)?;
        let mut inner = base;
        for node in spine.into_iter().rev() {
            if inner.is_multi_value() {
                self.emit(Instruction::new(OpCode::Scalar));
            }
            self.compile_suffix(node, false)?;
            inner = node;
        }
        Ok(())
    }

    fn compile_leaf(&mut self, expr: &Expr) -> LuaResult<()> {
        match expr {
            Expr::Nil { .. } => {
                self.emit(Instruction::new(OpCode::Literal).with_value(Value::Nil));
            }
            Expr::Boolean { value, .. } => {
                self.emit(Instruction::new(OpCode::Literal).with_value(Value::Boolean(*value)));
            }
            Expr::Integer { value, .. } => {
                self.emit(Instruction::new(OpCode::Literal).with_value(Value::integer(*value)));
            }
            Expr::Float { value, .. } => {
                self.emit(Instruction::new(OpCode::Literal).with_value(Value::float(*value)));
            }
            Expr::String { value, .. } => {
                self.emit(Instruction::new(OpCode::Literal).with_value(Value::bytes(value)));
            }
            Expr::Varargs { symbol, .. } => {
                self.emit(Instruction::new(OpCode::Local).with_num(symbol.index).with_name("..."));
            }
            Expr::Symbol { symbol, .. } => self.compile_symbol(symbol),
            Expr::Function { body, .. } => self.compile_closure(body)?,
            Expr::Unary { op, operand, .. } => {
                self.compile_scalar(operand)?;
                let opcode = match op {
                    UnaryOp::Negate => OpCode::Neg,
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::Length => OpCode::Len,
                    UnaryOp::BitNot => OpCode::BitNot,
                };
                self.emit(Instruction::new(opcode));
            }
            Expr::Paren { expr, .. } => self.compile_scalar(expr)?,
            Expr::Table { fields, .. } => self.compile_table(fields)?,
            Expr::Index { .. } | Expr::Call { .. } | Expr::MethodCall { .. } | Expr::Binary { .. } => {
                return Err(LuaError::internal("chain node compiled as a leaf"))
            }
        }
        Ok(())
    }

    /// Emits the part of a chain node that follows its already pushed left operand
    fn compile_suffix(&mut self, node: &Expr, tail: bool) -> LuaResult<()> {
        match node {
            Expr::Index { object, key, .. } => {
                let described = describe(object).map(|d| Rc::from(d.as_str()));
                let mut instr = match key.as_ref() {
                    Expr::String { value, .. } => {
                        Instruction::new(OpCode::IndexN).with_value(Value::bytes(value))
                    }
                    _ => {
                        self.compile_scalar(key)?;
                        Instruction::new(OpCode::Index)
                    }
                };
                instr.name = described;
                self.emit(instr);
            }
            Expr::Call { callee, args, .. } => {
                let argc = self.compile_expr_list(args)?;
                let mut instr = Instruction::new(OpCode::Call).with_nums(argc, usize::from(tail));
                instr.name = describe(callee).map(|d| Rc::from(d.as_str()));
                self.emit(instr);
            }
            Expr::MethodCall { method, args, .. } => {
                self.emit(Instruction::new(OpCode::Method).with_value(Value::string(method)));
                let argc = self.compile_expr_list(args)?;
                self.emit(
                    Instruction::new(OpCode::Call)
                        .with_nums(argc + 1, usize::from(tail))
                        .with_name(&format!("method '{}'", method)),
                );
            }
            Expr::Binary { op, right, .. } => self.compile_binary_rest(*op, right)?,
            _ => return Err(LuaError::internal("chain node expected")),
        }
        Ok(())
    }

    fn compile_symbol(&mut self, symbol: &SymbolRef) {
        let instr = match symbol.kind {
            SymbolKind::Local => Instruction::new(OpCode::Local)
                .with_num(symbol.index)
                .with_name(&symbol.name),
            SymbolKind::Upvalue => Instruction::new(OpCode::Upvalue)
                .with_num(symbol.index)
                .with_name(&symbol.name),
            SymbolKind::Global => {
                Instruction::new(OpCode::GetGlobal).with_value(Value::string(&symbol.name))
            }
            SymbolKind::ChunkRoot => Instruction::new(OpCode::Env),
        };
        self.emit(instr);
    }

    fn compile_call(&mut self, expr: &Expr, tail: bool) -> LuaResult<()> {
        match expr {
            Expr::Call { callee: prefix, .. } | Expr::MethodCall { object: prefix, .. } => {
                self.compile_scalar(prefix)?;
                self.compile_suffix(expr, tail)
            }
            _ => Err(LuaError::internal("call expected")),
        }
    }

    /// Emits a binary operator whose left operand is already on the stack
    fn compile_binary_rest(&mut self, op: BinaryOp, right: &Expr) -> LuaResult<()> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let opcode = if op == BinaryOp::And {
                    OpCode::JfOrPop
                } else {
                    OpCode::JtOrPop
                };
                let jump = self.emit_jump(opcode);
                self.compile_scalar(right)?;
                self.patch_jump(jump);
                return Ok(());
            }
            _ => {}
        }

        self.compile_scalar(right)?;
        let instr = match op {
            BinaryOp::Add => Instruction::new(OpCode::Add),
            BinaryOp::Sub => Instruction::new(OpCode::Sub),
            BinaryOp::Mul => Instruction::new(OpCode::Mul),
            BinaryOp::Div => Instruction::new(OpCode::Div),
            BinaryOp::FloorDiv => Instruction::new(OpCode::FloorDiv),
            BinaryOp::Mod => Instruction::new(OpCode::Mod),
            BinaryOp::Pow => Instruction::new(OpCode::Power),
            BinaryOp::Concat => Instruction::new(OpCode::Concat),
            BinaryOp::Equal => Instruction::new(OpCode::Eq),
            BinaryOp::NotEqual => Instruction::new(OpCode::Eq).with_num(1),
            BinaryOp::Less => Instruction::new(OpCode::Less),
            BinaryOp::LessEqual => Instruction::new(OpCode::LessEq),
            BinaryOp::Greater => Instruction::new(OpCode::Less).with_num(1),
            BinaryOp::GreaterEqual => Instruction::new(OpCode::LessEq).with_num(1),
            BinaryOp::BitAnd => Instruction::new(OpCode::BitAnd),
            BinaryOp::BitOr => Instruction::new(OpCode::BitOr),
            BinaryOp::BitXor => Instruction::new(OpCode::BitXor),
            BinaryOp::ShiftLeft => Instruction::new(OpCode::ShiftLeft),
            BinaryOp::ShiftRight => Instruction::new(OpCode::ShiftRight),
            BinaryOp::And | BinaryOp::Or => Instruction::new(OpCode::Invalid),
        };
        self.emit(instr);
        Ok(())
    }

    fn compile_table(&mut self, fields: &[TableField]) -> LuaResult<()> {
        self.emit(Instruction::new(OpCode::NewTable));
        let mut position = 1;
        for (i, field) in fields.iter().enumerate() {
            match field {
                TableField::Positional(value) => {
                    let expand = i + 1 == fields.len() && value.is_multi_value();
                    if expand {
                        self.compile_expr(value)?;
                    } else {
                        self.compile_scalar(value)?;
                    }
                    self.emit(
                        Instruction::new(OpCode::TblInitI).with_nums(position, usize::from(expand)),
                    );
                    position += 1;
                }
                TableField::Keyed { key, value } => {
                    self.compile_scalar(key)?;
                    self.compile_scalar(value)?;
                    self.emit(Instruction::new(OpCode::TblInitN));
                }
            }
        }
        Ok(())
    }

    // ==================== Emission helpers ====================

    fn emit(&mut self, mut instr: Instruction) -> usize {
        instr.source_ref = self.current_ref;
        self.code.push(instr);
        self.code.len() - 1
    }

    /// Synthetic instructions carry no source location, so debuggers never stop on them
    fn emit_cleanup(&mut self, instr: Instruction) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        self.emit(Instruction::new(opcode).with_num(UNPATCHED))
    }

    fn patch_jump(&mut self, address: usize) {
        let target = self.code.len();
        self.code[address].num_val = target;
    }

    fn patch_breaks(&mut self) -> LuaResult<()> {
        let breaks = self
            .state()?
            .break_jumps
            .pop()
            .ok_or_else(|| LuaError::internal("loop state underflow"))?;
        for jump in breaks {
            self.patch_jump(jump);
        }
        Ok(())
    }
}

/// Where the value for the `i`-th of `count` targets lives: (distance below top, element)
fn store_source(i: usize, count: usize) -> (usize, usize) {
    let source = i.min(count - 1);
    (count - 1 - source, i - source)
}

/// The left operand or prefix through which `expr` nests, if it is a chain node
fn chain_prefix(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::Binary { left, .. } => Some(left.as_ref()),
        Expr::Index { object, .. } | Expr::MethodCall { object, .. } => Some(object.as_ref()),
        Expr::Call { callee, .. } => Some(callee.as_ref()),
        _ => None,
    }
}

/// Variable description used in runtime error messages
fn describe(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Symbol { symbol, .. } => Some(match symbol.kind {
            SymbolKind::Local => format!("local '{}'", symbol.name),
            SymbolKind::Upvalue => format!("upvalue '{}'", symbol.name),
            SymbolKind::Global => format!("global '{}'", symbol.name),
            SymbolKind::ChunkRoot => "_ENV".to_string(),
        }),
        Expr::Index { key, .. } => match key.as_ref() {
            Expr::String { value, .. } => {
                Some(format!("field '{}'", String::from_utf8_lossy(value)))
            }
            _ => None,
        },
        Expr::MethodCall { method, .. } => Some(format!("method '{}'", method)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_chunk;
    use crate::profile::{CompatibilityProfile, LuaVersion};

    fn compile(source: &str) -> (Vec<Instruction>, usize) {
        let chunk = parse_chunk(
            source,
            "test",
            CompatibilityProfile::for_version(LuaVersion::Lua54),
        )
        .unwrap();
        let mut code = Vec::new();
        let entry = Compiler::new(&mut code, 1).compile_chunk(&chunk).unwrap();
        (code, entry)
    }

    #[test]
    fn every_jump_is_patched() {
        let (code, _) = compile(
            "local t = {} for i = 1, 3 do if i == 2 then break end t[i] = i end \
             while false do end repeat local x = 1 until x \
             for k, v in pairs(t) do goto skip end ::skip:: \
             local f = function(...) return ... end",
        );
        for (address, instr) in code.iter().enumerate() {
            if instr.is_jump() {
                assert!(
                    instr.num_val < code.len(),
                    "jump at {} left unpatched: {}",
                    address,
                    instr
                );
            }
        }
    }

    #[test]
    fn cleanup_instructions_have_no_source_ref() {
        let (code, entry) = compile("do local x = 1 end");
        assert_eq!(code[entry].opcode, OpCode::BeginFn);
        for instr in &code {
            if matches!(instr.opcode, OpCode::Enter | OpCode::Leave | OpCode::BeginFn) {
                assert!(instr.source_ref.is_none());
            }
        }
        let literal = code
            .iter()
            .find(|i| i.opcode == OpCode::Literal)
            .unwrap();
        assert_eq!(literal.source_ref.map(|r| r.from_line), Some(1));
    }

    #[test]
    fn return_of_call_is_a_tail_call() {
        let (code, _) = compile("local function f() return f() end");
        assert!(code
            .iter()
            .any(|i| i.opcode == OpCode::Call && i.num_val2 == 1));

        let (code, _) = compile("local function f() local x <close> = nil return f() end");
        assert!(!code
            .iter()
            .any(|i| i.opcode == OpCode::Call && i.num_val2 == 1));
    }

    #[test]
    fn multiple_assignment_reads_values_by_offset() {
        let (code, _) = compile("local a, b, c = 1, 2");
        let stores: Vec<(usize, usize)> = code
            .iter()
            .filter(|i| i.opcode == OpCode::DefLcl)
            .map(|i| (i.num_val, i.num_val2))
            .collect();
        assert_eq!(stores, vec![(1, 0), (0, 0), (0, 1)]);
    }

    #[test]
    fn long_left_chains_compile_without_recursion() {
        let source = format!("return 1{}", " + 1".repeat(50_000));
        let (code, _) = compile(&source);
        assert_eq!(code.iter().filter(|i| i.opcode == OpCode::Add).count(), 50_000);

        let source = format!("local t = {{}} return t{}", ".t".repeat(50_000));
        let (code, _) = compile(&source);
        assert_eq!(code.iter().filter(|i| i.opcode == OpCode::IndexN).count(), 50_000);
    }
}
