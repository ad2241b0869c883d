// Lunar Scope Resolver
// Tracks lexical scopes while parsing: slot assignment, upvalue capture, goto validation

use std::fmt;
use std::rc::Rc;

use crate::error::{LuaError, LuaResult, Span};

/// Where a name lives at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Slot in the current call frame
    Local,
    /// Captured variable of the current closure
    Upvalue,
    /// Field of the globals table
    Global,
    /// The chunk environment itself (`_ENV`)
    ChunkRoot,
}

/// Lua 5.4 local attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalAttrib {
    #[default]
    None,
    Const,
    Close,
}

/// A resolved reference to a variable
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRef {
    pub kind: SymbolKind,
    pub index: usize,
    pub name: Rc<str>,
    pub attrib: LocalAttrib,
    /// Set on frame slots that some inner closure captures
    pub captured: bool,
}

impl SymbolRef {
    pub fn local(index: usize, name: &str, attrib: LocalAttrib) -> Self {
        Self {
            kind: SymbolKind::Local,
            index,
            name: Rc::from(name),
            attrib,
            captured: false,
        }
    }

    pub fn upvalue(index: usize, name: Rc<str>, attrib: LocalAttrib) -> Self {
        Self {
            kind: SymbolKind::Upvalue,
            index,
            name,
            attrib,
            captured: false,
        }
    }

    pub fn global(name: &str) -> Self {
        Self {
            kind: SymbolKind::Global,
            index: 0,
            name: Rc::from(name),
            attrib: LocalAttrib::None,
            captured: false,
        }
    }

    pub fn chunk_root() -> Self {
        Self {
            kind: SymbolKind::ChunkRoot,
            index: 0,
            name: Rc::from("_ENV"),
            attrib: LocalAttrib::None,
            captured: false,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.attrib, LocalAttrib::Const | LocalAttrib::Close)
    }
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SymbolKind::Local => write!(f, "{}@{}", self.name, self.index),
            SymbolKind::Upvalue => write!(f, "^{}@{}", self.name, self.index),
            SymbolKind::Global => write!(f, "_G.{}", self.name),
            SymbolKind::ChunkRoot => write!(f, "_ENV"),
        }
    }
}

/// Slot range owned by a block; the emitter turns it into Enter/Leave
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeBlock {
    pub from: usize,
    pub to: usize,
}

/// Resolution of one `goto`: target label and blocks left on the way
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GotoTarget {
    pub label_id: usize,
    pub exits: usize,
}

/// Everything the emitter needs to know about a finished function scope
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    pub slots: Vec<SymbolRef>,
    /// What a closure over this function captures, expressed in the enclosing frame
    pub upvalues: Vec<SymbolRef>,
    pub gotos: Vec<GotoTarget>,
    pub label_count: usize,
    pub is_vararg: bool,
}

#[derive(Debug)]
struct LocalDecl {
    name: Rc<str>,
    slot: usize,
}

#[derive(Debug)]
struct LabelDecl {
    name: String,
    id: usize,
    line: usize,
    /// Locals of the block live at the label
    locals_at: usize,
    /// No non-void statement follows the label (yet)
    at_end: bool,
}

#[derive(Debug)]
struct PendingGoto {
    id: usize,
    label: String,
    line: usize,
    locals_at: usize,
    exits: usize,
}

#[derive(Debug)]
struct BlockScope {
    from: usize,
    locals: Vec<LocalDecl>,
    labels: Vec<LabelDecl>,
    pending: Vec<PendingGoto>,
}

impl BlockScope {
    fn new(from: usize) -> Self {
        Self {
            from,
            locals: Vec::new(),
            labels: Vec::new(),
            pending: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct FunctionScope {
    blocks: Vec<BlockScope>,
    slots: Vec<SymbolRef>,
    upvalues: Vec<SymbolRef>,
    gotos: Vec<Option<GotoTarget>>,
    label_count: usize,
    loop_heights: Vec<usize>,
    is_vararg: bool,
}

impl FunctionScope {
    fn new(is_vararg: bool) -> Self {
        Self {
            blocks: vec![BlockScope::new(0)],
            slots: Vec::new(),
            upvalues: Vec::new(),
            gotos: Vec::new(),
            label_count: 0,
            loop_heights: Vec::new(),
            is_vararg,
        }
    }

    fn find_local(&self, name: &str) -> Option<SymbolRef> {
        for block in self.blocks.iter().rev() {
            if let Some(decl) = block.locals.iter().rev().find(|l| &*l.name == name) {
                return Some(self.slots[decl.slot].clone());
            }
        }
        None
    }
}

/// Stack of build-time scopes consulted by the parser
pub struct ScopeResolver {
    functions: Vec<FunctionScope>,
    chunk: String,
    end_of_block_exemption: bool,
}

impl ScopeResolver {
    pub fn new(chunk: impl Into<String>, end_of_block_exemption: bool) -> Self {
        Self {
            functions: Vec::new(),
            chunk: chunk.into(),
            end_of_block_exemption,
        }
    }

    fn current(&self) -> LuaResult<&FunctionScope> {
        self.functions
            .last()
            .ok_or_else(|| LuaError::internal("no active function scope"))
    }

    fn current_mut(&mut self) -> LuaResult<&mut FunctionScope> {
        self.functions
            .last_mut()
            .ok_or_else(|| LuaError::internal("no active function scope"))
    }

    fn current_block_mut(&mut self) -> LuaResult<&mut BlockScope> {
        self.current_mut()?
            .blocks
            .last_mut()
            .ok_or_else(|| LuaError::internal("no active block scope"))
    }

    fn syntax(&self, message: String, span: Span) -> LuaError {
        LuaError::syntax(message, span, &self.chunk)
    }

    pub fn push_function(&mut self, is_vararg: bool) {
        self.functions.push(FunctionScope::new(is_vararg));
    }

    pub fn pop_function(&mut self, span: Span) -> LuaResult<FrameLayout> {
        self.close_block(span)?;
        let func = self
            .functions
            .pop()
            .ok_or_else(|| LuaError::internal("function scope underflow"))?;

        let gotos = func
            .gotos
            .into_iter()
            .map(|g| g.ok_or_else(|| LuaError::internal("unresolved goto after function close")))
            .collect::<LuaResult<Vec<_>>>()?;

        Ok(FrameLayout {
            slots: func.slots,
            upvalues: func.upvalues,
            gotos,
            label_count: func.label_count,
            is_vararg: func.is_vararg,
        })
    }

    pub fn push_block(&mut self) -> LuaResult<()> {
        let from = self.current()?.slots.len();
        self.current_mut()?.blocks.push(BlockScope::new(from));
        Ok(())
    }

    pub fn pop_block(&mut self, span: Span) -> LuaResult<RuntimeBlock> {
        if self.current()?.blocks.len() <= 1 {
            return Err(LuaError::internal("cannot pop the function root block"));
        }
        self.close_block(span)
    }

    /// Resolves the block's pending gotos against its labels, moving the rest outward
    fn close_block(&mut self, span: Span) -> LuaResult<RuntimeBlock> {
        let exemption = self.end_of_block_exemption;
        let func = self.current_mut()?;
        let block = func
            .blocks
            .pop()
            .ok_or_else(|| LuaError::internal("block scope underflow"))?;
        let range = RuntimeBlock {
            from: block.from,
            to: func.slots.len(),
        };

        let mut unresolved = Vec::new();
        let mut failure: Option<(String, Span)> = None;

        for goto in block.pending {
            match block.labels.iter().find(|l| l.name == goto.label) {
                Some(label) => {
                    let exempt = exemption && label.at_end;
                    if label.locals_at > goto.locals_at && !exempt {
                        let local = &block.locals[goto.locals_at].name;
                        failure.get_or_insert((
                            format!(
                                "<goto {}> at line {} jumps into the scope of local '{}'",
                                goto.label, goto.line, local
                            ),
                            span,
                        ));
                        continue;
                    }
                    func.gotos[goto.id] = Some(GotoTarget {
                        label_id: label.id,
                        exits: goto.exits,
                    });
                }
                None => unresolved.push(goto),
            }
        }

        if let Some((message, at)) = failure {
            return Err(self.syntax(message, at));
        }

        let func = self.current_mut()?;
        match func.blocks.last_mut() {
            Some(parent) => {
                let locals_at = parent.locals.len();
                for mut goto in unresolved {
                    goto.locals_at = locals_at;
                    goto.exits += 1;
                    parent.pending.push(goto);
                }
            }
            None => {
                if let Some(goto) = unresolved.first() {
                    let message = format!(
                        "no visible label '{}' for <goto> at line {}",
                        goto.label, goto.line
                    );
                    return Err(self.syntax(message, span));
                }
            }
        }

        Ok(range)
    }

    /// Allocates the next slot of the current frame and makes the name visible
    pub fn declare_local(&mut self, name: &str, attrib: LocalAttrib) -> LuaResult<SymbolRef> {
        let func = self.current_mut()?;
        let slot = func.slots.len();
        let symbol = SymbolRef::local(slot, name, attrib);
        func.slots.push(symbol.clone());
        let block = self.current_block_mut()?;
        block.locals.push(LocalDecl {
            name: Rc::from(name),
            slot,
        });
        Ok(symbol)
    }

    /// Resolves a name through locals, upvalues and enclosing functions
    pub fn find(&mut self, name: &str) -> LuaResult<SymbolRef> {
        if self.functions.is_empty() {
            return Err(LuaError::internal("no active function scope"));
        }
        let top = self.functions.len() - 1;
        Ok(self.resolve_in(top, name))
    }

    fn resolve_in(&mut self, index: usize, name: &str) -> SymbolRef {
        if let Some(symbol) = self.functions[index].find_local(name) {
            return symbol;
        }
        if let Some(pos) = self.functions[index]
            .upvalues
            .iter()
            .position(|u| &*u.name == name)
        {
            let attrib = self.functions[index].upvalues[pos].attrib;
            return SymbolRef::upvalue(pos, Rc::from(name), attrib);
        }
        if index == 0 {
            return if name == "_ENV" {
                SymbolRef::chunk_root()
            } else {
                SymbolRef::global(name)
            };
        }

        let outer = self.resolve_in(index - 1, name);
        match outer.kind {
            SymbolKind::Global | SymbolKind::ChunkRoot => outer,
            SymbolKind::Local | SymbolKind::Upvalue => {
                if outer.kind == SymbolKind::Local {
                    self.functions[index - 1].slots[outer.index].captured = true;
                }
                let func = &mut self.functions[index];
                func.upvalues.push(outer.clone());
                SymbolRef::upvalue(func.upvalues.len() - 1, outer.name, outer.attrib)
            }
        }
    }

    pub fn is_vararg(&self) -> bool {
        self.functions.last().map(|f| f.is_vararg).unwrap_or(false)
    }

    pub fn define_label(&mut self, name: &str, span: Span) -> LuaResult<usize> {
        let whole_function = !self.end_of_block_exemption;
        let func = self.current()?;
        let visible: Box<dyn Iterator<Item = &BlockScope>> = if whole_function {
            Box::new(func.blocks.iter())
        } else {
            Box::new(func.blocks.last().into_iter())
        };
        for block in visible {
            if let Some(previous) = block.labels.iter().find(|l| l.name == name) {
                let message = format!(
                    "label '{}' already defined on line {}",
                    name, previous.line
                );
                return Err(self.syntax(message, span));
            }
        }

        let func = self.current_mut()?;
        let id = func.label_count;
        func.label_count += 1;
        let block = self.current_block_mut()?;
        let locals_at = block.locals.len();
        block.labels.push(LabelDecl {
            name: name.to_string(),
            id,
            line: span.start.line,
            locals_at,
            at_end: true,
        });
        Ok(id)
    }

    /// Registers a goto; backward targets resolve at once, forward ones on block close
    pub fn register_goto(&mut self, label: &str, span: Span) -> LuaResult<usize> {
        let func = self.current_mut()?;
        let id = func.gotos.len();
        let depth = func.blocks.len();

        let mut backward = None;
        for (height, block) in func.blocks.iter().enumerate().rev() {
            if let Some(decl) = block.labels.iter().find(|l| l.name == label) {
                backward = Some(GotoTarget {
                    label_id: decl.id,
                    exits: depth - 1 - height,
                });
                break;
            }
        }
        func.gotos.push(backward);

        if backward.is_none() {
            let block = self.current_block_mut()?;
            let locals_at = block.locals.len();
            block.pending.push(PendingGoto {
                id,
                label: label.to_string(),
                line: span.start.line,
                locals_at,
                exits: 0,
            });
        }
        Ok(id)
    }

    /// Called before each statement that is not a label or an empty statement,
    /// and before a `repeat` loop's `until` condition
    pub fn mark_non_void_statement(&mut self) -> LuaResult<()> {
        let block = self.current_block_mut()?;
        for label in block.labels.iter_mut() {
            label.at_end = false;
        }
        Ok(())
    }

    pub fn push_loop(&mut self) -> LuaResult<()> {
        let func = self.current_mut()?;
        let height = func.blocks.len();
        func.loop_heights.push(height);
        Ok(())
    }

    pub fn pop_loop(&mut self) -> LuaResult<()> {
        self.current_mut()?.loop_heights.pop();
        Ok(())
    }

    /// Number of blocks a `break` leaves, or an error outside loops
    pub fn break_exits(&self, span: Span) -> LuaResult<usize> {
        let func = self.current()?;
        match func.loop_heights.last() {
            Some(height) => Ok(func.blocks.len() - height),
            None => Err(self.syntax(
                format!("break outside a loop at line {}", span.start.line),
                span,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(line: usize) -> Span {
        Span::single(line, 1, 0)
    }

    #[test]
    fn locals_get_unique_slots() {
        let mut r = ScopeResolver::new("test", false);
        r.push_function(true);
        let a = r.declare_local("a", LocalAttrib::None).unwrap();
        r.push_block().unwrap();
        let b = r.declare_local("a", LocalAttrib::None).unwrap();
        assert_eq!(r.find("a").unwrap().index, b.index);
        let block = r.pop_block(span(1)).unwrap();
        assert_eq!(block, RuntimeBlock { from: 1, to: 2 });
        assert_eq!(r.find("a").unwrap().index, a.index);
        assert_ne!(a.index, b.index);
        assert_eq!(r.find("print").unwrap().kind, SymbolKind::Global);
        assert_eq!(r.find("_ENV").unwrap().kind, SymbolKind::ChunkRoot);
    }

    #[test]
    fn upvalues_chain_through_intermediate_functions() {
        let mut r = ScopeResolver::new("test", false);
        r.push_function(true);
        r.declare_local("x", LocalAttrib::None).unwrap();
        r.push_function(false);
        r.push_function(false);
        let inner = r.find("x").unwrap();
        assert_eq!(inner.kind, SymbolKind::Upvalue);
        let innermost = r.pop_function(span(3)).unwrap();
        assert_eq!(innermost.upvalues[0].kind, SymbolKind::Upvalue);
        let middle = r.pop_function(span(4)).unwrap();
        assert_eq!(middle.upvalues[0].kind, SymbolKind::Local);
        let root = r.pop_function(span(5)).unwrap();
        assert!(root.slots[0].captured);
    }

    #[test]
    fn forward_goto_into_local_scope_fails() {
        let mut r = ScopeResolver::new("test", false);
        r.push_function(true);
        r.register_goto("a", span(1)).unwrap();
        r.mark_non_void_statement().unwrap();
        r.declare_local("x", LocalAttrib::None).unwrap();
        r.define_label("a", span(1)).unwrap();
        let err = r.pop_function(span(1)).unwrap_err();
        assert!(err.message.contains("jumps into the scope of local 'x'"));
    }

    #[test]
    fn end_of_block_label_is_exempt_when_enabled() {
        let mut r = ScopeResolver::new("test", true);
        r.push_function(true);
        r.register_goto("a", span(1)).unwrap();
        r.mark_non_void_statement().unwrap();
        r.declare_local("x", LocalAttrib::None).unwrap();
        r.define_label("a", span(1)).unwrap();
        let layout = r.pop_function(span(1)).unwrap();
        assert_eq!(layout.gotos[0], GotoTarget { label_id: 0, exits: 0 });
    }

    #[test]
    fn goto_out_of_nested_blocks_counts_exits() {
        let mut r = ScopeResolver::new("test", false);
        r.push_function(true);
        r.push_block().unwrap();
        r.push_block().unwrap();
        let id = r.register_goto("done", span(2)).unwrap();
        r.pop_block(span(3)).unwrap();
        r.pop_block(span(4)).unwrap();
        r.define_label("done", span(5)).unwrap();
        let layout = r.pop_function(span(6)).unwrap();
        assert_eq!(layout.gotos[id].exits, 2);
    }

    #[test]
    fn backward_goto_resolves_immediately() {
        let mut r = ScopeResolver::new("test", false);
        r.push_function(true);
        let label = r.define_label("top", span(1)).unwrap();
        r.push_block().unwrap();
        let id = r.register_goto("top", span(2)).unwrap();
        r.pop_block(span(3)).unwrap();
        let layout = r.pop_function(span(4)).unwrap();
        assert_eq!(layout.gotos[id], GotoTarget { label_id: label, exits: 1 });
    }

    #[test]
    fn missing_label_and_duplicates_are_reported() {
        let mut r = ScopeResolver::new("test", false);
        r.push_function(true);
        r.register_goto("nowhere", span(7)).unwrap();
        let err = r.pop_function(span(8)).unwrap_err();
        assert!(err.message.contains("no visible label 'nowhere' for <goto> at line 7"));

        let mut r = ScopeResolver::new("test", false);
        r.push_function(true);
        r.define_label("x", span(1)).unwrap();
        r.push_block().unwrap();
        let err = r.define_label("x", span(2)).unwrap_err();
        assert!(err.message.contains("label 'x' already defined on line 1"));
    }

    #[test]
    fn break_needs_a_loop() {
        let mut r = ScopeResolver::new("test", false);
        r.push_function(true);
        assert!(r.break_exits(span(1)).is_err());
        r.push_loop().unwrap();
        r.push_block().unwrap();
        r.push_block().unwrap();
        assert_eq!(r.break_exits(span(2)).unwrap(), 2);
    }
}
