// Lunar Parser
// Recursive descent parser that converts tokens into a scope-resolved AST

use crate::ast::*;
use crate::error::{LuaError, LuaResult, Span};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::profile::CompatibilityProfile;
use crate::scope::{LocalAttrib, ScopeResolver, SymbolKind};
use crate::vm::Number;

/// Nesting limit for statements and expressions
const MAX_SYNTAX_LEVELS: usize = 200;

/// Scan and parse a whole chunk under the given profile
pub fn parse_chunk(
    source: &str,
    chunk: &str,
    profile: &CompatibilityProfile,
) -> LuaResult<Chunk> {
    let tokens = Scanner::new(source, chunk)
        .with_goto_keyword(profile.goto_statement)
        .scan_tokens()?;
    Parser::new(tokens, chunk, source, *profile).parse()
}

/// Recursive descent parser for Lua
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    chunk: String,
    source: String,
    profile: CompatibilityProfile,
    scope: ScopeResolver,
    depth: usize,
}

impl Parser {
    pub fn new(
        tokens: Vec<Token>,
        chunk: impl Into<String>,
        source: impl Into<String>,
        profile: CompatibilityProfile,
    ) -> Self {
        let chunk = chunk.into();
        Self {
            tokens,
            current: 0,
            scope: ScopeResolver::new(chunk.clone(), profile.label_end_of_block_exemption),
            chunk,
            source: source.into(),
            profile,
            depth: 0,
        }
    }

    /// Parse the entire chunk as the body of a vararg main function
    pub fn parse(&mut self) -> LuaResult<Chunk> {
        let start = self.peek().span;
        self.scope.push_function(true);
        let varargs = self.scope.declare_local("...", LocalAttrib::None)?;

        let body = self.block()?;
        if !self.is_at_end() {
            return Err(self.error("'<eof>' expected"));
        }

        let span = start.merge(self.peek().span);
        let layout = self.scope.pop_function(span)?;

        Ok(Chunk {
            name: self.chunk.clone(),
            main: FunctionBody {
                name: "main chunk".to_string(),
                params: Vec::new(),
                varargs: Some(varargs),
                body,
                layout,
                span,
            },
        })
    }

    // ==================== Blocks ====================

    fn block(&mut self) -> LuaResult<Block> {
        let start = self.peek().span;
        self.scope.push_block()?;
        let statements = self.statement_list()?;
        let span = start.merge(self.previous_span());
        let scope = self.scope.pop_block(span)?;
        Ok(Block {
            statements,
            scope,
            span,
        })
    }

    fn statement_list(&mut self) -> LuaResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.peek().kind.is_block_end() {
            if self.check(&TokenKind::Return) {
                self.scope.mark_non_void_statement()?;
                statements.push(self.return_statement()?);
                // return closes the block; the caller reports what follows
                break;
            }
            if let Some(stmt) = self.statement()? {
                statements.push(stmt);
            }
        }
        Ok(statements)
    }

    // ==================== Statements ====================

    fn statement(&mut self) -> LuaResult<Option<Stmt>> {
        self.enter_level()?;
        let result = self.statement_inner();
        self.depth -= 1;
        result
    }

    fn statement_inner(&mut self) -> LuaResult<Option<Stmt>> {
        let kind = self.peek().kind.clone();
        match kind {
            TokenKind::Semicolon => {
                self.advance();
                return Ok(None);
            }
            TokenKind::ColonColon => return self.label_statement().map(Some),
            _ => {}
        }

        self.scope.mark_non_void_statement()?;
        let stmt = match kind {
            TokenKind::If => self.if_statement()?,
            TokenKind::While => self.while_statement()?,
            TokenKind::Do => self.do_statement()?,
            TokenKind::For => self.for_statement()?,
            TokenKind::Repeat => self.repeat_statement()?,
            TokenKind::Function => self.function_statement()?,
            TokenKind::Local => {
                self.advance();
                if self.match_token(&TokenKind::Function) {
                    self.local_function()?
                } else {
                    self.local_statement()?
                }
            }
            TokenKind::Goto => self.goto_statement()?,
            TokenKind::Break => self.break_statement()?,
            _ => self.expression_statement()?,
        };
        Ok(Some(stmt))
    }

    fn label_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume '::'
        let name = self.consume_name("<name> expected")?;
        self.consume(&TokenKind::ColonColon, "'::' expected")?;
        let span = start.merge(self.previous_span());
        let id = self.scope.define_label(&name, span)?;
        Ok(Stmt::Label { name, id, span })
    }

    fn goto_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume 'goto'
        let label = self.consume_name("<name> expected")?;
        let span = start.merge(self.previous_span());
        let id = self.scope.register_goto(&label, span)?;
        Ok(Stmt::Goto { label, id, span })
    }

    fn break_statement(&mut self) -> LuaResult<Stmt> {
        let span = self.advance().span; // consume 'break'
        let exits = self.scope.break_exits(span)?;
        Ok(Stmt::Break { exits, span })
    }

    fn return_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume 'return'
        let values = if self.peek().kind.is_block_end() || self.check(&TokenKind::Semicolon) {
            Vec::new()
        } else {
            self.expression_list()?
        };
        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Return {
            values,
            span: start.merge(self.previous_span()),
        })
    }

    fn if_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume 'if'
        let mut clauses = Vec::new();

        let condition = self.expression()?;
        self.consume(&TokenKind::Then, "'then' expected")?;
        clauses.push((condition, self.block()?));

        while self.match_token(&TokenKind::Elseif) {
            let condition = self.expression()?;
            self.consume(&TokenKind::Then, "'then' expected")?;
            clauses.push((condition, self.block()?));
        }

        let else_block = if self.match_token(&TokenKind::Else) {
            Some(self.block()?)
        } else {
            None
        };

        self.consume_end("if", start.start.line)?;
        Ok(Stmt::If {
            clauses,
            else_block,
            span: start.merge(self.previous_span()),
        })
    }

    fn while_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume 'while'
        let condition = self.expression()?;
        self.consume(&TokenKind::Do, "'do' expected")?;

        self.scope.push_loop()?;
        let body = self.block()?;
        self.scope.pop_loop()?;

        self.consume_end("while", start.start.line)?;
        Ok(Stmt::While {
            condition,
            body,
            span: start.merge(self.previous_span()),
        })
    }

    fn do_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume 'do'
        let block = self.block()?;
        self.consume_end("do", start.start.line)?;
        Ok(Stmt::Do {
            block,
            span: start.merge(self.previous_span()),
        })
    }

    fn repeat_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume 'repeat'

        self.scope.push_loop()?;
        self.scope.push_block()?;
        let statements = self.statement_list()?;
        if !self.check(&TokenKind::Until) {
            return Err(self.match_error("until", "repeat", start.start.line));
        }
        self.advance();
        // the condition still sees the body's locals, so labels before it are not at the end
        self.scope.mark_non_void_statement()?;
        let condition = self.expression()?;
        let body_span = start.merge(self.previous_span());
        let scope = self.scope.pop_block(body_span)?;
        self.scope.pop_loop()?;

        Ok(Stmt::Repeat {
            body: Block {
                statements,
                scope,
                span: body_span,
            },
            condition,
            span: body_span,
        })
    }

    fn for_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume 'for'
        let first = self.consume_name("<name> expected")?;

        if self.check(&TokenKind::Equal) {
            self.numeric_for(start, first)
        } else if self.check(&TokenKind::Comma) || self.check(&TokenKind::In) {
            self.generic_for(start, first)
        } else {
            Err(self.error("'=' or 'in' expected"))
        }
    }

    fn numeric_for(&mut self, start: Span, name: String) -> LuaResult<Stmt> {
        self.advance(); // consume '='
        let initial = self.expression()?;
        self.consume(&TokenKind::Comma, "',' expected")?;
        let limit = self.expression()?;
        let step = if self.match_token(&TokenKind::Comma) {
            Some(self.expression()?)
        } else {
            None
        };
        self.consume(&TokenKind::Do, "'do' expected")?;

        self.scope.push_block()?;
        let control = [
            self.scope.declare_local("(for state)", LocalAttrib::None)?,
            self.scope.declare_local("(for limit)", LocalAttrib::None)?,
            self.scope.declare_local("(for step)", LocalAttrib::None)?,
        ];

        self.scope.push_loop()?;
        let body_start = self.peek().span;
        self.scope.push_block()?;
        let variable = self.scope.declare_local(&name, LocalAttrib::None)?;
        let statements = self.statement_list()?;
        let body_span = body_start.merge(self.previous_span());
        let body_scope = self.scope.pop_block(body_span)?;
        self.scope.pop_loop()?;

        self.consume_end("for", start.start.line)?;
        let span = start.merge(self.previous_span());
        let loop_scope = self.scope.pop_block(span)?;

        Ok(Stmt::NumericFor {
            control,
            variable,
            start: initial,
            limit,
            step,
            loop_scope,
            body: Block {
                statements,
                scope: body_scope,
                span: body_span,
            },
            span,
        })
    }

    fn generic_for(&mut self, start: Span, first: String) -> LuaResult<Stmt> {
        let mut names = vec![first];
        while self.match_token(&TokenKind::Comma) {
            names.push(self.consume_name("<name> expected")?);
        }
        self.consume(&TokenKind::In, "'in' expected")?;
        let exprs = self.expression_list()?;
        self.consume(&TokenKind::Do, "'do' expected")?;

        self.scope.push_block()?;
        let control = [
            self.scope.declare_local("(for generator)", LocalAttrib::None)?,
            self.scope.declare_local("(for state)", LocalAttrib::None)?,
            self.scope.declare_local("(for control)", LocalAttrib::None)?,
        ];

        self.scope.push_loop()?;
        let body_start = self.peek().span;
        self.scope.push_block()?;
        let mut variables = Vec::with_capacity(names.len());
        for name in &names {
            variables.push(self.scope.declare_local(name, LocalAttrib::None)?);
        }
        let statements = self.statement_list()?;
        let body_span = body_start.merge(self.previous_span());
        let body_scope = self.scope.pop_block(body_span)?;
        self.scope.pop_loop()?;

        self.consume_end("for", start.start.line)?;
        let span = start.merge(self.previous_span());
        let loop_scope = self.scope.pop_block(span)?;

        Ok(Stmt::GenericFor {
            control,
            variables,
            exprs,
            loop_scope,
            body: Block {
                statements,
                scope: body_scope,
                span: body_span,
            },
            span,
        })
    }

    /// function a.b.c:m(params) ... end
    fn function_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.advance().span; // consume 'function'
        let first_span = self.peek().span;
        let first = self.consume_name("<name> expected")?;
        let mut full_name = first.clone();
        let mut target = self.name_reference(&first, first_span)?;

        let mut is_method = false;
        loop {
            if self.match_token(&TokenKind::Dot) {
                let key_span = self.peek().span;
                let key = self.consume_name("<name> expected")?;
                full_name.push('.');
                full_name.push_str(&key);
                target = self.field(target, key, key_span);
            } else if self.match_token(&TokenKind::Colon) {
                let key_span = self.peek().span;
                let key = self.consume_name("<name> expected")?;
                full_name.push(':');
                full_name.push_str(&key);
                target = self.field(target, key, key_span);
                is_method = true;
                break;
            } else {
                break;
            }
        }

        self.check_assignable(&target)?;
        let body = self.function_body(is_method, full_name, start)?;
        Ok(Stmt::Function {
            target,
            body: Box::new(body),
            span: start.merge(self.previous_span()),
        })
    }

    /// local function f() ... end (f is visible inside its own body)
    fn local_function(&mut self) -> LuaResult<Stmt> {
        let start = self.previous_span();
        let name = self.consume_name("<name> expected")?;
        let symbol = self.scope.declare_local(&name, LocalAttrib::None)?;
        let body = self.function_body(false, name, start)?;
        Ok(Stmt::LocalFunction {
            symbol,
            body: Box::new(body),
            span: start.merge(self.previous_span()),
        })
    }

    /// local a <const>, b = explist
    fn local_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.previous_span();
        let mut names = Vec::new();
        let mut has_close = false;

        loop {
            let name = self.consume_name("<name> expected")?;
            let attrib = self.local_attribute()?;
            if attrib == LocalAttrib::Close {
                if has_close {
                    return Err(self.error("multiple to-be-closed variables in local list"));
                }
                has_close = true;
            }
            names.push((name, attrib));
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        let values = if self.match_token(&TokenKind::Equal) {
            self.expression_list()?
        } else {
            Vec::new()
        };

        let mut targets = Vec::with_capacity(names.len());
        for (name, attrib) in &names {
            targets.push(self.scope.declare_local(name, *attrib)?);
        }

        Ok(Stmt::Local {
            targets,
            values,
            span: start.merge(self.previous_span()),
        })
    }

    fn local_attribute(&mut self) -> LuaResult<LocalAttrib> {
        if !(self.profile.const_locals || self.profile.to_be_closed_variables) {
            return Ok(LocalAttrib::None);
        }
        if !self.match_token(&TokenKind::Less) {
            return Ok(LocalAttrib::None);
        }
        let attrib = self.consume_name("<name> expected")?;
        let result = match attrib.as_str() {
            "const" if self.profile.const_locals => LocalAttrib::Const,
            "close" if self.profile.to_be_closed_variables => LocalAttrib::Close,
            _ => {
                return Err(LuaError::syntax(
                    format!("unknown attribute '{}'", attrib),
                    self.previous_span(),
                    &self.chunk,
                )
                .with_source(&self.source))
            }
        };
        self.consume(&TokenKind::Greater, "'>' expected")?;
        Ok(result)
    }

    /// Assignment or call statement
    fn expression_statement(&mut self) -> LuaResult<Stmt> {
        let start = self.peek().span;
        let first = self.suffixed_expression()?;

        if self.check(&TokenKind::Equal) || self.check(&TokenKind::Comma) {
            let mut targets = vec![first];
            while self.match_token(&TokenKind::Comma) {
                targets.push(self.suffixed_expression()?);
            }
            for target in &targets {
                self.check_assignable(target)?;
            }
            self.consume(&TokenKind::Equal, "'=' expected")?;
            let values = self.expression_list()?;
            return Ok(Stmt::Assign {
                targets,
                values,
                span: start.merge(self.previous_span()),
            });
        }

        if !first.is_call() {
            return Err(self.error("syntax error"));
        }
        Ok(Stmt::Call {
            call: first,
            span: start.merge(self.previous_span()),
        })
    }

    fn check_assignable(&self, target: &Expr) -> LuaResult<()> {
        match target {
            Expr::Symbol { symbol, span } => {
                if symbol.is_read_only() {
                    return Err(LuaError::syntax(
                        format!("attempt to assign to const variable '{}'", symbol.name),
                        *span,
                        &self.chunk,
                    )
                    .with_source(&self.source));
                }
                if symbol.kind == SymbolKind::ChunkRoot {
                    return Err(LuaError::syntax(
                        "cannot assign to the chunk environment '_ENV'",
                        *span,
                        &self.chunk,
                    )
                    .with_source(&self.source)
                    .with_help("declare 'local _ENV = ...' to change the environment of a block"));
                }
                Ok(())
            }
            Expr::Index { .. } => Ok(()),
            _ => Err(self.error("syntax error")),
        }
    }

    // ==================== Functions ====================

    /// Parses `(params) block end` into a closed function scope
    fn function_body(&mut self, is_method: bool, name: String, start: Span) -> LuaResult<FunctionBody> {
        self.consume(&TokenKind::LeftParen, "'(' expected")?;
        let mut param_names = Vec::new();
        let mut is_vararg = false;

        if !self.check(&TokenKind::RightParen) {
            loop {
                if self.match_token(&TokenKind::DotDotDot) {
                    is_vararg = true;
                    break;
                }
                param_names.push(self.consume_name("<name> expected")?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "')' expected")?;

        self.scope.push_function(is_vararg);
        let mut params = Vec::with_capacity(param_names.len() + 1);
        if is_method {
            params.push(self.scope.declare_local("self", LocalAttrib::None)?);
        }
        for param in &param_names {
            params.push(self.scope.declare_local(param, LocalAttrib::None)?);
        }
        let varargs = if is_vararg {
            Some(self.scope.declare_local("...", LocalAttrib::None)?)
        } else {
            None
        };

        let body = self.block()?;
        self.consume_end("function", start.start.line)?;
        let span = start.merge(self.previous_span());
        let layout = self.scope.pop_function(span)?;

        Ok(FunctionBody {
            name,
            params,
            varargs,
            body,
            layout,
            span,
        })
    }

    // ==================== Expressions ====================

    fn expression_list(&mut self) -> LuaResult<Vec<Expr>> {
        let mut exprs = vec![self.expression()?];
        while self.match_token(&TokenKind::Comma) {
            exprs.push(self.expression()?);
        }
        Ok(exprs)
    }

    fn expression(&mut self) -> LuaResult<Expr> {
        self.sub_expression(0)
    }

    /// Precedence climbing: parses operators whose left priority exceeds `limit`
    fn sub_expression(&mut self, limit: u8) -> LuaResult<Expr> {
        self.enter_level()?;

        let mut left = match UnaryOp::from_token(&self.peek().kind) {
            Some(op) => {
                if op == UnaryOp::BitNot && !self.profile.bitwise_operators {
                    return Err(self.error("unexpected symbol"));
                }
                let start = self.advance().span;
                let operand = self.sub_expression(UNARY_PRIORITY)?;
                let span = start.merge(operand.span());
                fold_unary(op, operand, span)
            }
            None => self.simple_expression()?,
        };

        while let Some(op) = BinaryOp::from_token(&self.peek().kind) {
            let (left_priority, right_priority) = op.precedence();
            if left_priority <= limit {
                break;
            }
            if (op.is_bitwise() && !self.profile.bitwise_operators)
                || (op == BinaryOp::FloorDiv && !self.profile.floor_division)
            {
                return Err(self.error("unexpected symbol"));
            }
            self.advance();
            let right = self.sub_expression(right_priority)?;
            let span = left.span().merge(right.span());
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
                span,
            };
        }

        self.depth -= 1;
        Ok(left)
    }

    fn simple_expression(&mut self) -> LuaResult<Expr> {
        let token = self.peek().clone();
        let span = token.span;
        let expr = match token.kind {
            TokenKind::Integer(value) => {
                self.advance();
                Expr::Integer { value, span }
            }
            TokenKind::Float(value) => {
                self.advance();
                // without an integer subtype, integral numbers share one representation
                match Number::Float(value).normalized() {
                    Number::Integer(value) if !self.profile.integer_subtype => {
                        Expr::Integer { value, span }
                    }
                    _ => Expr::Float { value, span },
                }
            }
            TokenKind::String(value) => {
                self.advance();
                Expr::String { value, span }
            }
            TokenKind::Nil => {
                self.advance();
                Expr::Nil { span }
            }
            TokenKind::True => {
                self.advance();
                Expr::Boolean { value: true, span }
            }
            TokenKind::False => {
                self.advance();
                Expr::Boolean { value: false, span }
            }
            TokenKind::DotDotDot => {
                if !self.scope.is_vararg() {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                self.advance();
                let symbol = self.scope.find("...")?;
                Expr::Varargs { symbol, span }
            }
            TokenKind::LeftBrace => self.table_constructor()?,
            TokenKind::Function => {
                self.advance();
                let body = self.function_body(false, "anonymous".to_string(), span)?;
                Expr::Function {
                    span: span.merge(self.previous_span()),
                    body: Box::new(body),
                }
            }
            _ => self.suffixed_expression()?,
        };
        Ok(expr)
    }

    fn primary_expression(&mut self) -> LuaResult<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Name(name) => {
                self.advance();
                self.name_reference(&name, token.span)
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.expression()?;
                self.consume(&TokenKind::RightParen, "')' expected")?;
                Ok(Expr::Paren {
                    expr: Box::new(inner),
                    span: token.span.merge(self.previous_span()),
                })
            }
            _ => Err(self.error("unexpected symbol")),
        }
    }

    /// primary { '.' Name | '[' exp ']' | ':' Name args | args }
    fn suffixed_expression(&mut self) -> LuaResult<Expr> {
        let mut expr = self.primary_expression()?;
        loop {
            let kind = self.peek().kind.clone();
            match kind {
                TokenKind::Dot => {
                    self.advance();
                    let key_span = self.peek().span;
                    let key = self.consume_name("<name> expected")?;
                    expr = self.field(expr, key, key_span);
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.consume(&TokenKind::RightBracket, "']' expected")?;
                    let span = expr.span().merge(self.previous_span());
                    expr = Expr::Index {
                        object: Box::new(expr),
                        key: Box::new(key),
                        span,
                    };
                }
                TokenKind::Colon => {
                    self.advance();
                    let method = self.consume_name("<name> expected")?;
                    let args = self.call_arguments()?;
                    let span = expr.span().merge(self.previous_span());
                    expr = Expr::MethodCall {
                        object: Box::new(expr),
                        method,
                        args,
                        span,
                    };
                }
                TokenKind::LeftParen | TokenKind::String(_) | TokenKind::LeftBrace => {
                    let args = self.call_arguments()?;
                    let span = expr.span().merge(self.previous_span());
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        span,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_arguments(&mut self) -> LuaResult<Vec<Expr>> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::String(value) => {
                self.advance();
                Ok(vec![Expr::String {
                    value,
                    span: token.span,
                }])
            }
            TokenKind::LeftBrace => Ok(vec![self.table_constructor()?]),
            TokenKind::LeftParen => {
                self.advance();
                let args = if self.check(&TokenKind::RightParen) {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                self.consume(&TokenKind::RightParen, "')' expected")?;
                Ok(args)
            }
            _ => Err(self.error("function arguments expected")),
        }
    }

    /// { [k] = v, name = v, v; ... }
    fn table_constructor(&mut self) -> LuaResult<Expr> {
        let start = self.advance().span; // consume '{'
        let mut fields = Vec::new();

        while !self.check(&TokenKind::RightBrace) {
            if self.check(&TokenKind::LeftBracket) {
                self.advance();
                let key = self.expression()?;
                self.consume(&TokenKind::RightBracket, "']' expected")?;
                self.consume(&TokenKind::Equal, "'=' expected")?;
                let value = self.expression()?;
                fields.push(TableField::Keyed { key, value });
            } else if matches!(self.peek().kind, TokenKind::Name(_))
                && self.check_ahead(1, &TokenKind::Equal)
            {
                let key_span = self.peek().span;
                let name = self.consume_name("<name> expected")?;
                self.advance(); // consume '='
                let value = self.expression()?;
                fields.push(TableField::Keyed {
                    key: Expr::String {
                        value: name.into_bytes(),
                        span: key_span,
                    },
                    value,
                });
            } else {
                fields.push(TableField::Positional(self.expression()?));
            }

            if !self.match_token(&TokenKind::Comma) && !self.match_token(&TokenKind::Semicolon) {
                break;
            }
        }

        if !self.check(&TokenKind::RightBrace) {
            return Err(self.match_error("}", "{", start.start.line));
        }
        self.advance();
        Ok(Expr::Table {
            fields,
            span: start.merge(self.previous_span()),
        })
    }

    // ==================== Name resolution ====================

    /// Resolves a name; free names go through a visible `local _ENV` when there is one
    fn name_reference(&mut self, name: &str, span: Span) -> LuaResult<Expr> {
        let symbol = self.scope.find(name)?;
        if symbol.kind == SymbolKind::Global {
            let env = self.scope.find("_ENV")?;
            if matches!(env.kind, SymbolKind::Local | SymbolKind::Upvalue) {
                return Ok(Expr::Index {
                    object: Box::new(Expr::Symbol { symbol: env, span }),
                    key: Box::new(Expr::String {
                        value: name.as_bytes().to_vec(),
                        span,
                    }),
                    span,
                });
            }
        }
        Ok(Expr::Symbol { symbol, span })
    }

    fn field(&self, object: Expr, key: String, key_span: Span) -> Expr {
        let span = object.span().merge(key_span);
        Expr::Index {
            object: Box::new(object),
            key: Box::new(Expr::String {
                value: key.into_bytes(),
                span: key_span,
            }),
            span,
        }
    }

    // ==================== Helpers ====================

    fn enter_level(&mut self) -> LuaResult<()> {
        self.depth += 1;
        if self.depth > MAX_SYNTAX_LEVELS {
            return Err(self.error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn previous_span(&self) -> Span {
        self.previous().span
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn check_ahead(&self, n: usize, kind: &TokenKind) -> bool {
        let idx = self.current + n;
        if idx >= self.tokens.len() {
            return false;
        }
        std::mem::discriminant(&self.tokens[idx].kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> LuaResult<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(message))
        }
    }

    fn consume_name(&mut self, message: &str) -> LuaResult<String> {
        if let TokenKind::Name(name) = &self.peek().kind {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error(message))
        }
    }

    fn consume_end(&mut self, what: &str, line: usize) -> LuaResult<()> {
        if self.match_token(&TokenKind::End) {
            Ok(())
        } else {
            Err(self.match_error("end", what, line))
        }
    }

    /// "'end' expected (to close 'if' at line 3)"
    fn match_error(&self, expected: &str, opener: &str, line: usize) -> LuaError {
        if line == self.peek().span.start.line {
            self.error(&format!("'{}' expected", expected))
        } else {
            self.error(&format!(
                "'{}' expected (to close '{}' at line {})",
                expected, opener, line
            ))
        }
    }

    fn error(&self, message: &str) -> LuaError {
        let token = self.peek();
        let near = if token.is_eof() {
            "<eof>".to_string()
        } else {
            token.lexeme.clone()
        };
        let err = LuaError::syntax(format!("{} near '{}'", message, near), token.span, &self.chunk)
            .with_source(&self.source);
        if token.is_eof() {
            err.premature()
        } else {
            err
        }
    }
}

/// Folds negation of numeric literals so `-1` is a single constant
fn fold_unary(op: UnaryOp, operand: Expr, span: Span) -> Expr {
    match (op, &operand) {
        (UnaryOp::Negate, Expr::Integer { value, .. }) => Expr::Integer {
            value: value.wrapping_neg(),
            span,
        },
        (UnaryOp::Negate, Expr::Float { value, .. }) => Expr::Float {
            value: -value,
            span,
        },
        _ => Expr::Unary {
            op,
            operand: Box::new(operand),
            span,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::profile::LuaVersion;

    fn parse(source: &str, version: LuaVersion) -> LuaResult<Chunk> {
        parse_chunk(source, "test", CompatibilityProfile::for_version(version))
    }

    fn parse_err(source: &str, version: LuaVersion) -> LuaError {
        match parse(source, version) {
            Ok(_) => panic!("expected a syntax error for {:?}", source),
            Err(e) => e,
        }
    }

    #[test]
    fn parses_basic_statements() {
        let chunk = parse(
            "local a, b = 1, 2\nfunction t.x:y(z) return z end\nwhile a do a = nil end",
            LuaVersion::Lua54,
        )
        .unwrap();
        assert_eq!(chunk.main.body.statements.len(), 3);
        assert!(matches!(chunk.main.body.statements[0], Stmt::Local { .. }));
        match &chunk.main.body.statements[1] {
            Stmt::Function { body, .. } => {
                assert_eq!(body.name, "t.x:y");
                assert_eq!(&*body.params[0].name, "self");
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn precedence_follows_the_operator_table() {
        let chunk = parse("return 1 + 2 * 3 ^ 2 .. 'x' .. 'y'", LuaVersion::Lua54).unwrap();
        let Stmt::Return { values, .. } = &chunk.main.body.statements[0] else {
            panic!("expected return");
        };
        // concat is the loosest operator here and is right associative
        let Expr::Binary { op, left, right, .. } = &values[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Concat);
        assert!(matches!(**left, Expr::Binary { op: BinaryOp::Add, .. }));
        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Concat, .. }));
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let chunk = parse("return -x ^ 2", LuaVersion::Lua54).unwrap();
        let Stmt::Return { values, .. } = &chunk.main.body.statements[0] else {
            panic!("expected return");
        };
        assert!(matches!(
            &values[0],
            Expr::Unary { op: UnaryOp::Negate, .. }
        ));
    }

    #[test]
    fn return_must_be_last() {
        let err = parse_err("do return 1 print(2) end", LuaVersion::Lua54);
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert!(err.message.contains("'end' expected"));
    }

    #[test]
    fn goto_into_local_scope_depends_on_version() {
        let source = "goto a; local x = 1; ::a::";
        let err = parse_err(source, LuaVersion::Lua54);
        assert!(err.message.contains("jumps into the scope of local 'x'"));
        assert!(parse(source, LuaVersion::Lua52).is_ok());
    }

    #[test]
    fn version_gated_syntax() {
        assert!(parse("return 1 << 2", LuaVersion::Lua53).is_ok());
        assert!(parse("return 1 << 2", LuaVersion::Lua52).is_err());
        assert!(parse("return 7 // 2", LuaVersion::Lua51).is_err());
        assert!(parse("local x <const> = 1; local y <close> = nil", LuaVersion::Lua54).is_ok());
        assert!(parse("local x <const> = 1", LuaVersion::Lua53).is_err());
        assert!(parse("goto done; ::done::", LuaVersion::Lua51).is_err());
    }

    #[test]
    fn const_assignment_is_rejected() {
        let err = parse_err("local x <const> = 1; x = 2", LuaVersion::Lua54);
        assert!(err.message.contains("attempt to assign to const variable 'x'"));
        let err = parse_err(
            "local x <const> = 1; local f = function() x = 2 end",
            LuaVersion::Lua54,
        );
        assert!(err.message.contains("const variable 'x'"));
    }

    #[test]
    fn unknown_attribute_and_bad_varargs() {
        let err = parse_err("local x <foo> = 1", LuaVersion::Lua54);
        assert!(err.message.contains("unknown attribute 'foo'"));
        let err = parse_err("function f() return ... end", LuaVersion::Lua54);
        assert!(err.message.contains("cannot use '...' outside a vararg function"));
    }

    #[test]
    fn incomplete_chunks_are_marked_premature() {
        let err = parse_err("function f()", LuaVersion::Lua54);
        assert!(err.premature_eof);
        let err = parse_err("x = = 1", LuaVersion::Lua54);
        assert!(!err.premature_eof);
    }

    #[test]
    fn local_env_redirects_free_names() {
        let chunk = parse("local _ENV = {}; y = 1", LuaVersion::Lua54).unwrap();
        let Stmt::Assign { targets, .. } = &chunk.main.body.statements[1] else {
            panic!("expected assignment");
        };
        assert!(matches!(targets[0], Expr::Index { .. }));
    }

    #[test]
    fn integral_floats_fold_to_integers_without_subtype() {
        let chunk = parse("return 1e2, 2.5", LuaVersion::Lua51).unwrap();
        let Stmt::Return { values, .. } = &chunk.main.body.statements[0] else {
            panic!("expected return");
        };
        assert!(matches!(values[0], Expr::Integer { value: 100, .. }));
        assert!(matches!(values[1], Expr::Float { .. }));

        let chunk = parse("return 1e2", LuaVersion::Lua54).unwrap();
        let Stmt::Return { values, .. } = &chunk.main.body.statements[0] else {
            panic!("expected return");
        };
        assert!(matches!(values[0], Expr::Float { .. }));
    }

    #[test]
    fn for_loop_declares_hidden_control_slots() {
        let chunk = parse("for i = 1, 3 do end", LuaVersion::Lua54).unwrap();
        let names: Vec<String> = chunk
            .main
            .layout
            .slots
            .iter()
            .map(|s| s.name.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["...", "(for state)", "(for limit)", "(for step)", "i"]
        );
    }
}
