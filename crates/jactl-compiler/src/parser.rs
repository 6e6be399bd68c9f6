//! Recursive-descent parser (C2, §4.2).
//!
//! A hand-written recursive-descent `Parser` (a `tokens: Vec<Token>` plus
//! a `pos` cursor, `peek`/`advance`/`expect` helpers, precedence climbing
//! realized as a cascade of `parse_*` methods rather than a table) over an
//! expression grammar with real operator precedence. Allocates
//! `VarDecl`/`FunDecl` arena entries directly (via [`CompileContext`]) as
//! they are parsed, per the "created by Parser, populated by Resolver"
//! lifecycle in §3.
//!
//! Forward-reference tolerance for functions (§4.2 "allows calling a
//! function declared later in the same block") is realized entirely in
//! the Resolver's declare-then-define pass over the already-built block
//! (§4.4): the parser performs one straightforward left-to-right descent
//! and never looks up a name, so there is nothing for it to pre-scan.

use crate::ast::{
    ClassDescriptor, ConstValue, Expr, ExprKind, FieldRef, FunDecl, FunctionDescriptor, Stmt,
    StmtKind, UnaryOp, VarDecl, WhileId,
};
use crate::context::CompileContext;
use crate::diagnostics::{CompileError, CompileResult};
use crate::lexer::Lexer;
use crate::location::Location;
use crate::token::{Literal, Token, TokenKind};
use crate::types::{BinaryOp, Type};

pub struct Parser<'s> {
    source: &'s str,
    tokens: Vec<Token>,
    pos: usize,
    next_while_id: u32,
}

impl<'s> Parser<'s> {
    /// Tokenises `source` and parses it into a [`Program`](crate::ast::Program),
    /// allocating every `VarDecl`/`FunDecl` it creates into `ctx`.
    pub fn parse(source: &'s str, ctx: &mut CompileContext) -> CompileResult<crate::ast::Program> {
        let tokens = Lexer::tokenize(source)?;
        let mut parser = Parser { source, tokens, pos: 0, next_while_id: 0 };
        let stmts = parser.parse_stmts_until(ctx, &[TokenKind::Eof])?;
        let classes = top_level_classes(&stmts);
        let whole = Location::new(0, source.len() as u32);
        let body = Stmt::new(StmtKind::Block(stmts), whole);
        let mut main = FunDecl::new(None, whole, body);
        main.is_script_main = true;
        main.return_type = Type::Any;
        let main = ctx.funs.insert(main);
        Ok(crate::ast::Program { main, classes })
    }

    // ---- token-stream primitives ----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos - 1]
    }

    fn at_eof(&self) -> bool {
        self.peek_kind() == TokenKind::Eof
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn check_any(&self, kinds: &[TokenKind]) -> bool {
        kinds.contains(&self.peek_kind())
    }

    fn advance(&mut self) -> &Token {
        if !self.at_eof() {
            self.pos += 1;
        }
        self.previous()
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> CompileResult<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            let found = self.peek().clone();
            Err(self.error_at(format!("expected {what}, found {found}"), found.location))
        }
    }

    fn error_at(&self, message: impl Into<String>, location: Location) -> CompileError {
        CompileError::new(message, location)
    }

    fn error_here(&self, message: impl Into<String>) -> CompileError {
        self.error_at(message, self.peek().location)
    }

    fn skip_separators(&mut self) {
        while self.check(TokenKind::Newline) || self.check(TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn identifier_text(&self, token: &Token) -> String {
        token.text(self.source).to_string()
    }

    fn next_while_id(&mut self) -> WhileId {
        let id = WhileId(self.next_while_id);
        self.next_while_id += 1;
        id
    }

    // ---- statements ----

    fn parse_stmts_until(
        &mut self,
        ctx: &mut CompileContext,
        enders: &[TokenKind],
    ) -> CompileResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            if self.check_any(enders) || self.at_eof() {
                break;
            }
            stmts.push(self.parse_statement(ctx)?);
        }
        Ok(stmts)
    }

    fn parse_block(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        let start = self.expect(TokenKind::LeftBrace, "'{'")?.location;
        let stmts = self.parse_stmts_until(ctx, &[TokenKind::RightBrace])?;
        let end = self.expect(TokenKind::RightBrace, "'}'")?.location;
        Ok(Stmt::new(StmtKind::Block(stmts), start.span(end)))
    }

    /// The body of an `if`/`while`/`for` arm: either a braced block or a
    /// single statement (§8 scenario S5's `if (x > 0) x else -x`).
    fn parse_control_body(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        if self.check(TokenKind::LeftBrace) {
            self.parse_block(ctx)
        } else {
            self.parse_statement(ctx)
        }
    }

    fn parse_statement(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        match self.peek_kind() {
            TokenKind::Def => self.parse_fun_decl_stmt(ctx),
            TokenKind::Class => self.parse_class_decl(ctx),
            TokenKind::If => self.parse_if(ctx),
            TokenKind::While => self.parse_while(ctx),
            TokenKind::For => self.parse_for(ctx),
            TokenKind::Return => self.parse_return(ctx),
            TokenKind::LeftBrace => self.parse_block(ctx),
            k if is_decl_type_keyword(k) => self.parse_var_decl_stmt(ctx),
            _ => {
                let expr = self.parse_expression(ctx)?;
                let loc = expr.location;
                Ok(Stmt::new(StmtKind::ExprStmt(expr), loc))
            }
        }
    }

    fn parse_var_decl_stmt(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        let type_tok = self.advance().clone();
        let declared_type = type_keyword_to_type(type_tok.kind);
        let name_tok = self.expect(TokenKind::Identifier, "a variable name")?.clone();
        let name = self.identifier_text(&name_tok);
        let initializer = if self.matches(TokenKind::Equal) {
            Some(self.parse_expression(ctx)?)
        } else {
            None
        };
        if declared_type.is_unknown() && initializer.is_none() {
            return Err(self.error_at(
                format!("'{name}' declared with 'var' needs an initializer to infer its type"),
                name_tok.location,
            ));
        }
        let mut decl = VarDecl::new(name, name_tok.location, declared_type);
        decl.initializer = initializer;
        let loc = type_tok.location.span(name_tok.location);
        let handle = ctx.vars.insert(decl);
        Ok(Stmt::new(StmtKind::VarDecl(handle), loc))
    }

    fn parse_params(&mut self, ctx: &mut CompileContext) -> CompileResult<(Vec<crate::context::VarHandle>, usize)> {
        let mut params = Vec::new();
        let mut mandatory = 0usize;
        if self.check(TokenKind::RightParen) {
            return Ok((params, mandatory));
        }
        loop {
            let declared_type = if is_decl_type_keyword(self.peek_kind()) {
                type_keyword_to_type(self.advance().kind)
            } else {
                Type::Any
            };
            let name_tok = self.expect(TokenKind::Identifier, "a parameter name")?.clone();
            let name = self.identifier_text(&name_tok);
            let mut decl = VarDecl::new(name, name_tok.location, declared_type.clone());
            decl.is_param = true;
            decl.ty = declared_type;
            if self.matches(TokenKind::Equal) {
                decl.initializer = Some(self.parse_expression(ctx)?);
            } else {
                mandatory += 1;
            }
            params.push(ctx.vars.insert(decl));
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        Ok((params, mandatory))
    }

    fn parse_fun_decl_stmt(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        let start = self.advance().location; // `def`
        let declared_return_type = if is_decl_type_keyword(self.peek_kind()) && self.peek_is_typed_fun_header() {
            Some(type_keyword_to_type(self.advance().kind))
        } else {
            None
        };
        let name_tok = self.expect(TokenKind::Identifier, "a function name")?.clone();
        let name = self.identifier_text(&name_tok);
        self.expect(TokenKind::LeftParen, "'('")?;
        let (params, mandatory) = self.parse_params(ctx)?;
        self.expect(TokenKind::RightParen, "')'")?;
        let body = self.parse_block(ctx)?;
        let arity = params.len();
        let mut fun = FunDecl::new(Some(name), start, body);
        fun.declared_return_type = declared_return_type.clone();
        fun.return_type = declared_return_type.unwrap_or(Type::Any);
        fun.params = params;
        fun.descriptor = FunctionDescriptor::new(arity, mandatory);
        let handle = ctx.funs.insert(fun);
        Ok(Stmt::new(StmtKind::FunDecl(handle), start))
    }

    /// Distinguishes `def int foo(...)` (typed return) from `def Map(...)`
    /// (a function literally named after a builtin-looking identifier is
    /// not supported by the reserved word list, so a type keyword here is
    /// unambiguous) — looks one token further for the name.
    fn peek_is_typed_fun_header(&self) -> bool {
        self.tokens.get(self.pos + 1).map(|t| t.kind == TokenKind::Identifier).unwrap_or(false)
    }

    fn parse_if(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        let start = self.advance().location; // `if`
        self.expect(TokenKind::LeftParen, "'('")?;
        let cond = self.parse_expression(ctx)?;
        self.expect(TokenKind::RightParen, "')'")?;
        let then_branch = Box::new(self.parse_control_body(ctx)?);
        let else_branch = if self.peek_past_separators_is(TokenKind::Else) {
            self.skip_separators();
            self.advance(); // `else`
            Some(Box::new(self.parse_control_body(ctx)?))
        } else {
            None
        };
        Ok(Stmt::new(StmtKind::If { cond, then_branch, else_branch }, start))
    }

    fn peek_past_separators_is(&self, kind: TokenKind) -> bool {
        let mut i = self.pos;
        while i < self.tokens.len()
            && matches!(self.tokens[i].kind, TokenKind::Newline | TokenKind::Semicolon)
        {
            i += 1;
        }
        self.tokens.get(i).map(|t| t.kind == kind).unwrap_or(false)
    }

    fn parse_while(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        let start = self.advance().location; // `while`
        let id = self.next_while_id();
        self.expect(TokenKind::LeftParen, "'('")?;
        let cond = self.parse_expression(ctx)?;
        self.expect(TokenKind::RightParen, "')'")?;
        let body = Box::new(self.parse_control_body(ctx)?);
        Ok(Stmt::new(StmtKind::While { id, cond, body }, start))
    }

    /// Desugars the conventional C-style `for` directly to a `Block`
    /// wrapping a `While`, matching how the rest of the language already
    /// expresses iteration.
    fn parse_for(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        let start = self.advance().location; // `for`
        self.expect(TokenKind::LeftParen, "'('")?;
        let mut prelude = Vec::new();
        if !self.check(TokenKind::Semicolon) {
            prelude.push(self.parse_init_clause(ctx)?);
        }
        self.expect(TokenKind::Semicolon, "';'")?;
        let cond = if !self.check(TokenKind::Semicolon) {
            self.parse_expression(ctx)?
        } else {
            Expr::new(ExprKind::Literal(ConstValue::Bool(true)), start)
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        let update = if !self.check(TokenKind::RightParen) {
            Some(self.parse_expression(ctx)?)
        } else {
            None
        };
        self.expect(TokenKind::RightParen, "')'")?;
        let id = self.next_while_id();
        let mut body_stmts = match self.parse_control_body(ctx)?.kind {
            StmtKind::Block(stmts) => stmts,
            other => vec![Stmt::new(other, start)],
        };
        if let Some(update) = update {
            let loc = update.location;
            body_stmts.push(Stmt::new(StmtKind::ExprStmt(update), loc));
        }
        let body = Box::new(Stmt::new(StmtKind::Block(body_stmts), start));
        let while_stmt = Stmt::new(StmtKind::While { id, cond, body }, start);
        prelude.push(while_stmt);
        Ok(Stmt::new(StmtKind::Block(prelude), start))
    }

    fn parse_init_clause(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        if is_decl_type_keyword(self.peek_kind()) {
            self.parse_var_decl_stmt(ctx)
        } else {
            let expr = self.parse_expression(ctx)?;
            let loc = expr.location;
            Ok(Stmt::new(StmtKind::ExprStmt(expr), loc))
        }
    }

    fn parse_return(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        let start = self.advance().location; // `return`
        let at_end = matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof
        );
        let value = if at_end {
            Expr::new(ExprKind::Literal(ConstValue::Null), start)
        } else {
            self.parse_expression(ctx)?
        };
        Ok(Stmt::new(StmtKind::Return(value), start))
    }

    fn parse_class_decl(&mut self, ctx: &mut CompileContext) -> CompileResult<Stmt> {
        let start = self.advance().location; // `class`
        let name_tok = self.expect(TokenKind::Identifier, "a class name")?.clone();
        let name = self.identifier_text(&name_tok);
        let mut descriptor = ClassDescriptor::new(name, "");
        if self.matches(TokenKind::Extends) {
            let super_name_tok = self.expect(TokenKind::Identifier, "a superclass name")?.clone();
            let super_name = self.identifier_text(&super_name_tok);
            descriptor.super_class = ctx.classes.lookup(&super_name);
        }
        // `implements Interface, ...` is parsed and discarded: interfaces
        // carry no runtime behaviour this front-end needs to model.
        if self.matches(TokenKind::Implements) {
            loop {
                self.expect(TokenKind::Identifier, "an interface name")?;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        let handle = ctx.classes.insert(descriptor);
        self.expect(TokenKind::LeftBrace, "'{'")?;
        let mut methods = Vec::new();
        loop {
            self.skip_separators();
            if self.check(TokenKind::RightBrace) || self.at_eof() {
                break;
            }
            if self.check(TokenKind::Def) {
                let stmt = self.parse_fun_decl_stmt(ctx)?;
                if let StmtKind::FunDecl(fun_handle) = stmt.kind {
                    ctx.funs.get_mut(fun_handle).owner_class = Some(handle);
                    methods.push(fun_handle);
                }
            } else {
                let field_tok_kind = self.peek_kind();
                let declared_type = if is_decl_type_keyword(field_tok_kind) {
                    type_keyword_to_type(self.advance().kind)
                } else {
                    Type::Any
                };
                let field_name_tok = self.expect(TokenKind::Identifier, "a field name")?.clone();
                let field_name = self.identifier_text(&field_name_tok);
                if self.matches(TokenKind::Equal) {
                    self.parse_expression(ctx)?; // field initializers are not modelled further here
                }
                ctx.classes.get_mut(handle).fields.push((field_name, declared_type));
            }
        }
        self.expect(TokenKind::RightBrace, "'}'")?;
        ctx.classes.get_mut(handle).methods = methods;
        Ok(Stmt::new(StmtKind::ClassDecl(handle), start))
    }

    // ---- expressions, lowest to highest precedence ----

    fn parse_expression(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        self.parse_assignment(ctx)
    }

    fn parse_assignment(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let lhs = self.parse_ternary(ctx)?;
        let op = match self.peek_kind() {
            TokenKind::Equal => Some(None),
            TokenKind::QuestionEqual => Some(None),
            TokenKind::PlusEqual => Some(Some(BinaryOp::Add)),
            TokenKind::MinusEqual => Some(Some(BinaryOp::Sub)),
            TokenKind::StarEqual => Some(Some(BinaryOp::Mul)),
            TokenKind::SlashEqual => Some(Some(BinaryOp::Div)),
            TokenKind::PercentEqual => Some(Some(BinaryOp::Mod)),
            _ => None,
        };
        let Some(op) = op else { return Ok(lhs) };
        let null_safe = self.peek_kind() == TokenKind::QuestionEqual;
        self.advance();
        let rhs = self.parse_assignment(ctx)?;
        match op {
            None => self.build_assign(lhs, rhs, null_safe),
            Some(bin_op) => self.build_op_assign(lhs, bin_op, rhs, false),
        }
    }

    fn build_assign(&self, target: Expr, value: Expr, null_safe: bool) -> CompileResult<Expr> {
        let loc = target.location.span(value.location);
        match target.kind {
            ExprKind::Identifier { name, .. } => Ok(Expr::new(
                ExprKind::VarAssign { name, var: None, value: Box::new(value), null_safe },
                loc,
            )),
            ExprKind::FieldAccess { receiver, field } => Ok(Expr::new(
                ExprKind::FieldAssign { receiver, field, value: Box::new(value) },
                loc,
            )),
            _ => Err(self.error_at("left-hand side of assignment is not assignable", loc)),
        }
    }

    fn build_op_assign(
        &self,
        target: Expr,
        op: BinaryOp,
        value: Expr,
        is_pre_inc_or_dec: bool,
    ) -> CompileResult<Expr> {
        let loc = target.location.span(value.location);
        match target.kind {
            ExprKind::Identifier { name, .. } => Ok(Expr::new(
                ExprKind::VarOpAssign {
                    name,
                    var: None,
                    op,
                    value: Box::new(value),
                    is_pre_inc_or_dec,
                },
                loc,
            )),
            ExprKind::FieldAccess { receiver, field } => Ok(Expr::new(
                ExprKind::FieldOpAssign {
                    receiver,
                    field,
                    op,
                    value: Box::new(value),
                    is_pre_inc_or_dec,
                },
                loc,
            )),
            _ => Err(self.error_at("target of compound assignment is not assignable", loc)),
        }
    }

    fn parse_ternary(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let cond = self.parse_logical_or(ctx)?;
        if self.matches(TokenKind::Question) {
            let then_expr = self.parse_expression(ctx)?;
            self.expect(TokenKind::Colon, "':'")?;
            let else_expr = self.parse_ternary(ctx)?;
            let loc = cond.location.span(else_expr.location);
            Ok(Expr::new(
                ExprKind::Ternary {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
                loc,
            ))
        } else if self.matches(TokenKind::QuestionColon) {
            // Elvis `a ?: b`: re-uses `a` as both condition and then-value.
            let else_expr = self.parse_ternary(ctx)?;
            let loc = cond.location.span(else_expr.location);
            Ok(Expr::new(
                ExprKind::Ternary {
                    cond: Box::new(cond.clone()),
                    then_expr: Box::new(cond),
                    else_expr: Box::new(else_expr),
                },
                loc,
            ))
        } else {
            Ok(cond)
        }
    }

    fn parse_logical_or(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let mut lhs = self.parse_logical_and(ctx)?;
        while self.check(TokenKind::PipePipe) || self.check(TokenKind::Or) {
            self.advance();
            let rhs = self.parse_logical_and(ctx)?;
            let loc = lhs.location.span(rhs.location);
            lhs = Expr::new(
                ExprKind::Binary { op: BinaryOp::Or, left: Box::new(lhs), right: Box::new(rhs) },
                loc,
            );
        }
        Ok(lhs)
    }

    fn parse_logical_and(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let mut lhs = self.parse_equality(ctx)?;
        while self.check(TokenKind::AmpAmp) || self.check(TokenKind::And) {
            self.advance();
            let rhs = self.parse_equality(ctx)?;
            let loc = lhs.location.span(rhs.location);
            lhs = Expr::new(
                ExprKind::Binary { op: BinaryOp::And, left: Box::new(lhs), right: Box::new(rhs) },
                loc,
            );
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let mut lhs = self.parse_relational(ctx)?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqualEqual => BinaryOp::Eq,
                TokenKind::BangEqual => BinaryOp::Ne,
                TokenKind::Instanceof | TokenKind::NotInstanceof | TokenKind::In | TokenKind::NotIn => {
                    // Modelled as equality-precedence comparisons; the
                    // concrete instanceof/in semantics belong to the
                    // resolver and back-end, not to operator precedence.
                    let negated = matches!(self.peek_kind(), TokenKind::NotInstanceof | TokenKind::NotIn);
                    self.advance();
                    let rhs = self.parse_relational(ctx)?;
                    let loc = lhs.location.span(rhs.location);
                    let eq = Expr::new(
                        ExprKind::Binary {
                            op: BinaryOp::Eq,
                            left: Box::new(lhs),
                            right: Box::new(rhs),
                        },
                        loc,
                    );
                    lhs = if negated {
                        Expr::new(ExprKind::Unary { op: UnaryOp::Not, operand: Box::new(eq), postfix: false }, loc)
                    } else {
                        eq
                    };
                    continue;
                }
                _ => break,
            };
            self.advance();
            let rhs = self.parse_relational(ctx)?;
            let loc = lhs.location.span(rhs.location);
            lhs = Expr::new(ExprKind::Binary { op, left: Box::new(lhs), right: Box::new(rhs) }, loc);
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let mut lhs = self.parse_additive(ctx)?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Less => BinaryOp::Lt,
                TokenKind::LessEqual => BinaryOp::Le,
                TokenKind::Greater => BinaryOp::Gt,
                TokenKind::GreaterEqual => BinaryOp::Ge,
                TokenKind::LessEqualGreater => BinaryOp::Compare,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive(ctx)?;
            let loc = lhs.location.span(rhs.location);
            lhs = Expr::new(ExprKind::Binary { op, left: Box::new(lhs), right: Box::new(rhs) }, loc);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let mut lhs = self.parse_multiplicative(ctx)?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative(ctx)?;
            let loc = lhs.location.span(rhs.location);
            lhs = Expr::new(ExprKind::Binary { op, left: Box::new(lhs), right: Box::new(rhs) }, loc);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let mut lhs = self.parse_unary(ctx)?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary(ctx)?;
            let loc = lhs.location.span(rhs.location);
            lhs = Expr::new(ExprKind::Binary { op, left: Box::new(lhs), right: Box::new(rhs) }, loc);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        match self.peek_kind() {
            TokenKind::Bang => {
                let start = self.advance().location;
                let operand = self.parse_unary(ctx)?;
                let loc = start.span(operand.location);
                Ok(Expr::new(ExprKind::Unary { op: UnaryOp::Not, operand: Box::new(operand), postfix: false }, loc))
            }
            TokenKind::Minus => {
                let start = self.advance().location;
                let operand = self.parse_unary(ctx)?;
                let loc = start.span(operand.location);
                Ok(Expr::new(ExprKind::Unary { op: UnaryOp::Negate, operand: Box::new(operand), postfix: false }, loc))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = if self.peek_kind() == TokenKind::PlusPlus { BinaryOp::Add } else { BinaryOp::Sub };
                let start = self.advance().location;
                let target = self.parse_unary(ctx)?;
                let one = Expr::new(ExprKind::Literal(ConstValue::Int(1)), start);
                self.build_op_assign(target, op, one, true)
            }
            _ => self.parse_postfix(ctx),
        }
    }

    fn parse_postfix(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let mut expr = self.parse_primary(ctx)?;
        loop {
            match self.peek_kind() {
                TokenKind::LeftParen => {
                    self.advance();
                    let args = self.parse_args(ctx)?;
                    let end = self.expect(TokenKind::RightParen, "')'")?.location;
                    let loc = expr.location.span(end);
                    expr = Expr::new(
                        ExprKind::Call { callee: Box::new(expr), args, is_async: false },
                        loc,
                    );
                }
                TokenKind::Dot | TokenKind::QuestionDot => {
                    let null_safe = self.peek_kind() == TokenKind::QuestionDot;
                    self.advance();
                    let name_tok = self.expect(TokenKind::Identifier, "a field or method name")?.clone();
                    let name = self.identifier_text(&name_tok);
                    if self.check(TokenKind::LeftParen) {
                        self.advance();
                        let args = self.parse_args(ctx)?;
                        let end = self.expect(TokenKind::RightParen, "')'")?.location;
                        let loc = expr.location.span(end);
                        expr = Expr::new(
                            ExprKind::MethodCall {
                                receiver: Box::new(expr),
                                name,
                                args,
                                null_safe,
                                is_async: false,
                            },
                            loc,
                        );
                    } else {
                        let loc = expr.location.span(name_tok.location);
                        expr = Expr::new(
                            ExprKind::FieldAccess {
                                receiver: Box::new(expr),
                                field: FieldRef::Dot { name, null_safe },
                            },
                            loc,
                        );
                    }
                }
                TokenKind::LeftSquare | TokenKind::QuestionSquare => {
                    let null_safe = self.peek_kind() == TokenKind::QuestionSquare;
                    self.advance();
                    let index = self.parse_expression(ctx)?;
                    let end = self.expect(TokenKind::RightSquare, "']'")?.location;
                    let loc = expr.location.span(end);
                    expr = Expr::new(
                        ExprKind::FieldAccess {
                            receiver: Box::new(expr),
                            field: FieldRef::Index { index: Box::new(index), null_safe },
                        },
                        loc,
                    );
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let op = if self.peek_kind() == TokenKind::PlusPlus { BinaryOp::Add } else { BinaryOp::Sub };
                    let end = self.advance().location;
                    let one = Expr::new(ExprKind::Literal(ConstValue::Int(1)), end);
                    expr = self.build_op_assign(expr, op, one, false)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self, ctx: &mut CompileContext) -> CompileResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.check(TokenKind::RightParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression(ctx)?);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::IntConst => {
                self.advance();
                let Some(Literal::Int(v)) = tok.literal else { unreachable!() };
                Ok(Expr::new(ExprKind::Literal(ConstValue::Int(v)), tok.location))
            }
            TokenKind::LongConst => {
                self.advance();
                let Some(Literal::Long(v)) = tok.literal else { unreachable!() };
                Ok(Expr::new(ExprKind::Literal(ConstValue::Long(v)), tok.location))
            }
            TokenKind::DoubleConst => {
                self.advance();
                let Some(Literal::Double(v)) = tok.literal else { unreachable!() };
                Ok(Expr::new(ExprKind::Literal(ConstValue::Double(v)), tok.location))
            }
            TokenKind::DecimalConst => {
                self.advance();
                let Some(Literal::Decimal(v)) = tok.literal else { unreachable!() };
                Ok(Expr::new(ExprKind::Literal(ConstValue::Decimal(v)), tok.location))
            }
            TokenKind::StringConst => {
                self.advance();
                let Some(Literal::String(v)) = tok.literal else { unreachable!() };
                Ok(Expr::new(ExprKind::Literal(ConstValue::String(v)), tok.location))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(ConstValue::Bool(true)), tok.location))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(ConstValue::Bool(false)), tok.location))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(ConstValue::Null), tok.location))
            }
            TokenKind::Identifier => {
                self.advance();
                let name = self.identifier_text(&tok);
                Ok(Expr::new(ExprKind::Identifier { name, var: None }, tok.location))
            }
            TokenKind::ExprStringStart => self.parse_interpolated_string(ctx),
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.parse_expression(ctx)?;
                self.expect(TokenKind::RightParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LeftSquare => self.parse_list_or_map_literal(ctx),
            TokenKind::LeftBrace => self.parse_closure(ctx),
            TokenKind::Do => {
                self.advance();
                let block = self.parse_block(ctx)?;
                let loc = block.location;
                Ok(Expr::new(ExprKind::Block(Box::new(block)), loc))
            }
            TokenKind::Print => {
                self.advance();
                let value = self.parse_expression(ctx)?;
                let loc = tok.location.span(value.location);
                Ok(Expr::new(ExprKind::Print { value: Box::new(value), newline: false }, loc))
            }
            TokenKind::Println => {
                self.advance();
                let value = self.parse_expression(ctx)?;
                let loc = tok.location.span(value.location);
                Ok(Expr::new(ExprKind::Print { value: Box::new(value), newline: true }, loc))
            }
            TokenKind::Break => {
                self.advance();
                Ok(Expr::new(ExprKind::Break(None), tok.location))
            }
            TokenKind::Continue => {
                self.advance();
                Ok(Expr::new(ExprKind::Continue(None), tok.location))
            }
            _ => Err(self.error_here(format!("unexpected {tok} in expression position"))),
        }
    }

    fn parse_interpolated_string(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let start = self.advance().location; // ExprStringStart
        let mut parts = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::StringConst => {
                    let tok = self.advance().clone();
                    let Some(Literal::String(s)) = tok.literal else { unreachable!() };
                    parts.push(Expr::new(ExprKind::Literal(ConstValue::String(s)), tok.location));
                }
                TokenKind::Identifier => {
                    // bare `$name` shorthand
                    let tok = self.advance().clone();
                    let name = self.identifier_text(&tok);
                    parts.push(Expr::new(ExprKind::Identifier { name, var: None }, tok.location));
                }
                TokenKind::LeftBrace => {
                    self.advance();
                    parts.push(self.parse_expression(ctx)?);
                    self.expect(TokenKind::RightBrace, "'}'")?;
                }
                TokenKind::ExprStringEnd => break,
                _ => return Err(self.error_here("malformed interpolated string")),
            }
        }
        let end = self.expect(TokenKind::ExprStringEnd, "end of interpolated string")?.location;
        Ok(Expr::new(ExprKind::InterpolatedString { parts }, start.span(end)))
    }

    fn parse_list_or_map_literal(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let start = self.advance().location; // `[`
        if self.check(TokenKind::Colon) {
            self.advance();
            let end = self.expect(TokenKind::RightSquare, "']'")?.location;
            return Ok(Expr::new(ExprKind::MapLiteral(Vec::new()), start.span(end)));
        }
        if self.check(TokenKind::RightSquare) {
            let end = self.advance().location;
            return Ok(Expr::new(ExprKind::ListLiteral(Vec::new()), start.span(end)));
        }
        let first = self.parse_expression(ctx)?;
        if self.matches(TokenKind::Colon) {
            let mut entries = Vec::new();
            let value = self.parse_expression(ctx)?;
            entries.push((first, value));
            while self.matches(TokenKind::Comma) {
                let key = self.parse_expression(ctx)?;
                self.expect(TokenKind::Colon, "':'")?;
                let value = self.parse_expression(ctx)?;
                entries.push((key, value));
            }
            let end = self.expect(TokenKind::RightSquare, "']'")?.location;
            Ok(Expr::new(ExprKind::MapLiteral(entries), start.span(end)))
        } else {
            let mut items = vec![first];
            while self.matches(TokenKind::Comma) {
                items.push(self.parse_expression(ctx)?);
            }
            let end = self.expect(TokenKind::RightSquare, "']'")?.location;
            Ok(Expr::new(ExprKind::ListLiteral(items), start.span(end)))
        }
    }

    /// A closure literal: `{ stmts }`, `{ -> stmts }`, or `{ a, b -> stmts }`.
    /// Bounded lookahead finds the top-level `->` (if any) before the
    /// closure's own closing brace, which is enough to split the param
    /// list from the body without real backtracking.
    fn parse_closure(&mut self, ctx: &mut CompileContext) -> CompileResult<Expr> {
        let start = self.advance().location; // `{`
        let mut params = Vec::new();
        if let Some(arrow_idx) = self.find_arrow_before_close(self.pos) {
            while self.pos < arrow_idx {
                self.skip_separators();
                if self.pos >= arrow_idx {
                    break;
                }
                let name_tok = self.expect(TokenKind::Identifier, "a parameter name")?.clone();
                let name = self.identifier_text(&name_tok);
                let mut decl = VarDecl::new(name, name_tok.location, Type::Any);
                decl.is_param = true;
                params.push(ctx.vars.insert(decl));
                if self.check(TokenKind::Comma) {
                    self.advance();
                }
            }
            self.expect(TokenKind::Arrow, "'->'")?;
        }
        let stmts = self.parse_stmts_until(ctx, &[TokenKind::RightBrace])?;
        let end = self.expect(TokenKind::RightBrace, "'}'")?.location;
        let loc = start.span(end);
        let body = Stmt::new(StmtKind::Block(stmts), loc);
        let arity = params.len();
        let mut fun = FunDecl::new(None, start, body);
        fun.params = params;
        fun.descriptor = FunctionDescriptor::new(arity, arity);
        let handle = ctx.funs.insert(fun);
        Ok(Expr::new(ExprKind::Closure(handle), loc))
    }

    fn find_arrow_before_close(&self, start: usize) -> Option<usize> {
        let mut depth = 0i32;
        let mut i = start;
        while i < self.tokens.len() {
            match self.tokens[i].kind {
                TokenKind::LeftBrace | TokenKind::LeftParen | TokenKind::LeftSquare => depth += 1,
                TokenKind::RightBrace if depth == 0 => return None,
                TokenKind::RightBrace | TokenKind::RightParen | TokenKind::RightSquare => depth -= 1,
                TokenKind::Arrow if depth == 0 => return Some(i),
                _ => {}
            }
            i += 1;
        }
        None
    }
}

fn is_decl_type_keyword(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Var
            | TokenKind::BooleanType
            | TokenKind::IntType
            | TokenKind::LongType
            | TokenKind::DoubleType
            | TokenKind::DecimalType
            | TokenKind::StringType
            | TokenKind::MapType
            | TokenKind::ListType
    )
}

fn type_keyword_to_type(kind: TokenKind) -> Type {
    match kind {
        TokenKind::Var => Type::Unknown,
        TokenKind::BooleanType => Type::BOOL,
        TokenKind::IntType => Type::INT,
        TokenKind::LongType => Type::LONG,
        TokenKind::DoubleType => Type::DOUBLE,
        TokenKind::DecimalType => Type::Decimal,
        TokenKind::StringType => Type::String,
        TokenKind::MapType => Type::Map,
        TokenKind::ListType => Type::List,
        _ => Type::Any,
    }
}

fn top_level_classes(stmts: &[Stmt]) -> Vec<crate::context::ClassHandle> {
    stmts
        .iter()
        .filter_map(|s| match &s.kind {
            StmtKind::ClassDecl(handle) => Some(*handle),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (crate::ast::Program, CompileContext) {
        let mut ctx = CompileContext::new();
        let program = Parser::parse(source, &mut ctx).expect("parse failed");
        (program, ctx)
    }

    fn main_body_stmts<'a>(program: &'a crate::ast::Program, ctx: &'a CompileContext) -> &'a [Stmt] {
        match &ctx.funs.get(program.main).body.kind {
            StmtKind::Block(stmts) => stmts,
            _ => panic!("main body is not a block"),
        }
    }

    #[test]
    fn parses_a_var_decl_with_an_initializer() {
        let (program, ctx) = parse("var x = 1 + 2\n");
        let stmts = main_body_stmts(&program, &ctx);
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StmtKind::VarDecl(handle) => {
                let decl = ctx.vars.get(*handle);
                assert_eq!(decl.name, "x");
                assert!(decl.initializer.is_some());
            }
            other => panic!("expected VarDecl, got {other:?}"),
        }
    }

    #[test]
    fn var_without_initializer_is_a_compile_error() {
        let mut ctx = CompileContext::new();
        let err = Parser::parse("var x\n", &mut ctx).unwrap_err();
        assert!(err.message.contains("initializer"));
    }

    #[test]
    fn operator_precedence_nests_multiplicative_under_additive() {
        let (program, ctx) = parse("var x = 1 + 2 * 3\n");
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::VarDecl(handle) = stmts[0].kind else { panic!() };
        let init = ctx.vars.get(handle).initializer.as_ref().unwrap();
        match &init.kind {
            ExprKind::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("expected top-level Add, got {other:?}"),
        }
    }

    #[test]
    fn if_without_braces_parses_both_arms_as_bare_expressions() {
        let (program, ctx) = parse("def f(int x) { if (x > 0) x else -x }\n");
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::FunDecl(fun) = stmts[0].kind else { panic!("expected FunDecl") };
        let body = match &ctx.funs.get(fun).body.kind {
            StmtKind::Block(stmts) => stmts,
            _ => panic!(),
        };
        match &body[0].kind {
            StmtKind::If { then_branch, else_branch, .. } => {
                assert!(matches!(then_branch.kind, StmtKind::ExprStmt(_)));
                assert!(matches!(else_branch.as_ref().unwrap().kind, StmtKind::ExprStmt(_)));
            }
            other => panic!("expected If, got {other:?}"),
        }
    }

    #[test]
    fn postfix_increment_rewrites_to_a_non_pre_op_assign() {
        let (program, ctx) = parse("x++\n");
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::ExprStmt(expr) = &stmts[0].kind else { panic!() };
        match &expr.kind {
            ExprKind::VarOpAssign { op: BinaryOp::Add, is_pre_inc_or_dec: false, .. } => {}
            other => panic!("expected postfix VarOpAssign, got {other:?}"),
        }
    }

    #[test]
    fn prefix_increment_rewrites_to_a_pre_op_assign() {
        let (program, ctx) = parse("++x\n");
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::ExprStmt(expr) = &stmts[0].kind else { panic!() };
        match &expr.kind {
            ExprKind::VarOpAssign { op: BinaryOp::Add, is_pre_inc_or_dec: true, .. } => {}
            other => panic!("expected prefix VarOpAssign, got {other:?}"),
        }
    }

    #[test]
    fn closure_with_no_params_uses_the_arrow_form() {
        let (program, ctx) = parse("var c = { -> 1 }\n");
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::VarDecl(handle) = stmts[0].kind else { panic!() };
        let init = ctx.vars.get(handle).initializer.as_ref().unwrap();
        let ExprKind::Closure(fun) = init.kind else { panic!("expected Closure") };
        assert_eq!(ctx.funs.get(fun).params.len(), 0);
    }

    #[test]
    fn closure_with_params_splits_on_the_arrow() {
        let (program, ctx) = parse("var add = { a, b -> a + b }\n");
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::VarDecl(handle) = stmts[0].kind else { panic!() };
        let init = ctx.vars.get(handle).initializer.as_ref().unwrap();
        let ExprKind::Closure(fun) = init.kind else { panic!("expected Closure") };
        assert_eq!(ctx.funs.get(fun).params.len(), 2);
    }

    #[test]
    fn interpolated_string_produces_literal_and_embedded_parts() {
        let (program, ctx) = parse(r#"var name = "world"
var greeting = "hello ${name}!"
"#);
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::VarDecl(handle) = stmts[1].kind else { panic!() };
        let init = ctx.vars.get(handle).initializer.as_ref().unwrap();
        let ExprKind::InterpolatedString { parts } = &init.kind else { panic!("expected InterpolatedString") };
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[0].kind, ExprKind::Literal(ConstValue::String(_))));
        assert!(matches!(parts[1].kind, ExprKind::Identifier { .. }));
        assert!(matches!(parts[2].kind, ExprKind::Literal(ConstValue::String(_))));
    }

    #[test]
    fn list_and_map_literals_are_disambiguated_by_colon() {
        let (program, ctx) = parse("var l = [1, 2, 3]\nvar m = [\"a\": 1, \"b\": 2]\nvar e = [:]\n");
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::VarDecl(l) = stmts[0].kind else { panic!() };
        assert!(matches!(ctx.vars.get(l).initializer.as_ref().unwrap().kind, ExprKind::ListLiteral(_)));
        let StmtKind::VarDecl(m) = stmts[1].kind else { panic!() };
        assert!(matches!(ctx.vars.get(m).initializer.as_ref().unwrap().kind, ExprKind::MapLiteral(_)));
        let StmtKind::VarDecl(e) = stmts[2].kind else { panic!() };
        match &ctx.vars.get(e).initializer.as_ref().unwrap().kind {
            ExprKind::MapLiteral(entries) => assert!(entries.is_empty()),
            other => panic!("expected empty MapLiteral, got {other:?}"),
        }
    }

    #[test]
    fn method_call_is_distinguished_from_a_field_read_followed_by_a_call() {
        let (program, ctx) = parse("a.foo(1)\n");
        let stmts = main_body_stmts(&program, &ctx);
        let StmtKind::ExprStmt(expr) = &stmts[0].kind else { panic!() };
        match &expr.kind {
            ExprKind::MethodCall { name, args, .. } => {
                assert_eq!(name, "foo");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected MethodCall, got {other:?}"),
        }
    }

    #[test]
    fn while_loop_is_assigned_a_distinct_while_id() {
        let (program, ctx) = parse("while (true) { break }\nwhile (true) { continue }\n");
        let stmts = main_body_stmts(&program, &ctx);
        let (StmtKind::While { id: id0, .. }, StmtKind::While { id: id1, .. }) =
            (&stmts[0].kind, &stmts[1].kind)
        else {
            panic!("expected two While statements")
        };
        assert_ne!(id0, id1);
    }

    #[test]
    fn class_decl_collects_fields_and_methods() {
        let (program, ctx) = parse(
            "class Point {\n  int x = 0\n  int y = 0\n  def magnitude() { x }\n}\n",
        );
        assert_eq!(program.classes.len(), 1);
        let descriptor = ctx.classes.get(program.classes[0]);
        assert_eq!(descriptor.name, "Point");
        assert_eq!(descriptor.fields.len(), 2);
        assert_eq!(descriptor.methods.len(), 1);
    }

    #[test]
    fn for_loop_desugars_to_a_block_with_a_while() {
        let (program, ctx) = parse("for (var i = 0; i < 3; i++) { println i }\n");
        let stmts = main_body_stmts(&program, &ctx);
        match &stmts[0].kind {
            StmtKind::Block(inner) => {
                assert!(matches!(inner[0].kind, StmtKind::VarDecl(_)));
                assert!(matches!(inner[1].kind, StmtKind::While { .. }));
            }
            other => panic!("expected desugared Block, got {other:?}"),
        }
    }
}
