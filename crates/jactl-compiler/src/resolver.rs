//! Symbol resolution, type inference, and constant folding (C4, §4.4).
//!
//! A separate analysis pass that walks an already-built tree and annotates
//! it in place, distinct from parsing: full declare-then-define scope
//! resolution, plus the cyclic-capture and take/restore techniques needed
//! for nested-closure capture, built on the arena design in `context.rs`.
//!
//! Every `VarDecl`/`FunDecl` body the resolver needs to recurse into lives
//! inside an arena owned by `CompileContext`, the same `&mut` value the
//! resolver itself needs for lookups. `std::mem::take`/`replace` pulls the
//! field out, resolves it with full arena access, then puts it back; this
//! pattern repeats throughout (`resolve_var_decl`, `resolve_function`,
//! implicit-return synthesis).

use std::collections::{HashMap, HashSet};

use crate::ast::{
    ConstValue, Decimal, Expr, ExprKind, FieldRef, Stmt, StmtKind, UnaryOp, VarDecl, WhileId,
};
use crate::config::{CompileOptions, GlobalsTypeMap};
use crate::context::{ClassHandle, CompileContext, FunHandle, VarHandle};
use crate::diagnostics::{CompileError, CompileResult};
use crate::location::Location;
use crate::types::{binary_result_type, BinaryOp, Primitive, Type};

/// Runs the resolver over an entire `Program` (script main, then every
/// top-level class's methods).
pub fn resolve(
    program: &crate::ast::Program,
    ctx: &mut CompileContext,
    globals: &GlobalsTypeMap,
    options: &CompileOptions,
) -> CompileResult<()> {
    let mut resolver = Resolver::new(ctx, globals, options);
    resolver.resolve_function(program.main)?;
    for &class in &program.classes {
        resolver.resolve_class(class)?;
    }
    Ok(())
}

struct FunctionFrame {
    fun: FunHandle,
    blocks: Vec<HashMap<String, VarHandle>>,
    loop_stack: Vec<WhileId>,
    nesting_level: u32,
    is_script_main: bool,
    owner_class: Option<ClassHandle>,
}

struct Resolver<'a> {
    ctx: &'a mut CompileContext,
    globals: &'a GlobalsTypeMap,
    options: &'a CompileOptions,
    frames: Vec<FunctionFrame>,
    being_initialized: HashSet<VarHandle>,
    global_vars: HashMap<String, VarHandle>,
    class_field_vars: HashMap<(ClassHandle, String), VarHandle>,
    class_method_vars: HashMap<(ClassHandle, String), VarHandle>,
}

impl<'a> Resolver<'a> {
    fn new(ctx: &'a mut CompileContext, globals: &'a GlobalsTypeMap, options: &'a CompileOptions) -> Self {
        Resolver {
            ctx,
            globals,
            options,
            frames: Vec::new(),
            being_initialized: HashSet::new(),
            global_vars: HashMap::new(),
            class_field_vars: HashMap::new(),
            class_method_vars: HashMap::new(),
        }
    }

    // ---- functions, classes, blocks ----

    fn resolve_class(&mut self, class: ClassHandle) -> CompileResult<()> {
        let methods = self.ctx.classes.get(class).methods.clone();
        for m in methods {
            self.resolve_function(m)?;
        }
        Ok(())
    }

    /// Resolves a single `FunDecl`'s params and body, in a freshly pushed
    /// scope, then synthesises its implicit return and (unless this is the
    /// script main) its argument-forwarding wrapper.
    fn resolve_function(&mut self, fh: FunHandle) -> CompileResult<()> {
        let is_script_main = self.ctx.funs.get(fh).is_script_main;
        let owner_class = self.ctx.funs.get(fh).owner_class;
        let nesting_level = self.frames.last().map(|f| f.nesting_level + 1).unwrap_or(1);
        self.ctx.funs.get_mut(fh).nesting_level = nesting_level;
        self.frames.push(FunctionFrame {
            fun: fh,
            blocks: vec![HashMap::new()],
            loop_stack: Vec::new(),
            nesting_level,
            is_script_main,
            owner_class,
        });

        let params = self.ctx.funs.get(fh).params.clone();
        let result = self.resolve_params(&params).and_then(|()| {
            let mut body = std::mem::replace(&mut self.ctx.funs.get_mut(fh).body, placeholder_stmt());
            let r = self.resolve_stmt(&mut body);
            self.ctx.funs.get_mut(fh).body = body;
            r
        });

        if result.is_ok() {
            let return_type = self.ctx.funs.get(fh).return_type.clone();
            let mut body = std::mem::replace(&mut self.ctx.funs.get_mut(fh).body, placeholder_stmt());
            let r = self.apply_implicit_return_body(&mut body, &return_type);
            self.ctx.funs.get_mut(fh).body = body;
            self.frames.pop();
            r?;
        } else {
            self.frames.pop();
            result?;
        }

        if !is_script_main {
            self.synthesize_wrapper(fh);
        }
        Ok(())
    }

    fn resolve_params(&mut self, params: &[VarHandle]) -> CompileResult<()> {
        let (fun, nesting_level) = {
            let f = self.frames.last().unwrap();
            (f.fun, f.nesting_level)
        };
        for &p in params {
            self.ctx.vars.get_mut(p).owner = Some(fun);
            self.ctx.vars.get_mut(p).nesting_level = nesting_level;
            let name = self.ctx.vars.get(p).name.clone();
            self.declare_in_current_block(p, &name)?;
        }
        for &p in params {
            let mut init = self.ctx.vars.get_mut(p).initializer.take();
            if let Some(expr) = init.as_mut() {
                self.resolve_expr(expr)?;
                let ty = self.ctx.vars.get(p).ty.clone();
                if !ty.is_any() && !expr.ty.is_convertible_to(&ty, &self.ctx.classes) {
                    self.ctx.vars.get_mut(p).initializer = init;
                    return Err(CompileError::new(
                        format!("cannot use a default value of type {} for a {} parameter", expr.ty, ty),
                        expr.location,
                    ));
                }
            }
            self.ctx.vars.get_mut(p).initializer = init;
        }
        Ok(())
    }

    fn push_block(&mut self) {
        self.frames.last_mut().unwrap().blocks.push(HashMap::new());
    }

    fn pop_block(&mut self) {
        self.frames.last_mut().unwrap().blocks.pop();
    }

    fn resolve_block(&mut self, stmts: &mut Vec<Stmt>) -> CompileResult<()> {
        self.push_block();
        let result = (|| {
            for stmt in stmts.iter() {
                if let StmtKind::FunDecl(fh) = &stmt.kind {
                    if let Some(name) = self.ctx.funs.get(*fh).name.clone() {
                        self.declare_function_proxy(*fh, &name)?;
                    }
                }
            }
            for stmt in stmts.iter_mut() {
                self.resolve_stmt(stmt)?;
            }
            Ok(())
        })();
        self.pop_block();
        result
    }

    fn declare_function_proxy(&mut self, fh: FunHandle, name: &str) -> CompileResult<()> {
        let loc = self.ctx.funs.get(fh).start;
        {
            let frame = self.frames.last().unwrap();
            if frame.blocks.last().unwrap().contains_key(name) {
                return Err(CompileError::new(format!("duplicate declaration of '{name}'"), loc));
            }
        }
        let owner = self.frames.last().map(|f| f.fun);
        let mut decl = VarDecl::new(name, loc, Type::Function);
        decl.ty = Type::Function;
        decl.fun_binding = Some(fh);
        decl.is_final = true;
        decl.owner = owner;
        let handle = self.ctx.vars.insert(decl);
        self.frames.last_mut().unwrap().blocks.last_mut().unwrap().insert(name.to_string(), handle);
        Ok(())
    }

    // ---- declaration ----

    /// Inserts `handle` into the innermost block of the current frame,
    /// applying the REPL top-level rebind rule (§4.4 "REPL mode") and
    /// otherwise rejecting a duplicate name in the same block.
    fn declare_in_current_block(&mut self, handle: VarHandle, name: &str) -> CompileResult<()> {
        let loc = self.ctx.vars.get(handle).name_location;
        let top_level_main = {
            let frame = self.frames.last().unwrap();
            frame.is_script_main && frame.blocks.len() == 1
        };
        if top_level_main && self.options.repl_mode {
            self.ctx.vars.get_mut(handle).is_global = true;
        }
        let frame = self.frames.last_mut().unwrap();
        let block = frame.blocks.last_mut().unwrap();
        if let Some(&existing) = block.get(name) {
            if top_level_main && self.options.repl_mode {
                block.insert(name.to_string(), handle);
                let _ = existing;
                return Ok(());
            }
            return Err(CompileError::new(format!("duplicate declaration of '{name}'"), loc));
        }
        block.insert(name.to_string(), handle);
        Ok(())
    }

    fn resolve_var_decl(&mut self, handle: VarHandle) -> CompileResult<()> {
        let name = self.ctx.vars.get(handle).name.clone();
        self.declare_in_current_block(handle, &name)?;
        {
            let (fun, nesting_level) = {
                let f = self.frames.last().unwrap();
                (f.fun, f.nesting_level)
            };
            self.ctx.vars.get_mut(handle).owner = Some(fun);
            self.ctx.vars.get_mut(handle).nesting_level = nesting_level;
        }

        let mut init = self.ctx.vars.get_mut(handle).initializer.take();
        self.being_initialized.insert(handle);
        let result = init.as_mut().map(|e| self.resolve_expr(e)).transpose();
        self.being_initialized.remove(&handle);
        if let Err(e) = result {
            self.ctx.vars.get_mut(handle).initializer = init;
            return Err(e);
        }

        if let Some(expr) = &init {
            let declared = self.ctx.vars.get(handle).declared_type.clone();
            if declared.is_unknown() {
                self.ctx.vars.get_mut(handle).ty = expr.ty.clone();
            } else if !expr.ty.is_convertible_to(&declared, &self.ctx.classes) {
                let err = CompileError::new(
                    format!("cannot assign {} to {} variable '{name}'", expr.ty, declared),
                    expr.location,
                );
                self.ctx.vars.get_mut(handle).initializer = init;
                return Err(err);
            }
            self.ctx.vars.get_mut(handle).record_initializer_write();
        }
        self.ctx.vars.get_mut(handle).initializer = init;
        Ok(())
    }

    // ---- statements ----

    fn resolve_stmt(&mut self, stmt: &mut Stmt) -> CompileResult<()> {
        match &mut stmt.kind {
            StmtKind::Stmts(v) => {
                for s in v.iter_mut() {
                    self.resolve_stmt(s)?;
                }
                Ok(())
            }
            StmtKind::Block(v) => self.resolve_block(v),
            StmtKind::If { cond, then_branch, else_branch } => {
                self.resolve_expr(cond)?;
                self.resolve_stmt(then_branch)?;
                if let Some(eb) = else_branch {
                    self.resolve_stmt(eb)?;
                }
                Ok(())
            }
            StmtKind::While { id, cond, body } => {
                self.resolve_expr(cond)?;
                self.frames.last_mut().unwrap().loop_stack.push(*id);
                let result = self.resolve_stmt(body);
                self.frames.last_mut().unwrap().loop_stack.pop();
                result
            }
            StmtKind::VarDecl(handle) => self.resolve_var_decl(*handle),
            StmtKind::FunDecl(fh) => self.resolve_function(*fh),
            StmtKind::Return(expr) => self.resolve_expr(expr),
            StmtKind::ExprStmt(expr) => self.resolve_expr(expr),
            StmtKind::ThrowError { message } => self.resolve_expr(message),
            // Classes are resolved centrally from `Program.classes`; the
            // inline `ClassDecl` statement left behind at its declaration
            // site is purely a marker; resolving it again here would
            // duplicate every method's capture/implicit-return analysis.
            StmtKind::ClassDecl(_) => Ok(()),
        }
    }

    // ---- implicit return synthesis (§4.4 "Implicit-return synthesis") ----

    fn apply_implicit_return_body(&mut self, body: &mut Stmt, return_type: &Type) -> CompileResult<()> {
        let loc = body.location;
        let stmts = match &mut body.kind {
            StmtKind::Block(v) | StmtKind::Stmts(v) => v,
            _ => return Err(CompileError::new("function body must be a block", loc)),
        };
        self.apply_to_stmt_list(stmts, loc, return_type)
    }

    fn apply_to_stmt_list(
        &mut self,
        stmts: &mut Vec<Stmt>,
        list_loc: Location,
        return_type: &Type,
    ) -> CompileResult<()> {
        if stmts.is_empty() {
            if return_type.is_any() {
                stmts.push(Stmt::new(StmtKind::Return(null_expr(list_loc)), list_loc));
                return Ok(());
            }
            return Err(CompileError::new(
                "function with a non-any return type must end in a return, if, or throw",
                list_loc,
            ));
        }
        let last_idx = stmts.len() - 1;
        let loc = stmts[last_idx].location;
        match &mut stmts[last_idx].kind {
            StmtKind::Return(_) => Ok(()),
            StmtKind::ThrowError { .. } => Ok(()),
            StmtKind::ExprStmt(_) => {
                let taken = stmts.pop().unwrap();
                let StmtKind::ExprStmt(expr) = taken.kind else { unreachable!() };
                stmts.push(Stmt::new(StmtKind::Return(expr), loc));
                Ok(())
            }
            StmtKind::FunDecl(fh) => {
                let fh = *fh;
                let name = self.ctx.funs.get(fh).name.clone().unwrap_or_default();
                let var = self
                    .find_name_in_current_scopes(&name)
                    .unwrap_or_else(|| self.function_proxy_var(fh, &name, loc));
                let ident = typed_expr(
                    ExprKind::Identifier { name, var: Some(var) },
                    Type::Function,
                    loc,
                );
                stmts.push(Stmt::new(StmtKind::Return(ident), loc));
                Ok(())
            }
            StmtKind::If { then_branch, else_branch, .. } => {
                self.apply_to_branch(then_branch, return_type)?;
                if else_branch.is_none() {
                    if return_type.is_primitive() {
                        return Err(CompileError::new(
                            "an if/else with no else branch cannot be the final statement of a function with a primitive return type",
                            loc,
                        ));
                    }
                    *else_branch = Some(Box::new(Stmt::new(StmtKind::Return(null_expr(loc)), loc)));
                } else {
                    self.apply_to_branch(else_branch.as_mut().unwrap(), return_type)?;
                }
                Ok(())
            }
            StmtKind::Block(_) | StmtKind::Stmts(_) => {
                let inner = match &mut stmts[last_idx].kind {
                    StmtKind::Block(v) | StmtKind::Stmts(v) => v,
                    _ => unreachable!(),
                };
                self.apply_to_stmt_list(inner, loc, return_type)
            }
            _ => {
                if return_type.is_any() {
                    stmts.push(Stmt::new(StmtKind::Return(null_expr(loc)), loc));
                    Ok(())
                } else {
                    Err(CompileError::new(
                        "function with a non-any return type must end in a return, if, or throw",
                        loc,
                    ))
                }
            }
        }
    }

    fn apply_to_branch(&mut self, branch: &mut Stmt, return_type: &Type) -> CompileResult<()> {
        match &mut branch.kind {
            StmtKind::Block(v) | StmtKind::Stmts(v) => {
                let loc = branch.location;
                self.apply_to_stmt_list(v, loc, return_type)
            }
            StmtKind::Return(_) | StmtKind::ThrowError { .. } => Ok(()),
            StmtKind::ExprStmt(_) => {
                let loc = branch.location;
                let taken = std::mem::replace(branch, placeholder_stmt());
                let StmtKind::ExprStmt(expr) = taken.kind else { unreachable!() };
                *branch = Stmt::new(StmtKind::Return(expr), loc);
                Ok(())
            }
            // `If` mutates its own else-branch in place (no Vec growth), so
            // it can be delegated to directly.
            StmtKind::If { then_branch, else_branch, .. } => {
                let loc = branch.location;
                self.apply_to_branch(then_branch, return_type)?;
                if else_branch.is_none() {
                    if return_type.is_primitive() {
                        return Err(CompileError::new(
                            "an if/else with no else branch cannot be the final statement of a function with a primitive return type",
                            loc,
                        ));
                    }
                    *else_branch = Some(Box::new(Stmt::new(StmtKind::Return(null_expr(loc)), loc)));
                } else {
                    self.apply_to_branch(else_branch.as_mut().unwrap(), return_type)?;
                }
                Ok(())
            }
            // A bare `FunDecl` as a branch's trailing (and only) statement
            // needs a second statement appended after it, which a single
            // `Stmt` slot can't hold — wrap both in a synthesized block,
            // same as the generic append case below.
            _ => {
                if return_type.is_any() {
                    let loc = branch.location;
                    let original = std::mem::replace(branch, placeholder_stmt());
                    let return_stmt = if let StmtKind::FunDecl(fh) = &original.kind {
                        let fh = *fh;
                        let name = self.ctx.funs.get(fh).name.clone().unwrap_or_default();
                        let var = self
                            .find_name_in_current_scopes(&name)
                            .unwrap_or_else(|| self.function_proxy_var(fh, &name, loc));
                        let ident = typed_expr(
                            ExprKind::Identifier { name, var: Some(var) },
                            Type::Function,
                            loc,
                        );
                        Stmt::new(StmtKind::Return(ident), loc)
                    } else {
                        Stmt::new(StmtKind::Return(null_expr(loc)), loc)
                    };
                    *branch = Stmt::new(StmtKind::Block(vec![original, return_stmt]), loc);
                    Ok(())
                } else {
                    Err(CompileError::new(
                        "branch cannot be the final statement of a function with a primitive return type",
                        branch.location,
                    ))
                }
            }
        }
    }

    fn find_name_in_current_scopes(&self, name: &str) -> Option<VarHandle> {
        let frame = self.frames.last()?;
        frame.blocks.iter().rev().find_map(|b| b.get(name).copied())
    }

    fn function_proxy_var(&mut self, fh: FunHandle, name: &str, loc: Location) -> VarHandle {
        let mut decl = VarDecl::new(name, loc, Type::Function);
        decl.ty = Type::Function;
        decl.fun_binding = Some(fh);
        decl.is_final = true;
        self.ctx.vars.insert(decl)
    }

    // ---- wrapper synthesis (§3 "every FunDecl except script main has a wrapper") ----

    /// Synthesizes a companion `FunDecl` that forwards positionally to `fh`.
    /// A full named/optional-argument dispatcher belongs to the back-end
    /// (out of scope here, per the design notes on "wrapper functions");
    /// this wrapper exists so the invariant holds structurally and so the
    /// async analyser has a concrete call target to propagate through.
    fn synthesize_wrapper(&mut self, fh: FunHandle) {
        if self.ctx.funs.get(fh).wrapper.is_some() {
            return;
        }
        let start = self.ctx.funs.get(fh).start;
        let return_type = self.ctx.funs.get(fh).return_type.clone();
        let params = self.ctx.funs.get(fh).params.clone();

        let mut forward_params = Vec::with_capacity(params.len());
        let mut call_args = Vec::with_capacity(params.len());
        for &p in &params {
            let ty = self.ctx.vars.get(p).ty.clone();
            let name = self.ctx.vars.get(p).name.clone();
            let mut decl = VarDecl::new(name.clone(), start, ty.clone());
            decl.ty = ty;
            decl.is_param = true;
            let handle = self.ctx.vars.insert(decl);
            forward_params.push(handle);
            call_args.push(typed_expr(ExprKind::Identifier { name, var: Some(handle) }, Type::Any, start));
        }

        let callee_var = self.function_proxy_var(fh, &format!("{}$wrapped", wrapper_base_name(self.ctx, fh)), start);
        let call = typed_expr(
            ExprKind::Call {
                callee: Box::new(typed_expr(
                    ExprKind::Identifier { name: String::new(), var: Some(callee_var) },
                    Type::Function,
                    start,
                )),
                args: call_args,
                is_async: self.ctx.funs.get(fh).descriptor.is_async,
            },
            return_type.clone(),
            start,
        );
        let body = Stmt::new(StmtKind::Block(vec![Stmt::new(StmtKind::Return(call), start)]), start);

        let mut wrapper = crate::ast::FunDecl::new(None, start, body);
        wrapper.return_type = return_type;
        wrapper.params = forward_params;
        wrapper.descriptor = crate::ast::FunctionDescriptor::new(params.len(), params.len());
        wrapper.nesting_level = self.ctx.funs.get(fh).nesting_level;
        wrapper.owner_class = self.ctx.funs.get(fh).owner_class;
        let wrapper_handle = self.ctx.funs.insert(wrapper);
        self.ctx.funs.get_mut(fh).wrapper = Some(wrapper_handle);
    }

    // ---- expressions ----

    fn resolve_expr(&mut self, expr: &mut Expr) -> CompileResult<()> {
        let loc = expr.location;
        match &mut expr.kind {
            ExprKind::Literal(cv) => {
                expr.ty = const_value_type(cv);
                expr.is_const = true;
                expr.const_value = Some(cv.clone());
            }
            ExprKind::ListLiteral(items) => {
                for it in items.iter_mut() {
                    self.resolve_expr(it)?;
                }
                expr.ty = Type::List;
            }
            ExprKind::MapLiteral(entries) => {
                for (k, v) in entries.iter_mut() {
                    self.resolve_expr(k)?;
                    self.resolve_expr(v)?;
                }
                expr.ty = Type::Map;
            }
            ExprKind::Identifier { name, var } => {
                let handle = self.resolve_identifier(name, loc)?;
                *var = Some(handle);
                expr.ty = self.ctx.vars.get(handle).ty.clone();
            }
            ExprKind::InterpolatedString { parts } => {
                for p in parts.iter_mut() {
                    self.resolve_expr(p)?;
                }
                expr.ty = Type::String;
                if self.options.evaluate_const_exprs && parts.iter().all(|p| p.is_const) {
                    let mut s = String::new();
                    for p in parts.iter() {
                        s.push_str(&display_const(p.const_value.as_ref().unwrap()));
                    }
                    expr.is_const = true;
                    expr.const_value = Some(ConstValue::String(s));
                }
            }
            ExprKind::Binary { op, left, right } => {
                self.resolve_expr(left)?;
                self.resolve_expr(right)?;
                let result_ty = binary_result_type(*op, &left.ty, &right.ty).ok_or_else(|| {
                    CompileError::new(
                        format!("operator {:?} is not applicable to {} and {}", op, left.ty, right.ty),
                        loc,
                    )
                })?;
                if self.options.evaluate_const_exprs
                    && matches!(op, BinaryOp::Div | BinaryOp::Mod)
                    && left.is_const
                    && right.is_const
                    && is_zero_numeric_const(right.const_value.as_ref())
                    && (result_ty == Type::INT
                        || result_ty == Type::LONG
                        || (result_ty == Type::Decimal && *op == BinaryOp::Div))
                {
                    return Err(CompileError::new("division by zero in constant expression", loc));
                }
                expr.ty = result_ty;
                if self.options.evaluate_const_exprs && left.is_const && right.is_const {
                    if let Some(cv) = fold_binary_const(
                        *op,
                        left.const_value.as_ref().unwrap(),
                        right.const_value.as_ref().unwrap(),
                        &left.ty,
                        self.options.min_scale,
                    ) {
                        expr.is_const = true;
                        expr.const_value = Some(cv);
                    }
                }
            }
            ExprKind::FieldAccess { receiver, field } => {
                self.resolve_expr(receiver)?;
                if let FieldRef::Index { index, .. } = field {
                    self.resolve_expr(index)?;
                }
                if !(receiver.ty.is_any()
                    || matches!(receiver.ty, Type::List | Type::Map | Type::String | Type::Instance(_)))
                {
                    return Err(CompileError::new(
                        format!("cannot index into a value of type {}", receiver.ty),
                        loc,
                    ));
                }
                expr.ty = match (&receiver.ty, field) {
                    (Type::Instance(class), FieldRef::Dot { name, .. }) => self
                        .lookup_field_type(*class, name)
                        .unwrap_or(Type::Any),
                    _ => Type::Any,
                };
            }
            ExprKind::Unary { op, operand, .. } => {
                self.resolve_expr(operand)?;
                expr.ty = match op {
                    UnaryOp::Negate => {
                        if operand.ty.is_numeric() || operand.ty.is_any() {
                            operand.ty.clone()
                        } else {
                            return Err(CompileError::new(
                                format!("cannot negate a value of type {}", operand.ty),
                                loc,
                            ));
                        }
                    }
                    UnaryOp::Not => {
                        if matches!(operand.ty, Type::Primitive(Primitive::Bool, _)) || operand.ty.is_any() {
                            Type::BOOL
                        } else {
                            return Err(CompileError::new(
                                format!("cannot negate a value of type {}", operand.ty),
                                loc,
                            ));
                        }
                    }
                };
                if self.options.evaluate_const_exprs && operand.is_const {
                    if let Some(cv) = fold_unary_const(*op, operand.const_value.as_ref().unwrap()) {
                        expr.is_const = true;
                        expr.const_value = Some(cv);
                    }
                }
            }
            ExprKind::VarDeclExpr(handle) => {
                let handle = *handle;
                self.resolve_var_decl(handle)?;
                expr.ty = self.ctx.vars.get(handle).ty.clone();
            }
            ExprKind::VarAssign { name, var, value, null_safe } => {
                self.resolve_expr(value)?;
                let handle = self.resolve_identifier(name, loc)?;
                *var = Some(handle);
                self.ctx.vars.get_mut(handle).record_write();
                let lhs_ty = self.ctx.vars.get(handle).ty.clone();
                if !value.ty.is_convertible_to(&lhs_ty, &self.ctx.classes) {
                    return Err(CompileError::new(
                        format!("cannot assign {} to {} variable '{name}'", value.ty, lhs_ty),
                        loc,
                    ));
                }
                expr.ty = if *null_safe { lhs_ty.boxed() } else { lhs_ty };
            }
            ExprKind::VarOpAssign { name, var, op, value, .. } => {
                self.resolve_expr(value)?;
                let handle = self.resolve_identifier(name, loc)?;
                *var = Some(handle);
                self.ctx.vars.get_mut(handle).record_write();
                let lhs_ty = self.ctx.vars.get(handle).ty.clone();
                let result_ty = binary_result_type(*op, &lhs_ty, &value.ty).ok_or_else(|| {
                    CompileError::new(
                        format!("operator {:?}= is not applicable to {} and {}", op, lhs_ty, value.ty),
                        loc,
                    )
                })?;
                if !result_ty.is_convertible_to(&lhs_ty, &self.ctx.classes) {
                    return Err(CompileError::new(
                        format!("cannot assign {} to {} variable '{name}'", result_ty, lhs_ty),
                        loc,
                    ));
                }
                expr.ty = lhs_ty;
            }
            ExprKind::FieldAssign { receiver, field, value } => {
                self.resolve_expr(receiver)?;
                if let FieldRef::Index { index, .. } = field {
                    self.resolve_expr(index)?;
                }
                self.resolve_expr(value)?;
                if !(receiver.ty.is_any()
                    || matches!(receiver.ty, Type::List | Type::Map | Type::Instance(_)))
                {
                    return Err(CompileError::new(
                        format!("cannot assign into a value of type {}", receiver.ty),
                        loc,
                    ));
                }
                expr.ty = value.ty.boxed();
            }
            ExprKind::FieldOpAssign { receiver, field, op, value, .. } => {
                self.resolve_expr(receiver)?;
                if let FieldRef::Index { index, .. } = field {
                    self.resolve_expr(index)?;
                }
                self.resolve_expr(value)?;
                if !(receiver.ty.is_any()
                    || matches!(receiver.ty, Type::List | Type::Map | Type::Instance(_)))
                {
                    return Err(CompileError::new(
                        format!("cannot assign into a value of type {}", receiver.ty),
                        loc,
                    ));
                }
                let _ = binary_result_type(*op, &Type::Any, &value.ty);
                expr.ty = Type::Any;
            }
            ExprKind::Noop => {
                expr.ty = Type::Any;
            }
            ExprKind::Call { callee, args, .. } => {
                self.resolve_expr(callee)?;
                for a in args.iter_mut() {
                    self.resolve_expr(a)?;
                }
                expr.ty = match &callee.kind {
                    ExprKind::Identifier { var: Some(h), .. } => {
                        let v = self.ctx.vars.get(*h);
                        match v.fun_binding {
                            Some(fh) => self.ctx.funs.get(fh).return_type.clone(),
                            None => Type::Any,
                        }
                    }
                    _ => Type::Any,
                };
            }
            ExprKind::MethodCall { receiver, args, name, .. } => {
                self.resolve_expr(receiver)?;
                for a in args.iter_mut() {
                    self.resolve_expr(a)?;
                }
                expr.ty = match &receiver.ty {
                    Type::Instance(class) => match self.ctx.classes.find_method(*class, name, &self.ctx.funs) {
                        Some(mh) => self.ctx.funs.get(mh).return_type.clone(),
                        None => Type::Any,
                    },
                    _ => Type::Any,
                };
            }
            ExprKind::RegexMatch { target, pattern, .. } => {
                self.resolve_expr(target)?;
                self.resolve_expr(pattern)?;
                expr.ty = Type::BOOL;
            }
            ExprKind::RegexSubst { target, pattern, replacement, .. } => {
                self.resolve_expr(target)?;
                self.resolve_expr(pattern)?;
                self.resolve_expr(replacement)?;
                expr.ty = Type::String;
            }
            ExprKind::Ternary { cond, then_expr, else_expr } => {
                self.resolve_expr(cond)?;
                self.resolve_expr(then_expr)?;
                self.resolve_expr(else_expr)?;
                if !(matches!(cond.ty, Type::Primitive(Primitive::Bool, _)) || cond.ty.is_any()) {
                    return Err(CompileError::new(
                        format!("condition of a ternary must be boolean, found {}", cond.ty),
                        loc,
                    ));
                }
                if self.options.evaluate_const_exprs && cond.is_const {
                    if let Some(ConstValue::Bool(b)) = &cond.const_value {
                        let chosen = if *b { &**then_expr } else { &**else_expr };
                        expr.ty = chosen.ty.clone();
                        expr.is_const = chosen.is_const;
                        expr.const_value = chosen.const_value.clone();
                    }
                }
                if !expr.is_const {
                    expr.ty = if then_expr.ty == else_expr.ty {
                        then_expr.ty.clone()
                    } else {
                        Type::Any
                    };
                }
            }
            ExprKind::Closure(fh) => {
                let fh = *fh;
                self.resolve_function(fh)?;
                expr.ty = Type::Function;
            }
            ExprKind::FunDecl(fh) => {
                let fh = *fh;
                self.resolve_function(fh)?;
                expr.ty = Type::Function;
            }
            ExprKind::Return(value) => {
                self.resolve_expr(value)?;
                expr.ty = value.ty.clone();
            }
            ExprKind::Break(target) => {
                let frame = self.frames.last().ok_or_else(|| CompileError::new("break outside of a loop", loc))?;
                *target = Some(*frame.loop_stack.last().ok_or_else(|| {
                    CompileError::new("break outside of a loop", loc)
                })?);
                expr.ty = Type::Any;
            }
            ExprKind::Continue(target) => {
                let frame = self.frames.last().ok_or_else(|| CompileError::new("continue outside of a loop", loc))?;
                *target = Some(*frame.loop_stack.last().ok_or_else(|| {
                    CompileError::new("continue outside of a loop", loc)
                })?);
                expr.ty = Type::Any;
            }
            ExprKind::Print { value, .. } => {
                self.resolve_expr(value)?;
                expr.ty = Type::Any;
            }
            ExprKind::Block(inner) => {
                self.resolve_stmt(inner)?;
                expr.ty = match &inner.kind {
                    StmtKind::Block(v) => v
                        .last()
                        .and_then(|s| if let StmtKind::ExprStmt(e) = &s.kind { Some(e.ty.clone()) } else { None })
                        .unwrap_or(Type::Any),
                    _ => Type::Any,
                };
            }
        }
        Ok(())
    }

    // ---- identifier resolution (§4.4 "Scope resolution") ----

    fn resolve_identifier(&mut self, name: &str, loc: Location) -> CompileResult<VarHandle> {
        if let Some(top) = self.frames.len().checked_sub(1) {
            for level in (0..=top).rev() {
                if let Some(handle) = self.find_in_frame_blocks(level, name) {
                    if level == top {
                        if self.being_initialized.contains(&handle) {
                            return Err(CompileError::new(
                                format!("'{name}' cannot be referenced in its own initializer"),
                                loc,
                            ));
                        }
                        return Ok(handle);
                    }
                    return Ok(self.build_capture_chain(handle, level, top, name, loc));
                }
            }
            if let Some(class) = self.frames[top].owner_class {
                if let Some(handle) = self.lookup_class_field(class, name, loc) {
                    return Ok(handle);
                }
                if let Some(handle) = self.lookup_class_method(class, name, loc) {
                    return Ok(handle);
                }
            }
        }
        if let Some(handle) = self.lookup_or_create_global(name, loc) {
            return Ok(handle);
        }
        Err(CompileError::new(format!("reference to undeclared identifier '{name}'"), loc))
    }

    fn find_in_frame_blocks(&self, level: usize, name: &str) -> Option<VarHandle> {
        self.frames[level].blocks.iter().rev().find_map(|b| b.get(name).copied())
    }

    /// Marks `declared` (found at `declaring_level`) as a heap local and
    /// threads a forwarding `VarDecl` through every function level between
    /// it and `top`, registering each in that level's `FunDecl.captures`
    /// (§3 "FunDecl" / design note "heap-local capture promotion").
    fn build_capture_chain(
        &mut self,
        declared: VarHandle,
        declaring_level: usize,
        top: usize,
        name: &str,
        loc: Location,
    ) -> VarHandle {
        self.ctx.vars.get_mut(declared).is_heap_local = true;
        let orig_ty = self.ctx.vars.get(declared).ty.clone();
        let mut parent = declared;
        for level in (declaring_level + 1)..=top {
            if let Some(existing) = self.find_in_frame_blocks(level, name) {
                parent = existing;
                continue;
            }
            let fun = self.frames[level].fun;
            let nesting_level = self.frames[level].nesting_level;
            let mut wrapper = VarDecl::new(name, loc, orig_ty.clone());
            wrapper.ty = orig_ty.clone();
            wrapper.is_param = true;
            wrapper.is_passed_as_heap_local = true;
            wrapper.is_heap_local = true;
            wrapper.parent = Some(parent);
            wrapper.original = Some(declared);
            wrapper.owner = Some(fun);
            wrapper.nesting_level = nesting_level;
            let handle = self.ctx.vars.insert(wrapper);
            self.ctx.funs.get_mut(fun).captures.insert(name.to_string(), handle);
            self.frames[level].blocks[0].insert(name.to_string(), handle);
            parent = handle;
        }
        parent
    }

    fn lookup_field_type(&self, class: ClassHandle, name: &str) -> Option<Type> {
        let mut current = Some(class);
        while let Some(c) = current {
            let descriptor = self.ctx.classes.get(c);
            if let Some(ty) = descriptor.field_type(name) {
                return Some(ty.clone());
            }
            current = descriptor.super_class;
        }
        None
    }

    fn lookup_class_field(&mut self, class: ClassHandle, name: &str, loc: Location) -> Option<VarHandle> {
        let key = (class, name.to_string());
        if let Some(&h) = self.class_field_vars.get(&key) {
            return Some(h);
        }
        let ty = self.lookup_field_type(class, name)?;
        let mut decl = VarDecl::new(name, loc, ty.clone());
        decl.ty = ty;
        decl.is_final = false;
        let handle = self.ctx.vars.insert(decl);
        self.class_field_vars.insert(key, handle);
        Some(handle)
    }

    fn lookup_class_method(&mut self, class: ClassHandle, name: &str, loc: Location) -> Option<VarHandle> {
        let key = (class, name.to_string());
        if let Some(&h) = self.class_method_vars.get(&key) {
            return Some(h);
        }
        let fh = self.ctx.classes.find_method(class, name, &self.ctx.funs)?;
        let mut decl = VarDecl::new(name, loc, Type::Function);
        decl.ty = Type::Function;
        decl.fun_binding = Some(fh);
        decl.is_final = true;
        let handle = self.ctx.vars.insert(decl);
        self.class_method_vars.insert(key, handle);
        Some(handle)
    }

    fn lookup_or_create_global(&mut self, name: &str, loc: Location) -> Option<VarHandle> {
        if let Some(&h) = self.global_vars.get(name) {
            return Some(h);
        }
        let ty = self.globals.get(name)?.clone();
        let mut decl = VarDecl::new(name, loc, ty.clone());
        decl.ty = ty;
        decl.is_global = true;
        decl.is_final = false;
        decl.nesting_level = 0;
        let handle = self.ctx.vars.insert(decl);
        self.global_vars.insert(name.to_string(), handle);
        Some(handle)
    }
}

fn placeholder_stmt() -> Stmt {
    Stmt::new(StmtKind::Stmts(Vec::new()), Location::default())
}

fn null_expr(loc: Location) -> Expr {
    let mut e = Expr::new(ExprKind::Literal(ConstValue::Null), loc);
    e.ty = Type::Any;
    e.is_const = true;
    e.const_value = Some(ConstValue::Null);
    e
}

fn typed_expr(kind: ExprKind, ty: Type, loc: Location) -> Expr {
    let mut e = Expr::new(kind, loc);
    e.ty = ty;
    e
}

fn wrapper_base_name(ctx: &CompileContext, fh: FunHandle) -> String {
    ctx.funs.get(fh).name.clone().unwrap_or_else(|| format!("$anon{}", fh.0))
}

fn const_value_type(cv: &ConstValue) -> Type {
    match cv {
        ConstValue::Null => Type::Any,
        ConstValue::Bool(_) => Type::BOOL,
        ConstValue::Int(_) => Type::INT,
        ConstValue::Long(_) => Type::LONG,
        ConstValue::Double(_) => Type::DOUBLE,
        ConstValue::Decimal(_) => Type::Decimal,
        ConstValue::String(_) => Type::String,
    }
}

fn is_zero_numeric_const(cv: Option<&ConstValue>) -> bool {
    matches!(
        cv,
        Some(ConstValue::Int(0)) | Some(ConstValue::Long(0))
    ) || matches!(cv, Some(ConstValue::Decimal(d)) if d.is_zero())
}

fn display_const(cv: &ConstValue) -> String {
    match cv {
        ConstValue::Null => "null".to_string(),
        ConstValue::Bool(b) => b.to_string(),
        ConstValue::Int(v) => v.to_string(),
        ConstValue::Long(v) => v.to_string(),
        ConstValue::Double(v) => v.to_string(),
        ConstValue::Decimal(d) => decimal_to_string(*d),
        ConstValue::String(s) => s.clone(),
    }
}

fn decimal_to_string(d: Decimal) -> String {
    if d.scale == 0 {
        return d.unscaled.to_string();
    }
    let scale = d.scale as usize;
    let neg = d.unscaled < 0;
    let abs = d.unscaled.unsigned_abs();
    let digits = format!("{:0width$}", abs, width = scale + 1);
    let (int_part, frac_part) = digits.split_at(digits.len() - scale);
    format!("{}{int_part}.{frac_part}", if neg { "-" } else { "" })
}

fn to_decimal(cv: &ConstValue) -> Option<Decimal> {
    match cv {
        ConstValue::Decimal(d) => Some(*d),
        ConstValue::Int(v) => Some(Decimal::new(*v as i128, 0)),
        ConstValue::Long(v) => Some(Decimal::new(*v as i128, 0)),
        _ => None,
    }
}

fn const_to_f64(cv: &ConstValue) -> Option<f64> {
    match cv {
        ConstValue::Int(v) => Some(*v as f64),
        ConstValue::Long(v) => Some(*v as f64),
        ConstValue::Double(v) => Some(*v),
        _ => None,
    }
}

fn const_to_i64(cv: &ConstValue) -> Option<i64> {
    match cv {
        ConstValue::Int(v) => Some(*v as i64),
        ConstValue::Long(v) => Some(*v),
        _ => None,
    }
}

fn fold_binary_const(op: BinaryOp, l: &ConstValue, r: &ConstValue, lhs_ty: &Type, min_scale: u32) -> Option<ConstValue> {
    match op {
        BinaryOp::Add if matches!(lhs_ty, Type::String) => {
            Some(ConstValue::String(format!("{}{}", display_const(l), display_const(r))))
        }
        BinaryOp::Mul if matches!(lhs_ty, Type::String) => {
            let ConstValue::String(s) = l else { return None };
            let count = match r {
                ConstValue::Int(v) => *v as i64,
                ConstValue::Long(v) => *v,
                _ => return None,
            };
            if count < 0 {
                return None;
            }
            Some(ConstValue::String(s.repeat(count as usize)))
        }
        _ if op.is_arithmetic() => fold_arithmetic(op, l, r, min_scale),
        _ if op.is_equality() || op.is_ordered_comparison() => fold_comparison(op, l, r),
        BinaryOp::And => match (as_bool(l), as_bool(r)) {
            (Some(a), Some(b)) => Some(ConstValue::Bool(a && b)),
            _ => None,
        },
        BinaryOp::Or => match (as_bool(l), as_bool(r)) {
            (Some(a), Some(b)) => Some(ConstValue::Bool(a || b)),
            _ => None,
        },
        _ => None,
    }
}

fn as_bool(cv: &ConstValue) -> Option<bool> {
    if let ConstValue::Bool(b) = cv {
        Some(*b)
    } else {
        None
    }
}

fn fold_arithmetic(op: BinaryOp, l: &ConstValue, r: &ConstValue, min_scale: u32) -> Option<ConstValue> {
    if matches!(l, ConstValue::Decimal(_)) || matches!(r, ConstValue::Decimal(_)) {
        let a = to_decimal(l)?;
        let b = to_decimal(r)?;
        return fold_decimal(op, a, b, min_scale);
    }
    if matches!(l, ConstValue::Double(_)) || matches!(r, ConstValue::Double(_)) {
        let a = const_to_f64(l)?;
        let b = const_to_f64(r)?;
        return fold_double(op, a, b);
    }
    if matches!(l, ConstValue::Long(_)) || matches!(r, ConstValue::Long(_)) {
        let a = const_to_i64(l)?;
        let b = const_to_i64(r)?;
        return fold_long(op, a, b);
    }
    if let (ConstValue::Int(a), ConstValue::Int(b)) = (l, r) {
        return fold_int(op, *a, *b);
    }
    None
}

fn fold_int(op: BinaryOp, a: i32, b: i32) -> Option<ConstValue> {
    match op {
        BinaryOp::Add => a.checked_add(b).map(ConstValue::Int),
        BinaryOp::Sub => a.checked_sub(b).map(ConstValue::Int),
        BinaryOp::Mul => a.checked_mul(b).map(ConstValue::Int),
        BinaryOp::Div => (b != 0).then(|| ConstValue::Int(a / b)),
        BinaryOp::Mod => (b != 0).then(|| ConstValue::Int(a % b)),
        _ => None,
    }
}

fn fold_long(op: BinaryOp, a: i64, b: i64) -> Option<ConstValue> {
    match op {
        BinaryOp::Add => a.checked_add(b).map(ConstValue::Long),
        BinaryOp::Sub => a.checked_sub(b).map(ConstValue::Long),
        BinaryOp::Mul => a.checked_mul(b).map(ConstValue::Long),
        BinaryOp::Div => (b != 0).then(|| ConstValue::Long(a / b)),
        BinaryOp::Mod => (b != 0).then(|| ConstValue::Long(a % b)),
        _ => None,
    }
}

fn fold_double(op: BinaryOp, a: f64, b: f64) -> Option<ConstValue> {
    match op {
        BinaryOp::Add => Some(ConstValue::Double(a + b)),
        BinaryOp::Sub => Some(ConstValue::Double(a - b)),
        BinaryOp::Mul => Some(ConstValue::Double(a * b)),
        BinaryOp::Div => Some(ConstValue::Double(a / b)),
        BinaryOp::Mod => Some(ConstValue::Double(a % b)),
        _ => None,
    }
}

fn fold_decimal(op: BinaryOp, a: Decimal, b: Decimal, min_scale: u32) -> Option<ConstValue> {
    match op {
        BinaryOp::Add => Some(ConstValue::Decimal(a.add(b, min_scale))),
        BinaryOp::Sub => Some(ConstValue::Decimal(a.sub(b, min_scale))),
        BinaryOp::Mul => Some(ConstValue::Decimal(a.mul(b, min_scale))),
        BinaryOp::Div => a.div(b, min_scale).map(ConstValue::Decimal),
        _ => None,
    }
}

fn fold_comparison(op: BinaryOp, l: &ConstValue, r: &ConstValue) -> Option<ConstValue> {
    use std::cmp::Ordering;
    if matches!(l, ConstValue::Null) || matches!(r, ConstValue::Null) {
        return match op {
            BinaryOp::Eq => Some(ConstValue::Bool(matches!(l, ConstValue::Null) && matches!(r, ConstValue::Null))),
            BinaryOp::Ne => Some(ConstValue::Bool(!(matches!(l, ConstValue::Null) && matches!(r, ConstValue::Null)))),
            _ => None,
        };
    }
    let ordering = if let (ConstValue::String(a), ConstValue::String(b)) = (l, r) {
        a.cmp(b)
    } else if let (ConstValue::Bool(a), ConstValue::Bool(b)) = (l, r) {
        a.cmp(b)
    } else {
        let (a, b) = (const_to_comparable(l)?, const_to_comparable(r)?);
        a.partial_cmp(&b)?
    };
    Some(match op {
        BinaryOp::Eq => ConstValue::Bool(ordering == Ordering::Equal),
        BinaryOp::Ne => ConstValue::Bool(ordering != Ordering::Equal),
        BinaryOp::Lt => ConstValue::Bool(ordering == Ordering::Less),
        BinaryOp::Le => ConstValue::Bool(ordering != Ordering::Greater),
        BinaryOp::Gt => ConstValue::Bool(ordering == Ordering::Greater),
        BinaryOp::Ge => ConstValue::Bool(ordering != Ordering::Less),
        BinaryOp::Compare => ConstValue::Int(match ordering {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }),
        _ => return None,
    })
}

fn const_to_comparable(cv: &ConstValue) -> Option<f64> {
    if let ConstValue::Decimal(d) = cv {
        return Some(d.unscaled as f64 / 10f64.powi(d.scale as i32));
    }
    const_to_f64(cv)
}

fn fold_unary_const(op: UnaryOp, cv: &ConstValue) -> Option<ConstValue> {
    match (op, cv) {
        (UnaryOp::Negate, ConstValue::Int(v)) => v.checked_neg().map(ConstValue::Int),
        (UnaryOp::Negate, ConstValue::Long(v)) => v.checked_neg().map(ConstValue::Long),
        (UnaryOp::Negate, ConstValue::Double(v)) => Some(ConstValue::Double(-v)),
        (UnaryOp::Negate, ConstValue::Decimal(d)) => Some(ConstValue::Decimal(Decimal::new(-d.unscaled, d.scale))),
        (UnaryOp::Not, ConstValue::Bool(b)) => Some(ConstValue::Bool(!b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::parser::Parser;

    fn resolve_source(source: &str) -> CompileResult<(CompileContext, Program)> {
        let mut ctx = CompileContext::new();
        let program = Parser::parse(source, &mut ctx)?;
        resolve(&program, &mut ctx, &GlobalsTypeMap::new(), &CompileOptions::new())?;
        Ok((ctx, program))
    }

    #[test]
    fn simple_var_decl_resolves_its_type_from_the_initializer() {
        let (ctx, program) = resolve_source("var x = 1\n").unwrap();
        let main = ctx.funs.get(program.main);
        let StmtKind::Block(stmts) = &main.body.kind else { panic!() };
        let StmtKind::VarDecl(handle) = &stmts[0].kind else { panic!() };
        assert_eq!(ctx.vars.get(*handle).ty, Type::INT);
    }

    #[test]
    fn self_referential_initializer_is_rejected() {
        let err = resolve_source("var x = x + 1\n").unwrap_err();
        assert!(err.message.contains("own initializer"));
    }

    #[test]
    fn forward_reference_to_a_later_function_resolves() {
        let (_, _) = resolve_source("def g() { return f() }\ndef f() { return 1 }\n").unwrap();
    }

    #[test]
    fn undeclared_identifier_is_an_error() {
        let err = resolve_source("return y\n").unwrap_err();
        assert!(err.message.contains("undeclared"));
    }

    #[test]
    fn duplicate_declaration_in_the_same_block_is_rejected() {
        let err = resolve_source("var x = 1\nvar x = 2\n").unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn constant_integer_division_by_zero_is_a_compile_error() {
        let err = resolve_source("var x = 1 / 0\n").unwrap_err();
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn constant_arithmetic_folds_through_the_numeric_tower() {
        let (ctx, program) = resolve_source("var x = 1 + 2L\n").unwrap();
        let main = ctx.funs.get(program.main);
        let StmtKind::Block(stmts) = &main.body.kind else { panic!() };
        let StmtKind::VarDecl(handle) = &stmts[0].kind else { panic!() };
        let var = ctx.vars.get(*handle);
        assert_eq!(var.ty, Type::LONG);
        let init = var.initializer.as_ref().unwrap();
        assert!(init.is_const);
        assert_eq!(init.const_value, Some(ConstValue::Long(3)));
    }

    #[test]
    fn closure_capturing_an_outer_local_marks_it_heap_local_and_records_a_capture() {
        let (ctx, program) = resolve_source("var x = 1\ndef f() { return x }\n").unwrap();
        let main = ctx.funs.get(program.main);
        let StmtKind::Block(stmts) = &main.body.kind else { panic!() };
        let StmtKind::VarDecl(outer) = &stmts[0].kind else { panic!() };
        assert!(ctx.vars.get(*outer).is_heap_local);
        let StmtKind::FunDecl(f) = &stmts[1].kind else { panic!() };
        assert_eq!(ctx.funs.get(*f).captures.len(), 1);
        assert!(ctx.funs.get(*f).captures.contains_key("x"));
    }

    #[test]
    fn a_trailing_expression_statement_becomes_an_implicit_return() {
        let (ctx, program) = resolve_source("def f() { 42 }\n").unwrap();
        let StmtKind::Block(stmts) = &ctx.funs.get(program.main).body.kind else { panic!() };
        let StmtKind::FunDecl(f) = &stmts[0].kind else { panic!() };
        let StmtKind::Block(body) = &ctx.funs.get(*f).body.kind else { panic!() };
        assert!(matches!(body.last().unwrap().kind, StmtKind::Return(_)));
    }

    #[test]
    fn every_non_main_function_gets_a_wrapper() {
        let (ctx, program) = resolve_source("def f() { return 1 }\n").unwrap();
        let StmtKind::Block(stmts) = &ctx.funs.get(program.main).body.kind else { panic!() };
        let StmtKind::FunDecl(f) = &stmts[0].kind else { panic!() };
        assert!(ctx.funs.get(*f).wrapper.is_some());
        assert!(ctx.funs.get(program.main).wrapper.is_none());
    }

    #[test]
    fn repl_mode_allows_rebinding_a_top_level_name() {
        let mut ctx = CompileContext::new();
        let program = Parser::parse("var x = 1\nvar x = 2\n", &mut ctx).unwrap();
        let options = CompileOptions::new().with_repl_mode(true);
        resolve(&program, &mut ctx, &GlobalsTypeMap::new(), &options).unwrap();
    }
}
