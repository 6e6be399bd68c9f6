//! Async-propagation analysis (C5, §4.5).
//!
//! A worklist keyed on `(caller, call-site, callee)` dependency triples,
//! drained as each callee resolves to async, would let a caller re-scan
//! only on a specific callee's transition. This crate takes a simpler,
//! semantically equivalent route: repeatedly re-walk every function body
//! until a full pass marks nothing new async, then stop. A fixed point
//! over a monotone (async flags only ever flip false→true, never back)
//! boolean lattice is reached either way; the worklist only buys less
//! redundant re-scanning, which this analysis never needs to care about
//! at source-program scale.

use crate::ast::{Expr, ExprKind, FieldRef, Stmt, StmtKind};
use crate::config::CompileOptions;
use crate::context::{CompileContext, FunHandle};
use crate::types::Type;

/// Runs the fixed point (or, under the testing hook, the "assume every call
/// is async" short-circuit) over every function in `ctx`, including
/// top-level classes' methods — `ClassRegistry` stores `FunDecl`s in the
/// same `FunArena` as everything else, so a single `ctx.funs.handles()`
/// sweep already covers them.
pub fn analyze(ctx: &mut CompileContext, options: &CompileOptions) {
    if options.assume_async {
        force_everything_async(ctx);
        propagate_to_wrappers(ctx);
        return;
    }

    seed_async_arg_positions(ctx);

    loop {
        let mut changed = false;
        let handles: Vec<FunHandle> = ctx.funs.handles().collect();
        for fh in handles {
            let mut body = std::mem::replace(&mut ctx.funs.get_mut(fh).body, placeholder());
            if visit_stmt(&mut body, ctx, fh) {
                changed = true;
            }
            ctx.funs.get_mut(fh).body = body;
        }
        if !changed {
            break;
        }
    }

    propagate_to_wrappers(ctx);
}

fn placeholder() -> Stmt {
    Stmt::new(StmtKind::Stmts(Vec::new()), crate::location::Location::default())
}

fn force_everything_async(ctx: &mut CompileContext) {
    let handles: Vec<FunHandle> = ctx.funs.handles().collect();
    for fh in &handles {
        ctx.funs.get_mut(*fh).descriptor.is_async = true;
    }
    for fh in handles {
        let mut body = std::mem::replace(&mut ctx.funs.get_mut(fh).body, placeholder());
        force_stmt(&mut body);
        ctx.funs.get_mut(fh).body = body;
    }
}

fn force_stmt(stmt: &mut Stmt) {
    match &mut stmt.kind {
        StmtKind::Stmts(v) | StmtKind::Block(v) => v.iter_mut().for_each(force_stmt),
        StmtKind::If { cond, then_branch, else_branch } => {
            force_expr(cond);
            force_stmt(then_branch);
            if let Some(e) = else_branch {
                force_stmt(e);
            }
        }
        StmtKind::While { cond, body, .. } => {
            force_expr(cond);
            force_stmt(body);
        }
        StmtKind::Return(e) | StmtKind::ExprStmt(e) => force_expr(e),
        StmtKind::ThrowError { message } => force_expr(message),
        StmtKind::VarDecl(_) | StmtKind::FunDecl(_) | StmtKind::ClassDecl(_) => {}
    }
}

fn force_expr(expr: &mut Expr) {
    if let ExprKind::Call { is_async, .. } | ExprKind::MethodCall { is_async, .. } = &mut expr.kind {
        *is_async = true;
    }
    for_each_child_expr_mut(expr, force_expr);
    if let ExprKind::Block(inner) = &mut expr.kind {
        force_stmt(inner);
    }
}

/// The wrapper propagation rule (§4.5 "A function marked async has its
/// wrapper transitively marked async").
fn propagate_to_wrappers(ctx: &mut CompileContext) {
    let handles: Vec<FunHandle> = ctx.funs.handles().collect();
    for fh in handles {
        if let Some(wrapper) = ctx.funs.get(fh).wrapper {
            let is_async = ctx.funs.get(fh).descriptor.is_async;
            if is_async {
                ctx.funs.get_mut(wrapper).descriptor.is_async = true;
            }
        }
    }
}

/// Higher-order parameters: a parameter that is itself directly invoked
/// inside the function body transfers async-ness from whatever the caller
/// passes for it. Computed once, up front, since it depends only on a
/// function's own body shape, not on the fixed point's evolving async
/// flags.
fn seed_async_arg_positions(ctx: &mut CompileContext) {
    let handles: Vec<FunHandle> = ctx.funs.handles().collect();
    for fh in handles {
        let params = ctx.funs.get(fh).params.clone();
        if params.is_empty() {
            continue;
        }
        let body = ctx.funs.get(fh).body.clone();
        let mut positions = Vec::new();
        collect_called_params(&body, &params, &mut positions);
        if !positions.is_empty() {
            ctx.funs.get_mut(fh).descriptor.async_args = positions;
        }
    }
}

fn collect_called_params(stmt: &Stmt, params: &[crate::context::VarHandle], out: &mut Vec<usize>) {
    match &stmt.kind {
        StmtKind::Stmts(v) | StmtKind::Block(v) => v.iter().for_each(|s| collect_called_params(s, params, out)),
        StmtKind::If { cond, then_branch, else_branch } => {
            collect_called_params_expr(cond, params, out);
            collect_called_params(then_branch, params, out);
            if let Some(e) = else_branch {
                collect_called_params(e, params, out);
            }
        }
        StmtKind::While { cond, body, .. } => {
            collect_called_params_expr(cond, params, out);
            collect_called_params(body, params, out);
        }
        StmtKind::Return(e) | StmtKind::ExprStmt(e) => collect_called_params_expr(e, params, out),
        StmtKind::ThrowError { message } => collect_called_params_expr(message, params, out),
        StmtKind::VarDecl(_) | StmtKind::FunDecl(_) | StmtKind::ClassDecl(_) => {}
    }
}

fn collect_called_params_expr(expr: &Expr, params: &[crate::context::VarHandle], out: &mut Vec<usize>) {
    if let ExprKind::Call { callee, .. } = &expr.kind {
        if let ExprKind::Identifier { var: Some(h), .. } = &callee.kind {
            if let Some(idx) = params.iter().position(|p| p == h) {
                let position = idx + 1;
                if !out.contains(&position) {
                    out.push(position);
                }
            }
        }
    }
    for_each_child_expr(expr, |e| collect_called_params_expr(e, params, out));
    if let ExprKind::Block(inner) = &expr.kind {
        collect_called_params(inner, params, out);
    }
}

/// Visits every statement in `stmt` (owned by function `owner`), updating
/// `is_async` flags in place. Returns whether anything changed this pass.
fn visit_stmt(stmt: &mut Stmt, ctx: &mut CompileContext, owner: FunHandle) -> bool {
    match &mut stmt.kind {
        StmtKind::Stmts(v) | StmtKind::Block(v) => v.iter_mut().fold(false, |acc, s| visit_stmt(s, ctx, owner) || acc),
        StmtKind::If { cond, then_branch, else_branch } => {
            let mut changed = visit_expr(cond, ctx, owner);
            changed |= visit_stmt(then_branch, ctx, owner);
            if let Some(e) = else_branch {
                changed |= visit_stmt(e, ctx, owner);
            }
            changed
        }
        StmtKind::While { cond, body, .. } => {
            let mut changed = visit_expr(cond, ctx, owner);
            changed |= visit_stmt(body, ctx, owner);
            changed
        }
        StmtKind::Return(e) | StmtKind::ExprStmt(e) => visit_expr(e, ctx, owner),
        StmtKind::ThrowError { message } => visit_expr(message, ctx, owner),
        StmtKind::VarDecl(handle) => {
            let handle = *handle;
            let mut init = ctx.vars.get_mut(handle).initializer.take();
            let changed = init.as_mut().map(|e| visit_expr(e, ctx, owner)).unwrap_or(false);
            ctx.vars.get_mut(handle).initializer = init;
            changed
        }
        // nested functions/classes are visited on their own turn of the
        // outer `ctx.funs.handles()` sweep; this owner's body only needs to
        // know about calls it directly makes.
        StmtKind::FunDecl(_) | StmtKind::ClassDecl(_) => false,
    }
}

fn visit_expr(expr: &mut Expr, ctx: &mut CompileContext, owner: FunHandle) -> bool {
    let mut changed = false;
    match &mut expr.kind {
        ExprKind::VarDeclExpr(handle) => {
            let handle = *handle;
            let mut init = ctx.vars.get_mut(handle).initializer.take();
            if let Some(e) = init.as_mut() {
                changed |= visit_expr(e, ctx, owner);
            }
            ctx.vars.get_mut(handle).initializer = init;
        }
        ExprKind::Block(inner) => {
            changed |= visit_stmt(inner, ctx, owner);
        }
        ExprKind::Call { callee, args, is_async } => {
            changed |= visit_expr(callee, ctx, owner);
            for a in args.iter_mut() {
                changed |= visit_expr(a, ctx, owner);
            }
            let new_async = match identify_static_callee(callee, ctx) {
                Some(callee_fh) => call_is_async(ctx, callee_fh, None, args),
                None => true, // an unresolved dynamic callee is a value of static type `any`
            };
            if new_async && !*is_async {
                *is_async = true;
                ctx.funs.get_mut(owner).descriptor.is_async = true;
                changed = true;
            }
        }
        ExprKind::MethodCall { receiver, args, name, is_async, .. } => {
            changed |= visit_expr(receiver, ctx, owner);
            for a in args.iter_mut() {
                changed |= visit_expr(a, ctx, owner);
            }
            let new_async = match &receiver.ty {
                Type::Instance(class) => match ctx.classes.find_method(*class, name, &ctx.funs) {
                    Some(target) => call_is_async(ctx, target, Some(&**receiver), args),
                    None => true,
                },
                _ => true, // dynamic receiver type: unknown callable
            };
            if new_async && !*is_async {
                *is_async = true;
                ctx.funs.get_mut(owner).descriptor.is_async = true;
                changed = true;
            }
        }
        _ => {
            changed |= for_each_child_expr_mut_fallible(expr, ctx, owner);
        }
    }
    changed
}

/// Rule 2 (§4.5): async iff the callee is (now) async, and — when the
/// callee names specific async-sensitive positions — at least one of those
/// argument expressions supplies an async value. Position 0 is the method
/// receiver (`None` for an ordinary call), positions 1..N are `args[0..]`.
fn call_is_async(ctx: &CompileContext, callee: FunHandle, receiver: Option<&Expr>, args: &[Expr]) -> bool {
    let descriptor = &ctx.funs.get(callee).descriptor;
    if !descriptor.is_async {
        return false;
    }
    if descriptor.async_args.is_empty() {
        return true;
    }
    if descriptor.async_args.contains(&0) {
        if let Some(r) = receiver {
            if arg_is_async(r, ctx) {
                return true;
            }
        }
    }
    args.iter()
        .enumerate()
        .any(|(i, a)| descriptor.async_args.contains(&(i + 1)) && arg_is_async(a, ctx))
}

/// §4.5 "conservative argument classification". An identifier bound to a
/// non-final `VarDecl` is conservatively async (its runtime value is
/// unknown); one bound to a *final* `VarDecl` follows through to the bound
/// function or the initializer and recurses, per §4.5.
fn arg_is_async(expr: &Expr, ctx: &CompileContext) -> bool {
    match &expr.kind {
        ExprKind::Noop => false,
        ExprKind::Call { is_async, .. } | ExprKind::MethodCall { is_async, .. } => *is_async,
        ExprKind::Closure(fh) | ExprKind::FunDecl(fh) => ctx.funs.get(*fh).descriptor.is_async,
        ExprKind::Identifier { var: Some(h), .. } => {
            let var = ctx.vars.get(*h);
            if !var.is_final {
                return true;
            }
            if let Some(fh) = var.fun_binding {
                return ctx.funs.get(fh).descriptor.is_async;
            }
            if let Some(init) = var.initializer.as_ref() {
                return arg_is_async(init, ctx);
            }
            expr.ty.is_any()
        }
        _ => expr.ty.is_any(),
    }
}

/// A call-site's target is statically known only when the callee is a bare
/// identifier bound (by the resolver) to a `VarDecl` that itself names a
/// function (`fun_binding`). Anything else — a value returned by another
/// call, a field access, an `any`-typed local — is a dynamic dispatch the
/// analysis cannot see through, so it falls back to the conservative "value
/// of static type any" rule (§4.5).
fn identify_static_callee(callee: &Expr, ctx: &CompileContext) -> Option<FunHandle> {
    if let ExprKind::Identifier { var: Some(handle), .. } = &callee.kind {
        return ctx.vars.get(*handle).fun_binding;
    }
    None
}

/// Walks every direct `Expr` child of `expr` (not `Stmt` children; callers
/// that need those handle `Block` themselves) without needing `ctx`.
fn for_each_child_expr<'e>(expr: &'e Expr, mut f: impl FnMut(&'e Expr)) {
    match &expr.kind {
        ExprKind::Literal(_) | ExprKind::Noop | ExprKind::Break(_) | ExprKind::Continue(_) => {}
        ExprKind::ListLiteral(items) => items.iter().for_each(|e| f(e)),
        ExprKind::MapLiteral(entries) => entries.iter().for_each(|(k, v)| {
            f(k);
            f(v);
        }),
        ExprKind::Identifier { .. } => {}
        ExprKind::InterpolatedString { parts } => parts.iter().for_each(|e| f(e)),
        ExprKind::Binary { left, right, .. } => {
            f(left);
            f(right);
        }
        ExprKind::FieldAccess { receiver, field } => {
            f(receiver);
            if let FieldRef::Index { index, .. } = field {
                f(index);
            }
        }
        ExprKind::Unary { operand, .. } => f(operand),
        ExprKind::VarDeclExpr(_) => {}
        ExprKind::VarAssign { value, .. } => f(value),
        ExprKind::VarOpAssign { value, .. } => f(value),
        ExprKind::FieldAssign { receiver, field, value } => {
            f(receiver);
            if let FieldRef::Index { index, .. } = field {
                f(index);
            }
            f(value);
        }
        ExprKind::FieldOpAssign { receiver, field, value, .. } => {
            f(receiver);
            if let FieldRef::Index { index, .. } = field {
                f(index);
            }
            f(value);
        }
        ExprKind::Call { callee, args, .. } => {
            f(callee);
            args.iter().for_each(|e| f(e));
        }
        ExprKind::MethodCall { receiver, args, .. } => {
            f(receiver);
            args.iter().for_each(|e| f(e));
        }
        ExprKind::RegexMatch { target, pattern, .. } => {
            f(target);
            f(pattern);
        }
        ExprKind::RegexSubst { target, pattern, replacement, .. } => {
            f(target);
            f(pattern);
            f(replacement);
        }
        ExprKind::Ternary { cond, then_expr, else_expr } => {
            f(cond);
            f(then_expr);
            f(else_expr);
        }
        ExprKind::Closure(_) | ExprKind::FunDecl(_) => {}
        ExprKind::Return(value) => f(value),
        ExprKind::Print { value, .. } => f(value),
        ExprKind::Block(_) => {}
    }
}

fn for_each_child_expr_mut(expr: &mut Expr, mut f: impl FnMut(&mut Expr)) {
    match &mut expr.kind {
        ExprKind::Literal(_) | ExprKind::Noop | ExprKind::Break(_) | ExprKind::Continue(_) => {}
        ExprKind::ListLiteral(items) => items.iter_mut().for_each(|e| f(e)),
        ExprKind::MapLiteral(entries) => entries.iter_mut().for_each(|(k, v)| {
            f(k);
            f(v);
        }),
        ExprKind::Identifier { .. } => {}
        ExprKind::InterpolatedString { parts } => parts.iter_mut().for_each(|e| f(e)),
        ExprKind::Binary { left, right, .. } => {
            f(left);
            f(right);
        }
        ExprKind::FieldAccess { receiver, field } => {
            f(receiver);
            if let FieldRef::Index { index, .. } = field {
                f(index);
            }
        }
        ExprKind::Unary { operand, .. } => f(operand),
        ExprKind::VarDeclExpr(_) => {}
        ExprKind::VarAssign { value, .. } => f(value),
        ExprKind::VarOpAssign { value, .. } => f(value),
        ExprKind::FieldAssign { receiver, field, value } => {
            f(receiver);
            if let FieldRef::Index { index, .. } = field {
                f(index);
            }
            f(value);
        }
        ExprKind::FieldOpAssign { receiver, field, value, .. } => {
            f(receiver);
            if let FieldRef::Index { index, .. } = field {
                f(index);
            }
            f(value);
        }
        ExprKind::Call { callee, args, .. } => {
            f(callee);
            args.iter_mut().for_each(|e| f(e));
        }
        ExprKind::MethodCall { receiver, args, .. } => {
            f(receiver);
            args.iter_mut().for_each(|e| f(e));
        }
        ExprKind::RegexMatch { target, pattern, .. } => {
            f(target);
            f(pattern);
        }
        ExprKind::RegexSubst { target, pattern, replacement, .. } => {
            f(target);
            f(pattern);
            f(replacement);
        }
        ExprKind::Ternary { cond, then_expr, else_expr } => {
            f(cond);
            f(then_expr);
            f(else_expr);
        }
        ExprKind::Closure(_) | ExprKind::FunDecl(_) => {}
        ExprKind::Return(value) => f(value),
        ExprKind::Print { value, .. } => f(value),
        ExprKind::Block(_) => {}
    }
}

fn for_each_child_expr_mut_fallible(expr: &mut Expr, ctx: &mut CompileContext, owner: FunHandle) -> bool {
    let mut changed = false;
    match &mut expr.kind {
        ExprKind::ListLiteral(items) => items.iter_mut().for_each(|e| changed |= visit_expr(e, ctx, owner)),
        ExprKind::MapLiteral(entries) => entries.iter_mut().for_each(|(k, v)| {
            changed |= visit_expr(k, ctx, owner);
            changed |= visit_expr(v, ctx, owner);
        }),
        ExprKind::InterpolatedString { parts } => parts.iter_mut().for_each(|e| changed |= visit_expr(e, ctx, owner)),
        ExprKind::Binary { left, right, .. } => {
            changed |= visit_expr(left, ctx, owner);
            changed |= visit_expr(right, ctx, owner);
        }
        ExprKind::FieldAccess { receiver, field } => {
            changed |= visit_expr(receiver, ctx, owner);
            if let FieldRef::Index { index, .. } = field {
                changed |= visit_expr(index, ctx, owner);
            }
        }
        ExprKind::Unary { operand, .. } => changed |= visit_expr(operand, ctx, owner),
        ExprKind::VarAssign { value, .. } => changed |= visit_expr(value, ctx, owner),
        ExprKind::VarOpAssign { value, .. } => changed |= visit_expr(value, ctx, owner),
        ExprKind::FieldAssign { receiver, field, value } => {
            changed |= visit_expr(receiver, ctx, owner);
            if let FieldRef::Index { index, .. } = field {
                changed |= visit_expr(index, ctx, owner);
            }
            changed |= visit_expr(value, ctx, owner);
        }
        ExprKind::FieldOpAssign { receiver, field, value, .. } => {
            changed |= visit_expr(receiver, ctx, owner);
            if let FieldRef::Index { index, .. } = field {
                changed |= visit_expr(index, ctx, owner);
            }
            changed |= visit_expr(value, ctx, owner);
        }
        ExprKind::RegexMatch { target, pattern, .. } => {
            changed |= visit_expr(target, ctx, owner);
            changed |= visit_expr(pattern, ctx, owner);
        }
        ExprKind::RegexSubst { target, pattern, replacement, .. } => {
            changed |= visit_expr(target, ctx, owner);
            changed |= visit_expr(pattern, ctx, owner);
            changed |= visit_expr(replacement, ctx, owner);
        }
        ExprKind::Ternary { cond, then_expr, else_expr } => {
            changed |= visit_expr(cond, ctx, owner);
            changed |= visit_expr(then_expr, ctx, owner);
            changed |= visit_expr(else_expr, ctx, owner);
        }
        ExprKind::Return(value) => changed |= visit_expr(value, ctx, owner),
        ExprKind::Print { value, .. } => changed |= visit_expr(value, ctx, owner),
        ExprKind::Closure(fh) | ExprKind::FunDecl(fh) => {
            // the closure/nested function's own body is visited on its own
            // turn of the outer sweep; nothing to do here.
            let _ = fh;
        }
        _ => {}
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::config::GlobalsTypeMap;
    use crate::parser::Parser;
    use crate::resolver::resolve;

    fn analyze_source(source: &str) -> (CompileContext, Program) {
        let mut ctx = CompileContext::new();
        let program = Parser::parse(source, &mut ctx).unwrap();
        let globals = GlobalsTypeMap::new().with_global("sleep", Type::Function);
        resolve(&program, &mut ctx, &globals, &CompileOptions::new()).unwrap();
        analyze(&mut ctx, &CompileOptions::new());
        (ctx, program)
    }

    #[test]
    fn a_call_to_a_known_sync_function_stays_sync() {
        let (ctx, program) = analyze_source("def f() { return 1 }\nf()\n");
        let StmtKind::Block(stmts) = &ctx.funs.get(program.main).body.kind else { panic!() };
        let StmtKind::FunDecl(f) = &stmts[0].kind else { panic!() };
        assert!(!ctx.funs.get(*f).descriptor.is_async);
    }

    #[test]
    fn forward_reference_between_two_functions_propagates_async() {
        let (ctx, program) = analyze_source(
            "def a() { return b() }\ndef b() { return sleep() }\na()\n",
        );
        let StmtKind::Block(stmts) = &ctx.funs.get(program.main).body.kind else { panic!() };
        let StmtKind::FunDecl(a) = &stmts[0].kind else { panic!() };
        let StmtKind::FunDecl(b) = &stmts[1].kind else { panic!() };
        assert!(ctx.funs.get(*a).descriptor.is_async);
        assert!(ctx.funs.get(*b).descriptor.is_async);
    }

    #[test]
    fn assume_async_marks_everything() {
        let mut ctx = CompileContext::new();
        let program = Parser::parse("def f() { return 1 }\nf()\n", &mut ctx).unwrap();
        resolve(&program, &mut ctx, &GlobalsTypeMap::new(), &CompileOptions::new()).unwrap();
        let options = CompileOptions::new().with_assume_async(true);
        analyze(&mut ctx, &options);
        let StmtKind::Block(stmts) = &ctx.funs.get(program.main).body.kind else { panic!() };
        let StmtKind::FunDecl(f) = &stmts[0].kind else { panic!() };
        assert!(ctx.funs.get(*f).descriptor.is_async);
        assert!(ctx.funs.get(program.main).descriptor.is_async);
    }

    #[test]
    fn a_final_identifier_bound_to_an_async_function_makes_the_call_site_async() {
        let (ctx, program) = analyze_source(
            "def a() { return sleep() }\ndef apply(f) { return f() }\nvar g = a\napply(g)\n",
        );
        let StmtKind::Block(stmts) = &ctx.funs.get(program.main).body.kind else { panic!() };
        let StmtKind::ExprStmt(call) = &stmts[3].kind else { panic!("expected apply(g) call") };
        let ExprKind::Call { is_async, .. } = &call.kind else { panic!("expected a Call") };
        assert!(*is_async, "apply(g) must be async: g is a final binding to an async function");
    }

    #[test]
    fn async_flag_propagates_to_the_synthesized_wrapper() {
        let (ctx, program) = analyze_source("def f() { return sleep() }\nf()\n");
        let StmtKind::Block(stmts) = &ctx.funs.get(program.main).body.kind else { panic!() };
        let StmtKind::FunDecl(f) = &stmts[0].kind else { panic!() };
        let wrapper = ctx.funs.get(*f).wrapper.unwrap();
        assert!(ctx.funs.get(wrapper).descriptor.is_async);
    }
}
