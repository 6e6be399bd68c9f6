//! Jactl compiler library.
//!
//! Front-end and middle-end for a small dynamically-flavored scripting
//! language: tokenising, parsing, semantic resolution, and the async-
//! propagation analysis that tells a back-end where suspension plumbing is
//! required. This crate stops at that contract — it never executes a
//! script itself.
//!
//! # Extending the compiler
//!
//! Host programs supply the set of global names a script may reference
//! (and their static types) via [`GlobalsTypeMap`], and tune the pipeline
//! with [`CompileOptions`]:
//!
//! ```rust,ignore
//! use jactl_compiler::{compile, CompileOptions, GlobalsTypeMap, Type};
//!
//! let globals = GlobalsTypeMap::new().with_global("env", Type::Map);
//! let options = CompileOptions::new().with_min_scale(20);
//! let script = compile("return env.HOME", &globals, &options)?;
//! # Ok::<(), jactl_compiler::diagnostics::CompileError>(())
//! ```

pub mod ast;
pub mod async_analysis;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod lexer;
pub mod location;
pub mod parser;
pub mod resolver;
pub mod token;
pub mod types;

pub use ast::Program;
pub use config::{CompileOptions, GlobalsTypeMap};
pub use context::CompileContext;
pub use diagnostics::{CompileError, CompileResult, InternalError, RuntimeErrorKind, RuntimeErrorSite};
pub use parser::Parser;
pub use types::Type;

use tracing::debug;

use crate::ast::ConstValue;

/// A runtime value crossing the boundary between a compiled [`Script`] and
/// its [`Backend`]. Mirrors [`ConstValue`] for the scalar cases and adds the
/// two reference shapes (`List`/`Map`) a script can produce; `Instance` and
/// `Function` values are a back-end concern (object layout, closures over
/// captured heap locals) this crate does not model.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(ast::Decimal),
    String(String),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl From<ConstValue> for Value {
    fn from(cv: ConstValue) -> Self {
        match cv {
            ConstValue::Null => Value::Null,
            ConstValue::Bool(b) => Value::Bool(b),
            ConstValue::Int(v) => Value::Int(v),
            ConstValue::Long(v) => Value::Long(v),
            ConstValue::Double(v) => Value::Double(v),
            ConstValue::Decimal(d) => Value::Decimal(d),
            ConstValue::String(s) => Value::String(s),
        }
    }
}

/// A failure surfaced by a `Backend` while running a [`Script`] — distinct
/// from [`CompileError`], which can only happen before a `Script` exists.
/// Carries the same [`RuntimeErrorKind`] taxonomy the compiler records as
/// [`RuntimeErrorSite`]s so a host can report a runtime failure against the
/// same vocabulary the compiler used to predict where it could occur.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeFailure {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeFailure {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        RuntimeFailure { kind, message: message.into() }
    }
}

impl std::fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeFailure {}

/// The seam an (out-of-scope) execution engine implements to run a resolved
/// [`Script`]. This crate only specifies the contract: what a `Script`
/// exposes and what it hands the back-end, never an implementation of
/// suspension/resumption itself (§4.9 "the suspend/resume runtime... is an
/// external collaborator").
pub trait Backend {
    fn run(&self, script: &Script, globals: &std::collections::HashMap<String, Value>) -> Result<Value, RuntimeFailure>;
}

/// An immutable, compiled artifact: the resolved, async-analysed
/// [`Program`] plus the [`CompileContext`] that owns its arenas and the
/// [`CompileOptions`] that produced it. `compile()` is the only way to
/// build one; there is no partial `Script` on failure.
pub struct Script {
    ctx: CompileContext,
    program: Program,
    options: CompileOptions,
    source: String,
}

impl Script {
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn ctx(&self) -> &CompileContext {
        &self.ctx
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hands this script to `backend` for execution (§4.9 `Script::run`).
    /// `globals` supplies the actual values for every name `compile()`'s
    /// `GlobalsTypeMap` promised a type for; a host wiring the two up
    /// should only ever populate a `Value` for a name that also appears in
    /// the `GlobalsTypeMap` the script was compiled against.
    pub fn run(
        &self,
        globals: &std::collections::HashMap<String, Value>,
        backend: &dyn Backend,
    ) -> Result<Value, RuntimeFailure> {
        backend.run(self, globals)
    }
}

/// Runs C1 (tokenise, inside [`Parser::parse`]) → C2 (parse) → C4 (resolve)
/// → C5 (async-analyse) over `source` in a fresh [`CompileContext`],
/// returning the first [`CompileError`] encountered or a finished
/// [`Script`]. Every compilation gets its own context (§4.8), so two
/// `compile()` calls on two threads never share mutable state.
pub fn compile(source: &str, globals: &GlobalsTypeMap, options: &CompileOptions) -> CompileResult<Script> {
    let mut ctx = CompileContext::new();

    let program = Parser::parse(source, &mut ctx)?;
    if options.debug_level >= 1 {
        debug!(functions = ctx.funs.len(), "parsed");
    }

    resolver::resolve(&program, &mut ctx, globals, options)?;
    if options.debug_level >= 1 {
        debug!("resolved");
    }
    if options.debug_level >= 2 {
        trace_top_level(&ctx, &program);
    }

    async_analysis::analyze(&mut ctx, options);
    if options.debug_level >= 1 {
        let async_count = ctx.funs.handles().filter(|&h| ctx.funs.get(h).descriptor.is_async).count();
        debug!(async_count, "async-analysed");
    }

    Ok(Script { ctx, program, options: options.clone(), source: source.to_string() })
}

fn trace_top_level(ctx: &CompileContext, program: &Program) {
    if let ast::StmtKind::Block(stmts) | ast::StmtKind::Stmts(stmts) = &ctx.funs.get(program.main).body.kind {
        let kinds: Vec<&'static str> = stmts.iter().map(stmt_kind_name).collect();
        tracing::trace!(?kinds, "resolved top-level statements");
    }
}

fn stmt_kind_name(stmt: &ast::Stmt) -> &'static str {
    match &stmt.kind {
        ast::StmtKind::Stmts(_) => "stmts",
        ast::StmtKind::Block(_) => "block",
        ast::StmtKind::If { .. } => "if",
        ast::StmtKind::While { .. } => "while",
        ast::StmtKind::VarDecl(_) => "var_decl",
        ast::StmtKind::FunDecl(_) => "fun_decl",
        ast::StmtKind::Return(_) => "return",
        ast::StmtKind::ExprStmt(_) => "expr_stmt",
        ast::StmtKind::ThrowError { .. } => "throw_error",
        ast::StmtKind::ClassDecl(_) => "class_decl",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend;
    impl Backend for NullBackend {
        fn run(&self, _script: &Script, _globals: &std::collections::HashMap<String, Value>) -> Result<Value, RuntimeFailure> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn compile_succeeds_on_a_trivial_script() {
        let script = compile("return 1 + 2", &GlobalsTypeMap::new(), &CompileOptions::new()).unwrap();
        assert_eq!(script.program().classes.len(), 0);
    }

    #[test]
    fn compile_surfaces_the_first_compile_error() {
        let err = compile("return y", &GlobalsTypeMap::new(), &CompileOptions::new()).unwrap_err();
        assert!(err.message.contains("undeclared"));
    }

    #[test]
    fn a_script_can_be_handed_to_a_backend() {
        let script = compile("return 1", &GlobalsTypeMap::new(), &CompileOptions::new()).unwrap();
        let globals = std::collections::HashMap::new();
        let result = script.run(&globals, &NullBackend);
        assert_eq!(result, Ok(Value::Null));
    }

    #[test]
    fn debug_level_two_does_not_panic_while_tracing() {
        let options = CompileOptions::new().with_debug_level(2);
        compile("var x = 1\nreturn x", &GlobalsTypeMap::new(), &options).unwrap();
    }
}
