//! The typed AST shared by every pass (§3 "AST nodes", §4.6).
//!
//! Two disjoint sum types, `Expr`/`Stmt`, each a small metadata struct
//! wrapping a `*Kind` enum — a tagged union with pattern-match dispatch
//! rather than a double-dispatch visitor interface. `VarDecl`/`FunDecl`/
//! `ClassDescriptor` are *not* part of the tree; they live in the arenas
//! of [`crate::context::CompileContext`] and are referred to by handle
//! (`VarHandle`/`FunHandle`/`ClassHandle`), which is how the VarDecl↔FunDecl
//! cycle is represented without `Rc`.

use indexmap::IndexMap;

use crate::context::{ClassHandle, FunHandle, VarHandle};
use crate::location::Location;
use crate::types::{BinaryOp, Type};

/// A fixed-point decimal: `unscaled * 10^-scale`. Jactl's `Decimal` type is
/// the top of the numeric tower; this crate only needs enough of it to
/// const-fold literals and respect `CompileOptions.min_scale` (§4.4), not a
/// full arbitrary-precision arithmetic library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    pub unscaled: i128,
    pub scale: u32,
}

impl Decimal {
    pub fn new(unscaled: i128, scale: u32) -> Self {
        Decimal { unscaled, scale }
    }

    fn rescale(self, scale: u32) -> Decimal {
        if scale >= self.scale {
            Decimal::new(self.unscaled * 10i128.pow(scale - self.scale), scale)
        } else {
            Decimal::new(self.unscaled / 10i128.pow(self.scale - scale), scale)
        }
    }

    pub fn add(self, other: Decimal, min_scale: u32) -> Decimal {
        let scale = self.scale.max(other.scale).max(min_scale);
        let a = self.rescale(scale);
        let b = other.rescale(scale);
        Decimal::new(a.unscaled + b.unscaled, scale)
    }

    pub fn sub(self, other: Decimal, min_scale: u32) -> Decimal {
        self.add(Decimal::new(-other.unscaled, other.scale), min_scale)
    }

    pub fn mul(self, other: Decimal, min_scale: u32) -> Decimal {
        let scale = (self.scale + other.scale).max(min_scale);
        let unscaled = self.unscaled * other.unscaled;
        Decimal::new(unscaled, self.scale + other.scale).rescale(scale)
    }

    /// Returns `None` on division by zero — callers turn that into a
    /// compile error (constant operands) or a `RuntimeErrorSite` (not).
    pub fn div(self, other: Decimal, min_scale: u32) -> Option<Decimal> {
        if other.unscaled == 0 {
            return None;
        }
        let scale = self.scale.max(other.scale).max(min_scale);
        let numerator = self.rescale(scale + other.scale).unscaled;
        Some(Decimal::new(numerator / other.unscaled, scale))
    }

    pub fn is_zero(self) -> bool {
        self.unscaled == 0
    }
}

/// A literal value cached by constant folding, or produced directly by a
/// `Literal` expression. Mirrors the token literal kinds (§3 "Token").
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Decimal),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

/// Identifies the `while` a `break`/`continue` targets (§4.2/§4.4). Assigned
/// by the parser as each `while` is opened; break/continue nodes start with
/// `target: None` and the resolver fills it in from its own loop stack,
/// mirroring the VarDecl lifecycle ("created by Parser, populated by
/// Resolver") for this one other forward-reference-free binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WhileId(pub u32);

/// The receiver-side target of a field access/assignment: `.name`, `?.name`
/// (null-safe), `[expr]`, or `?[expr]` (null-safe index).
#[derive(Debug, Clone)]
pub enum FieldRef {
    Dot { name: String, null_safe: bool },
    Index { index: Box<Expr>, null_safe: bool },
}

/// Shared metadata plus the expression-specific payload. Type, const-flag,
/// and const-value start at their "not yet known" defaults and are filled
/// in by the Resolver in the documented order: type before const-fold
/// before async (design note, §9).
#[derive(Debug, Clone)]
pub struct Expr {
    pub location: Location,
    pub ty: Type,
    pub is_const: bool,
    pub const_value: Option<ConstValue>,
    pub is_result_used: bool,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(kind: ExprKind, location: Location) -> Self {
        Expr {
            location,
            ty: Type::Unknown,
            is_const: false,
            const_value: None,
            is_result_used: true,
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(ConstValue),
    ListLiteral(Vec<Expr>),
    MapLiteral(Vec<(Expr, Expr)>),
    /// Unresolved until the Resolver fills `var`; `None` after parse, `Some`
    /// after resolution (invariant 3, §8).
    Identifier { name: String, var: Option<VarHandle> },
    /// `parts` alternates (conceptually) between literal string segments and
    /// embedded expressions; both are represented as `Expr` so a plain
    /// `STRING_CONST` segment is just `Literal(ConstValue::String(..))`.
    InterpolatedString { parts: Vec<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    /// A read through `.`/`?.`/`[`/`?[` (§4.3 "indexing"); the assignment
    /// forms (`FieldAssign`/`FieldOpAssign`) carry their own `FieldRef`.
    FieldAccess { receiver: Box<Expr>, field: FieldRef },
    Unary { op: UnaryOp, operand: Box<Expr>, postfix: bool },
    /// Expression-form `var` (e.g. as the condition of a `while`).
    VarDeclExpr(VarHandle),
    VarAssign {
        name: String,
        var: Option<VarHandle>,
        value: Box<Expr>,
        /// `?=`: assignability is checked as for `=`, but the expression's
        /// type is `boxed(lhs)` because a caught `NullError` on the right
        /// yields null instead of propagating (§4.4).
        null_safe: bool,
    },
    /// `x op= y`, including the `++`/`--` rewritten forms. `op` is `None`
    /// for a rewritten `++`/`--` pair represented structurally via
    /// `is_pre_inc_or_dec` over `Binary(Add/Sub, Noop, 1)`.
    VarOpAssign {
        name: String,
        var: Option<VarHandle>,
        op: BinaryOp,
        /// The right-hand side; for `++`/`--` this is `Literal(Int(1))` and
        /// `op` is `Add`/`Sub`.
        value: Box<Expr>,
        /// Post-forms capture the pre-value into a synthesised temporary;
        /// pre-forms evaluate the post-increment value (§4.2).
        is_pre_inc_or_dec: bool,
    },
    FieldAssign { receiver: Box<Expr>, field: FieldRef, value: Box<Expr> },
    FieldOpAssign {
        receiver: Box<Expr>,
        field: FieldRef,
        op: BinaryOp,
        value: Box<Expr>,
        is_pre_inc_or_dec: bool,
    },
    /// A `Noop` placeholder embedded as the left operand of the `op=`
    /// rewrite's internal binary; the Resolver assigns its type from the
    /// already-resolved target, the back-end materialises it from the
    /// already-computed target value (§4.2).
    Noop,
    Call { callee: Box<Expr>, args: Vec<Expr>, is_async: bool },
    MethodCall {
        receiver: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        null_safe: bool,
        is_async: bool,
    },
    RegexMatch { target: Box<Expr>, pattern: Box<Expr>, negated: bool },
    RegexSubst {
        target: Box<Expr>,
        pattern: Box<Expr>,
        replacement: Box<Expr>,
        global: bool,
    },
    Ternary { cond: Box<Expr>, then_expr: Box<Expr>, else_expr: Box<Expr> },
    Closure(FunHandle),
    FunDecl(FunHandle),
    Return(Box<Expr>),
    Break(Option<WhileId>),
    Continue(Option<WhileId>),
    Print { value: Box<Expr>, newline: bool },
    Block(Box<Stmt>),
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub location: Location,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(kind: StmtKind, location: Location) -> Self {
        Stmt { location, kind }
    }
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Stmts(Vec<Stmt>),
    Block(Vec<Stmt>),
    If { cond: Expr, then_branch: Box<Stmt>, else_branch: Option<Box<Stmt>> },
    While { id: WhileId, cond: Expr, body: Box<Stmt> },
    VarDecl(VarHandle),
    FunDecl(FunHandle),
    Return(Expr),
    ExprStmt(Expr),
    ThrowError { message: Expr },
    ClassDecl(ClassHandle),
}

/// A resolved symbol (§3 "VarDecl"). Lives in [`crate::context::VarArena`];
/// `initializer` is the single source of truth for the declaration's
/// right-hand side (both `Expr::VarDeclExpr` and `StmtKind::VarDecl` just
/// reference the handle).
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    pub name_location: Location,
    pub declared_type: Type,
    /// Starts equal to `declared_type`; for `var` (`declared_type ==
    /// Type::Unknown`) the Resolver fills this in from the initializer.
    pub ty: Type,
    pub owner: Option<FunHandle>,
    pub initializer: Option<Expr>,
    pub is_global: bool,
    pub is_heap_local: bool,
    pub is_passed_as_heap_local: bool,
    pub is_param: bool,
    pub is_final: bool,
    pub nesting_level: u32,
    /// Set when this symbol names a function rather than data (so a call
    /// through it can be resolved statically by the async analyser).
    pub fun_binding: Option<FunHandle>,
    /// For a heap-local wrapper parameter, the VarDecl one level up the
    /// capture chain that it forwards to.
    pub parent: Option<VarHandle>,
    /// The original (non-wrapper) declaration, if this is itself a
    /// wrapper-promoted copy.
    pub original: Option<VarHandle>,
    write_count: u32,
}

impl VarDecl {
    pub fn new(name: impl Into<String>, name_location: Location, declared_type: Type) -> Self {
        let ty = declared_type.clone();
        VarDecl {
            name: name.into(),
            name_location,
            declared_type,
            ty,
            owner: None,
            initializer: None,
            is_global: false,
            is_heap_local: false,
            is_passed_as_heap_local: false,
            is_param: false,
            is_final: true,
            nesting_level: 1,
            fun_binding: None,
            parent: None,
            original: None,
            write_count: 0,
        }
    }

    /// Called by the Resolver at every write site (the initializer does not
    /// count separately — it is recorded once up front). `is_final` becomes
    /// false as soon as a second write is observed (§4.4 "Final-variable
    /// detection").
    pub fn record_write(&mut self) {
        self.write_count += 1;
        if self.write_count > 1 {
            self.is_final = false;
        }
    }

    pub fn record_initializer_write(&mut self) {
        self.write_count = 1;
    }
}

/// Compile-time metadata about a function's signature and async behaviour
/// (§5 glossary). `async_args` positions: 0 = method-call receiver, 1..N =
/// ordinary arguments (§4.5).
#[derive(Debug, Clone, Default)]
pub struct FunctionDescriptor {
    pub arity: usize,
    pub mandatory_count: usize,
    pub is_async: bool,
    pub async_args: Vec<usize>,
    pub method_name: Option<String>,
}

impl FunctionDescriptor {
    pub fn new(arity: usize, mandatory_count: usize) -> Self {
        FunctionDescriptor {
            arity,
            mandatory_count,
            is_async: false,
            async_args: Vec::new(),
            method_name: None,
        }
    }
}

/// §3 "FunDecl". Every `FunDecl` other than the script main has a
/// `wrapper` (invariant); the wrapper is itself a plain `FunDecl` that
/// delegates to `self`, per the "floating source-language parameter
/// binding" design note — no bytecode method-handle plumbing lives here.
#[derive(Debug, Clone)]
pub struct FunDecl {
    pub name: Option<String>,
    pub start: Location,
    pub declared_return_type: Option<Type>,
    pub return_type: Type,
    pub params: Vec<VarHandle>,
    pub body: Stmt,
    pub descriptor: FunctionDescriptor,
    pub wrapper: Option<FunHandle>,
    /// Ordered name→VarDecl table of outer symbols this function (or a
    /// function nested within it) captures. Order matters: it fixes the
    /// wrapper's extra parameter list (§3 "FunDecl" invariant).
    pub captures: IndexMap<String, VarHandle>,
    pub nesting_level: u32,
    pub earliest_forward_ref: Option<Location>,
    pub is_script_main: bool,
    pub is_static: bool,
    pub owner_class: Option<ClassHandle>,
}

impl FunDecl {
    pub fn new(name: Option<String>, start: Location, body: Stmt) -> Self {
        FunDecl {
            name,
            start,
            declared_return_type: None,
            return_type: Type::Unknown,
            params: Vec::new(),
            body,
            descriptor: FunctionDescriptor::new(0, 0),
            wrapper: None,
            captures: IndexMap::new(),
            nesting_level: 1,
            earliest_forward_ref: None,
            is_script_main: false,
            is_static: false,
            owner_class: None,
        }
    }
}

/// §3 "ClassDescriptor".
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub name: String,
    pub package: String,
    pub fields: Vec<(String, Type)>,
    pub methods: Vec<FunHandle>,
    pub super_class: Option<ClassHandle>,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>, package: impl Into<String>) -> Self {
        ClassDescriptor {
            name: name.into(),
            package: package.into(),
            fields: Vec::new(),
            methods: Vec::new(),
            super_class: None,
        }
    }

    pub fn fully_qualified_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }

    pub fn field_type(&self, name: &str) -> Option<&Type> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }
}

/// The root of a compiled unit: a single implicit script-main function
/// (`is_script_main`) whose body is the top-level statement sequence, plus
/// any top-level class declarations. Multi-file module resolution is out
/// of scope, so a `Program` is always exactly one source's worth of tree.
#[derive(Debug, Clone)]
pub struct Program {
    pub main: FunHandle,
    pub classes: Vec<ClassHandle>,
}
