//! Error taxonomy (§7): compile errors, internal errors, and the
//! descriptive runtime-error sites the compiler hands off to the back-end.
//!
//! Every fallible function returns a plain `Result<T, E>` with a small
//! hand-rolled error type rather than reaching for `thiserror`/`anyhow`;
//! the error carries a real [`Location`] instead of a bare `String`, since
//! a compiler's whole job is to report *where*.

use std::fmt;

use crate::location::{caret_excerpt, line_col, Location};

/// A deterministic, locatable failure during tokenising, parsing, or
/// resolution. Aborts the current compilation; no partial artifact is
/// produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    pub location: Location,
}

impl CompileError {
    pub fn new(message: impl Into<String>, location: Location) -> Self {
        CompileError {
            message: message.into(),
            location,
        }
    }

    /// Renders `source`, `line:column`, the offending line, and a caret
    /// under the location's start column.
    pub fn render(&self, source: &str) -> String {
        let lc = line_col(source, self.location.offset);
        format!(
            "{}: {}\n{}",
            lc,
            self.message,
            caret_excerpt(source, self.location)
        )
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// An invariant violation reachable only by a compiler bug, never by valid
/// (or even invalid-but-well-formed) source. Always fatal; never caught and
/// converted into a `CompileError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalError {
    pub message: String,
}

impl InternalError {
    pub fn new(message: impl Into<String>) -> Self {
        InternalError {
            message: format!("Internal error: {}", message.into()),
        }
    }
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for InternalError {}

/// The kind of failure contract a [`RuntimeErrorSite`] documents. The
/// compiler never raises these itself — it only records where the back-end
/// must check for them so that a failure at runtime can be reported against
/// the user's source location rather than the generated program's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    NullDereference,
    DivideByZero,
    CastFailure,
    RegexFailure,
    NegativeRepeatCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeErrorSite {
    pub kind: RuntimeErrorKind,
    pub location: Location,
}

impl RuntimeErrorSite {
    pub fn new(kind: RuntimeErrorKind, location: Location) -> Self {
        RuntimeErrorSite { kind, location }
    }
}

/// A pass-level result: every fallible pass (tokenise, parse, resolve)
/// returns this rather than panicking or using `unwrap`.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_points_a_caret_at_the_location() {
        let source = "var x = 1 / 0";
        let err = CompileError::new("divide by zero", Location::new(10, 1));
        let rendered = err.render(source);
        assert!(rendered.contains("var x = 1 / 0"));
        assert!(rendered.contains('^'));
        assert!(rendered.contains("divide by zero"));
    }

    #[test]
    fn internal_error_always_carries_the_prefix() {
        let err = InternalError::new("identifier with no VarDecl");
        assert!(err.message.starts_with("Internal error: "));
    }
}
