//! Compiler configuration and the globals-type-map parameter `compile()`
//! takes (§4.8/§6, C8/C9; ambient "Configuration" addition, §10).
//!
//! A `#[derive(Debug, Clone)]` struct with `with_*` builder methods that
//! consume and return `Self`, rather than a setter-mutates-in-place API.

use std::collections::HashMap;

use crate::types::Type;

/// The host-supplied mapping of global name to its static type (§6 "globals
/// is a string→value mapping containing initial values for every name that
/// the script references as a global"). The Resolver consults only the
/// *type* half at compile time; actual values are a `Script::run` concern.
#[derive(Debug, Clone, Default)]
pub struct GlobalsTypeMap {
    types: HashMap<String, Type>,
}

impl GlobalsTypeMap {
    pub fn new() -> Self {
        GlobalsTypeMap::default()
    }

    pub fn with_global(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.types.insert(name.into(), ty);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, ty: Type) {
        self.types.insert(name.into(), ty);
    }

    pub fn get(&self, name: &str) -> Option<&Type> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }
}

/// Compile-time options (§6 "Options"). `min_scale` defaults to 10 and
/// `debug_level` to 0.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Enables top-level re-binding and globals-backed locals (§4.4 "REPL
    /// mode").
    pub repl_mode: bool,
    /// 0 = silent, >0 = emit `tracing` spans/events at pass boundaries
    /// (§7 "Logging"); >=2 additionally traces the resolved AST's top-level
    /// statement kinds.
    pub debug_level: u8,
    /// Minimum decimal scale for `Decimal` arithmetic (§4.4).
    pub min_scale: u32,
    /// Fold constant expressions during resolution (§4.4(b)).
    pub evaluate_const_exprs: bool,
    /// Wrap the script in an implicit printing read-loop.
    pub print_loop: bool,
    /// Wrap the script in an implicit non-printing read-loop.
    pub non_print_loop: bool,
    /// Testing hook (§4.5 "Testing hook"): every call-site and user
    /// function is unconditionally flagged async.
    pub assume_async: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            repl_mode: false,
            debug_level: 0,
            min_scale: 10,
            evaluate_const_exprs: true,
            print_loop: false,
            non_print_loop: false,
            assume_async: false,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        CompileOptions::default()
    }

    pub fn with_repl_mode(mut self, repl_mode: bool) -> Self {
        self.repl_mode = repl_mode;
        self
    }

    pub fn with_debug_level(mut self, level: u8) -> Self {
        self.debug_level = level;
        self
    }

    pub fn with_min_scale(mut self, scale: u32) -> Self {
        self.min_scale = scale;
        self
    }

    pub fn with_evaluate_const_exprs(mut self, evaluate: bool) -> Self {
        self.evaluate_const_exprs = evaluate;
        self
    }

    pub fn with_print_loop(mut self, print_loop: bool) -> Self {
        self.print_loop = print_loop;
        self.non_print_loop = self.non_print_loop && !print_loop;
        self
    }

    pub fn with_non_print_loop(mut self, non_print_loop: bool) -> Self {
        self.non_print_loop = non_print_loop;
        self.print_loop = self.print_loop && !non_print_loop;
        self
    }

    pub fn with_assume_async(mut self, assume_async: bool) -> Self {
        self.assume_async = assume_async;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let opts = CompileOptions::new();
        assert_eq!(opts.min_scale, 10);
        assert_eq!(opts.debug_level, 0);
        assert!(!opts.repl_mode);
    }

    #[test]
    fn print_loop_and_non_print_loop_are_mutually_exclusive() {
        let opts = CompileOptions::new().with_print_loop(true).with_non_print_loop(true);
        assert!(opts.non_print_loop);
        assert!(!opts.print_loop);
    }

    #[test]
    fn globals_type_map_round_trips() {
        let globals = GlobalsTypeMap::new().with_global("x", Type::INT);
        assert_eq!(globals.get("x"), Some(&Type::INT));
        assert!(globals.contains("x"));
        assert!(!globals.contains("y"));
    }
}
