//! Per-compilation context (§4.8, design note "Cyclic captures" / "Global
//! mutable state").
//!
//! `VarDecl` and `FunDecl` are mutually referential (a function's captures
//! point at outer VarDecls; a VarDecl can be bound to a FunDecl). Rather
//! than `Rc<RefCell<_>>` cycles, both live in arenas owned by a
//! `CompileContext` and are referred to elsewhere by stable, `Copy` handles.
//! AST nodes hold handles, never owning references.

use std::collections::HashMap;

use crate::ast::{ClassDescriptor, FunDecl, VarDecl};

macro_rules! handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle!(VarHandle);
handle!(FunHandle);
handle!(ClassHandle);

#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<ClassDescriptor>,
    by_name: HashMap<String, ClassHandle>,
}

impl ClassRegistry {
    pub fn insert(&mut self, descriptor: ClassDescriptor) -> ClassHandle {
        let handle = ClassHandle(self.classes.len() as u32);
        self.by_name.insert(descriptor.fully_qualified_name(), handle);
        self.classes.push(descriptor);
        handle
    }

    pub fn get(&self, handle: ClassHandle) -> &ClassDescriptor {
        &self.classes[handle.0 as usize]
    }

    pub fn get_mut(&mut self, handle: ClassHandle) -> &mut ClassDescriptor {
        &mut self.classes[handle.0 as usize]
    }

    pub fn lookup(&self, fully_qualified_name: &str) -> Option<ClassHandle> {
        self.by_name.get(fully_qualified_name).copied()
    }

    /// `instance<T>` compatibility (§4.3): `src` is the same class as `dst`
    /// or inherits from it, transitively.
    pub fn is_subclass_of(&self, src: ClassHandle, dst: ClassHandle) -> bool {
        let mut current = Some(src);
        while let Some(handle) = current {
            if handle == dst {
                return true;
            }
            current = self.get(handle).super_class;
        }
        false
    }

    /// Finds `name` among `handle`'s methods, then its superclass's, and so
    /// on up the chain. Shared by the resolver's bare-identifier-as-method
    /// fallback and the async analyser's static-callee identification.
    pub fn find_method(&self, handle: ClassHandle, name: &str, funs: &FunArena) -> Option<FunHandle> {
        let mut current = Some(handle);
        while let Some(c) = current {
            let descriptor = self.get(c);
            if let Some(&m) = descriptor
                .methods
                .iter()
                .find(|&&m| funs.get(m).name.as_deref() == Some(name))
            {
                return Some(m);
            }
            current = descriptor.super_class;
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct VarArena {
    decls: Vec<VarDecl>,
}

impl VarArena {
    pub fn insert(&mut self, decl: VarDecl) -> VarHandle {
        let handle = VarHandle(self.decls.len() as u32);
        self.decls.push(decl);
        handle
    }

    pub fn get(&self, handle: VarHandle) -> &VarDecl {
        &self.decls[handle.0 as usize]
    }

    pub fn get_mut(&mut self, handle: VarHandle) -> &mut VarDecl {
        &mut self.decls[handle.0 as usize]
    }
}

#[derive(Debug, Default)]
pub struct FunArena {
    decls: Vec<FunDecl>,
}

impl FunArena {
    pub fn insert(&mut self, decl: FunDecl) -> FunHandle {
        let handle = FunHandle(self.decls.len() as u32);
        self.decls.push(decl);
        handle
    }

    pub fn get(&self, handle: FunHandle) -> &FunDecl {
        &self.decls[handle.0 as usize]
    }

    pub fn get_mut(&mut self, handle: FunHandle) -> &mut FunDecl {
        &mut self.decls[handle.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = FunHandle> {
        (0..self.decls.len() as u32).map(FunHandle)
    }
}

/// Owns every arena for one compilation, plus the anonymous-script-name
/// counter. Never shared mutably across compilations — `compile()`
/// constructs a fresh one per call, which is the whole of the concurrency
/// story (§5): two compilations on two threads simply own two contexts.
#[derive(Debug, Default)]
pub struct CompileContext {
    pub vars: VarArena,
    pub funs: FunArena,
    pub classes: ClassRegistry,
    anonymous_script_counter: u32,
}

impl CompileContext {
    pub fn new() -> Self {
        CompileContext::default()
    }

    /// Names the next anonymous script class, e.g. for REPL-compiled
    /// fragments that have no user-given name.
    pub fn next_anonymous_script_name(&mut self) -> String {
        let n = self.anonymous_script_counter;
        self.anonymous_script_counter += 1;
        format!("Script${n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_script_names_are_distinct_and_ordered() {
        let mut ctx = CompileContext::new();
        assert_eq!(ctx.next_anonymous_script_name(), "Script$0");
        assert_eq!(ctx.next_anonymous_script_name(), "Script$1");
    }

    #[test]
    fn subclass_check_walks_the_super_chain() {
        let mut classes = ClassRegistry::default();
        let base = classes.insert(ClassDescriptor::new("Base", ""));
        let mut mid = ClassDescriptor::new("Mid", "");
        mid.super_class = Some(base);
        let mid = classes.insert(mid);
        let mut leaf = ClassDescriptor::new("Leaf", "");
        leaf.super_class = Some(mid);
        let leaf = classes.insert(leaf);

        assert!(classes.is_subclass_of(leaf, base));
        assert!(classes.is_subclass_of(leaf, mid));
        assert!(!classes.is_subclass_of(base, leaf));
    }
}
