//! Activity type descriptors and the precomputed type-hierarchy table
//!
//! Constraints are registered against activity types, either closed
//! (`Sequence`, `Literal<Int32>`) or open generic (`Literal<>`). Every
//! descriptor carries its dispatch chain, computed once at registration:
//! the type itself, its open-generic definition when it is a closed
//! instantiation, then the same pair for each base type up to `Activity`.
//! Constraint lookup is a scan over that chain.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::ArgumentError;

/// Names of the activity types registered by [`TypeRegistry::with_builtins`]
pub mod builtin {
    /// Root of every activity hierarchy
    pub const ACTIVITY: &str = "Activity";
    /// Activities with custom execution logic
    pub const NATIVE_ACTIVITY: &str = "NativeActivity";
    /// Synchronous, non-idling activities
    pub const CODE_ACTIVITY: &str = "CodeActivity";
    /// Runs children one after the other
    pub const SEQUENCE: &str = "Sequence";
    /// Runs children as independent branches
    pub const PARALLEL: &str = "Parallel";
    /// Appends a line to the instance output
    pub const WRITE_LINE: &str = "WriteLine";
    /// Timer based wait
    pub const DELAY: &str = "Delay";
    /// Suspends on a named bookmark
    pub const WAIT_FOR_BOOKMARK: &str = "WaitForBookmark";
    /// Faults the instance
    pub const THROW: &str = "Throw";
    /// Constraint body that reports a violation
    pub const ADD_VALIDATION_ERROR: &str = "AddValidationError";
    /// Constraint body that reports a violation when an assertion fails
    pub const ASSERT_VALIDATION: &str = "AssertValidation";
    /// Open generic for activities producing a value
    pub const CODE_ACTIVITY_OF: &str = "CodeActivity";
    /// Open generic for constant expressions
    pub const LITERAL: &str = "Literal";
    /// Open generic for variable reads
    pub const VARIABLE_VALUE: &str = "VariableValue";
}

/// Stable handle to a registered type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey(pub(crate) u32);

impl TypeKey {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Registered activity type
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    /// Display name (`Sequence`, `Literal<>`, `Literal<Int32>`)
    pub name: String,
    /// Declared base type
    pub base: Option<TypeKey>,
    /// Open-generic definition this type instantiates
    pub generic_definition: Option<TypeKey>,
    /// Type arguments of a closed instantiation
    pub type_arguments: Vec<String>,
    /// Whether this descriptor is an open-generic definition
    pub is_open_generic: bool,
    lookup_chain: Vec<TypeKey>,
}

impl TypeDescriptor {
    /// Keys to probe when dispatching constraints for this type
    pub fn lookup_chain(&self) -> &[TypeKey] {
        &self.lookup_chain
    }
}

/// Process-wide table of activity types
///
/// Built explicitly and shared behind an `Arc` by every tree that uses it;
/// there is no ambient global registry.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    descriptors: Vec<TypeDescriptor>,
    by_name: HashMap<String, TypeKey>,
}

impl TypeRegistry {
    /// Create a registry containing only the `Activity` root type
    pub fn new() -> Self {
        let mut registry = Self {
            descriptors: Vec::new(),
            by_name: HashMap::new(),
        };
        registry.insert(builtin::ACTIVITY.to_string(), None, None, Vec::new(), false);
        registry
    }

    /// Create a registry with the built-in activity library
    pub fn with_builtins() -> Self {
        use builtin::*;

        let mut registry = Self::new();
        let root = registry.root();
        // Names are unique in a fresh registry, so registration cannot fail.
        let native = registry.insert(NATIVE_ACTIVITY.into(), Some(root), None, Vec::new(), false);
        let code = registry.insert(CODE_ACTIVITY.into(), Some(root), None, Vec::new(), false);
        for name in [SEQUENCE, PARALLEL, DELAY, WAIT_FOR_BOOKMARK] {
            registry.insert(name.into(), Some(native), None, Vec::new(), false);
        }
        for name in [ADD_VALIDATION_ERROR, ASSERT_VALIDATION] {
            registry.insert(name.into(), Some(native), None, Vec::new(), false);
        }
        for name in [WRITE_LINE, THROW] {
            registry.insert(name.into(), Some(code), None, Vec::new(), false);
        }

        let code_of = registry.insert(format!("{CODE_ACTIVITY_OF}<>"), Some(root), None, Vec::new(), true);
        registry.insert(format!("{LITERAL}<>"), Some(code_of), None, Vec::new(), true);
        registry.insert(format!("{VARIABLE_VALUE}<>"), Some(code_of), None, Vec::new(), true);
        registry
    }

    /// The `Activity` root type
    pub fn root(&self) -> TypeKey {
        TypeKey(0)
    }

    /// Register a closed (non-generic) type deriving from `base`
    pub fn register(&mut self, name: &str, base: TypeKey) -> Result<TypeKey, ArgumentError> {
        self.check_new_name(name)?;
        let base = self.check_closed_base(base)?;
        Ok(self.insert(name.to_string(), Some(base), None, Vec::new(), false))
    }

    /// Register an open-generic definition, named `name<>`
    ///
    /// `base` may itself be an open generic; instantiations then derive from
    /// the matching instantiation of the base.
    pub fn register_generic_definition(
        &mut self,
        name: &str,
        base: TypeKey,
    ) -> Result<TypeKey, ArgumentError> {
        let full = format!("{name}<>");
        self.check_new_name(&full)?;
        self.check_key(base)?;
        Ok(self.insert(full, Some(base), None, Vec::new(), true))
    }

    /// Closed instantiation of an open-generic definition
    ///
    /// Instantiating the same definition with the same arguments twice
    /// returns the same key.
    pub fn instantiate(
        &mut self,
        definition: TypeKey,
        type_arguments: &[&str],
    ) -> Result<TypeKey, ArgumentError> {
        self.check_key(definition)?;
        let descriptor = &self.descriptors[definition.index()];
        if !descriptor.is_open_generic {
            return Err(ArgumentError::new(
                "definition",
                format!("'{}' is not an open generic type", descriptor.name),
            ));
        }
        if type_arguments.is_empty() {
            return Err(ArgumentError::new(
                "type_arguments",
                "a generic instantiation needs at least one type argument",
            ));
        }

        let stem = descriptor.name.trim_end_matches("<>").to_string();
        let declared_base = descriptor.base;
        let name = format!("{}<{}>", stem, type_arguments.join(", "));
        if let Some(existing) = self.by_name.get(&name) {
            return Ok(*existing);
        }

        let base = match declared_base {
            Some(base) if self.descriptors[base.index()].is_open_generic => {
                Some(self.instantiate(base, type_arguments)?)
            }
            other => other,
        };
        Ok(self.insert(
            name,
            base,
            Some(definition),
            type_arguments.iter().map(|arg| arg.to_string()).collect(),
            false,
        ))
    }

    /// Look up a type by name
    pub fn key(&self, name: &str) -> Option<TypeKey> {
        self.by_name.get(name).copied()
    }

    /// Descriptor for a key
    pub fn descriptor(&self, key: TypeKey) -> &TypeDescriptor {
        &self.descriptors[key.index()]
    }

    /// Display name for a key
    pub fn name(&self, key: TypeKey) -> &str {
        &self.descriptors[key.index()].name
    }

    /// Dispatch chain for a key (see module docs)
    pub fn lookup_chain(&self, key: TypeKey) -> &[TypeKey] {
        self.descriptors[key.index()].lookup_chain()
    }

    /// Whether `key` is `target`, derives from it, or instantiates it
    pub fn is_assignable_to(&self, key: TypeKey, target: TypeKey) -> bool {
        self.lookup_chain(key).contains(&target)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry is empty (never true: `Activity` is always present)
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    fn insert(
        &mut self,
        name: String,
        base: Option<TypeKey>,
        generic_definition: Option<TypeKey>,
        type_arguments: Vec<String>,
        is_open_generic: bool,
    ) -> TypeKey {
        let key = TypeKey(self.descriptors.len() as u32);

        let mut lookup_chain = vec![key];
        if let Some(definition) = generic_definition {
            lookup_chain.push(definition);
        }
        if let Some(base) = base {
            lookup_chain.extend_from_slice(self.descriptors[base.index()].lookup_chain());
        }

        self.by_name.insert(name.clone(), key);
        self.descriptors.push(TypeDescriptor {
            name,
            base,
            generic_definition,
            type_arguments,
            is_open_generic,
            lookup_chain,
        });
        key
    }

    fn check_new_name(&self, name: &str) -> Result<(), ArgumentError> {
        if name.is_empty() {
            return Err(ArgumentError::new("name", "type name must not be empty"));
        }
        if self.by_name.contains_key(name) {
            return Err(ArgumentError::new(
                "name",
                format!("type '{name}' is already registered"),
            ));
        }
        Ok(())
    }

    fn check_key(&self, key: TypeKey) -> Result<(), ArgumentError> {
        if key.index() >= self.descriptors.len() {
            return Err(ArgumentError::new("key", format!("unknown type key {}", key.0)));
        }
        Ok(())
    }

    fn check_closed_base(&self, base: TypeKey) -> Result<TypeKey, ArgumentError> {
        self.check_key(base)?;
        if self.descriptors[base.index()].is_open_generic {
            return Err(ArgumentError::new(
                "base",
                format!(
                    "'{}' is an open generic; instantiate it before deriving from it",
                    self.name(base)
                ),
            ));
        }
        Ok(base)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
