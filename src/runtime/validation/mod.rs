//! Activity tree validation
//!
//! [`validate`] runs the structural caching pass over a tree and, for every
//! node the pass reaches, dispatches the constraints that apply to it:
//! constraints declared on the activity itself and additional constraints
//! registered by type in [`ValidationSettings`]. Additional constraints are
//! matched along the type's precomputed lookup chain, so a constraint on a
//! base type or on an open generic applies to every derived type and closed
//! instantiation.

pub mod constraint;
pub mod context;
pub mod dispatch;
pub mod report;
pub mod violation;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use constraint::{Constraint, ConstraintFault, FaultKind, is_fatal};
pub use context::ValidationContext;
pub use report::{EXCEPTION_STRING_MAX_LENGTH, ExceptionReason, generate_exception_string, validate_root_inputs};
pub use violation::{ErrorSource, ValidationError, ValidationResults, ViolationList};

use super::activity::{ActivityRef, ActivityTree, NodeIndex};
use super::error::{ArgumentError, Result};
use super::metadata::{ActivityCallStack, CachingMode, CachingOptions, ChildActivity, MetadataCache};
use super::types::TypeKey;
use dispatch::{attribute, run_constraints};

/// Cooperative cancellation flag, checked by the caching pass between nodes
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Token that has not fired
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the token has fired
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Names of the variables in scope for the tree being validated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEnvironment {
    names: BTreeSet<String>,
}

impl LocationEnvironment {
    /// Empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable
    pub fn declare(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    /// Whether a variable is declared
    pub fn is_declared(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Declared names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Options for one validation pass
#[derive(Debug, Clone, Default)]
pub struct ValidationSettings {
    /// Validate only the root, not its descendants
    pub single_level: bool,
    /// Skip the root's own configuration checks (build-time validation)
    pub skip_validating_root_configuration: bool,
    /// Report only errors from additional constraints
    pub only_use_additional_constraints: bool,
    /// Commit the computed metadata onto the tree
    pub prepare_for_runtime: bool,
    /// Constraints registered by target type
    pub additional_constraints: HashMap<TypeKey, Vec<Constraint>>,
    /// Variables in scope
    pub environment: LocationEnvironment,
    /// Observed by the caching pass between nodes
    pub cancellation: Option<CancellationToken>,
}

impl ValidationSettings {
    /// Register an additional constraint for a type (closed or open generic)
    pub fn add_constraint(&mut self, target: TypeKey, constraint: Constraint) {
        self.additional_constraints.entry(target).or_default().push(constraint);
    }

    fn check(&self) -> std::result::Result<(), ArgumentError> {
        if self.prepare_for_runtime
            && (self.single_level || self.skip_validating_root_configuration || self.only_use_additional_constraints)
        {
            return Err(ArgumentError::new(
                "settings",
                "prepare_for_runtime cannot be combined with single_level, \
                 skip_validating_root_configuration or only_use_additional_constraints",
            ));
        }
        Ok(())
    }

    fn caching_options(&self) -> CachingOptions {
        CachingOptions {
            mode: if self.prepare_for_runtime {
                CachingMode::Full
            } else {
                CachingMode::ValidationOnly
            },
            skip_root_configuration_validation: self.skip_validating_root_configuration,
            prepare_for_runtime: self.prepare_for_runtime,
            single_level: self.single_level,
        }
    }
}

/// Validate a tree with default settings
pub fn validate(tree: &ActivityTree) -> Result<ValidationResults> {
    validate_with_settings(tree, &ValidationSettings::default())
}

/// Validate a tree
///
/// Fails only for malformed calls (a tree already bound to an instance, an
/// inconsistent settings combination), cancellation, or a fatal constraint
/// fault. Findings are returned as data.
pub fn validate_with_settings(tree: &ActivityTree, settings: &ValidationSettings) -> Result<ValidationResults> {
    if tree.has_been_associated_with_an_instance() {
        return Err(ArgumentError::new(
            "root",
            "the activity tree has already been associated with a workflow instance and cannot be validated again",
        )
        .into());
    }
    settings.check()?;

    let options = settings.caching_options();
    let cache = MetadataCache::new(tree).with_cancellation(settings.cancellation.clone());
    let mut structural = Vec::new();
    let mut constraint_errors = Vec::new();
    {
        let mut validator = Validator {
            cache: &cache,
            settings,
            options,
            errors: &mut constraint_errors,
        };
        cache.cache_root(
            options,
            &mut |child, chain| validator.validate_element(child, chain),
            &mut structural,
        )?;
    }

    // A definition with structural errors must still fail instance initialization
    let structurally_valid = structural.iter().all(|error| error.is_warning);
    if options.mode == CachingMode::Full && structurally_valid {
        tree.commit_metadata(cache.into_metadata());
    }

    let mut all = if settings.only_use_additional_constraints {
        Vec::new()
    } else {
        structural
    };
    all.extend(constraint_errors);

    let results = ValidationResults::new(all);
    info!(
        "validated '{}': {} error(s), {} warning(s)",
        tree.display_name(tree.root()),
        results.errors().len(),
        results.warnings().len()
    );
    Ok(results)
}

/// Find a public activity by id
///
/// Ids inside an implementation are private and never resolve. Uses the
/// metadata committed on the tree when there is some, otherwise caches the
/// tree first.
pub fn resolve<'t>(tree: &'t ActivityTree, id: &str) -> Result<Option<ActivityRef<'t>>> {
    let found = match tree.metadata() {
        Some(meta) => meta.resolve_public(id),
        None => {
            let cache = MetadataCache::new(tree);
            let mut discarded = Vec::new();
            cache.cache_root(CachingOptions::validation(), &mut |_, _| Ok(()), &mut discarded)?;
            cache.read(|meta| meta.resolve_public(id))
        }
    };
    Ok(found.map(|node| tree.get(node)))
}

struct Validator<'v, 't> {
    cache: &'v MetadataCache<'t>,
    settings: &'v ValidationSettings,
    options: CachingOptions,
    errors: &'v mut Vec<ValidationError>,
}

impl Validator<'_, '_> {
    fn validate_element(&mut self, child: ChildActivity, parent_chain: &ActivityCallStack) -> Result<()> {
        let tree = self.cache.tree();
        if self.settings.single_level && child.node != tree.root() {
            return Ok(());
        }

        let node = tree.node(child.node);
        let suppress = self.settings.only_use_additional_constraints || self.settings.single_level;

        if !self.settings.only_use_additional_constraints && !node.constraints.is_empty() {
            run_constraints(
                self.cache,
                child.node,
                parent_chain,
                &node.constraints,
                self.options,
                &self.settings.environment,
                suppress,
                self.errors,
            )?;
        }

        if !self.settings.additional_constraints.is_empty() {
            for key in tree.types().lookup_chain(node.type_key) {
                if let Some(constraints) = self.settings.additional_constraints.get(key) {
                    run_constraints(
                        self.cache,
                        child.node,
                        parent_chain,
                        constraints,
                        self.options,
                        &self.settings.environment,
                        suppress,
                        self.errors,
                    )?;
                }
            }
        }

        if let Some((owner, position)) = self.cache.read(|meta| meta.bound_argument(child.node)) {
            self.validate_expression(child, parent_chain, owner, position)?;
        }
        Ok(())
    }

    /// Expressions bound to arguments must complete synchronously
    fn validate_expression(
        &mut self,
        child: ChildActivity,
        parent_chain: &ActivityCallStack,
        owner: NodeIndex,
        position: usize,
    ) -> Result<()> {
        let tree = self.cache.tree();
        let argument = tree.node(owner).arguments[position].name.clone();

        let mut idle = Vec::new();
        if tree.node(child.node).has_non_empty_subtree() {
            let options = if self.options.skip_root_configuration_validation {
                CachingOptions {
                    single_level: false,
                    ..self.options
                }
            } else {
                CachingOptions::full()
            };
            let mut subtree_errors = Vec::new();
            let mut collect_idle = |descendant: ChildActivity, _: &ActivityCallStack| -> Result<()> {
                if tree.node(descendant.node).can_induce_idle {
                    idle.push(descendant.node);
                }
                Ok(())
            };
            self.cache.finish_caching_subtree(
                child,
                parent_chain,
                options,
                Some(&mut collect_idle),
                &mut subtree_errors,
            )?;
            if !self.settings.only_use_additional_constraints {
                self.errors.extend(subtree_errors);
            }
        } else if tree.node(child.node).can_induce_idle {
            idle.push(child.node);
        }

        if idle.is_empty() {
            return Ok(());
        }

        let mut owner_chain = parent_chain.clone();
        owner_chain.truncate(parent_chain.len().saturating_sub(1));
        for node in idle {
            debug!("expression activity {} bound to '{}' can induce idle", node, argument);
            let warning = ValidationError::warning(format!(
                "The activity '{}' bound to argument '{}' can induce idle. \
                 Expressions bound to arguments must complete synchronously.",
                tree.display_name(node),
                argument
            ))
            .with_property(argument.clone());
            self.errors
                .push(attribute(self.cache, warning, owner, &owner_chain, self.options));
        }
        Ok(())
    }
}
