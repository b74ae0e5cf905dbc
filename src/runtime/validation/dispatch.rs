//! Constraint dispatch and error attribution

use tracing::warn;

use super::LocationEnvironment;
use super::constraint::{Constraint, is_fatal};
use super::context::ValidationContext;
use super::violation::{ErrorSource, ValidationError};
use crate::runtime::activity::{ActivityTree, NodeIndex};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::metadata::{ActivityCallStack, CachingOptions, MetadataCache, TreeMetadata};

/// Run `constraints` against `node`, appending attributed violations
///
/// A recoverable fault becomes an "internal constraint failure" error and
/// the remaining constraints still run. A fatal fault is returned at once.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_constraints(
    cache: &MetadataCache<'_>,
    node: NodeIndex,
    parent_chain: &ActivityCallStack,
    constraints: &[Constraint],
    options: CachingOptions,
    environment: &LocationEnvironment,
    suppress_get_children_errors: bool,
    errors: &mut Vec<ValidationError>,
) -> Result<()> {
    for constraint in constraints {
        let context = ValidationContext::new(cache, node, parent_chain, options, environment);
        match constraint.invoke(&context) {
            Ok(violations) => {
                for violation in violations {
                    errors.push(attribute(cache, violation, node, parent_chain, options));
                }
            }
            Err(fault) if is_fatal(&fault) => return Err(RuntimeError::FatalConstraint(fault)),
            Err(fault) => {
                let tree = cache.tree();
                warn!(
                    "constraint '{}' failed on {} '{}': {}",
                    constraint.name(),
                    node,
                    tree.display_name(node),
                    fault
                );
                let mut error = ValidationError::new(format!(
                    "An internal constraint failure occurred while validating '{}' with constraint '{}': {}",
                    tree.display_name(node),
                    constraint.name(),
                    fault.message
                ));
                let id = cache.read(|meta| meta.qualified_id(node));
                error.attribute(ErrorSource::new(node, tree.display_name(node)), id);
                errors.push(error);
            }
        }

        let buffered = context.take_get_children_errors();
        if !suppress_get_children_errors {
            errors.extend(buffered);
        }
        if let Some(failure) = context.take_get_children_failure() {
            return Err(failure);
        }
    }
    Ok(())
}

/// Prefix the message and stamp source and id for an error raised on `node`
pub(crate) fn attribute(
    cache: &MetadataCache<'_>,
    mut error: ValidationError,
    node: NodeIndex,
    parent_chain: &ActivityCallStack,
    options: CachingOptions,
) -> ValidationError {
    let tree = cache.tree();
    let (prefix, source, id) = cache.read(|meta| {
        let (prefix, source) = generate_validation_error_prefix(tree, meta, node, parent_chain, options);
        (prefix, source, meta.qualified_id(source))
    });
    if !prefix.is_empty() {
        error.message = format!("{prefix}{}", error.message);
    }
    error.attribute(ErrorSource::new(source, tree.display_name(source)), id);
    error
}

/// Externally addressable source for an error on `node`, plus the message
/// prefix to use when that source is not `node` itself
///
/// In build-time mode (root configuration skipped) one level of
/// implementation is visible, so deeper nodes are reported against their
/// boundary activity one level down. Otherwise hidden nodes are reported
/// against their closest public ancestor.
pub fn generate_validation_error_prefix(
    tree: &ActivityTree,
    meta: &TreeMetadata,
    node: NodeIndex,
    parent_chain: &ActivityCallStack,
    options: CachingOptions,
) -> (String, NodeIndex) {
    if options.skip_root_configuration_validation {
        let mut depth = meta.private_depth(node);
        if depth <= 1 {
            return (String::new(), node);
        }
        let mut source = node;
        while depth > 1 {
            match meta.space_owner(source) {
                Some(owner) => source = owner,
                None => break,
            }
            depth -= 1;
        }
        return (hidden_activity_prefix(tree, meta, source), source);
    }

    let parent_visible = !parent_chain.iter().any(|frame| meta.is_private(frame.node));

    let mut source = node;
    while let Some(owner) = meta.space_owner(source) {
        source = owner;
    }

    if meta.is_private(node) {
        (hidden_activity_prefix(tree, meta, source), source)
    } else if !parent_visible {
        let prefix = match meta.parent(source) {
            Some(parent) => format!(
                "The public activity '{}: {}' is nested under the hidden activity '{}: {}' and has the following validation error:   ",
                describe_id(meta, source),
                tree.display_name(source),
                describe_id(meta, parent),
                tree.display_name(parent),
            ),
            None => String::new(),
        };
        (prefix, source)
    } else {
        (String::new(), source)
    }
}

fn hidden_activity_prefix(tree: &ActivityTree, meta: &TreeMetadata, source: NodeIndex) -> String {
    format!(
        "The private implementation of activity '{}: {}' has the following validation error:   ",
        describe_id(meta, source),
        tree.display_name(source)
    )
}

fn describe_id(meta: &TreeMetadata, node: NodeIndex) -> String {
    meta.qualified_id(node).unwrap_or_else(|| "?".to_string())
}
